//! Treatment handler: route the request through the engine's effect
//! table, let the sub-engine rule on conversions and ledgers, then
//! re-evaluate stage transitions with the treatment hint.

use chrono::{DateTime, Utc};

use pg_engine::{ToolIntent, TreatmentRequest};

use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

pub async fn handle_treatment(
    state: &AppState,
    session_id: &str,
    request: TreatmentRequest,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    let treatment_type = request.treatment_type;
    let events = runtime.engine.apply_intent(
        &ToolIntent::ApplyTreatment { treatment: request },
        now,
    );
    orchestrator::process_engine_events(state, session_id, runtime, &events).await;

    let hint = format!("treatment:{}", treatment_type.as_str());
    if let Some(evt) = runtime.engine.evaluate_automatic_transitions(&[hint], now) {
        orchestrator::process_engine_events(state, session_id, runtime, &[evt]).await;
    }
}
