//! Bedside exam handler: immediate reveal of the scenario's exam lines
//! and auscultation clips, narrated by the nurse.

use chrono::{DateTime, Utc};

use pg_domain::events::SessionEvent;
use pg_engine::OrderType;
use pg_protocol::{ExamPayload, ExamType};

use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

pub async fn handle_exam(
    state: &AppState,
    session_id: &str,
    payload: ExamPayload,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    let order_type = match payload.exam_type {
        ExamType::Cardiac => OrderType::CardiacExam,
        ExamType::Lungs => OrderType::LungExam,
        ExamType::General => OrderType::GeneralExam,
    };

    let Some(text) = runtime.engine.perform_exam(order_type, now) else {
        return;
    };

    let logged = runtime.events.append(SessionEvent::ScenarioEvent {
        session_id: session_id.to_string(),
        kind: format!("exam.{}", order_type.as_str()),
        description: text.clone(),
    });
    state.persistence.append_event(session_id, &logged).await;

    orchestrator::nurse_line(state, session_id, &text);
}
