//! Telemetry toggle and show-EKG handlers.

use chrono::{DateTime, Utc};

use pg_domain::events::SessionEvent;
use pg_engine::state::OrderStatus;
use pg_engine::OrderType;
use pg_protocol::{Character, ServerMessage};

use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

pub async fn handle_toggle_telemetry(
    state: &AppState,
    session_id: &str,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    let on = !runtime.engine.state().telemetry;
    runtime.engine.set_telemetry(on, now);

    let logged = runtime.events.append(SessionEvent::ScenarioEvent {
        session_id: session_id.to_string(),
        kind: "telemetry".into(),
        description: if on { "telemetry on" } else { "telemetry off" }.into(),
    });
    state.persistence.append_event(session_id, &logged).await;

    if on {
        if let Some(evt) = runtime
            .engine
            .evaluate_automatic_transitions(&["telemetry:on".to_string()], now)
        {
            orchestrator::process_engine_events(state, session_id, runtime, &[evt]).await;
        }
    }
    orchestrator::nurse_line(
        state,
        session_id,
        if on {
            "Leads on, telemetry is up."
        } else {
            "Telemetry off."
        },
    );
}

/// Surface the most recent completed EKG; the snapshot broadcast that
/// follows carries a fresh waveform when telemetry is on.
pub async fn handle_show_ekg(state: &AppState, session_id: &str, runtime: &mut SessionRuntime) {
    let latest = runtime
        .engine
        .state()
        .orders
        .iter()
        .rev()
        .find(|o| o.order_type == OrderType::Ekg && o.status == OrderStatus::Complete)
        .and_then(|o| o.result.clone());

    match latest {
        Some(result) => {
            state.sessions.broadcast_to_session(
                session_id,
                &ServerMessage::PatientTranscriptDelta {
                    session_id: session_id.to_string(),
                    text: format!("Pulling up the EKG: {result}"),
                    character: Some(Character::Tech),
                },
            );
        }
        None => {
            orchestrator::nurse_line(state, session_id, "No completed EKG on file yet.");
        }
    }
}
