//! Presenter injects: age-group-aware vitals overrides plus narration.

use chrono::{DateTime, Utc};

use pg_domain::events::SessionEvent;
use pg_engine::scenarios::ScenarioEventKind;
use pg_protocol::{Character, ScenarioEventPayload, ServerMessage};

use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

pub async fn handle_scenario_event(
    state: &AppState,
    session_id: &str,
    payload: ScenarioEventPayload,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    let (description, events) =
        runtime
            .engine
            .inject_event(payload.event_type, payload.vitals, now);
    orchestrator::process_engine_events(state, session_id, runtime, &events).await;

    let narration = payload.description.unwrap_or(description);
    let logged = runtime.events.append(SessionEvent::ScenarioEvent {
        session_id: session_id.to_string(),
        kind: payload.event_type.as_str().to_string(),
        description: narration.clone(),
    });
    state.persistence.append_event(session_id, &logged).await;

    // Equipment faults come from the tech, symptoms from the patient,
    // everything else from the nurse.
    match payload.event_type {
        ScenarioEventKind::EquipmentFailure => {
            state.sessions.broadcast_to_session(
                session_id,
                &ServerMessage::PatientTranscriptDelta {
                    session_id: session_id.to_string(),
                    text: narration,
                    character: Some(Character::Tech),
                },
            );
        }
        ScenarioEventKind::PatientSymptom => {
            state.sessions.broadcast_to_session(
                session_id,
                &ServerMessage::PatientTranscriptDelta {
                    session_id: session_id.to_string(),
                    text: narration,
                    character: Some(Character::Patient),
                },
            );
        }
        _ => orchestrator::nurse_line(state, session_id, &narration),
    }
}
