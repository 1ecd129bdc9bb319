//! Pause / resume / freeze / unfreeze / skip-stage / end-turn / mute.
//!
//! Pausing flips the session into text fallback and, on complex
//! scenarios, freezes the scenario clock. Resume is refused while the
//! hard budget is latched.

use chrono::{DateTime, Utc};

use pg_domain::events::SessionEvent;
use pg_engine::ToolIntent;
use pg_protocol::ServerMessage;

use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

pub async fn handle_pause(
    state: &AppState,
    session_id: &str,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    state.sessions.set_fallback(session_id, true);
    runtime.engine.pause_clock(now);
    orchestrator::nurse_line(state, session_id, "Simulation paused.");
}

/// Returns false when the hard budget blocks the resume.
pub async fn handle_resume(
    state: &AppState,
    session_id: &str,
    user_id: &str,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) -> bool {
    if runtime.cost.over_hard() {
        let logged = runtime.events.append(SessionEvent::BudgetResumeBlocked {
            session_id: session_id.to_string(),
            usd_estimate: runtime.cost.usd_estimate,
        });
        state.persistence.append_event(session_id, &logged).await;
        state.sessions.send_to_user(
            session_id,
            user_id,
            &ServerMessage::Error {
                message: "session budget exhausted — voice cannot resume".into(),
            },
        );
        return false;
    }

    state.sessions.set_fallback(session_id, false);
    runtime.engine.resume_clock(now);
    orchestrator::nurse_line(state, session_id, "Simulation resumed.");
    true
}

pub async fn handle_skip_stage(
    state: &AppState,
    session_id: &str,
    stage_id: &str,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    let events = runtime.engine.apply_intent(
        &ToolIntent::SetStage {
            stage_id: stage_id.to_string(),
        },
        now,
    );
    orchestrator::process_engine_events(state, session_id, runtime, &events).await;
}

/// Cut off the in-flight NPC response (explicit end-of-turn).
pub async fn handle_end_turn(runtime: &mut SessionRuntime) {
    runtime
        .reply_epoch
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    if let Some(realtime) = runtime.realtime.clone() {
        if let Err(e) = realtime.cancel_response().await {
            tracing::debug!(error = %e, "cancel_response failed");
        }
    }
}
