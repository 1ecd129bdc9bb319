//! Transcript analysis and debrief.
//!
//! Complex scenarios get the deterministic score plus the timeline, with
//! an optional LLM narrative on top; simple scenarios get a free-form LLM
//! summary only. The minimum-interaction guard rejects sessions with
//! nothing to debrief.
//!
//! The deterministic part is computed under the state lock; the LLM
//! narrative runs in a spawned task so a slow provider never blocks the
//! session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use pg_domain::events::SessionEvent;
use pg_domain::stream::ChatDelta;
use pg_engine::state::ExtendedState;
use pg_engine::svt::TimelineEvent;
use pg_engine::svt::scoring::ScoreResult;
use pg_engine::{myocarditis, svt};
use pg_protocol::{ServerMessage, TranscriptTurn};
use pg_voice::ChatMessage;

use crate::cost::UsageSample;
use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

const MIN_TURNS: usize = 3;
const MIN_TIMELINE_EVENTS: usize = 3;

pub async fn handle_analyze(
    state: &AppState,
    session_id: &str,
    turns: Vec<TranscriptTurn>,
    runtime: &mut SessionRuntime,
    _now: DateTime<Utc>,
) {
    let timeline_len = runtime
        .engine
        .state()
        .extended
        .as_ref()
        .map(|e| e.timeline_len())
        .unwrap_or(0);

    if turns.len() < MIN_TURNS && timeline_len < MIN_TIMELINE_EVENTS {
        state.sessions.broadcast_to_session(
            session_id,
            &ServerMessage::AnalysisResult {
                session_id: session_id.to_string(),
                summary: "Not enough interaction to analyze yet — run more of the case first."
                    .into(),
                strengths: Vec::new(),
                opportunities: Vec::new(),
                teaching_points: Vec::new(),
            },
        );
        return;
    }

    match runtime.engine.state().extended.clone() {
        Some(extended) => {
            complex_debrief(state, session_id, turns, extended, runtime).await;
        }
        None => {
            simple_summary(state, session_id, turns, runtime);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Complex path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn complex_debrief(
    state: &AppState,
    session_id: &str,
    turns: Vec<TranscriptTurn>,
    extended: ExtendedState,
    runtime: &mut SessionRuntime,
) {
    let (score, timeline): (ScoreResult, Vec<TimelineEvent>) = match &extended {
        ExtendedState::Svt(s) => (svt::scoring::calculate_score(s), s.timeline_events.clone()),
        ExtendedState::Myocarditis(m) => {
            (myocarditis::calculate_score(m), m.timeline_events.clone())
        }
    };

    let logged = runtime.events.append(SessionEvent::DebriefScored {
        session_id: session_id.to_string(),
        total_points: score.total_points,
        grade: score.grade.clone(),
    });
    state.persistence.append_event(session_id, &logged).await;

    let state = state.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let summary = llm_narrative(&state, &session_id, &turns, Some(&score)).await;
        state.sessions.broadcast_to_session(
            &session_id,
            &ServerMessage::ComplexDebriefResult {
                session_id: session_id.clone(),
                summary,
                passed: score.passed,
                grade: score.grade.clone(),
                checklist_score: score.checklist_score,
                checklist_results: score.checklist_results.clone(),
                bonuses: score.bonuses_earned.clone(),
                penalties: score.penalties_incurred.clone(),
                total_points: score.total_points,
                timeline,
                scenario_specific_feedback: score.feedback.clone(),
            },
        );
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Simple path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// Simple-scenario analyses are not persisted as session events.
fn simple_summary(
    state: &AppState,
    session_id: &str,
    turns: Vec<TranscriptTurn>,
    runtime: &SessionRuntime,
) {
    let engine_state = runtime.engine.state();
    let strengths: Vec<String> = [
        (!engine_state.orders.is_empty()).then(|| "Used diagnostic orders to work the problem".to_string()),
        (!engine_state.treatment_history.is_empty()).then(|| "Committed to treatment decisions".to_string()),
        engine_state.telemetry.then(|| "Put the patient on a monitor".to_string()),
    ]
    .into_iter()
    .flatten()
    .collect();
    let opportunities: Vec<String> = [
        engine_state.orders.is_empty().then(|| "No orders were placed".to_string()),
        engine_state
            .treatment_history
            .is_empty()
            .then(|| "No treatments were given".to_string()),
    ]
    .into_iter()
    .flatten()
    .collect();

    let state = state.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let summary = llm_narrative(&state, &session_id, &turns, None)
            .await
            .unwrap_or_else(|| {
                format!("Reviewed {} transcript turns; see the highlights below.", turns.len())
            });
        state.sessions.broadcast_to_session(
            &session_id,
            &ServerMessage::AnalysisResult {
                session_id: session_id.clone(),
                summary,
                strengths,
                opportunities,
                teaching_points: vec![
                    "Reassess after every intervention.".into(),
                    "Verbalize your working diagnosis early.".into(),
                ],
            },
        );
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM narrative
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Best-effort narrative; `None` when the adapter is down.
async fn llm_narrative(
    state: &AppState,
    session_id: &str,
    turns: &[TranscriptTurn],
    score: Option<&ScoreResult>,
) -> Option<String> {
    let transcript: String = turns
        .iter()
        .map(|t| format!("{}: {}\n", t.speaker, t.text))
        .collect();
    let score_block = score
        .map(|s| {
            format!(
                "Deterministic scoring: grade {}, {} points, passed={}.",
                s.grade, s.total_points, s.passed
            )
        })
        .unwrap_or_default();

    let messages = vec![
        ChatMessage::system(
            "You are a pediatric simulation debrief instructor. Summarize the team's \
             performance in three or four sentences, plain prose, no lists.",
        ),
        ChatMessage::user(format!("{score_block}\nTranscript:\n{transcript}")),
    ];

    let retry = state.config.voice.retry_attempts;
    let delay = Duration::from_millis(state.config.voice.retry_delay_ms);
    let chat = state.adapters.chat.clone();
    let mut stream = with_retry_stream(retry, delay, || chat.stream(messages.clone())).await?;

    let mut summary = None;
    let mut usage = None;
    while let Some(delta) = stream.next().await {
        match delta {
            Ok(ChatDelta::Done {
                full_text,
                usage: u,
            }) => {
                summary = Some(full_text);
                usage = u;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id, error = %e, "debrief narrative stream failed");
                break;
            }
        }
    }

    if let Some(u) = usage {
        orchestrator::record_usage_locked(
            state,
            session_id,
            UsageSample {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                audio_seconds: 0.0,
            },
        )
        .await;
    }
    summary
}

async fn with_retry_stream<F, Fut, T>(
    attempts: u32,
    delay: Duration,
    op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = pg_domain::error::Result<T>>,
{
    pg_voice::with_retry("chat.stream", attempts, delay, op).await
}
