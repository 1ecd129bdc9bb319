//! Non-player character replies.
//!
//! Character dispatch is a declared table: each character carries a reply
//! policy (`Ai` streams through the chat adapter then speaks via TTS;
//! `Stub` composes from templates and the latest relevant order result).
//! Auto-routing from a doctor's utterance is a pure keyword classifier.
//!
//! AI replies run as spawned tasks so the state lock is never held
//! across an LLM stream; a bumped reply epoch makes an in-flight stream
//! finish silently (output discarded, nothing broadcast).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use pg_domain::stream::ChatDelta;
use pg_engine::state::OrderStatus;
use pg_engine::OrderType;
use pg_protocol::{Character, PatientVoiceState, ServerMessage, VoiceErrorKind};
use pg_voice::{with_retry, ChatMessage};

use crate::cost::UsageSample;
use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Character table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    Ai,
    Stub,
}

pub struct CharacterProfile {
    pub policy: ReplyPolicy,
    pub persona: &'static str,
    pub templates: &'static [&'static str],
}

pub fn profile(character: Character) -> CharacterProfile {
    match character {
        Character::Patient => CharacterProfile {
            policy: ReplyPolicy::Ai,
            persona: "You are the patient in a pediatric simulation. Stay in character, \
                      answer briefly and emotionally appropriately for your age and how \
                      sick you currently are.",
            templates: &[],
        },
        Character::Nurse => CharacterProfile {
            policy: ReplyPolicy::Ai,
            persona: "You are an experienced pediatric ED nurse. Answer the physician \
                      concisely and factually using only the current clinical state.",
            templates: &[],
        },
        Character::Tech => CharacterProfile {
            policy: ReplyPolicy::Stub,
            persona: "",
            templates: &[
                "Monitor's hooked up. I'll call out any rhythm changes.",
                "Leads are good, tracing is clean.",
            ],
        },
        Character::Consultant => CharacterProfile {
            policy: ReplyPolicy::Stub,
            persona: "",
            templates: &[
                "Consultant here. I agree with your current plan — call me back if the patient deteriorates.",
                "Thanks for the update. Keep going as you are, we'll see the patient shortly.",
            ],
        },
        Character::Imaging => CharacterProfile {
            policy: ReplyPolicy::Stub,
            persona: "",
            templates: &["Portable's on the way, give us five minutes."],
        },
        Character::Parent => CharacterProfile {
            policy: ReplyPolicy::Stub,
            persona: "",
            templates: &[
                "Is my child going to be okay? It came on so suddenly.",
                "Please tell me what's happening — should I call anyone?",
            ],
        },
    }
}

/// Route an utterance to a non-patient character by keyword. `None`
/// means the default patient routing.
pub fn classify_character(text: &str) -> Option<Character> {
    let lower = text.to_lowercase();
    const ROUTES: &[(&str, Character)] = &[
        ("nurse", Character::Nurse),
        ("monitor tech", Character::Tech),
        ("tech,", Character::Tech),
        ("hey tech", Character::Tech),
        ("cardiology", Character::Consultant),
        ("consult", Character::Consultant),
        ("picu", Character::Consultant),
        ("radiology", Character::Imaging),
        ("x-ray", Character::Imaging),
        ("imaging", Character::Imaging),
        ("mom", Character::Parent),
        ("dad", Character::Parent),
        ("mother", Character::Parent),
        ("father", Character::Parent),
        ("parent", Character::Parent),
    ];
    ROUTES
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, c)| *c)
}

fn voice_id(state: &AppState, character: Character) -> String {
    state
        .config
        .voice
        .voice_map
        .get(character.as_str())
        .cloned()
        .unwrap_or_else(|| "alloy".to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Produce a spoken reply from `character`. Runs under the state lock;
/// AI characters hand off to a spawned task before any provider call.
pub async fn trigger_reply(
    state: &AppState,
    session_id: &str,
    character: Character,
    prompt: String,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    runtime
        .engine
        .note_character_contact(character.as_str(), now);

    let profile = profile(character);
    match profile.policy {
        ReplyPolicy::Stub => {
            let text = stub_reply(character, &profile, runtime);
            broadcast_text(state, session_id, character, &text);
            speak(state, session_id, character, text).await;
        }
        ReplyPolicy::Ai => {
            let context = clinical_context(runtime);
            let epoch = runtime.reply_epoch.clone();
            let epoch_at_start = epoch.load(Ordering::SeqCst);
            let state = state.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                stream_ai_reply(
                    state,
                    session_id,
                    character,
                    profile.persona,
                    context,
                    prompt,
                    epoch,
                    epoch_at_start,
                )
                .await;
            });
        }
    }
}

fn clinical_context(runtime: &SessionRuntime) -> String {
    let engine_state = runtime.engine.state();
    format!(
        "Scenario: {}. Current stage: {}. Vitals: {}. Rhythm: {}.",
        runtime.engine.definition().name,
        engine_state.stage_id,
        engine_state.vitals.summary_line(),
        runtime.engine.dynamic_rhythm(),
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stub path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn latest_result(runtime: &SessionRuntime, order_type: OrderType) -> Option<String> {
    runtime
        .engine
        .state()
        .orders
        .iter()
        .rev()
        .find(|o| o.order_type == order_type && o.status == OrderStatus::Complete)
        .and_then(|o| o.result.clone())
}

fn stub_reply(
    character: Character,
    profile: &CharacterProfile,
    runtime: &SessionRuntime,
) -> String {
    // Weave in the most recent relevant result when one exists.
    let contextual = match character {
        Character::Tech => {
            latest_result(runtime, OrderType::Ekg).map(|r| format!("Latest strip: {r}"))
        }
        Character::Consultant => latest_result(runtime, OrderType::Labs)
            .map(|r| format!("Consultant here. Looking at the labs — {r}. Your plan sounds right.")),
        Character::Imaging => latest_result(runtime, OrderType::Imaging),
        _ => None,
    };
    if let Some(text) = contextual {
        return text;
    }

    // Deterministic template rotation keyed on session activity.
    let idx = runtime.engine.state().treatment_history.len() % profile.templates.len().max(1);
    profile
        .templates
        .get(idx)
        .copied()
        .unwrap_or("…")
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AI path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn stream_ai_reply(
    state: AppState,
    session_id: String,
    character: Character,
    persona: &'static str,
    context: String,
    prompt: String,
    epoch: Arc<std::sync::atomic::AtomicU64>,
    epoch_at_start: u64,
) {
    let live = |epoch: &Arc<std::sync::atomic::AtomicU64>| {
        epoch.load(Ordering::SeqCst) == epoch_at_start
    };

    state.sessions.broadcast_to_session(
        &session_id,
        &ServerMessage::PatientState {
            session_id: session_id.clone(),
            state: PatientVoiceState::Speaking,
            character: Some(character),
        },
    );

    let messages = vec![
        ChatMessage::system(format!("{persona}\n{context}")),
        ChatMessage::user(prompt),
    ];
    let retry = state.config.voice.retry_attempts;
    let delay = Duration::from_millis(state.config.voice.retry_delay_ms);
    let chat = state.adapters.chat.clone();

    let stream = with_retry("chat.stream", retry, delay, || {
        chat.stream(messages.clone())
    })
    .await;

    let Some(mut stream) = stream else {
        orchestrator::voice_error_locked(
            &state,
            &session_id,
            VoiceErrorKind::OpenaiFailed,
            "chat stream failed",
        )
        .await;
        return;
    };

    let mut full_text = None;
    let mut usage = None;
    while let Some(delta) = stream.next().await {
        match delta {
            Ok(ChatDelta::Token { text }) => {
                // A bumped epoch discards output; the stream itself is
                // allowed to run dry.
                if live(&epoch) {
                    broadcast_text(&state, &session_id, character, &text);
                }
            }
            Ok(ChatDelta::Done {
                full_text: text,
                usage: u,
            }) => {
                full_text = Some(text);
                usage = u;
            }
            Ok(ChatDelta::Error { message }) => {
                tracing::warn!(session_id = %session_id, error = %message, "chat stream error");
                break;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "chat stream transport error");
                break;
            }
        }
    }

    if let Some(u) = usage {
        orchestrator::record_usage_locked(
            &state,
            &session_id,
            UsageSample {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                audio_seconds: 0.0,
            },
        )
        .await;
    }

    if let Some(text) = full_text {
        if live(&epoch) {
            speak(&state, &session_id, character, text).await;
        }
    }

    state.sessions.broadcast_to_session(
        &session_id,
        &ServerMessage::PatientState {
            session_id: session_id.clone(),
            state: PatientVoiceState::Idle,
            character: Some(character),
        },
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared pieces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn broadcast_text(state: &AppState, session_id: &str, character: Character, text: &str) {
    state.sessions.broadcast_to_session(
        session_id,
        &ServerMessage::PatientTranscriptDelta {
            session_id: session_id.to_string(),
            text: text.to_string(),
            character: Some(character),
        },
    );
}

/// Synthesize and broadcast the audio for a finished reply. TTS soft
/// failures skip the audio; hard failures degrade the voice path.
async fn speak(state: &AppState, session_id: &str, character: Character, text: String) {
    let voice = voice_id(state, character);
    let retry = state.config.voice.retry_attempts;
    let delay = Duration::from_millis(state.config.voice.retry_delay_ms);
    let tts = state.adapters.tts.clone();

    let result = with_retry("tts.synthesize", retry, delay, || {
        tts.synthesize(&text, &voice)
    })
    .await;

    match result {
        None => {
            orchestrator::voice_error_locked(
                state,
                session_id,
                VoiceErrorKind::TtsFailed,
                "synthesis failed after retries",
            )
            .await;
        }
        Some(None) => {
            tracing::debug!(session_id, "tts returned no audio for reply");
        }
        Some(Some(bytes)) => {
            state.sessions.broadcast_to_session(
                session_id,
                &ServerMessage::PatientAudio {
                    session_id: session_id.to_string(),
                    audio_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
                    character: Some(character),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_routes_by_keyword() {
        assert_eq!(classify_character("nurse, can you get vitals"), Some(Character::Nurse));
        assert_eq!(classify_character("call cardiology for a consult"), Some(Character::Consultant));
        assert_eq!(classify_character("any word from radiology?"), Some(Character::Imaging));
        assert_eq!(classify_character("mom, has this happened before?"), Some(Character::Parent));
        assert_eq!(classify_character("how are you feeling?"), None);
    }

    #[test]
    fn ai_and_stub_policies_match_the_table() {
        assert_eq!(profile(Character::Patient).policy, ReplyPolicy::Ai);
        assert_eq!(profile(Character::Nurse).policy, ReplyPolicy::Ai);
        for c in [Character::Tech, Character::Consultant, Character::Imaging, Character::Parent] {
            assert_eq!(profile(c).policy, ReplyPolicy::Stub, "{c:?}");
            assert!(!profile(c).templates.is_empty(), "{c:?} needs templates");
        }
    }
}
