//! Per-session orchestration: message routing, the voice path, the
//! heartbeat, adapter callback wiring, budget consequences, and
//! role-gated snapshot broadcasting.
//!
//! Every state mutation — handler, heartbeat tick, realtime callback,
//! scheduled decay — goes through the session's state lock, and snapshot
//! broadcasts happen while it is held, so clients observe a
//! monotonically consistent history.

pub mod snapshot;

use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;

use pg_domain::events::SessionEvent;
use pg_engine::engine::EngineEvent;
use pg_engine::{scenarios, ToolGate, ToolIntent};
use pg_protocol::{
    validate_sim_state, Character, ClientMessage, ExamPayload, MuteUserPayload, OrderPayload,
    PatientVoiceState, Role, ScenarioEventPayload, ServerMessage, SimState, SkipStagePayload,
    TranscriptTurn, VoiceCommandType, VoiceErrorKind,
};
use pg_voice::{with_retry, RealtimeEvent};

use crate::cost::{BudgetCrossing, UsageSample};
use crate::handlers;
use crate::runtime::SessionRuntime;
use crate::sessions::ConnId;
use crate::state::AppState;

/// Per-connection context carried by the transport.
#[derive(Debug, Clone)]
pub struct ConnCtx {
    pub conn_id: ConnId,
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs after a successful join: ensures the runtime exists, hydrates it
/// from persistence on first creation, and sends the joining client a
/// snapshot.
pub async fn on_client_joined(state: &AppState, ctx: &ConnCtx) {
    let now = Utc::now();
    let scenario_id = state
        .sessions
        .scenario_id(&ctx.session_id)
        .unwrap_or_else(|| "child_asthma_basic_v1".to_string());

    let Some((slot, created)) = state
        .runtimes
        .ensure(&ctx.session_id, &scenario_id, &state.config, now)
    else {
        tracing::error!(session_id = %ctx.session_id, scenario_id = %scenario_id, "unknown scenario at join");
        return;
    };

    if created {
        // One-time hydration from the persisted snapshot.
        if let Some(persisted) = state.persistence.load_snapshot(&ctx.session_id).await {
            if let Ok(mut runtime) = slot.lock.acquire("hydrate").await {
                let scenario = persisted.scenario_id.clone();
                let stage = persisted.stage_id.clone();
                if runtime.engine.hydrate(persisted) {
                    runtime.hydrated = true;
                    state.sessions.set_scenario(&ctx.session_id, &scenario);
                    let logged = runtime.events.append(SessionEvent::SessionHydrated {
                        session_id: ctx.session_id.clone(),
                        stage_id: stage,
                    });
                    state.persistence.append_event(&ctx.session_id, &logged).await;
                }
            }
        }

        // Wire the realtime adapter and its event pump.
        if let Some(realtime) = state.adapters.new_realtime() {
            if let Some(rx) = realtime.take_events() {
                let pump = spawn_realtime_pump(state.clone(), ctx.session_id.clone(), rx);
                *slot.realtime_pump.lock() = Some(pump);
            }
            if let Ok(mut runtime) = slot.lock.acquire("attach_realtime").await {
                runtime.realtime = Some(realtime);
            }
        }

        let heartbeat = spawn_heartbeat(state.clone(), ctx.session_id.clone());
        *slot.heartbeat.lock() = Some(heartbeat);
    }

    if let Ok(mut runtime) = slot.lock.acquire("join_broadcast").await {
        broadcast_snapshots(state, &ctx.session_id, &mut runtime);
    }
}

/// One-shot teardown after the last connection leaves: stop the
/// background tasks, close the realtime adapter, drop the runtime with
/// its correlation ID, guard maps, and alarm state.
pub async fn session_empty(state: &AppState, session_id: &str) {
    let Some(slot) = state.runtimes.remove(session_id) else {
        return;
    };
    if let Some(handle) = slot.heartbeat.lock().take() {
        handle.abort();
    }
    if let Some(handle) = slot.realtime_pump.lock().take() {
        handle.abort();
    }
    if let Ok(mut runtime) = slot.lock.acquire("session_cleanup").await {
        if let Some(realtime) = runtime.realtime.take() {
            realtime.close().await;
        }
        let logged = runtime.events.append(SessionEvent::SessionClosed {
            session_id: session_id.to_string(),
        });
        state.persistence.append_event(session_id, &logged).await;
        state
            .persistence
            .save_snapshot(session_id, &runtime.engine.snapshot())
            .await;
    }
    tracing::info!(session_id, "session torn down");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn handle_message(state: &AppState, ctx: &ConnCtx, msg: ClientMessage) {
    match msg {
        ClientMessage::Join { .. } => {
            state.sessions.send_to_user(
                &ctx.session_id,
                &ctx.user_id,
                &ServerMessage::Error {
                    message: "already joined".into(),
                },
            );
        }
        ClientMessage::StartSpeaking { .. } => handle_start_speaking(state, ctx).await,
        ClientMessage::StopSpeaking { .. } => handle_stop_speaking(state, ctx).await,
        ClientMessage::DoctorAudio {
            audio_base64,
            content_type,
            character,
            ..
        } => handle_doctor_audio(state, ctx, audio_base64, content_type, character).await,
        ClientMessage::SetScenario { scenario_id, .. } => {
            handle_set_scenario(state, ctx, &scenario_id).await
        }
        ClientMessage::AnalyzeTranscript { turns, .. } => {
            handle_analyze(state, ctx, turns).await
        }
        ClientMessage::VoiceCommand {
            character,
            command_type,
            payload,
            ..
        } => handle_voice_command(state, ctx, character, command_type, payload).await,
        ClientMessage::Ping => {
            state
                .sessions
                .send_to_user(&ctx.session_id, &ctx.user_id, &ServerMessage::Pong);
        }
    }
}

async fn handle_start_speaking(state: &AppState, ctx: &ConnCtx) {
    let grant = state.sessions.request_floor(&ctx.session_id, &ctx.user_id);
    if !grant.granted {
        state.sessions.send_to_user(
            &ctx.session_id,
            &ctx.user_id,
            &ServerMessage::Error {
                message: "floor_taken".into(),
            },
        );
        return;
    }

    state.sessions.broadcast_to_session(
        &ctx.session_id,
        &ServerMessage::ParticipantState {
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            speaking: true,
        },
    );
    if let Some(slot) = state.runtimes.get(&ctx.session_id) {
        if let Ok(mut runtime) = slot.lock.acquire("floor_granted").await {
            let logged = runtime.events.append(SessionEvent::FloorGranted {
                session_id: ctx.session_id.clone(),
                user_id: ctx.user_id.clone(),
                previous: grant.previous,
            });
            state.persistence.append_event(&ctx.session_id, &logged).await;
        }
    }
}

async fn handle_stop_speaking(state: &AppState, ctx: &ConnCtx) {
    if !state.sessions.release_floor(&ctx.session_id, &ctx.user_id) {
        return;
    }
    state.sessions.broadcast_to_session(
        &ctx.session_id,
        &ServerMessage::ParticipantState {
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            speaking: false,
        },
    );
    if let Some(slot) = state.runtimes.get(&ctx.session_id) {
        if let Ok(mut runtime) = slot.lock.acquire("floor_released").await {
            // Relinquishing the floor cuts off any in-flight NPC reply.
            handlers::flow::handle_end_turn(&mut runtime).await;
            let logged = runtime.events.append(SessionEvent::FloorReleased {
                session_id: ctx.session_id.clone(),
                user_id: ctx.user_id.clone(),
            });
            state.persistence.append_event(&ctx.session_id, &logged).await;
        }
    }
}

async fn handle_set_scenario(state: &AppState, ctx: &ConnCtx, scenario_id: &str) {
    if ctx.role != Role::Presenter {
        send_error(state, ctx, "only the presenter can change the scenario");
        return;
    }
    if !scenarios::is_known(scenario_id) {
        send_error(state, ctx, &format!("unknown scenario {scenario_id}"));
        return;
    }

    let Some(slot) = state.runtimes.get(&ctx.session_id) else {
        return;
    };
    let Ok(mut runtime) = slot.lock.acquire("set_scenario").await else {
        send_error(state, ctx, "session busy, try again");
        return;
    };
    runtime.engine.set_scenario(scenario_id, Utc::now());
    state.sessions.set_scenario(&ctx.session_id, scenario_id);

    state.sessions.broadcast_to_session(
        &ctx.session_id,
        &ServerMessage::ScenarioChanged {
            session_id: ctx.session_id.clone(),
            scenario_id: scenario_id.to_string(),
        },
    );
    broadcast_snapshots(state, &ctx.session_id, &mut runtime);
}

async fn handle_analyze(state: &AppState, ctx: &ConnCtx, turns: Vec<TranscriptTurn>) {
    let Some(slot) = state.runtimes.get(&ctx.session_id) else {
        return;
    };
    match slot.lock.acquire("analyze_transcript").await {
        Ok(mut runtime) => {
            handlers::analyze::handle_analyze(state, &ctx.session_id, turns, &mut runtime, Utc::now())
                .await;
        }
        Err(e) => {
            tracing::warn!(session_id = %ctx.session_id, error = %e, "analyze aborted");
            send_error(state, ctx, "session busy, try again");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const PRESENTER_ONLY: &[VoiceCommandType] = &[
    VoiceCommandType::ScenarioEvent,
    VoiceCommandType::SkipStage,
    VoiceCommandType::MuteUser,
];

const COOLDOWN_GATED: &[VoiceCommandType] = &[
    VoiceCommandType::Order,
    VoiceCommandType::Exam,
    VoiceCommandType::Treatment,
    VoiceCommandType::ShowEkg,
    VoiceCommandType::ToggleTelemetry,
    VoiceCommandType::ForceReply,
];

async fn handle_voice_command(
    state: &AppState,
    ctx: &ConnCtx,
    character: Option<Character>,
    command_type: VoiceCommandType,
    payload: Option<serde_json::Value>,
) {
    if PRESENTER_ONLY.contains(&command_type) && ctx.role != Role::Presenter {
        send_error(state, ctx, "presenter-only command");
        return;
    }

    let Some(slot) = state.runtimes.get(&ctx.session_id) else {
        return;
    };
    let operation = format!("voice_command:{command_type:?}");
    let Ok(mut runtime) = slot.lock.acquire(&operation).await else {
        send_error(state, ctx, "session busy, try again");
        return;
    };
    let now = Utc::now();

    if COOLDOWN_GATED.contains(&command_type) {
        let cooldown = Duration::from_millis(state.config.gateway.command_cooldown_ms);
        if runtime.command_on_cooldown(&ctx.user_id, cooldown, now) {
            tracing::debug!(
                session_id = %ctx.session_id,
                user_id = %ctx.user_id,
                ?command_type,
                "command dropped by cooldown"
            );
            return;
        }
    }

    match command_type {
        VoiceCommandType::PauseAi | VoiceCommandType::Freeze => {
            handlers::flow::handle_pause(state, &ctx.session_id, &mut runtime, now).await;
        }
        VoiceCommandType::ResumeAi | VoiceCommandType::Unfreeze => {
            handlers::flow::handle_resume(state, &ctx.session_id, &ctx.user_id, &mut runtime, now)
                .await;
        }
        VoiceCommandType::EndTurn => {
            handlers::flow::handle_end_turn(&mut runtime).await;
        }
        VoiceCommandType::MuteUser => {
            if let Some(p) = parse_payload::<MuteUserPayload>(state, ctx, payload) {
                runtime.muted_users.insert(p.user_id);
            }
        }
        VoiceCommandType::SkipStage => {
            if let Some(p) = parse_payload::<SkipStagePayload>(state, ctx, payload) {
                handlers::flow::handle_skip_stage(
                    state,
                    &ctx.session_id,
                    &p.stage_id,
                    &mut runtime,
                    now,
                )
                .await;
            }
        }
        VoiceCommandType::Order => {
            if let Some(p) = parse_payload::<OrderPayload>(state, ctx, payload) {
                handlers::orders::handle_order(
                    state,
                    &ctx.session_id,
                    &ctx.user_id,
                    p,
                    &mut runtime,
                    now,
                )
                .await;
            }
        }
        VoiceCommandType::Exam => {
            if let Some(p) = parse_payload::<ExamPayload>(state, ctx, payload) {
                handlers::exam::handle_exam(state, &ctx.session_id, p, &mut runtime, now).await;
            }
        }
        VoiceCommandType::ToggleTelemetry => {
            handlers::telemetry::handle_toggle_telemetry(state, &ctx.session_id, &mut runtime, now)
                .await;
        }
        VoiceCommandType::Treatment => {
            if let Some(p) = parse_payload::<pg_engine::TreatmentRequest>(state, ctx, payload) {
                handlers::treatment::handle_treatment(state, &ctx.session_id, p, &mut runtime, now)
                    .await;
            }
        }
        VoiceCommandType::ShowEkg => {
            handlers::telemetry::handle_show_ekg(state, &ctx.session_id, &mut runtime).await;
        }
        VoiceCommandType::ScenarioEvent => {
            if let Some(p) = parse_payload::<ScenarioEventPayload>(state, ctx, payload) {
                handlers::scenario_event::handle_scenario_event(
                    state,
                    &ctx.session_id,
                    p,
                    &mut runtime,
                    now,
                )
                .await;
            }
        }
        VoiceCommandType::ForceReply => {
            let character = character.unwrap_or(Character::Patient);
            handlers::reply::trigger_reply(
                state,
                &ctx.session_id,
                character,
                "Respond to the team.".to_string(),
                &mut runtime,
                now,
            )
            .await;
        }
    }

    broadcast_snapshots(state, &ctx.session_id, &mut runtime);
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    state: &AppState,
    ctx: &ConnCtx,
    payload: Option<serde_json::Value>,
) -> Option<T> {
    let value = payload.unwrap_or(serde_json::Value::Null);
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            send_error(state, ctx, &format!("bad command payload: {e}"));
            None
        }
    }
}

fn send_error(state: &AppState, ctx: &ConnCtx, message: &str) {
    state.sessions.send_to_user(
        &ctx.session_id,
        &ctx.user_id,
        &ServerMessage::Error {
            message: message.to_string(),
        },
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_doctor_audio(
    state: &AppState,
    ctx: &ConnCtx,
    audio_base64: String,
    content_type: String,
    character_hint: Option<Character>,
) {
    let Ok(audio) = base64::engine::general_purpose::STANDARD.decode(&audio_base64) else {
        send_error(state, ctx, "audio_base64 is not valid base64");
        return;
    };

    // Audio from anyone but the floor holder is ignored without a
    // broadcast.
    if !state.sessions.holds_floor(&ctx.session_id, &ctx.user_id) {
        return;
    }

    let Some(slot) = state.runtimes.get(&ctx.session_id) else {
        return;
    };
    let Ok(mut runtime) = slot.lock.acquire("doctor_audio").await else {
        return;
    };
    if runtime.muted_users.contains(&ctx.user_id) {
        return;
    }
    let now = Utc::now();

    let fallback = state.sessions.is_fallback(&ctx.session_id)
        || runtime.voice_fallback
        || runtime.realtime.is_none();

    // STT runs on every chunk: the text drives order parsing, routing,
    // and the visible utterance.
    let retry = state.config.voice.retry_attempts;
    let delay = Duration::from_millis(state.config.voice.retry_delay_ms);
    let stt = state.adapters.stt.clone();
    let transcription = with_retry("stt.transcribe", retry, delay, || {
        stt.transcribe(&audio, &content_type)
    })
    .await;

    let text = match transcription {
        None => {
            voice_error_inner(
                state,
                &ctx.session_id,
                &mut runtime,
                VoiceErrorKind::SttFailed,
                "transcription failed after retries",
            )
            .await;
            broadcast_snapshots(state, &ctx.session_id, &mut runtime);
            return;
        }
        Some(None) => {
            // Soft failure: nothing intelligible, no degradation.
            state.sessions.broadcast_to_session(
                &ctx.session_id,
                &ServerMessage::PatientState {
                    session_id: ctx.session_id.clone(),
                    state: PatientVoiceState::Error,
                    character: None,
                },
            );
            return;
        }
        Some(Some(text)) => text,
    };

    let crossing = runtime.cost.add_usage(UsageSample {
        input_tokens: 0,
        output_tokens: 0,
        audio_seconds: audio.len() as f64 / 32_000.0,
    });
    apply_budget_crossing(state, &ctx.session_id, &mut runtime, crossing).await;

    state.sessions.broadcast_to_session(
        &ctx.session_id,
        &ServerMessage::DoctorUtterance {
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            text: text.clone(),
            character: character_hint,
        },
    );

    let spoken_order = handlers::orders::parse_spoken_order(&text);
    let routed_character = character_hint
        .filter(|c| *c != Character::Patient)
        .or_else(|| handlers::reply::classify_character(&text));

    if !fallback {
        if let Some(realtime) = runtime.realtime.clone() {
            let forwarded = async {
                realtime.send_audio_chunk(&audio).await?;
                realtime.commit_audio().await
            }
            .await;
            if let Err(e) = forwarded {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "realtime forward failed");
            }

            // Explicit non-patient routing or a parsed order suppresses
            // the model's patient voice reply.
            if spoken_order.is_some() || routed_character.is_some() {
                if let Err(e) = realtime.cancel_response().await {
                    tracing::debug!(session_id = %ctx.session_id, error = %e, "cancel failed");
                }
            }
        }
    }

    if let Some(order_type) = spoken_order {
        handlers::orders::handle_order(
            state,
            &ctx.session_id,
            &ctx.user_id,
            OrderPayload {
                order_type,
                iv_params: None,
            },
            &mut runtime,
            now,
        )
        .await;
    } else if fallback || routed_character.is_some() {
        // Legacy auto-reply path, and explicit routing on the realtime
        // path (the model only ever voices the patient).
        let verdict = runtime.guard.evaluate(&ctx.user_id, &text, true, now);
        match verdict {
            crate::guard::GuardVerdict::Reply => {
                let character = routed_character.unwrap_or(Character::Patient);
                handlers::reply::trigger_reply(
                    state,
                    &ctx.session_id,
                    character,
                    text.clone(),
                    &mut runtime,
                    now,
                )
                .await;
            }
            crate::guard::GuardVerdict::HeldForReview => {
                let logged = runtime.events.append(SessionEvent::AutoReplyBlocked {
                    session_id: ctx.session_id.clone(),
                    user_id: ctx.user_id.clone(),
                    reason: "content flagged".into(),
                });
                state.persistence.append_event(&ctx.session_id, &logged).await;
                state.sessions.broadcast_to_presenters(
                    &ctx.session_id,
                    &ServerMessage::PatientTranscriptDelta {
                        session_id: ctx.session_id.clone(),
                        text: "NPC reply held for review (content flagged)".into(),
                        character: Some(Character::Nurse),
                    },
                );
            }
            crate::guard::GuardVerdict::Silent { reason } => {
                tracing::debug!(session_id = %ctx.session_id, reason, "auto-reply suppressed");
            }
        }
    }

    broadcast_snapshots(state, &ctx.session_id, &mut runtime);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn spawn_heartbeat(state: AppState, session_id: String) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_millis(state.config.gateway.heartbeat_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(slot) = state.runtimes.get(&session_id) else {
                break;
            };
            // Low priority: skip the beat while a handler is in flight.
            let Some(mut runtime) = slot.lock.try_acquire() else {
                continue;
            };
            heartbeat_tick(&state, &session_id, &mut runtime).await;
        }
    })
}

async fn heartbeat_tick(state: &AppState, session_id: &str, runtime: &mut SessionRuntime) {
    let now = Utc::now();
    let events = runtime.engine.tick(now);
    process_engine_events(state, session_id, runtime, &events).await;

    // Monitor alarms only sound with telemetry on.
    if runtime.engine.state().telemetry {
        let vitals = runtime.engine.state().vitals.clone();
        let group = runtime.engine.demographics().age_group;
        for alarm in runtime.alarms.evaluate(&vitals, group) {
            let message = alarm.message(&vitals);
            let logged = runtime.events.append(SessionEvent::ScenarioEvent {
                session_id: session_id.to_string(),
                kind: "alarm".into(),
                description: message.clone(),
            });
            state.persistence.append_event(session_id, &logged).await;
            nurse_line(state, session_id, &message);
        }
    }

    broadcast_snapshots(state, session_id, runtime);
    state
        .persistence
        .save_snapshot(session_id, &runtime.engine.snapshot())
        .await;
}

fn spawn_realtime_pump(
    state: AppState,
    session_id: String,
    mut rx: tokio::sync::mpsc::Receiver<RealtimeEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RealtimeEvent::AudioOut(bytes) => {
                    state.sessions.broadcast_to_session(
                        &session_id,
                        &ServerMessage::PatientAudio {
                            session_id: session_id.clone(),
                            audio_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
                            character: Some(Character::Patient),
                        },
                    );
                }
                RealtimeEvent::TranscriptDelta { text, .. } => {
                    state.sessions.broadcast_to_session(
                        &session_id,
                        &ServerMessage::PatientTranscriptDelta {
                            session_id: session_id.clone(),
                            text,
                            character: Some(Character::Patient),
                        },
                    );
                }
                RealtimeEvent::ToolIntent(intent) => {
                    handle_realtime_intent(&state, &session_id, intent).await;
                }
                RealtimeEvent::Usage(usage) => {
                    record_usage_locked(
                        &state,
                        &session_id,
                        UsageSample {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            audio_seconds: 0.0,
                        },
                    )
                    .await;
                }
                RealtimeEvent::Disconnected => {
                    voice_error_locked(
                        &state,
                        &session_id,
                        VoiceErrorKind::OpenaiFailed,
                        "realtime connection lost",
                    )
                    .await;
                    break;
                }
            }
        }
    })
}

/// An LLM-proposed intent: gate against the active stage, apply, then
/// re-evaluate automatic transitions.
async fn handle_realtime_intent(state: &AppState, session_id: &str, intent: ToolIntent) {
    let Some(slot) = state.runtimes.get(session_id) else {
        return;
    };
    let Ok(mut runtime) = slot.lock.acquire("realtime_tool_intent").await else {
        return;
    };
    let now = Utc::now();

    let decision = ToolGate::check(runtime.engine.current_stage(), &intent);
    if !decision.allowed {
        let logged = runtime.events.append(SessionEvent::ToolIntentRejected {
            session_id: session_id.to_string(),
            intent: intent.label(),
            reason: decision.reason.unwrap_or_default(),
        });
        state.persistence.append_event(session_id, &logged).await;
        return;
    }

    let stage_id = runtime.engine.state().stage_id.clone();
    let logged = runtime.events.append(SessionEvent::ToolIntentApplied {
        session_id: session_id.to_string(),
        intent: intent.label(),
        stage_id,
    });
    state.persistence.append_event(session_id, &logged).await;

    let events = runtime.engine.apply_intent(&intent, now);
    process_engine_events(state, session_id, &mut runtime, &events).await;
    if let Some(evt) = runtime.engine.evaluate_automatic_transitions(&[], now) {
        process_engine_events(state, session_id, &mut runtime, &[evt]).await;
    }
    broadcast_snapshots(state, session_id, &mut runtime);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget & voice errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Record adapter usage from outside the lock (realtime callbacks,
/// spawned reply tasks) and apply any budget consequence.
pub async fn record_usage_locked(state: &AppState, session_id: &str, sample: UsageSample) {
    let Some(slot) = state.runtimes.get(session_id) else {
        return;
    };
    let Ok(mut runtime) = slot.lock.acquire("record_usage").await else {
        return;
    };
    let crossing = runtime.cost.add_usage(sample);
    if crossing != BudgetCrossing::None {
        apply_budget_crossing(state, session_id, &mut runtime, crossing).await;
        broadcast_snapshots(state, session_id, &mut runtime);
    }
}

async fn apply_budget_crossing(
    state: &AppState,
    session_id: &str,
    runtime: &mut SessionRuntime,
    crossing: BudgetCrossing,
) {
    match crossing {
        BudgetCrossing::None => {}
        BudgetCrossing::Soft => {
            let logged = runtime.events.append(SessionEvent::BudgetSoftLimit {
                session_id: session_id.to_string(),
                usd_estimate: runtime.cost.usd_estimate,
            });
            state.persistence.append_event(session_id, &logged).await;
        }
        BudgetCrossing::Hard => {
            let logged = runtime.events.append(SessionEvent::BudgetHardLimit {
                session_id: session_id.to_string(),
                usd_estimate: runtime.cost.usd_estimate,
            });
            state.persistence.append_event(session_id, &logged).await;
            if let Some(realtime) = runtime.realtime.take() {
                realtime.close().await;
            }
            state.sessions.set_fallback(session_id, true);
        }
    }
}

/// Acquire the lock and degrade the voice path with a correlated error
/// notice. Used from spawned tasks that don't hold the lock.
pub(crate) async fn voice_error_locked(
    state: &AppState,
    session_id: &str,
    kind: VoiceErrorKind,
    detail: &str,
) {
    let Some(slot) = state.runtimes.get(session_id) else {
        return;
    };
    let Ok(mut runtime) = slot.lock.acquire("voice_error").await else {
        return;
    };
    voice_error_inner(state, session_id, &mut runtime, kind, detail).await;
    broadcast_snapshots(state, session_id, &mut runtime);
}

async fn voice_error_inner(
    state: &AppState,
    session_id: &str,
    runtime: &mut SessionRuntime,
    kind: VoiceErrorKind,
    detail: &str,
) {
    runtime.voice_fallback = true;
    let kind_str = match kind {
        VoiceErrorKind::TtsFailed => "tts_failed",
        VoiceErrorKind::SttFailed => "stt_failed",
        VoiceErrorKind::OpenaiFailed => "openai_failed",
    };
    let logged = runtime.events.append(SessionEvent::VoiceError {
        session_id: session_id.to_string(),
        kind: kind_str.to_string(),
        correlation_id: runtime.correlation_id.clone(),
        detail: detail.to_string(),
    });
    state.persistence.append_event(session_id, &logged).await;

    state.sessions.broadcast_to_session(
        session_id,
        &ServerMessage::VoiceError {
            session_id: session_id.to_string(),
            error: kind,
            correlation_id: runtime.correlation_id.clone(),
            detail: Some(detail.to_string()),
        },
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine event fan-out & snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn nurse_line(state: &AppState, session_id: &str, text: &str) {
    state.sessions.broadcast_to_session(
        session_id,
        &ServerMessage::PatientTranscriptDelta {
            session_id: session_id.to_string(),
            text: text.to_string(),
            character: Some(Character::Nurse),
        },
    );
}

/// Turn engine events into session events and transcript narration.
pub(crate) async fn process_engine_events(
    state: &AppState,
    session_id: &str,
    runtime: &mut SessionRuntime,
    events: &[EngineEvent],
) {
    for event in events {
        let session_event = match event {
            EngineEvent::OrderPlaced {
                order_id,
                order_type,
            } => Some(SessionEvent::OrderPlaced {
                session_id: session_id.to_string(),
                order_id: *order_id,
                order_type: order_type.as_str().to_string(),
            }),
            EngineEvent::OrderCompleted {
                order_id,
                order_type,
                result,
            } => {
                nurse_line(
                    state,
                    session_id,
                    &format!("{} result is back: {result}", order_type.as_str()),
                );
                Some(SessionEvent::OrderCompleted {
                    session_id: session_id.to_string(),
                    order_id: *order_id,
                    order_type: order_type.as_str().to_string(),
                })
            }
            EngineEvent::TreatmentApplied {
                treatment_type,
                note,
            } => {
                nurse_line(state, session_id, note);
                Some(SessionEvent::TreatmentApplied {
                    session_id: session_id.to_string(),
                    treatment: treatment_type.clone(),
                    detail: note.clone(),
                })
            }
            EngineEvent::StageChanged { from, to, forced } => Some(SessionEvent::StageChanged {
                session_id: session_id.to_string(),
                from: from.clone(),
                to: to.clone(),
                forced: *forced,
            }),
            EngineEvent::RhythmChanged { rhythm } => {
                state.sessions.broadcast_to_session(
                    session_id,
                    &ServerMessage::PatientTranscriptDelta {
                        session_id: session_id.to_string(),
                        text: format!("Rhythm on the monitor is now {rhythm}."),
                        character: Some(Character::Tech),
                    },
                );
                None
            }
            EngineEvent::IntentRejected { reason } => Some(SessionEvent::ToolIntentRejected {
                session_id: session_id.to_string(),
                intent: "engine".into(),
                reason: reason.clone(),
            }),
            EngineEvent::VitalsUpdated
            | EngineEvent::FindingRevealed { .. }
            | EngineEvent::ExamRevealed { .. } => None,
        };
        if let Some(evt) = session_event {
            let logged = runtime.events.append(evt);
            state.persistence.append_event(session_id, &logged).await;
        }
    }
}

/// Build, validate, and send the role-gated snapshots. A snapshot that
/// fails validation is dropped and logged, never sent.
pub fn broadcast_snapshots(state: &AppState, session_id: &str, runtime: &mut SessionRuntime) {
    let now = Utc::now();
    let elapsed = (runtime.engine.elapsed_ms(now) / 1000).max(0) as u64;
    let session_fallback = state.sessions.is_fallback(session_id);

    let presenter_view = snapshot::build_sim_state(
        session_id,
        runtime,
        Role::Presenter,
        session_fallback,
        elapsed,
    );
    send_validated(state, session_id, Role::Presenter, presenter_view);

    let participant_view = snapshot::build_sim_state(
        session_id,
        runtime,
        Role::Participant,
        session_fallback,
        elapsed,
    );
    send_validated(state, session_id, Role::Participant, participant_view);
}

fn send_validated(state: &AppState, session_id: &str, role: Role, sim_state: SimState) {
    if let Err(reason) = validate_sim_state(&sim_state) {
        tracing::error!(session_id, ?role, reason = %reason, "dropping invalid sim_state broadcast");
        return;
    }
    let msg = ServerMessage::SimState(sim_state);
    match role {
        Role::Presenter => state.sessions.broadcast_to_presenters(session_id, &msg),
        Role::Participant => state.sessions.broadcast_to_participants(session_id, &msg),
    }
}
