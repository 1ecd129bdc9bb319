//! End-to-end flows through the orchestrator with scripted adapters:
//! floor arbitration, role-gated visibility, the SVT conversion path,
//! budget degradation, and the auto-reply safety valve.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;
use tokio::sync::mpsc;

use pg_domain::config::Config;
use pg_engine::state::OrderStatus;
use pg_engine::{ExtendedState, OrderType};
use pg_protocol::{Character, ClientMessage, Role, ServerMessage, VoiceCommandType};
use pg_voice::stub::{CannedTts, FixedStt, ScriptedChat};
use pg_voice::VoiceAdapters;

use pg_gateway::cost::UsageSample;
use pg_gateway::orchestrator::{self, ConnCtx};
use pg_gateway::persist::NullPersistence;
use pg_gateway::runtime::RuntimeManager;
use pg_gateway::sessions::{ClientHandle, SessionManager};
use pg_gateway::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn make_state(default_scenario: &str, stt_transcript: Option<&str>) -> AppState {
    let mut config = Config::default();
    // Keep the heartbeat out of the way; tests drive ticks directly.
    config.gateway.heartbeat_ms = 3_600_000;
    // No command cooldown so tests can issue back-to-back commands (the
    // auto-reply guard keeps its own 1 s floor regardless).
    config.gateway.command_cooldown_ms = 0;

    AppState {
        config: Arc::new(config),
        sessions: Arc::new(SessionManager::new(default_scenario)),
        runtimes: Arc::new(RuntimeManager::new()),
        adapters: VoiceAdapters {
            stt: Arc::new(FixedStt {
                transcript: stt_transcript.map(str::to_string),
            }),
            tts: Arc::new(CannedTts),
            chat: Arc::new(ScriptedChat {
                reply: "My chest still feels fluttery.".into(),
            }),
            realtime_factory: None,
        },
        persistence: Arc::new(NullPersistence),
        verifier: None,
    }
}

async fn join(
    state: &AppState,
    session_id: &str,
    user_id: &str,
    role: Role,
) -> (ConnCtx, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(512);
    let conn_id = state.sessions.mint_conn_id();
    state.sessions.add_client(
        session_id,
        role,
        ClientHandle {
            conn_id,
            user_id: user_id.to_string(),
            sink: tx,
        },
    );
    let ctx = ConnCtx {
        conn_id,
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        role,
    };
    orchestrator::on_client_joined(state, &ctx).await;
    (ctx, rx)
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(json) = rx.try_recv() {
        out.push(serde_json::from_str(&json).expect("valid server message"));
    }
    out
}

async fn wait_for(
    rx: &mut mpsc::Receiver<String>,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let json = rx.recv().await.expect("channel open");
            let msg: ServerMessage = serde_json::from_str(&json).expect("valid server message");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("message arrives in time")
}

fn command(session_id: &str, user_id: &str, cmd: VoiceCommandType, payload: serde_json::Value) -> ClientMessage {
    ClientMessage::VoiceCommand {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        character: None,
        command_type: cmd,
        payload: Some(payload),
    }
}

fn audio_frame(session_id: &str, user_id: &str) -> ClientMessage {
    ClientMessage::DoctorAudio {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        audio_base64: base64::engine::general_purpose::STANDARD.encode([0u8; 3200]),
        content_type: "audio/webm".into(),
        character: None,
    }
}

fn latest_sim_state(messages: &[ServerMessage]) -> Option<&pg_protocol::SimState> {
    messages.iter().rev().find_map(|m| match m {
        ServerMessage::SimState(s) => Some(s),
        _ => None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Floor arbitration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn floor_arbitration_and_non_holder_audio_is_ignored() {
    let state = make_state("teen_svt_complex_v1", Some("checking on the patient now"));
    let (ctx_a, mut rx_a) = join(&state, "s1", "alice", Role::Participant).await;
    let (ctx_b, mut rx_b) = join(&state, "s1", "bob", Role::Participant).await;

    orchestrator::handle_message(
        &state,
        &ctx_a,
        ClientMessage::StartSpeaking {
            session_id: "s1".into(),
            user_id: "alice".into(),
        },
    )
    .await;
    orchestrator::handle_message(
        &state,
        &ctx_b,
        ClientMessage::StartSpeaking {
            session_id: "s1".into(),
            user_id: "bob".into(),
        },
    )
    .await;

    // Exactly one holder; the loser got a floor_taken error.
    assert_eq!(state.sessions.floor_holder("s1").as_deref(), Some("alice"));
    let bob_msgs = drain(&mut rx_b);
    assert!(bob_msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { message } if message == "floor_taken"
    )));

    // Clear both inboxes, then send audio from each.
    drain(&mut rx_a);
    drain(&mut rx_b);
    orchestrator::handle_message(&state, &ctx_b, audio_frame("s1", "bob")).await;
    let after_bob: Vec<ServerMessage> = drain(&mut rx_a);
    assert!(
        !after_bob
            .iter()
            .any(|m| matches!(m, ServerMessage::DoctorUtterance { .. })),
        "non-holder audio must produce no utterance"
    );

    orchestrator::handle_message(&state, &ctx_a, audio_frame("s1", "alice")).await;
    let after_alice = drain(&mut rx_a);
    assert!(after_alice.iter().any(|m| matches!(
        m,
        ServerMessage::DoctorUtterance { user_id, .. } if user_id == "alice"
    )));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Role-gated visibility
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn participant_vitals_hidden_until_vitals_order_completes() {
    let state = make_state("teen_svt_complex_v1", None);
    let (_presenter, mut rx_p) = join(&state, "s1", "lead", Role::Presenter).await;
    let (ctx_part, mut rx_a) = join(&state, "s1", "alice", Role::Participant).await;

    // Presenter always sees vitals and the presenter-only fields.
    let p_msgs = drain(&mut rx_p);
    let p_state = latest_sim_state(&p_msgs).expect("presenter snapshot");
    assert_eq!(p_state.vitals.as_ref().unwrap().hr, 220);
    assert!(p_state.extended.is_some());
    assert!(p_state.stage_ids.is_some());

    // Participant starts blind.
    let a_msgs = drain(&mut rx_a);
    let a_state = latest_sim_state(&a_msgs).expect("participant snapshot");
    assert!(a_state.vitals.is_none());
    assert!(a_state.extended.is_none());
    assert!(a_state.stage_ids.is_none());

    // Order vitals, then let the ETA elapse on a driven tick.
    orchestrator::handle_message(
        &state,
        &ctx_part,
        command("s1", "alice", VoiceCommandType::Order, serde_json::json!({"order_type": "vitals"})),
    )
    .await;
    let slot = state.runtimes.get("s1").unwrap();
    {
        let mut runtime = slot.lock.acquire("test_tick").await.unwrap();
        runtime
            .engine
            .tick(Utc::now() + chrono::Duration::milliseconds(OrderType::Vitals.eta_ms() + 500));
        assert!(runtime
            .engine
            .state()
            .orders
            .iter()
            .any(|o| o.status == OrderStatus::Complete));
        orchestrator::broadcast_snapshots(&state, "s1", &mut runtime);
    }

    let a_msgs = drain(&mut rx_a);
    let a_state = latest_sim_state(&a_msgs).expect("post-order snapshot");
    assert_eq!(a_state.vitals.as_ref().unwrap().hr, 220);
    assert!(a_state.extended.is_none(), "extended stays presenter-only");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SVT happy path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn svt_conversion_and_complex_debrief() {
    let state = make_state("teen_svt_complex_v1", None);
    let (ctx_p, mut rx_p) = join(&state, "s1", "lead", Role::Presenter).await;
    let (ctx_a, _rx_a) = join(&state, "s1", "alice", Role::Participant).await;

    // EKG order advances the stage and starts the SVT workup clock.
    orchestrator::handle_message(
        &state,
        &ctx_a,
        command("s1", "alice", VoiceCommandType::Order, serde_json::json!({"order_type": "ekg"})),
    )
    .await;

    // Vagal attempt (does not convert this patient), then a correct
    // first adenosine dose with flush.
    orchestrator::handle_message(
        &state,
        &ctx_p,
        command(
            "s1",
            "lead",
            VoiceCommandType::Treatment,
            serde_json::json!({"treatment_type": "vagal_maneuver"}),
        ),
    )
    .await;
    orchestrator::handle_message(
        &state,
        &ctx_a,
        command(
            "s1",
            "alice2",
            VoiceCommandType::Treatment,
            serde_json::json!({
                "treatment_type": "adenosine",
                "dose_mg": 5.0,
                "rapid_push": true,
                "flush_given": true
            }),
        ),
    )
    .await;

    let msgs = drain(&mut rx_p);
    let snap = latest_sim_state(&msgs).expect("snapshot after treatments");
    assert_eq!(snap.stage_id, "converted");
    match snap.extended.as_ref().expect("presenter extended") {
        ExtendedState::Svt(svt) => {
            assert!(svt.converted);
            assert_eq!(svt.conversion_method.as_deref(), Some("adenosine_first"));
            assert_eq!(svt.adenosine_doses.len(), 1);
        }
        other => panic!("unexpected extended state: {other:?}"),
    }
    assert_eq!(snap.vitals.as_ref().unwrap().hr, 96);

    // Debrief: enough transcript turns, deterministic score.
    let turns = serde_json::json!([
        {"speaker": "alice", "text": "get an ekg"},
        {"speaker": "nurse", "text": "ekg is back"},
        {"speaker": "alice", "text": "adenosine 5 milligrams rapid push"},
    ]);
    orchestrator::handle_message(
        &state,
        &ctx_a,
        ClientMessage::AnalyzeTranscript {
            session_id: "s1".into(),
            user_id: "alice".into(),
            turns: serde_json::from_value(turns).unwrap(),
        },
    )
    .await;

    let debrief = wait_for(&mut rx_p, |m| {
        matches!(m, ServerMessage::ComplexDebriefResult { .. })
    })
    .await;
    let ServerMessage::ComplexDebriefResult {
        passed,
        grade,
        bonuses,
        penalties,
        timeline,
        ..
    } = debrief
    else {
        unreachable!();
    };
    assert!(passed);
    assert!(matches!(grade.as_str(), "A" | "B"));
    let bonus_ids: Vec<&str> = bonuses.iter().map(|b| b.id.as_str()).collect();
    assert!(bonus_ids.contains(&"early_ecg"));
    assert!(bonus_ids.contains(&"first_dose_conversion"));
    assert!(!bonus_ids.contains(&"vagal_conversion"));
    assert!(!penalties
        .iter()
        .any(|p| p.id.contains("overdose")));
    assert!(timeline.len() >= 3);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unsedated cardioversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn unsedated_cardioversion_is_penalized() {
    let state = make_state("teen_svt_complex_v1", None);
    let (ctx_a, _rx_a) = join(&state, "s1", "alice", Role::Participant).await;

    orchestrator::handle_message(
        &state,
        &ctx_a,
        command(
            "s1",
            "alice",
            VoiceCommandType::Treatment,
            serde_json::json!({
                "treatment_type": "cardioversion",
                "joules": 50.0,
                "synchronized": true,
                "sedated": false
            }),
        ),
    )
    .await;

    let slot = state.runtimes.get("s1").unwrap();
    let runtime = slot.lock.acquire("inspect").await.unwrap();
    let Some(ExtendedState::Svt(svt)) = &runtime.engine.state().extended else {
        panic!("svt extended state expected");
    };
    assert!(svt.flags.unsedated_cardioversion);
    assert!(svt.converted, "1 J/kg synchronized still converts");
    assert!(svt.timeline_events.iter().any(|e| e.negative));

    let score = pg_engine::svt::scoring::calculate_score(svt);
    let penalty = score
        .penalties_incurred
        .iter()
        .find(|p| p.id == "unsedated_cardioversion")
        .expect("penalty present");
    assert!(penalty.points < 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget hard limit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn hard_budget_pins_fallback_and_blocks_resume() {
    let state = make_state("teen_svt_complex_v1", None);
    let (ctx_a, mut rx_a) = join(&state, "s1", "alice", Role::Participant).await;
    drain(&mut rx_a);

    // Burn through the whole budget in one usage report.
    orchestrator::record_usage_locked(
        &state,
        "s1",
        UsageSample {
            input_tokens: 0,
            output_tokens: 2_000_000,
            audio_seconds: 0.0,
        },
    )
    .await;

    assert!(state.sessions.is_fallback("s1"));
    let msgs = drain(&mut rx_a);
    let snap = latest_sim_state(&msgs).expect("snapshot after crossing");
    assert!(snap.fallback);

    // Resume is refused and leaves fallback pinned.
    orchestrator::handle_message(
        &state,
        &ctx_a,
        command("s1", "alice", VoiceCommandType::ResumeAi, serde_json::Value::Null),
    )
    .await;
    assert!(state.sessions.is_fallback("s1"));
    let msgs = drain(&mut rx_a);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::Error { message } if message.contains("budget")
    )));

    let slot = state.runtimes.get("s1").unwrap();
    let runtime = slot.lock.acquire("inspect").await.unwrap();
    assert_eq!(runtime.events.count_kind("budget.hard_limit"), 1);
    assert_eq!(runtime.events.count_kind("budget.resume_blocked"), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-reply safety valve
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn flagged_utterance_is_held_for_presenter_review() {
    let state = make_state("teen_svt_complex_v1", Some("This is shit"));
    let (_ctx_p, mut rx_p) = join(&state, "s1", "lead", Role::Presenter).await;
    let (ctx_a, mut rx_a) = join(&state, "s1", "alice", Role::Participant).await;

    orchestrator::handle_message(
        &state,
        &ctx_a,
        ClientMessage::StartSpeaking {
            session_id: "s1".into(),
            user_id: "alice".into(),
        },
    )
    .await;
    drain(&mut rx_p);
    drain(&mut rx_a);

    orchestrator::handle_message(&state, &ctx_a, audio_frame("s1", "alice")).await;

    // Presenter sees the held-for-review nurse line.
    let p_msgs = drain(&mut rx_p);
    assert!(p_msgs.iter().any(|m| matches!(
        m,
        ServerMessage::PatientTranscriptDelta { text, character, .. }
            if text.contains("held for review") && *character == Some(Character::Nurse)
    )));

    // Participants get the utterance but no NPC reply and no review
    // notice.
    let a_msgs = drain(&mut rx_a);
    assert!(a_msgs
        .iter()
        .any(|m| matches!(m, ServerMessage::DoctorUtterance { .. })));
    assert!(!a_msgs.iter().any(|m| matches!(
        m,
        ServerMessage::PatientTranscriptDelta { character, .. }
            if *character == Some(Character::Patient)
    )));
    assert!(!a_msgs
        .iter()
        .any(|m| matches!(m, ServerMessage::PatientAudio { .. })));

    let slot = state.runtimes.get("s1").unwrap();
    let runtime = slot.lock.acquire("inspect").await.unwrap();
    assert_eq!(runtime.events.count_kind("safety.autoreply.blocked"), 1);
}
