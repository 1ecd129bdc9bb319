use serde::{Deserialize, Serialize};

use pg_engine::scenarios::ScenarioEventKind;
use pg_engine::svt::TimelineEvent;
use pg_engine::svt::scoring::{ChecklistResult, ScoreItemResult};
use pg_engine::{IvParams, OrderType, TreatmentRequest, VitalsDelta};

use crate::sim_state::SimState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles & characters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    Participant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presenter => "presenter",
            Self::Participant => "participant",
        }
    }
}

/// Non-player characters a reply can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Character {
    Patient,
    Nurse,
    Tech,
    Consultant,
    Imaging,
    Parent,
}

impl Character {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Nurse => "nurse",
            Self::Tech => "tech",
            Self::Consultant => "consultant",
            Self::Imaging => "imaging",
            Self::Parent => "parent",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inbound message envelope. Closed set — anything else is a protocol
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        session_id: String,
        user_id: String,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    StartSpeaking {
        session_id: String,
        user_id: String,
    },
    StopSpeaking {
        session_id: String,
        user_id: String,
    },
    DoctorAudio {
        session_id: String,
        user_id: String,
        audio_base64: String,
        content_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<Character>,
    },
    SetScenario {
        session_id: String,
        user_id: String,
        scenario_id: String,
    },
    AnalyzeTranscript {
        session_id: String,
        user_id: String,
        turns: Vec<TranscriptTurn>,
    },
    VoiceCommand {
        session_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<Character>,
        command_type: VoiceCommandType,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: String,
    pub text: String,
}

/// The closed voice-command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceCommandType {
    PauseAi,
    ResumeAi,
    ForceReply,
    EndTurn,
    MuteUser,
    Freeze,
    Unfreeze,
    SkipStage,
    Order,
    Exam,
    ToggleTelemetry,
    Treatment,
    ShowEkg,
    ScenarioEvent,
}

// ── Command payloads ─────────────────────────────────────────────────
//
// `VoiceCommand.payload` is parsed into one of these by the handler for
// the command type. Unknown keys are rejected.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderPayload {
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_params: Option<IvParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    Cardiac,
    Lungs,
    General,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExamPayload {
    pub exam_type: ExamType,
}

/// Treatment commands carry the engine's request shape directly.
pub type TreatmentPayload = TreatmentRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioEventPayload {
    pub event_type: ScenarioEventKind,
    /// Explicit deltas for `vitals_change`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vitals: Option<VitalsDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkipStagePayload {
    pub stage_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MuteUserPayload {
    pub user_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatientVoiceState {
    Idle,
    Listening,
    Speaking,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceErrorKind {
    TtsFailed,
    SttFailed,
    OpenaiFailed,
}

/// Outbound message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        session_id: String,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        insecure_mode: Option<bool>,
    },
    ParticipantState {
        session_id: String,
        user_id: String,
        speaking: bool,
    },
    PatientState {
        session_id: String,
        state: PatientVoiceState,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<Character>,
    },
    PatientTranscriptDelta {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<Character>,
    },
    PatientAudio {
        session_id: String,
        audio_base64: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<Character>,
    },
    DoctorUtterance {
        session_id: String,
        user_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<Character>,
    },
    SimState(SimState),
    ScenarioChanged {
        session_id: String,
        scenario_id: String,
    },
    AnalysisResult {
        session_id: String,
        summary: String,
        strengths: Vec<String>,
        opportunities: Vec<String>,
        teaching_points: Vec<String>,
    },
    ComplexDebriefResult {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        passed: bool,
        grade: String,
        checklist_score: i32,
        checklist_results: Vec<ChecklistResult>,
        bonuses: Vec<ScoreItemResult>,
        penalties: Vec<ScoreItemResult>,
        total_points: i32,
        timeline: Vec<TimelineEvent>,
        scenario_specific_feedback: Vec<String>,
    },
    VoiceError {
        session_id: String,
        error: VoiceErrorKind,
        correlation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Serialize once for fan-out.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_string())
    }
}
