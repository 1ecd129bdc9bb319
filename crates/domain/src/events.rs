use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured session events emitted across all PulseGate crates.
///
/// Events land in the per-session ring (tracing) and are forwarded to the
/// persistence adapter best-effort. Kinds follow a dotted
/// `subsystem.action` naming scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ToolIntentApplied {
        session_id: String,
        intent: String,
        stage_id: String,
    },
    ToolIntentRejected {
        session_id: String,
        intent: String,
        reason: String,
    },
    StageChanged {
        session_id: String,
        from: String,
        to: String,
        forced: bool,
    },
    ScenarioEvent {
        session_id: String,
        kind: String,
        description: String,
    },
    TreatmentApplied {
        session_id: String,
        treatment: String,
        detail: String,
    },
    OrderPlaced {
        session_id: String,
        order_id: u64,
        order_type: String,
    },
    OrderCompleted {
        session_id: String,
        order_id: u64,
        order_type: String,
    },
    VoiceError {
        session_id: String,
        kind: String,
        correlation_id: String,
        detail: String,
    },
    BudgetSoftLimit {
        session_id: String,
        usd_estimate: f64,
    },
    BudgetHardLimit {
        session_id: String,
        usd_estimate: f64,
    },
    BudgetResumeBlocked {
        session_id: String,
        usd_estimate: f64,
    },
    AuthDenied {
        session_id: String,
        user_id: String,
        reason: String,
    },
    AutoReplyBlocked {
        session_id: String,
        user_id: String,
        reason: String,
    },
    FloorGranted {
        session_id: String,
        user_id: String,
        previous: Option<String>,
    },
    FloorReleased {
        session_id: String,
        user_id: String,
    },
    SessionHydrated {
        session_id: String,
        stage_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    DebriefScored {
        session_id: String,
        total_points: i32,
        grade: String,
    },
}

impl SessionEvent {
    /// Log the serialized event as a structured tracing line.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(session_event = %json, "pg_event");
    }

    /// The dotted event kind used for the persisted stream.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolIntentApplied { .. } => "tool.intent.applied",
            Self::ToolIntentRejected { .. } => "tool.intent.rejected",
            Self::StageChanged { .. } => "scenario.stage_changed",
            Self::ScenarioEvent { .. } => "scenario.event",
            Self::TreatmentApplied { .. } => "scenario.treatment",
            Self::OrderPlaced { .. } => "order.placed",
            Self::OrderCompleted { .. } => "order.completed",
            Self::VoiceError { .. } => "voice.error",
            Self::BudgetSoftLimit { .. } => "budget.soft_limit",
            Self::BudgetHardLimit { .. } => "budget.hard_limit",
            Self::BudgetResumeBlocked { .. } => "budget.resume_blocked",
            Self::AuthDenied { .. } => "ws.auth.denied",
            Self::AutoReplyBlocked { .. } => "safety.autoreply.blocked",
            Self::FloorGranted { .. } => "floor.granted",
            Self::FloorReleased { .. } => "floor.released",
            Self::SessionHydrated { .. } => "session.hydrated",
            Self::SessionClosed { .. } => "session.closed",
            Self::DebriefScored { .. } => "debrief.scored",
        }
    }
}

/// A timestamped event as stored in the per-session ring and the persisted
/// event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub event: SessionEvent,
}

impl LoggedEvent {
    pub fn now(event: SessionEvent) -> Self {
        Self {
            ts: Utc::now(),
            kind: event.kind().to_string(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_dotted() {
        let evt = SessionEvent::BudgetSoftLimit {
            session_id: "s1".into(),
            usd_estimate: 2.5,
        };
        assert_eq!(evt.kind(), "budget.soft_limit");
    }

    #[test]
    fn logged_event_round_trips() {
        let logged = LoggedEvent::now(SessionEvent::FloorGranted {
            session_id: "s1".into(),
            user_id: "u1".into(),
            previous: None,
        });
        let json = serde_json::to_string(&logged).unwrap();
        let back: LoggedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "floor.granted");
    }
}
