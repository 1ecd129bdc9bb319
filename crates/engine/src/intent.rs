//! Tool intents: proposed state changes.
//!
//! Intents arrive from the upstream LLM (via the realtime adapter), from
//! handlers, and from the engine's own scheduled effects. Every intent
//! passes through the tool gate before `apply_intent` except the engine's
//! internal order-completion and decay effects.

use serde::{Deserialize, Serialize};

use crate::state::OrderType;
use crate::treatments::TreatmentRequest;

/// Per-vital numeric deltas (blood pressure is an override string).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VitalsDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spo2: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rr: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
}

impl VitalsDelta {
    pub fn is_empty(&self) -> bool {
        self.hr.is_none()
            && self.bp.is_none()
            && self.spo2.is_none()
            && self.rr.is_none()
            && self.temp.is_none()
    }

    /// Largest absolute numeric delta, used for stage bounds checks.
    pub fn max_magnitude(&self) -> f64 {
        let mut max = 0f64;
        for v in [self.hr, self.spo2, self.rr] {
            if let Some(d) = v {
                max = max.max(d.unsigned_abs() as f64);
            }
        }
        if let Some(t) = self.temp {
            max = max.max(t.abs());
        }
        max
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IvParams {
    #[serde(default = "d_gauge")]
    pub gauge: u32,
    #[serde(default = "d_site")]
    pub site: String,
}

fn d_gauge() -> u32 {
    22
}
fn d_site() -> String {
    "left antecubital".into()
}

/// A proposed state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ToolIntent {
    UpdateVitals {
        deltas: VitalsDelta,
    },
    RevealFinding {
        finding_id: String,
    },
    ApplyTreatment {
        treatment: TreatmentRequest,
    },
    SubmitOrder {
        order_type: OrderType,
        #[serde(skip_serializing_if = "Option::is_none")]
        ordered_by: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        iv_params: Option<IvParams>,
    },
    SetStage {
        stage_id: String,
    },
    /// Engine-internal: fired by the pending-effect queue when an order's
    /// turnaround elapses. Never offered to the LLM and never gated.
    CompleteOrder {
        order_id: u64,
    },
}

impl ToolIntent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Self::UpdateVitals { .. } => IntentKind::UpdateVitals,
            Self::RevealFinding { .. } => IntentKind::RevealFinding,
            Self::ApplyTreatment { .. } => IntentKind::ApplyTreatment,
            Self::SubmitOrder { .. } => IntentKind::SubmitOrder,
            Self::SetStage { .. } => IntentKind::SetStage,
            Self::CompleteOrder { .. } => IntentKind::CompleteOrder,
        }
    }

    /// Short label for events and logs.
    pub fn label(&self) -> String {
        match self {
            Self::UpdateVitals { .. } => "update_vitals".into(),
            Self::RevealFinding { finding_id } => format!("reveal_finding:{finding_id}"),
            Self::ApplyTreatment { treatment } => {
                format!("apply_treatment:{}", treatment.treatment_type.as_str())
            }
            Self::SubmitOrder { order_type, .. } => {
                format!("submit_order:{}", order_type.as_str())
            }
            Self::SetStage { stage_id } => format!("set_stage:{stage_id}"),
            Self::CompleteOrder { order_id } => format!("complete_order:{order_id}"),
        }
    }
}

/// Closed intent tag set used by stage policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    UpdateVitals,
    RevealFinding,
    ApplyTreatment,
    SubmitOrder,
    SetStage,
    CompleteOrder,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_tag_round_trip() {
        let intent = ToolIntent::RevealFinding {
            finding_id: "murmur".into(),
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert!(json.contains(r#""intent":"reveal_finding""#));
        let back: ToolIntent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn delta_magnitude() {
        let d = VitalsDelta {
            hr: Some(-40),
            spo2: Some(3),
            ..Default::default()
        };
        assert_eq!(d.max_magnitude(), 40.0);
    }

    #[test]
    fn unknown_delta_key_rejected() {
        let raw = r#"{"hr": 10, "lactate": 2}"#;
        assert!(serde_json::from_str::<VitalsDelta>(raw).is_err());
    }
}
