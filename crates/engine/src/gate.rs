//! Tool gate: per-stage policy validation for proposed intents.
//!
//! Pure — no state, no side effects. The orchestrator consults the gate
//! for every LLM-proposed intent before it reaches the engine; handler
//! commands issued by participants do not pass through here.

use serde::Serialize;

use crate::intent::{IntentKind, ToolIntent};
use crate::stages::StageDefinition;

/// Outcome of a gate check.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct ToolGate;

impl ToolGate {
    /// Validate a proposed intent against the active stage policy.
    pub fn check(stage: &StageDefinition, intent: &ToolIntent) -> GateDecision {
        let kind = intent.kind();

        // The completion intent is engine-internal and never admissible
        // from outside, whatever the stage says.
        if kind == IntentKind::CompleteOrder {
            return GateDecision::deny("complete_order is not an external intent");
        }

        if !stage.allowed_intents.contains(&kind) {
            return GateDecision::deny(format!(
                "intent {:?} not allowed in stage {}",
                kind, stage.id
            ));
        }

        if let ToolIntent::UpdateVitals { deltas } = intent {
            if deltas.is_empty() {
                return GateDecision::deny("empty vitals delta");
            }
            if let Some(max) = stage.max_vitals_delta {
                let magnitude = deltas.max_magnitude();
                if magnitude > max {
                    return GateDecision::deny(format!(
                        "vitals delta {magnitude} exceeds stage bound {max}"
                    ));
                }
            }
        }

        GateDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::VitalsDelta;
    use crate::scenarios;

    fn stage(scenario: &str, stage_id: &str) -> StageDefinition {
        scenarios::by_id(scenario)
            .unwrap()
            .stage(stage_id)
            .unwrap()
            .clone()
    }

    #[test]
    fn treatment_denied_in_presentation() {
        let presentation = stage("teen_svt_complex_v1", "presentation");
        let intent = ToolIntent::ApplyTreatment {
            treatment: crate::treatments::TreatmentRequest::new(
                crate::treatments::TreatmentType::Adenosine,
            ),
        };
        let decision = ToolGate::check(&presentation, &intent);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("presentation"));
    }

    #[test]
    fn treatment_allowed_in_active_svt() {
        let active = stage("teen_svt_complex_v1", "active_svt");
        let intent = ToolIntent::ApplyTreatment {
            treatment: crate::treatments::TreatmentRequest::new(
                crate::treatments::TreatmentType::VagalManeuver,
            ),
        };
        assert!(ToolGate::check(&active, &intent).allowed);
    }

    #[test]
    fn vitals_delta_bound_enforced() {
        let presentation = stage("teen_svt_complex_v1", "presentation");
        let small = ToolIntent::UpdateVitals {
            deltas: VitalsDelta {
                hr: Some(-8),
                ..Default::default()
            },
        };
        assert!(ToolGate::check(&presentation, &small).allowed);

        let huge = ToolIntent::UpdateVitals {
            deltas: VitalsDelta {
                hr: Some(-80),
                ..Default::default()
            },
        };
        let decision = ToolGate::check(&presentation, &huge);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("exceeds"));
    }

    #[test]
    fn complete_order_always_denied() {
        let active = stage("teen_svt_complex_v1", "active_svt");
        let decision = ToolGate::check(&active, &ToolIntent::CompleteOrder { order_id: 1 });
        assert!(!decision.allowed);
    }

    #[test]
    fn set_stage_denied_everywhere_in_catalog() {
        for id in scenarios::scenario_ids() {
            let def = scenarios::by_id(id).unwrap();
            for stage in &def.stages {
                let decision = ToolGate::check(
                    stage,
                    &ToolIntent::SetStage {
                        stage_id: "disposition".into(),
                    },
                );
                assert!(!decision.allowed, "{id}/{} admits set_stage", stage.id);
            }
        }
    }
}
