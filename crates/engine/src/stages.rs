//! Stage definitions: the nodes of the scenario state machine.
//!
//! A stage declares which intents the tool gate admits, optional bounds on
//! LLM-proposed vitals deltas, and an ordered list of exit rules. Rules
//! are all-of guard conjunctions evaluated in declared order; the first
//! match wins and at most one transition fires per evaluation.

use serde::{Deserialize, Serialize};

use crate::intent::IntentKind;
use crate::state::{EngineState, ExtendedState, Vitals};
use crate::treatments::TreatmentType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    pub name: String,
    /// Intent tags the tool gate admits while this stage is active.
    pub allowed_intents: Vec<IntentKind>,
    /// Cap on the magnitude of a single LLM-proposed vitals delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_vitals_delta: Option<f64>,
    /// Baseline vitals applied when the stage is entered via an exit rule
    /// that asks for a reset (scenario data decides).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_vitals: Option<Vitals>,
    pub exit_rules: Vec<ExitRule>,
}

/// One exit rule: all guards must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRule {
    pub description: String,
    pub guards: Vec<ExitGuard>,
    pub target: String,
}

/// Guard predicates over vitals, findings, elapsed stage time, extended
/// state, and the action hints the orchestrator passes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "guard", rename_all = "snake_case")]
pub enum ExitGuard {
    HrAtLeast { bpm: u32 },
    HrAtMost { bpm: u32 },
    Spo2AtLeast { pct: u32 },
    Spo2AtMost { pct: u32 },
    HasFinding { finding_id: String },
    TimeInStageAtLeast { seconds: u64 },
    TreatmentGiven { treatment: TreatmentType },
    /// Extended-state conversion flag (complex scenarios only).
    Converted,
    /// Matches a hint passed by the caller for this evaluation, e.g.
    /// `"order:ekg"` or `"treatment:adenosine"`.
    ActionHint { hint: String },
}

impl ExitGuard {
    pub fn holds(&self, state: &EngineState, time_in_stage_secs: u64, hints: &[String]) -> bool {
        match self {
            Self::HrAtLeast { bpm } => state.vitals.hr >= *bpm,
            Self::HrAtMost { bpm } => state.vitals.hr <= *bpm,
            Self::Spo2AtLeast { pct } => state.vitals.spo2 >= *pct,
            Self::Spo2AtMost { pct } => state.vitals.spo2 <= *pct,
            Self::HasFinding { finding_id } => state.findings.contains(finding_id),
            Self::TimeInStageAtLeast { seconds } => time_in_stage_secs >= *seconds,
            Self::TreatmentGiven { treatment } => state
                .treatment_history
                .iter()
                .any(|t| t.treatment_type == treatment.as_str()),
            Self::Converted => match &state.extended {
                Some(ExtendedState::Svt(svt)) => svt.converted,
                Some(ExtendedState::Myocarditis(m)) => m.stabilized,
                None => false,
            },
            Self::ActionHint { hint } => hints.iter().any(|h| h == hint),
        }
    }
}

impl ExitRule {
    pub fn matches(&self, state: &EngineState, time_in_stage_secs: u64, hints: &[String]) -> bool {
        self.guards
            .iter()
            .all(|g| g.holds(state, time_in_stage_secs, hints))
    }
}
