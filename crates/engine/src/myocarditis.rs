//! Myocarditis sub-engine.
//!
//! The failing ventricle tolerates neither fluid overload nor delay:
//! aggressive boluses push the patient into shock, early inotropic
//! support stabilizes. Smaller sibling of the SVT sub-engine with the
//! same pause-clock mechanics and scoring shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Vitals;
use crate::svt::TimelineEvent;
use crate::svt::scoring::{ChecklistResult, Grade, ScoreItemResult, ScoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MyoPhase {
    Presentation,
    Compensated,
    Decompensating,
    Shock,
    Stabilized,
}

impl MyoPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presentation => "presentation",
            Self::Compensated => "compensated",
            Self::Decompensating => "decompensating",
            Self::Shock => "shock",
            Self::Stabilized => "stabilized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidBolus {
    pub ts: DateTime<Utc>,
    pub ml_kg: f64,
}

/// Cumulative fluids beyond this tip the failing ventricle into shock.
pub const FLUID_OVERLOAD_ML_KG: f64 = 40.0;
/// A single bolus beyond this counts as aggressive even if the total is ok.
pub const AGGRESSIVE_BOLUS_ML_KG: f64 = 15.0;
/// Inotrope started inside this pause-adjusted window earns the bonus.
pub const EARLY_INOTROPE_MS: i64 = 300_000;
/// Beyond this window without inotropic support is a delay.
pub const INOTROPE_DELAY_MS: i64 = 600_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyocarditisState {
    pub phase: MyoPhase,
    /// `"adequate"` or `"poor"`.
    pub perfusion: String,
    pub stabilized: bool,
    pub fluid_boluses: Vec<FluidBolus>,
    pub total_fluids_ml_kg: f64,
    pub inotrope_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inotrope_elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecg_ordered_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo_ordered_ts: Option<DateTime<Utc>>,
    pub picu_consulted: bool,
    pub scenario_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_paused_at: Option<DateTime<Utc>>,
    pub total_paused_ms: i64,
    pub phase_entered_elapsed_ms: i64,
    pub timeline_events: Vec<TimelineEvent>,
    pub rule_triggers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_score: Option<i32>,
    /// Vitals applied when the patient stabilizes on support.
    pub stabilized_vitals: Vitals,
    /// Vitals applied on fluid-overload shock.
    pub shock_vitals: Vitals,
}

/// State change for the scenario engine to apply.
#[derive(Debug, Clone, Default)]
pub struct MyoDirective {
    pub vitals_override: Option<Vitals>,
    pub stabilized_now: bool,
}

impl MyocarditisState {
    pub fn new(
        started_at: DateTime<Utc>,
        stabilized_vitals: Vitals,
        shock_vitals: Vitals,
    ) -> Self {
        Self {
            phase: MyoPhase::Presentation,
            perfusion: "poor".into(),
            stabilized: false,
            fluid_boluses: Vec::new(),
            total_fluids_ml_kg: 0.0,
            inotrope_started: false,
            inotrope_elapsed_ms: None,
            ecg_ordered_ts: None,
            echo_ordered_ts: None,
            picu_consulted: false,
            scenario_started_at: started_at,
            clock_paused_at: None,
            total_paused_ms: 0,
            phase_entered_elapsed_ms: 0,
            timeline_events: Vec::new(),
            rule_triggers: Vec::new(),
            current_score: None,
            stabilized_vitals,
            shock_vitals,
        }
    }

    pub fn elapsed_since_start(&self, now: DateTime<Utc>) -> i64 {
        let reference = self.clock_paused_at.unwrap_or(now);
        let raw = (reference - self.scenario_started_at).num_milliseconds();
        (raw - self.total_paused_ms).max(0)
    }

    pub fn pause_clock(&mut self, now: DateTime<Utc>) {
        if self.clock_paused_at.is_none() {
            self.clock_paused_at = Some(now);
        }
    }

    pub fn resume_clock(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.clock_paused_at.take() {
            self.total_paused_ms += (now - paused_at).num_milliseconds().max(0);
        }
    }

    pub fn note(&mut self, ts: DateTime<Utc>, kind: &str, description: impl Into<String>) {
        self.timeline_events.push(TimelineEvent {
            ts,
            kind: kind.to_string(),
            description: description.into(),
            negative: false,
        });
    }

    pub fn note_negative(&mut self, ts: DateTime<Utc>, kind: &str, description: impl Into<String>) {
        self.timeline_events.push(TimelineEvent {
            ts,
            kind: kind.to_string(),
            description: description.into(),
            negative: true,
        });
    }

    fn enter_phase(&mut self, now: DateTime<Utc>, phase: MyoPhase) {
        if self.phase == phase {
            return;
        }
        self.phase_entered_elapsed_ms = self.elapsed_since_start(now);
        self.phase = phase;
        self.note(now, "phase", format!("Entered phase {}", phase.as_str()));
    }

    pub fn record_ecg_ordered(&mut self, now: DateTime<Utc>) {
        if self.ecg_ordered_ts.is_none() {
            self.ecg_ordered_ts = Some(now);
            self.note(now, "order", "12-lead ECG obtained");
        }
    }

    pub fn record_echo_ordered(&mut self, now: DateTime<Utc>) {
        if self.echo_ordered_ts.is_none() {
            self.echo_ordered_ts = Some(now);
            self.note(now, "order", "Bedside echo requested");
        }
    }

    pub fn record_picu_consult(&mut self, now: DateTime<Utc>) {
        if !self.picu_consulted {
            self.picu_consulted = true;
            self.note(now, "consult", "PICU consulted");
        }
    }

    pub fn apply_fluid_bolus(&mut self, now: DateTime<Utc>, ml_kg: f64) -> MyoDirective {
        self.fluid_boluses.push(FluidBolus { ts: now, ml_kg });
        self.total_fluids_ml_kg += ml_kg;

        if ml_kg > AGGRESSIVE_BOLUS_ML_KG {
            self.note_negative(
                now,
                "treatment",
                format!("Aggressive {ml_kg:.0} mL/kg bolus in myocarditis"),
            );
        } else {
            self.note(now, "treatment", format!("Cautious {ml_kg:.0} mL/kg bolus"));
        }

        if self.total_fluids_ml_kg > FLUID_OVERLOAD_ML_KG && !self.stabilized {
            self.rule_triggers.push("fluid_overload_shock".into());
            self.note_negative(
                now,
                "response",
                format!(
                    "Fluid overload at {:.0} mL/kg total — patient decompensating into shock",
                    self.total_fluids_ml_kg
                ),
            );
            self.perfusion = "poor".into();
            self.enter_phase(now, MyoPhase::Shock);
            return MyoDirective {
                vitals_override: Some(self.shock_vitals.clone()),
                stabilized_now: false,
            };
        }
        MyoDirective::default()
    }

    pub fn apply_inotrope(&mut self, now: DateTime<Utc>) -> MyoDirective {
        if self.inotrope_started {
            return MyoDirective::default();
        }
        self.inotrope_started = true;
        self.inotrope_elapsed_ms = Some(self.elapsed_since_start(now));
        self.note(now, "treatment", "Inotrope infusion started");

        if self.total_fluids_ml_kg <= FLUID_OVERLOAD_ML_KG {
            self.stabilized = true;
            self.perfusion = "adequate".into();
            self.rule_triggers.push("inotrope_stabilized".into());
            self.note(now, "response", "Perfusion improving on inotropic support");
            self.enter_phase(now, MyoPhase::Stabilized);
            return MyoDirective {
                vitals_override: Some(self.stabilized_vitals.clone()),
                stabilized_now: true,
            };
        }
        MyoDirective::default()
    }

    /// Dwell transitions. No-op while paused.
    pub fn tick(&mut self, now: DateTime<Utc>) -> MyoDirective {
        if self.clock_paused_at.is_some() || self.stabilized {
            return MyoDirective::default();
        }

        match self.phase {
            MyoPhase::Presentation => {
                if self.elapsed_since_start(now) - self.phase_entered_elapsed_ms >= 30_000 {
                    self.enter_phase(now, MyoPhase::Compensated);
                }
            }
            MyoPhase::Compensated => {
                if !self.inotrope_started
                    && self.elapsed_since_start(now) - self.phase_entered_elapsed_ms >= 180_000
                {
                    self.note_negative(now, "response", "Perfusion worsening without support");
                    self.enter_phase(now, MyoPhase::Decompensating);
                }
            }
            _ => {}
        }
        MyoDirective::default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Item {
    id: &'static str,
    description: &'static str,
    explanation: &'static str,
    points: i32,
    predicate: fn(&MyocarditisState) -> bool,
}

const CHECKLIST: &[Item] = &[
    Item {
        id: "ecg_obtained",
        description: "12-lead ECG obtained",
        explanation: "Low voltages and ST changes point at the myocardium",
        points: 15,
        predicate: |m| m.ecg_ordered_ts.is_some(),
    },
    Item {
        id: "echo_ordered",
        description: "Bedside echo requested",
        explanation: "Function, not anatomy, is the question in myocarditis",
        points: 20,
        predicate: |m| m.echo_ordered_ts.is_some(),
    },
    Item {
        id: "cautious_fluids",
        description: "Fluids limited to careful boluses",
        explanation: "5–10 mL/kg aliquots with reassessment protect the failing ventricle",
        points: 20,
        predicate: |m| {
            !m.fluid_boluses.is_empty()
                && m.fluid_boluses.iter().all(|b| b.ml_kg <= 10.0)
                && m.total_fluids_ml_kg <= 20.0
        },
    },
    Item {
        id: "inotrope_started",
        description: "Inotropic support started",
        explanation: "Contractility is the deficit; fluids alone cannot fix it",
        points: 25,
        predicate: |m| m.inotrope_started,
    },
    Item {
        id: "picu_consulted",
        description: "PICU consulted",
        explanation: "These patients belong in an ICU before they arrest",
        points: 20,
        predicate: |m| m.picu_consulted,
    },
];

const BONUSES: &[Item] = &[Item {
    id: "early_inotrope",
    description: "Inotrope within five minutes",
    explanation: "",
    points: 10,
    predicate: |m| {
        m.inotrope_elapsed_ms
            .map(|ms| ms <= EARLY_INOTROPE_MS)
            .unwrap_or(false)
    },
}];

const PENALTIES: &[Item] = &[
    Item {
        id: "fluid_overload",
        description: "Fluid overload precipitated shock",
        explanation: "",
        points: -25,
        predicate: |m| m.total_fluids_ml_kg > FLUID_OVERLOAD_ML_KG,
    },
    Item {
        id: "aggressive_bolus",
        description: "Single bolus exceeded 15 mL/kg",
        explanation: "",
        points: -10,
        predicate: |m| m.fluid_boluses.iter().any(|b| b.ml_kg > AGGRESSIVE_BOLUS_ML_KG),
    },
    Item {
        id: "delayed_inotrope",
        description: "Inotropic support delayed beyond ten minutes",
        explanation: "",
        points: -10,
        predicate: |m| {
            m.inotrope_elapsed_ms
                .map(|ms| ms > INOTROPE_DELAY_MS)
                .unwrap_or(true)
        },
    },
];

pub fn calculate_score(myo: &MyocarditisState) -> ScoreResult {
    let mut checklist_results = Vec::with_capacity(CHECKLIST.len());
    let mut checklist_score = 0;
    for item in CHECKLIST {
        let achieved = (item.predicate)(myo);
        if achieved {
            checklist_score += item.points;
        }
        checklist_results.push(ChecklistResult {
            id: item.id.to_string(),
            description: item.description.to_string(),
            explanation: item.explanation.to_string(),
            points: item.points,
            achieved,
        });
    }

    let bonuses_earned: Vec<ScoreItemResult> = BONUSES
        .iter()
        .filter(|b| (b.predicate)(myo))
        .map(|b| ScoreItemResult {
            id: b.id.to_string(),
            description: b.description.to_string(),
            points: b.points,
        })
        .collect();

    let penalties_incurred: Vec<ScoreItemResult> = PENALTIES
        .iter()
        .filter(|p| (p.predicate)(myo))
        .map(|p| ScoreItemResult {
            id: p.id.to_string(),
            description: p.description.to_string(),
            points: p.points,
        })
        .collect();

    let total_points = checklist_score
        + bonuses_earned.iter().map(|b| b.points).sum::<i32>()
        + penalties_incurred.iter().map(|p| p.points).sum::<i32>();

    let grade = Grade::from_points(total_points);
    let passed = matches!(grade, Grade::A | Grade::B | Grade::C);

    let mut feedback = Vec::new();
    for item in &checklist_results {
        if !item.achieved {
            feedback.push(format!("Missed: {} — {}", item.description, item.explanation));
        }
    }
    for p in &penalties_incurred {
        feedback.push(format!("Penalty: {}", p.description));
    }
    if myo.stabilized {
        feedback.push("Patient stabilized on inotropic support".to_string());
    } else {
        feedback.push("The patient never reached a stabilized state".to_string());
    }

    ScoreResult {
        passed,
        grade: grade.as_str().to_string(),
        checklist_score,
        checklist_results,
        bonuses_earned,
        penalties_incurred,
        total_points,
        feedback,
    }
}
