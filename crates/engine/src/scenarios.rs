//! Scenario catalog.
//!
//! Scenario definitions are declared data: demographics, starting vitals,
//! exam content, result texts, stage graphs, and the complex sub-engine
//! parameters. Clinical content lives here, not in the engine logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intent::IntentKind;
use crate::myocarditis::MyocarditisState;
use crate::stages::{ExitGuard, ExitRule, StageDefinition};
use crate::state::{
    AgeGroup, Demographics, EngineState, Exam, ExtendedState, Interventions, Vitals,
};
use crate::svt::SvtState;
use crate::treatments::TreatmentType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub enum ComplexKind {
    Simple,
    Svt {
        vagal_converts: bool,
        post_conversion_vitals: Vitals,
    },
    Myocarditis {
        stabilized_vitals: Vitals,
        shock_vitals: Vitals,
    },
}

#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub demographics: Demographics,
    pub initial_vitals: Vitals,
    /// Full exam content; the exam handler reveals subsets.
    pub exam: Exam,
    pub labs_summary: &'static str,
    pub imaging_summary: &'static str,
    pub ekg_image_url: Option<&'static str>,
    pub stages: Vec<StageDefinition>,
    pub complex: ComplexKind,
}

impl ScenarioDefinition {
    pub fn stage(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id.clone()).collect()
    }

    pub fn is_complex(&self) -> bool {
        !matches!(self.complex, ComplexKind::Simple)
    }
}

pub fn scenario_ids() -> &'static [&'static str] {
    &[
        "child_asthma_basic_v1",
        "teen_svt_complex_v1",
        "toddler_myocarditis_complex_v1",
    ]
}

pub fn is_known(id: &str) -> bool {
    scenario_ids().contains(&id)
}

pub fn is_complex(id: &str) -> bool {
    by_id(id).map(|s| s.is_complex()).unwrap_or(false)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn by_id(id: &str) -> Option<ScenarioDefinition> {
    match id {
        "child_asthma_basic_v1" => Some(child_asthma()),
        "teen_svt_complex_v1" => Some(teen_svt()),
        "toddler_myocarditis_complex_v1" => Some(toddler_myocarditis()),
        _ => None,
    }
}

fn all_clinical_intents() -> Vec<IntentKind> {
    vec![
        IntentKind::UpdateVitals,
        IntentKind::RevealFinding,
        IntentKind::ApplyTreatment,
        IntentKind::SubmitOrder,
    ]
}

fn child_asthma() -> ScenarioDefinition {
    ScenarioDefinition {
        id: "child_asthma_basic_v1",
        name: "Acute asthma exacerbation, 8-year-old",
        demographics: Demographics {
            age_years: 8.0,
            weight_kg: 26.0,
            age_group: AgeGroup::Child,
        },
        initial_vitals: Vitals {
            hr: 132,
            bp: "102/64".into(),
            spo2: 90,
            rr: 38,
            temp: 37.1,
        },
        exam: Exam {
            general: Some("Sitting upright, tripoding, speaking in short phrases.".into()),
            cardio: Some("Tachycardic, regular, no murmur.".into()),
            lungs: Some("Diffuse expiratory wheeze, prolonged expiratory phase.".into()),
            perfusion: Some("Warm, capillary refill 2 seconds.".into()),
            neuro: Some("Alert, anxious.".into()),
            heart_audio_url: Some("/audio/heart/child_tachy_regular.mp3".into()),
            lung_audio_url: Some("/audio/lungs/expiratory_wheeze.mp3".into()),
        },
        labs_summary: "VBG: pH 7.38, pCO2 38. CBC and BMP unremarkable.",
        imaging_summary: "CXR: hyperinflation, no focal consolidation, no pneumothorax.",
        ekg_image_url: None,
        stages: vec![
            StageDefinition {
                id: "presentation".into(),
                name: "Presentation".into(),
                allowed_intents: all_clinical_intents(),
                max_vitals_delta: Some(15.0),
                baseline_vitals: None,
                exit_rules: vec![
                    ExitRule {
                        description: "oxygen started".into(),
                        guards: vec![ExitGuard::TreatmentGiven {
                            treatment: TreatmentType::Oxygen,
                        }],
                        target: "treatment".into(),
                    },
                    ExitRule {
                        description: "five minutes untreated".into(),
                        guards: vec![ExitGuard::TimeInStageAtLeast { seconds: 300 }],
                        target: "treatment".into(),
                    },
                ],
            },
            StageDefinition {
                id: "treatment".into(),
                name: "Bronchodilator therapy".into(),
                allowed_intents: all_clinical_intents(),
                max_vitals_delta: Some(15.0),
                baseline_vitals: None,
                exit_rules: vec![ExitRule {
                    description: "oxygenation recovered".into(),
                    guards: vec![ExitGuard::Spo2AtLeast { pct: 94 }],
                    target: "reassessment".into(),
                }],
            },
            StageDefinition {
                id: "reassessment".into(),
                name: "Reassessment".into(),
                allowed_intents: all_clinical_intents(),
                max_vitals_delta: Some(10.0),
                baseline_vitals: None,
                exit_rules: vec![ExitRule {
                    description: "observed for a minute".into(),
                    guards: vec![ExitGuard::TimeInStageAtLeast { seconds: 60 }],
                    target: "disposition".into(),
                }],
            },
            StageDefinition {
                id: "disposition".into(),
                name: "Disposition".into(),
                allowed_intents: vec![IntentKind::RevealFinding, IntentKind::SubmitOrder],
                max_vitals_delta: Some(5.0),
                baseline_vitals: None,
                exit_rules: vec![],
            },
        ],
        complex: ComplexKind::Simple,
    }
}

fn teen_svt() -> ScenarioDefinition {
    let post_conversion = Vitals {
        hr: 96,
        bp: "104/66".into(),
        spo2: 99,
        rr: 18,
        temp: 37.0,
    };
    ScenarioDefinition {
        id: "teen_svt_complex_v1",
        name: "Supraventricular tachycardia, 14-year-old",
        demographics: Demographics {
            age_years: 14.0,
            weight_kg: 50.0,
            age_group: AgeGroup::Teen,
        },
        initial_vitals: Vitals {
            hr: 220,
            bp: "96/62".into(),
            spo2: 97,
            rr: 24,
            temp: 37.0,
        },
        exam: Exam {
            general: Some("Pale, anxious teenager complaining of a racing heart.".into()),
            cardio: Some("Rapid regular rhythm, too fast to count at the bedside.".into()),
            lungs: Some("Clear bilaterally.".into()),
            perfusion: Some("Cool hands, capillary refill 3 seconds.".into()),
            neuro: Some("Alert, follows commands, frightened.".into()),
            heart_audio_url: Some("/audio/heart/svt_220.mp3".into()),
            lung_audio_url: Some("/audio/lungs/clear.mp3".into()),
        },
        labs_summary: "BMP normal. Troponin pending. Magnesium 2.0.",
        imaging_summary: "CXR: normal cardiac silhouette, clear lungs.",
        ekg_image_url: Some("/images/ekg/svt_narrow_complex.png"),
        stages: vec![
            StageDefinition {
                id: "presentation".into(),
                name: "Presentation".into(),
                allowed_intents: vec![
                    IntentKind::UpdateVitals,
                    IntentKind::RevealFinding,
                    IntentKind::SubmitOrder,
                ],
                max_vitals_delta: Some(10.0),
                baseline_vitals: None,
                exit_rules: vec![
                    ExitRule {
                        description: "rhythm identified on ECG".into(),
                        guards: vec![ExitGuard::ActionHint {
                            hint: "order:ekg".into(),
                        }],
                        target: "active_svt".into(),
                    },
                    ExitRule {
                        description: "monitor shows the rhythm".into(),
                        guards: vec![ExitGuard::ActionHint {
                            hint: "telemetry:on".into(),
                        }],
                        target: "active_svt".into(),
                    },
                    ExitRule {
                        description: "dwell".into(),
                        guards: vec![ExitGuard::TimeInStageAtLeast { seconds: 45 }],
                        target: "active_svt".into(),
                    },
                ],
            },
            StageDefinition {
                id: "active_svt".into(),
                name: "Active SVT".into(),
                allowed_intents: all_clinical_intents(),
                max_vitals_delta: Some(40.0),
                baseline_vitals: None,
                exit_rules: vec![ExitRule {
                    description: "rhythm converted".into(),
                    guards: vec![ExitGuard::Converted],
                    target: "converted".into(),
                }],
            },
            StageDefinition {
                id: "converted".into(),
                name: "Post-conversion".into(),
                allowed_intents: vec![
                    IntentKind::UpdateVitals,
                    IntentKind::RevealFinding,
                    IntentKind::SubmitOrder,
                ],
                max_vitals_delta: Some(10.0),
                baseline_vitals: None,
                exit_rules: vec![ExitRule {
                    description: "stable after conversion".into(),
                    guards: vec![
                        ExitGuard::TimeInStageAtLeast { seconds: 120 },
                        ExitGuard::HrAtMost { bpm: 120 },
                    ],
                    target: "disposition".into(),
                }],
            },
            StageDefinition {
                id: "disposition".into(),
                name: "Disposition".into(),
                allowed_intents: vec![IntentKind::RevealFinding, IntentKind::SubmitOrder],
                max_vitals_delta: Some(5.0),
                baseline_vitals: None,
                exit_rules: vec![],
            },
        ],
        complex: ComplexKind::Svt {
            vagal_converts: false,
            post_conversion_vitals: post_conversion,
        },
    }
}

fn toddler_myocarditis() -> ScenarioDefinition {
    ScenarioDefinition {
        id: "toddler_myocarditis_complex_v1",
        name: "Viral myocarditis, 2-year-old",
        demographics: Demographics {
            age_years: 2.0,
            weight_kg: 12.0,
            age_group: AgeGroup::Toddler,
        },
        initial_vitals: Vitals {
            hr: 168,
            bp: "78/46".into(),
            spo2: 94,
            rr: 46,
            temp: 38.4,
        },
        exam: Exam {
            general: Some("Listless toddler, won't feed, hard to console.".into()),
            cardio: Some("Tachycardic with a gallop, muffled heart sounds.".into()),
            lungs: Some("Scattered crackles at both bases.".into()),
            perfusion: Some("Mottled, cool to the knees, capillary refill 4 seconds.".into()),
            neuro: Some("Drowsy but rouses to voice.".into()),
            heart_audio_url: Some("/audio/heart/gallop_s3.mp3".into()),
            lung_audio_url: Some("/audio/lungs/basal_crackles.mp3".into()),
        },
        labs_summary: "Troponin 2.1 (elevated). BNP 1840. Lactate 3.8. VBG pH 7.29.",
        imaging_summary: "CXR: cardiomegaly, pulmonary venous congestion.",
        ekg_image_url: Some("/images/ekg/low_voltage_sinus_tach.png"),
        stages: vec![
            StageDefinition {
                id: "presentation".into(),
                name: "Presentation".into(),
                allowed_intents: vec![
                    IntentKind::UpdateVitals,
                    IntentKind::RevealFinding,
                    IntentKind::SubmitOrder,
                ],
                max_vitals_delta: Some(15.0),
                baseline_vitals: None,
                exit_rules: vec![
                    ExitRule {
                        description: "workup started".into(),
                        guards: vec![ExitGuard::ActionHint {
                            hint: "order:ekg".into(),
                        }],
                        target: "workup".into(),
                    },
                    ExitRule {
                        description: "labs sent".into(),
                        guards: vec![ExitGuard::ActionHint {
                            hint: "order:labs".into(),
                        }],
                        target: "workup".into(),
                    },
                    ExitRule {
                        description: "dwell".into(),
                        guards: vec![ExitGuard::TimeInStageAtLeast { seconds: 60 }],
                        target: "workup".into(),
                    },
                ],
            },
            StageDefinition {
                id: "workup".into(),
                name: "Workup".into(),
                allowed_intents: all_clinical_intents(),
                max_vitals_delta: Some(25.0),
                baseline_vitals: None,
                exit_rules: vec![ExitRule {
                    description: "inotrope running".into(),
                    guards: vec![ExitGuard::TreatmentGiven {
                        treatment: TreatmentType::Inotrope,
                    }],
                    target: "management".into(),
                }],
            },
            StageDefinition {
                id: "management".into(),
                name: "Management".into(),
                allowed_intents: all_clinical_intents(),
                max_vitals_delta: Some(20.0),
                baseline_vitals: None,
                exit_rules: vec![ExitRule {
                    description: "stabilized on support".into(),
                    guards: vec![
                        ExitGuard::Converted,
                        ExitGuard::TimeInStageAtLeast { seconds: 60 },
                    ],
                    target: "disposition".into(),
                }],
            },
            StageDefinition {
                id: "disposition".into(),
                name: "Disposition".into(),
                allowed_intents: vec![IntentKind::RevealFinding, IntentKind::SubmitOrder],
                max_vitals_delta: Some(5.0),
                baseline_vitals: None,
                exit_rules: vec![],
            },
        ],
        complex: ComplexKind::Myocarditis {
            stabilized_vitals: Vitals {
                hr: 142,
                bp: "88/54".into(),
                spo2: 96,
                rr: 36,
                temp: 38.0,
            },
            shock_vitals: Vitals {
                hr: 185,
                bp: "62/38".into(),
                spo2: 88,
                rr: 56,
                temp: 38.4,
            },
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Initial state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the starting engine state for a scenario.
pub fn initial_state(scenario_id: &str, now: DateTime<Utc>) -> Option<EngineState> {
    let def = by_id(scenario_id)?;
    let extended = match &def.complex {
        ComplexKind::Simple => None,
        ComplexKind::Svt {
            vagal_converts,
            post_conversion_vitals,
        } => Some(ExtendedState::Svt(SvtState::new(
            now,
            *vagal_converts,
            post_conversion_vitals.clone(),
        ))),
        ComplexKind::Myocarditis {
            stabilized_vitals,
            shock_vitals,
        } => Some(ExtendedState::Myocarditis(MyocarditisState::new(
            now,
            stabilized_vitals.clone(),
            shock_vitals.clone(),
        ))),
    };

    Some(EngineState {
        scenario_id: def.id.to_string(),
        stage_id: def.stages[0].id.clone(),
        stage_ids: def.stage_ids(),
        stage_entered_at: now,
        scenario_started_at: now,
        elapsed_seconds: 0,
        vitals: def.initial_vitals.clone(),
        exam: None,
        interventions: Interventions::default(),
        telemetry: false,
        rhythm_summary: None,
        findings: Default::default(),
        orders: Vec::new(),
        next_order_id: 1,
        ekg_history: Vec::new(),
        telemetry_history: Vec::new(),
        treatment_history: Vec::new(),
        pending_effects: Vec::new(),
        next_effect_seq: 1,
        extended,
        demographics: def.demographics.clone(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Age-group vitals tables (presenter scenario events)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The presenter-inject event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioEventKind {
    Hypoxia,
    Tachycardia,
    Hypotension,
    Fever,
    Stabilize,
    RhythmChange,
    Deteriorate,
    Improve,
    CodeBlue,
    VitalsChange,
    EquipmentFailure,
    PatientSymptom,
}

impl ScenarioEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hypoxia => "hypoxia",
            Self::Tachycardia => "tachycardia",
            Self::Hypotension => "hypotension",
            Self::Fever => "fever",
            Self::Stabilize => "stabilize",
            Self::RhythmChange => "rhythm_change",
            Self::Deteriorate => "deteriorate",
            Self::Improve => "improve",
            Self::CodeBlue => "code_blue",
            Self::VitalsChange => "vitals_change",
            Self::EquipmentFailure => "equipment_failure",
            Self::PatientSymptom => "patient_symptom",
        }
    }
}

/// Age-group vitals anchors for presenter injects.
#[derive(Debug, Clone)]
pub struct AgeVitalsProfile {
    pub baseline: Vitals,
    pub hypoxia_spo2: u32,
    pub tachycardia_hr: u32,
    pub hypotension_bp: &'static str,
    pub fever_temp: f64,
    pub code_hr: u32,
}

pub fn age_profile(group: AgeGroup) -> AgeVitalsProfile {
    match group {
        AgeGroup::Infant => AgeVitalsProfile {
            baseline: Vitals {
                hr: 130,
                bp: "85/52".into(),
                spo2: 98,
                rr: 38,
                temp: 37.0,
            },
            hypoxia_spo2: 78,
            tachycardia_hr: 210,
            hypotension_bp: "58/32",
            fever_temp: 39.9,
            code_hr: 40,
        },
        AgeGroup::Toddler => AgeVitalsProfile {
            baseline: Vitals {
                hr: 112,
                bp: "90/56".into(),
                spo2: 98,
                rr: 28,
                temp: 37.0,
            },
            hypoxia_spo2: 80,
            tachycardia_hr: 195,
            hypotension_bp: "64/36",
            fever_temp: 39.8,
            code_hr: 45,
        },
        AgeGroup::Preschool => AgeVitalsProfile {
            baseline: Vitals {
                hr: 102,
                bp: "95/58".into(),
                spo2: 98,
                rr: 24,
                temp: 37.0,
            },
            hypoxia_spo2: 82,
            tachycardia_hr: 185,
            hypotension_bp: "68/40",
            fever_temp: 39.6,
            code_hr: 48,
        },
        AgeGroup::Child => AgeVitalsProfile {
            baseline: Vitals {
                hr: 92,
                bp: "100/62".into(),
                spo2: 98,
                rr: 20,
                temp: 37.0,
            },
            hypoxia_spo2: 84,
            tachycardia_hr: 170,
            hypotension_bp: "74/44",
            fever_temp: 39.5,
            code_hr: 50,
        },
        AgeGroup::Teen => AgeVitalsProfile {
            baseline: Vitals {
                hr: 78,
                bp: "112/70".into(),
                spo2: 99,
                rr: 16,
                temp: 37.0,
            },
            hypoxia_spo2: 85,
            tachycardia_hr: 160,
            hypotension_bp: "82/48",
            fever_temp: 39.3,
            code_hr: 50,
        },
    }
}

/// Resolve a presenter inject into new vitals and a narration line.
/// `VitalsChange`, `EquipmentFailure`, and `PatientSymptom` leave the
/// vitals alone — the handler supplies deltas or narration itself.
pub fn vitals_for_event(
    kind: ScenarioEventKind,
    group: AgeGroup,
    current: &Vitals,
) -> (Option<Vitals>, &'static str) {
    let profile = age_profile(group);
    match kind {
        ScenarioEventKind::Hypoxia => {
            let mut v = current.clone();
            v.spo2 = profile.hypoxia_spo2;
            v.rr = current.rr + 12;
            (Some(v), "Saturation is falling")
        }
        ScenarioEventKind::Tachycardia => {
            let mut v = current.clone();
            v.hr = profile.tachycardia_hr;
            (Some(v), "Heart rate is climbing")
        }
        ScenarioEventKind::Hypotension => {
            let mut v = current.clone();
            v.bp = profile.hypotension_bp.to_string();
            v.hr = current.hr + 15;
            (Some(v), "Pressure is dropping")
        }
        ScenarioEventKind::Fever => {
            let mut v = current.clone();
            v.temp = profile.fever_temp;
            v.hr = current.hr + 10;
            (Some(v), "Spiking a fever")
        }
        ScenarioEventKind::Stabilize | ScenarioEventKind::Improve => {
            (Some(profile.baseline), "Patient is settling")
        }
        ScenarioEventKind::Deteriorate => {
            let mut v = current.clone();
            v.hr = current.hr + 25;
            v.spo2 = current.spo2.saturating_sub(6);
            v.bp = profile.hypotension_bp.to_string();
            (Some(v), "Patient is deteriorating")
        }
        ScenarioEventKind::CodeBlue => {
            let mut v = current.clone();
            v.hr = profile.code_hr;
            v.spo2 = 70;
            v.bp = "50/30".to_string();
            (Some(v), "Patient is coding")
        }
        ScenarioEventKind::RhythmChange => (None, "Rhythm change on the monitor"),
        ScenarioEventKind::VitalsChange => (None, "Vitals updated"),
        ScenarioEventKind::EquipmentFailure => (None, "Equipment fault"),
        ScenarioEventKind::PatientSymptom => (None, "Patient reports a new symptom"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_resolve() {
        for id in scenario_ids() {
            let def = by_id(id).expect("known scenario");
            assert_eq!(def.id, *id);
            assert!(!def.stages.is_empty());
        }
        assert!(by_id("nonexistent_v9").is_none());
    }

    #[test]
    fn complex_flags() {
        assert!(!is_complex("child_asthma_basic_v1"));
        assert!(is_complex("teen_svt_complex_v1"));
        assert!(is_complex("toddler_myocarditis_complex_v1"));
    }

    #[test]
    fn initial_state_has_extended_exactly_for_complex() {
        let now = Utc::now();
        assert!(initial_state("child_asthma_basic_v1", now)
            .unwrap()
            .extended
            .is_none());
        assert!(initial_state("teen_svt_complex_v1", now)
            .unwrap()
            .extended
            .is_some());
    }

    #[test]
    fn stage_graph_targets_exist() {
        for id in scenario_ids() {
            let def = by_id(id).unwrap();
            for stage in &def.stages {
                for rule in &stage.exit_rules {
                    assert!(
                        def.stage(&rule.target).is_some(),
                        "{id}: stage {} exits to unknown {}",
                        stage.id,
                        rule.target
                    );
                }
            }
        }
    }

    #[test]
    fn hypoxia_inject_uses_age_table() {
        let current = age_profile(AgeGroup::Infant).baseline;
        let (vitals, _) = vitals_for_event(ScenarioEventKind::Hypoxia, AgeGroup::Infant, &current);
        assert_eq!(vitals.unwrap().spo2, 78);

        let current = age_profile(AgeGroup::Teen).baseline;
        let (vitals, _) = vitals_for_event(ScenarioEventKind::Hypoxia, AgeGroup::Teen, &current);
        assert_eq!(vitals.unwrap().spo2, 85);
    }

    #[test]
    fn stabilize_returns_to_baseline() {
        let mut current = age_profile(AgeGroup::Child).baseline;
        current.hr = 180;
        let (vitals, _) =
            vitals_for_event(ScenarioEventKind::Stabilize, AgeGroup::Child, &current);
        assert_eq!(vitals.unwrap().hr, 92);
    }
}
