//! Table-driven treatment effects.
//!
//! Each treatment maps to a [`TreatmentEffect`]: immediate vitals deltas,
//! an optional scheduled decay, scripted nurse/tech lines, and an optional
//! rhythm label. Weight-based dose math lives here; complex-scenario
//! consequences (conversion, dose ledgers, penalties) live in the
//! sub-engines.

use serde::{Deserialize, Serialize};

use crate::intent::VitalsDelta;
use crate::state::Demographics;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Treatment types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentType {
    Oxygen,
    IvFluids,
    VagalManeuver,
    Adenosine,
    Cardioversion,
    Defibrillation,
    Sedation,
    Antipyretic,
    Inotrope,
    Amiodarone,
}

impl TreatmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oxygen => "oxygen",
            Self::IvFluids => "iv_fluids",
            Self::VagalManeuver => "vagal_maneuver",
            Self::Adenosine => "adenosine",
            Self::Cardioversion => "cardioversion",
            Self::Defibrillation => "defibrillation",
            Self::Sedation => "sedation",
            Self::Antipyretic => "antipyretic",
            Self::Inotrope => "inotrope",
            Self::Amiodarone => "amiodarone",
        }
    }

    /// Treatments that require established IV access. Administering one
    /// implicitly places a line (the nurse does it) when none exists.
    pub fn needs_iv(&self) -> bool {
        matches!(
            self,
            Self::IvFluids | Self::Adenosine | Self::Sedation | Self::Inotrope | Self::Amiodarone
        )
    }
}

/// A treatment as requested by a participant or proposed by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreatmentRequest {
    pub treatment_type: TreatmentType,
    /// Absolute dose in milligrams (adenosine, amiodarone, sedation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_mg: Option<f64>,
    /// Volume in mL/kg (fluid boluses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ml_kg: Option<f64>,
    /// Energy in joules (cardioversion, defibrillation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joules: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Oxygen flow in liters per minute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sedated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rapid_push: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_given: Option<bool>,
}

impl TreatmentRequest {
    pub fn new(treatment_type: TreatmentType) -> Self {
        Self {
            treatment_type,
            dose_mg: None,
            volume_ml_kg: None,
            joules: None,
            route: None,
            lpm: None,
            synchronized: None,
            sedated: None,
            rapid_push: None,
            flush_given: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dose math
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolved dose for one administration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDose {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_mg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_mg_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joules_per_kg: Option<f64>,
    pub note: String,
}

/// Adenosine first-dose target 0.1 mg/kg, capped at 6 mg.
pub const ADENOSINE_TARGET_MG_KG: f64 = 0.1;
pub const ADENOSINE_MAX_FIRST_MG: f64 = 6.0;

/// Resolve the ordered dose against the patient's weight. An omitted dose
/// uses the weight-based default for the drug.
pub fn resolve_dose(req: &TreatmentRequest, demo: &Demographics) -> ResolvedDose {
    let weight = demo.weight_kg;
    match req.treatment_type {
        TreatmentType::Adenosine => {
            let dose_mg = req
                .dose_mg
                .unwrap_or_else(|| (ADENOSINE_TARGET_MG_KG * weight).min(ADENOSINE_MAX_FIRST_MG));
            let dose_mg_kg = dose_mg / weight;
            ResolvedDose {
                dose_mg: Some(dose_mg),
                dose_mg_kg: Some(dose_mg_kg),
                joules_per_kg: None,
                note: format!("adenosine {dose_mg:.1} mg ({dose_mg_kg:.3} mg/kg)"),
            }
        }
        TreatmentType::Cardioversion | TreatmentType::Defibrillation => {
            let default_j = if req.treatment_type == TreatmentType::Cardioversion {
                1.0 * weight
            } else {
                2.0 * weight
            };
            let joules = req.joules.unwrap_or(default_j);
            let jkg = joules / weight;
            ResolvedDose {
                dose_mg: None,
                dose_mg_kg: None,
                joules_per_kg: Some(jkg),
                note: format!("{joules:.0} J ({jkg:.2} J/kg)"),
            }
        }
        TreatmentType::IvFluids => {
            let ml_kg = req.volume_ml_kg.unwrap_or(20.0);
            ResolvedDose {
                dose_mg: None,
                dose_mg_kg: Some(ml_kg),
                joules_per_kg: None,
                note: format!("{:.0} mL bolus ({ml_kg:.0} mL/kg)", ml_kg * weight),
            }
        }
        TreatmentType::Amiodarone => {
            let dose_mg = req.dose_mg.unwrap_or(5.0 * weight);
            ResolvedDose {
                dose_mg: Some(dose_mg),
                dose_mg_kg: Some(dose_mg / weight),
                joules_per_kg: None,
                note: format!("amiodarone {dose_mg:.0} mg over 20 min"),
            }
        }
        TreatmentType::Sedation => {
            let dose_mg = req.dose_mg.unwrap_or(0.1 * weight);
            ResolvedDose {
                dose_mg: Some(dose_mg),
                dose_mg_kg: Some(dose_mg / weight),
                joules_per_kg: None,
                note: format!("midazolam {dose_mg:.1} mg IV"),
            }
        }
        _ => ResolvedDose {
            dose_mg: req.dose_mg,
            dose_mg_kg: req.dose_mg.map(|d| d / weight),
            joules_per_kg: None,
            note: req.treatment_type.as_str().replace('_', " "),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Effect table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The physiologic effect of one treatment administration.
#[derive(Debug, Clone)]
pub struct TreatmentEffect {
    pub delta_vitals: VitalsDelta,
    /// Reverting deltas scheduled after `decay_ms`, for transient effects.
    pub decay: Option<(i64, VitalsDelta)>,
    pub nurse_line: String,
    pub tech_line: Option<String>,
    /// Rhythm label to surface after the deltas settle, when the treatment
    /// itself dictates one. Sub-engines may override.
    pub rhythm_effect: Option<&'static str>,
}

/// Look up the effect for a treatment. This is the per-drug effect table;
/// values are declared data, not clinical logic.
pub fn effect_for(req: &TreatmentRequest, demo: &Demographics) -> TreatmentEffect {
    let dose = resolve_dose(req, demo);
    match req.treatment_type {
        TreatmentType::Oxygen => {
            let lpm = req.lpm.unwrap_or(10.0);
            let mode = req
                .route
                .clone()
                .unwrap_or_else(|| "non_rebreather".to_string());
            TreatmentEffect {
                delta_vitals: VitalsDelta {
                    spo2: Some(4),
                    ..Default::default()
                },
                decay: None,
                nurse_line: format!(
                    "Oxygen on at {lpm:.0} liters per minute via {}.",
                    mode.replace('_', " ")
                ),
                tech_line: None,
                rhythm_effect: None,
            }
        }
        TreatmentType::IvFluids => TreatmentEffect {
            delta_vitals: VitalsDelta {
                hr: Some(-8),
                ..Default::default()
            },
            decay: None,
            nurse_line: format!("Fluid bolus running, {}.", dose.note),
            tech_line: None,
            rhythm_effect: None,
        },
        TreatmentType::VagalManeuver => TreatmentEffect {
            delta_vitals: VitalsDelta {
                hr: Some(-15),
                ..Default::default()
            },
            decay: Some((
                30_000,
                VitalsDelta {
                    hr: Some(15),
                    ..Default::default()
                },
            )),
            nurse_line: "Vagal maneuver attempted — blowing through a syringe.".into(),
            tech_line: None,
            rhythm_effect: None,
        },
        TreatmentType::Adenosine => TreatmentEffect {
            delta_vitals: VitalsDelta {
                hr: Some(-30),
                ..Default::default()
            },
            decay: Some((
                10_000,
                VitalsDelta {
                    hr: Some(30),
                    ..Default::default()
                },
            )),
            nurse_line: format!("Giving {}, rapid push.", dose.note),
            tech_line: Some("Watch the monitor — expecting a brief pause.".into()),
            rhythm_effect: None,
        },
        TreatmentType::Cardioversion => TreatmentEffect {
            delta_vitals: VitalsDelta::default(),
            decay: None,
            nurse_line: format!("Synchronized cardioversion delivered at {}.", dose.note),
            tech_line: Some("Sync marker confirmed on the R wave.".into()),
            rhythm_effect: None,
        },
        TreatmentType::Defibrillation => TreatmentEffect {
            delta_vitals: VitalsDelta::default(),
            decay: None,
            nurse_line: format!("Shock delivered, unsynchronized, {}.", dose.note),
            tech_line: None,
            rhythm_effect: None,
        },
        TreatmentType::Sedation => TreatmentEffect {
            delta_vitals: VitalsDelta {
                rr: Some(-4),
                ..Default::default()
            },
            decay: None,
            nurse_line: format!("Sedation given — {}.", dose.note),
            tech_line: None,
            rhythm_effect: None,
        },
        TreatmentType::Antipyretic => TreatmentEffect {
            delta_vitals: VitalsDelta {
                temp: Some(-1.0),
                ..Default::default()
            },
            decay: None,
            nurse_line: "Antipyretic given.".into(),
            tech_line: None,
            rhythm_effect: None,
        },
        TreatmentType::Inotrope => TreatmentEffect {
            delta_vitals: VitalsDelta {
                hr: Some(5),
                ..Default::default()
            },
            decay: None,
            nurse_line: "Inotrope infusion started.".into(),
            tech_line: Some("Pump programmed, line flushed.".into()),
            rhythm_effect: None,
        },
        TreatmentType::Amiodarone => TreatmentEffect {
            delta_vitals: VitalsDelta {
                hr: Some(-20),
                ..Default::default()
            },
            decay: None,
            nurse_line: format!("Starting {}.", dose.note),
            tech_line: None,
            rhythm_effect: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgeGroup;

    fn teen() -> Demographics {
        Demographics {
            age_years: 14.0,
            weight_kg: 50.0,
            age_group: AgeGroup::Teen,
        }
    }

    #[test]
    fn adenosine_default_dose_is_weight_based() {
        let req = TreatmentRequest::new(TreatmentType::Adenosine);
        let dose = resolve_dose(&req, &teen());
        assert_eq!(dose.dose_mg, Some(5.0));
        assert_eq!(dose.dose_mg_kg, Some(0.1));
    }

    #[test]
    fn adenosine_first_dose_caps_at_six_mg() {
        let heavy = Demographics {
            age_years: 16.0,
            weight_kg: 80.0,
            age_group: AgeGroup::Teen,
        };
        let req = TreatmentRequest::new(TreatmentType::Adenosine);
        let dose = resolve_dose(&req, &heavy);
        assert_eq!(dose.dose_mg, Some(6.0));
    }

    #[test]
    fn cardioversion_joules_per_kg() {
        let mut req = TreatmentRequest::new(TreatmentType::Cardioversion);
        req.joules = Some(50.0);
        let dose = resolve_dose(&req, &teen());
        assert_eq!(dose.joules_per_kg, Some(1.0));
    }

    #[test]
    fn vagal_effect_is_transient() {
        let req = TreatmentRequest::new(TreatmentType::VagalManeuver);
        let effect = effect_for(&req, &teen());
        let (decay_ms, decay) = effect.decay.expect("vagal decays");
        assert_eq!(decay_ms, 30_000);
        assert_eq!(decay.hr, Some(15));
        assert_eq!(effect.delta_vitals.hr, Some(-15));
    }
}
