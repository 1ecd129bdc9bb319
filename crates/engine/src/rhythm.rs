//! Rhythm label derivation.
//!
//! The displayed rhythm is a deterministic function of the current heart
//! rate, the age group, and the extended-state flags. Re-derived after any
//! vitals-mutating treatment so the telemetry label never drifts from the
//! numbers.

use crate::state::{AgeGroup, EngineState, ExtendedState};

/// Age-adjusted tachycardia threshold used when no extended state pins the
/// rhythm.
fn sinus_tach_threshold(group: AgeGroup) -> u32 {
    match group {
        AgeGroup::Infant => 180,
        AgeGroup::Toddler => 160,
        AgeGroup::Preschool => 140,
        AgeGroup::Child => 130,
        AgeGroup::Teen => 110,
    }
}

fn bradycardia_threshold(group: AgeGroup) -> u32 {
    match group {
        AgeGroup::Infant => 90,
        AgeGroup::Toddler => 80,
        AgeGroup::Preschool => 70,
        AgeGroup::Child => 60,
        AgeGroup::Teen => 50,
    }
}

/// Derive the rhythm label from the current state.
pub fn dynamic_rhythm(state: &EngineState) -> &'static str {
    if let Some(ExtendedState::Svt(svt)) = &state.extended {
        if !svt.converted && svt.in_svt() {
            return "svt";
        }
    }

    let group = state.demographics.age_group;
    let hr = state.vitals.hr;
    if hr < bradycardia_threshold(group) {
        "sinus_bradycardia"
    } else if hr > sinus_tach_threshold(group) {
        "sinus_tachycardia"
    } else {
        "sinus"
    }
}

/// Human-readable summary used in broadcasts and EKG results.
pub fn rhythm_summary(state: &EngineState) -> String {
    match dynamic_rhythm(state) {
        "svt" => format!(
            "Narrow-complex tachycardia at {} bpm, no discernible P waves",
            state.vitals.hr
        ),
        "sinus_tachycardia" => format!("Sinus tachycardia at {} bpm", state.vitals.hr),
        "sinus_bradycardia" => format!("Sinus bradycardia at {} bpm", state.vitals.hr),
        _ => format!("Normal sinus rhythm at {} bpm", state.vitals.hr),
    }
}
