//! Deterministic SVT debrief scoring.
//!
//! Checklist, bonus, and penalty items are declared tables; each carries a
//! predicate over the extended state. All time-based items use the
//! pause-adjusted clock.
//!
//! Grade bands over `total_points`:
//! A ≥ 90, B ≥ 80, C ≥ 70, D ≥ 60, F below. Passing is grade C or better.

use serde::{Deserialize, Serialize};

use super::{DoseClass, SvtState, classify_adenosine};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_points(points: i32) -> Self {
        if points >= 90 {
            Self::A
        } else if points >= 80 {
            Self::B
        } else if points >= 70 {
            Self::C
        } else if points >= 60 {
            Self::D
        } else {
            Self::F
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistResult {
    pub id: String,
    pub description: String,
    pub explanation: String,
    pub points: i32,
    pub achieved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreItemResult {
    pub id: String,
    pub description: String,
    pub points: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    pub passed: bool,
    pub grade: String,
    pub checklist_score: i32,
    pub checklist_results: Vec<ChecklistResult>,
    pub bonuses_earned: Vec<ScoreItemResult>,
    pub penalties_incurred: Vec<ScoreItemResult>,
    pub total_points: i32,
    pub feedback: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Item tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ChecklistItem {
    id: &'static str,
    description: &'static str,
    explanation: &'static str,
    points: i32,
    predicate: fn(&SvtState) -> bool,
}

struct BonusItem {
    id: &'static str,
    description: &'static str,
    points: i32,
    predicate: fn(&SvtState) -> bool,
}

struct PenaltyItem {
    id: &'static str,
    description: &'static str,
    points: i32,
    predicate: fn(&SvtState) -> bool,
}

/// The early-ECG window, pause-adjusted.
pub const EARLY_ECG_WINDOW_MS: i64 = 60_000;
/// No rhythm-directed treatment inside this window is a delay.
pub const TREATMENT_DELAY_MS: i64 = 300_000;

const CHECKLIST: &[ChecklistItem] = &[
    ChecklistItem {
        id: "ecg_obtained",
        description: "12-lead ECG obtained",
        explanation: "A 12-lead confirms the rhythm before treatment",
        points: 15,
        predicate: |s| s.ecg_ordered_ts.is_some(),
    },
    ChecklistItem {
        id: "iv_access",
        description: "IV access established",
        explanation: "Adenosine needs a proximal line and a rapid flush",
        points: 10,
        predicate: |s| s.iv_access_ts.is_some(),
    },
    ChecklistItem {
        id: "vagal_first",
        description: "Vagal maneuver attempted before adenosine",
        explanation: "Vagal maneuvers are first-line in a stable patient",
        points: 15,
        predicate: |s| match (s.vagal_attempt_ts, s.adenosine_doses.first()) {
            (Some(vagal), Some(first_dose)) => vagal <= first_dose.ts,
            (Some(_), None) => true,
            _ => false,
        },
    },
    ChecklistItem {
        id: "adenosine_given",
        description: "Adenosine administered",
        explanation: "Adenosine is the first-line drug for refractory SVT",
        points: 15,
        predicate: |s| !s.adenosine_doses.is_empty(),
    },
    ChecklistItem {
        id: "correct_first_dose",
        description: "First adenosine dose in range",
        explanation: "Target 0.1 mg/kg; the accepted band is 0.08–0.15 mg/kg",
        points: 15,
        predicate: |s| {
            s.adenosine_doses
                .first()
                .map(|d| classify_adenosine(d.dose_mg_kg, 1) == DoseClass::Correct)
                .unwrap_or(false)
        },
    },
    ChecklistItem {
        id: "rapid_push_flush",
        description: "Rapid push with saline flush",
        explanation: "Adenosine's half-life is seconds; slow pushes never reach the heart",
        points: 10,
        predicate: |s| {
            s.adenosine_doses
                .first()
                .map(|d| d.rapid_push && d.flush_given)
                .unwrap_or(false)
        },
    },
    ChecklistItem {
        id: "rhythm_converted",
        description: "Rhythm converted to sinus",
        explanation: "The patient left SVT before the end of the case",
        points: 20,
        predicate: |s| s.converted,
    },
];

const BONUSES: &[BonusItem] = &[
    BonusItem {
        id: "early_ecg",
        description: "ECG within the first minute",
        points: 10,
        predicate: |s| {
            s.ecg_ordered_elapsed_ms
                .map(|ms| ms <= EARLY_ECG_WINDOW_MS)
                .unwrap_or(false)
        },
    },
    BonusItem {
        id: "first_dose_conversion",
        description: "Converted on the first adenosine dose",
        points: 10,
        predicate: |s| s.conversion_method.as_deref() == Some("adenosine_first"),
    },
    BonusItem {
        id: "vagal_conversion",
        description: "Converted with a vagal maneuver alone",
        points: 15,
        predicate: |s| s.conversion_method.as_deref() == Some("vagal"),
    },
    BonusItem {
        id: "patient_reassured",
        description: "Patient reassured before interventions",
        points: 5,
        predicate: |s| s.flags.patient_reassured,
    },
    BonusItem {
        id: "parent_informed",
        description: "Parent kept informed",
        points: 5,
        predicate: |s| s.flags.parent_informed,
    },
];

const PENALTIES: &[PenaltyItem] = &[
    PenaltyItem {
        id: "adenosine_underdose",
        description: "Adenosine underdosed",
        points: -10,
        predicate: |s| {
            s.adenosine_doses
                .iter()
                .any(|d| classify_adenosine(d.dose_mg_kg, d.dose_number) == DoseClass::Underdose)
        },
    },
    // Severe supersedes moderate: the moderate predicate refuses to match
    // when any dose lands in the severe band.
    PenaltyItem {
        id: "adenosine_moderate_overdose",
        description: "Adenosine moderately overdosed",
        points: -15,
        predicate: |s| {
            let classes: Vec<DoseClass> = s
                .adenosine_doses
                .iter()
                .map(|d| classify_adenosine(d.dose_mg_kg, d.dose_number))
                .collect();
            classes.contains(&DoseClass::ModerateOverdose)
                && !classes.contains(&DoseClass::SevereOverdose)
        },
    },
    PenaltyItem {
        id: "adenosine_severe_overdose",
        description: "Adenosine severely overdosed",
        points: -30,
        predicate: |s| {
            s.adenosine_doses
                .iter()
                .any(|d| classify_adenosine(d.dose_mg_kg, d.dose_number) == DoseClass::SevereOverdose)
        },
    },
    PenaltyItem {
        id: "unsedated_cardioversion",
        description: "Cardioversion without sedation on a responsive patient",
        points: -20,
        predicate: |s| s.flags.unsedated_cardioversion,
    },
    PenaltyItem {
        id: "unsynchronized_shock",
        description: "Unsynchronized shock delivered in SVT with a pulse",
        points: -15,
        predicate: |s| s.cardioversion_attempts.iter().any(|c| !c.synchronized),
    },
    PenaltyItem {
        id: "delayed_treatment",
        description: "No rhythm-directed treatment within five minutes",
        points: -10,
        predicate: |s| {
            s.first_treatment_elapsed_ms
                .map(|ms| ms > TREATMENT_DELAY_MS)
                .unwrap_or(true)
        },
    },
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Score the case. Deterministic over the extended state; safe to call
/// repeatedly.
pub fn calculate_score(svt: &SvtState) -> ScoreResult {
    let mut checklist_results = Vec::with_capacity(CHECKLIST.len());
    let mut checklist_score = 0;
    for item in CHECKLIST {
        let achieved = (item.predicate)(svt);
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
        .filter(|b| (b.predicate)(svt))
        .map(|b| ScoreItemResult {
            id: b.id.to_string(),
            description: b.description.to_string(),
            points: b.points,
        })
        .collect();

    let penalties_incurred: Vec<ScoreItemResult> = PENALTIES
        .iter()
        .filter(|p| (p.predicate)(svt))
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
    if svt.converted {
        feedback.push(format!(
            "Rhythm converted via {}",
            svt.conversion_method.as_deref().unwrap_or("unknown")
        ));
    } else {
        feedback.push("The patient never converted out of SVT".to_string());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AgeGroup, Demographics, Vitals};
    use chrono::{Duration, Utc};

    fn teen() -> Demographics {
        Demographics {
            age_years: 14.0,
            weight_kg: 50.0,
            age_group: AgeGroup::Teen,
        }
    }

    fn sinus() -> Vitals {
        Vitals {
            hr: 96,
            bp: "104/66".into(),
            spo2: 99,
            rr: 18,
            temp: 37.0,
        }
    }

    fn fresh(t0: chrono::DateTime<Utc>) -> SvtState {
        SvtState::new(t0, false, sinus())
    }

    #[test]
    fn happy_path_scores_at_least_b() {
        let t0 = Utc::now();
        let mut svt = fresh(t0);
        svt.record_ecg_ordered(t0 + Duration::seconds(10));
        svt.apply_vagal(t0 + Duration::seconds(40));
        svt.apply_adenosine(t0 + Duration::seconds(60), &teen(), 5.0, true, true);

        let score = calculate_score(&svt);
        assert!(score.passed);
        assert!(matches!(score.grade.as_str(), "A" | "B"));

        let bonus_ids: Vec<&str> = score.bonuses_earned.iter().map(|b| b.id.as_str()).collect();
        assert!(bonus_ids.contains(&"early_ecg"));
        assert!(bonus_ids.contains(&"first_dose_conversion"));
        assert!(!bonus_ids.contains(&"vagal_conversion"));

        let penalty_ids: Vec<&str> = score
            .penalties_incurred
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert!(!penalty_ids.contains(&"adenosine_moderate_overdose"));
        assert!(!penalty_ids.contains(&"adenosine_severe_overdose"));
    }

    #[test]
    fn severe_overdose_supersedes_moderate() {
        let t0 = Utc::now();
        let mut svt = fresh(t0);
        // 0.2 mg/kg: moderate. 0.3 mg/kg second dose is within the doubled
        // correct band, so push a severe first dose instead.
        svt.apply_adenosine(t0, &teen(), 15.0, true, true); // 0.3 mg/kg: severe
        svt.apply_adenosine(t0 + Duration::seconds(60), &teen(), 10.0, true, true);

        let score = calculate_score(&svt);
        let ids: Vec<&str> = score
            .penalties_incurred
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert!(ids.contains(&"adenosine_severe_overdose"));
        assert!(!ids.contains(&"adenosine_moderate_overdose"));
    }

    #[test]
    fn moderate_alone_is_emitted() {
        let t0 = Utc::now();
        let mut svt = fresh(t0);
        svt.apply_adenosine(t0, &teen(), 10.0, true, true); // 0.2 mg/kg: moderate

        let score = calculate_score(&svt);
        let ids: Vec<&str> = score
            .penalties_incurred
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert!(ids.contains(&"adenosine_moderate_overdose"));
        assert!(!ids.contains(&"adenosine_severe_overdose"));
    }

    #[test]
    fn unsedated_cardioversion_penalty_present() {
        let t0 = Utc::now();
        let mut svt = fresh(t0);
        svt.apply_cardioversion(t0 + Duration::seconds(30), 1.0, true, false);

        let score = calculate_score(&svt);
        let penalty = score
            .penalties_incurred
            .iter()
            .find(|p| p.id == "unsedated_cardioversion")
            .expect("penalty emitted");
        assert!(penalty.points < 0);
        assert!(svt.timeline_events.iter().any(|e| e.negative));
    }

    #[test]
    fn early_ecg_respects_pause_adjustment() {
        let t0 = Utc::now();

        // 90 s wall clock, 35 s paused: adjusted 55 s -> bonus granted.
        let mut svt = fresh(t0);
        svt.pause_clock(t0 + Duration::seconds(10));
        svt.resume_clock(t0 + Duration::seconds(45));
        svt.record_ecg_ordered(t0 + Duration::seconds(90));
        let score = calculate_score(&svt);
        assert!(score.bonuses_earned.iter().any(|b| b.id == "early_ecg"));

        // 90 s wall clock, 20 s paused: adjusted 70 s -> denied.
        let mut svt = fresh(t0);
        svt.pause_clock(t0 + Duration::seconds(10));
        svt.resume_clock(t0 + Duration::seconds(30));
        svt.record_ecg_ordered(t0 + Duration::seconds(90));
        let score = calculate_score(&svt);
        assert!(!score.bonuses_earned.iter().any(|b| b.id == "early_ecg"));
    }

    #[test]
    fn grade_bands() {
        assert_eq!(Grade::from_points(95).as_str(), "A");
        assert_eq!(Grade::from_points(90).as_str(), "A");
        assert_eq!(Grade::from_points(85).as_str(), "B");
        assert_eq!(Grade::from_points(70).as_str(), "C");
        assert_eq!(Grade::from_points(69).as_str(), "D");
        assert_eq!(Grade::from_points(10).as_str(), "F");
    }

    #[test]
    fn no_treatment_at_all_is_a_delay_penalty() {
        let t0 = Utc::now();
        let svt = fresh(t0);
        let score = calculate_score(&svt);
        assert!(score
            .penalties_incurred
            .iter()
            .any(|p| p.id == "delayed_treatment"));
        assert!(!score.passed);
    }
}
