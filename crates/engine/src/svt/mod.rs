//! SVT sub-engine: phase machine, dose ledger, and patient response rules
//! for the supraventricular-tachycardia scenarios.
//!
//! The sub-engine owns no vitals — it returns [`SvtDirective`]s that the
//! scenario engine applies, so there is exactly one writer of clinical
//! state.

pub mod scoring;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Demographics, Vitals};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phases & ledger entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SvtPhase {
    Presentation,
    SvtOnset,
    InitialManagement,
    Treatment,
    PostTreatment,
    Decompensating,
    Resolution,
}

impl SvtPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presentation => "presentation",
            Self::SvtOnset => "svt_onset",
            Self::InitialManagement => "initial_management",
            Self::Treatment => "treatment",
            Self::PostTreatment => "post_treatment",
            Self::Decompensating => "decompensating",
            Self::Resolution => "resolution",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdenosineDose {
    pub ts: DateTime<Utc>,
    pub dose_mg: f64,
    pub dose_mg_kg: f64,
    pub dose_number: u32,
    pub rapid_push: bool,
    pub flush_given: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardioversionAttempt {
    pub ts: DateTime<Utc>,
    pub joules_per_kg: f64,
    pub synchronized: bool,
    pub sedated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub negative: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SvtFlags {
    #[serde(default)]
    pub patient_reassured: bool,
    #[serde(default)]
    pub parent_informed: bool,
    #[serde(default)]
    pub valsalva_explained: bool,
    #[serde(default)]
    pub rebound_svt: bool,
    #[serde(default)]
    pub unsedated_cardioversion: bool,
    #[serde(default)]
    pub sedation_given: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dose classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseClass {
    Underdose,
    Correct,
    ModerateOverdose,
    SevereOverdose,
}

/// First-dose bands in mg/kg; second and later doses use doubled bands
/// (second-dose target is 0.2 mg/kg).
pub fn classify_adenosine(dose_mg_kg: f64, dose_number: u32) -> DoseClass {
    let scale = if dose_number <= 1 { 1.0 } else { 2.0 };
    let d = dose_mg_kg / scale;
    if d < 0.08 {
        DoseClass::Underdose
    } else if d <= 0.15 {
        DoseClass::Correct
    } else if d <= 0.25 {
        DoseClass::ModerateOverdose
    } else {
        DoseClass::SevereOverdose
    }
}

/// Conversion threshold: 0.08 mg/kg for the first dose, 0.2 mg/kg after.
fn adequate_for_conversion(dose_mg_kg: f64, dose_number: u32) -> bool {
    if dose_number <= 1 {
        dose_mg_kg >= 0.08
    } else {
        dose_mg_kg >= 0.2
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extended state for the SVT scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvtState {
    pub phase: SvtPhase,
    /// 4 = well-appearing, 1 = peri-arrest.
    pub stability_level: u8,
    pub current_rhythm: String,
    pub converted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_method: Option<String>,
    pub vagal_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vagal_attempt_ts: Option<DateTime<Utc>>,
    pub adenosine_doses: Vec<AdenosineDose>,
    pub cardioversion_attempts: Vec<CardioversionAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_access_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_on_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecg_ordered_ts: Option<DateTime<Utc>>,
    /// Pause-adjusted elapsed when the ECG was ordered; drives the
    /// early-ECG bonus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecg_ordered_elapsed_ms: Option<i64>,
    /// Pause-adjusted elapsed at the first rhythm-directed treatment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_treatment_elapsed_ms: Option<i64>,
    pub scenario_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_paused_at: Option<DateTime<Utc>>,
    pub total_paused_ms: i64,
    /// Pause-adjusted elapsed at the last phase change.
    pub phase_entered_elapsed_ms: i64,
    pub flags: SvtFlags,
    pub timeline_events: Vec<TimelineEvent>,
    /// Response rules that have already fired (one-shot).
    pub rule_triggers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_score: Option<i32>,
    /// Whether a vagal maneuver can convert this patient (scenario data).
    pub vagal_converts: bool,
    /// Vitals applied when the rhythm converts to sinus.
    pub post_conversion_vitals: Vitals,
}

impl SvtState {
    pub fn new(
        started_at: DateTime<Utc>,
        vagal_converts: bool,
        post_conversion_vitals: Vitals,
    ) -> Self {
        Self {
            phase: SvtPhase::Presentation,
            stability_level: 3,
            current_rhythm: "svt".into(),
            converted: false,
            conversion_method: None,
            vagal_attempts: 0,
            vagal_attempt_ts: None,
            adenosine_doses: Vec::new(),
            cardioversion_attempts: Vec::new(),
            iv_access_ts: None,
            monitor_on_ts: None,
            ecg_ordered_ts: None,
            ecg_ordered_elapsed_ms: None,
            first_treatment_elapsed_ms: None,
            scenario_started_at: started_at,
            clock_paused_at: None,
            total_paused_ms: 0,
            phase_entered_elapsed_ms: 0,
            flags: SvtFlags::default(),
            timeline_events: Vec::new(),
            rule_triggers: Vec::new(),
            current_score: None,
            vagal_converts,
            post_conversion_vitals,
        }
    }

    pub fn in_svt(&self) -> bool {
        self.current_rhythm == "svt"
    }

    // ── Pause-adjusted clock ─────────────────────────────────────────

    /// Wall-clock elapsed minus total paused time, in milliseconds.
    /// Non-decreasing; frozen while paused.
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

    // ── Timeline ─────────────────────────────────────────────────────

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

    fn enter_phase(&mut self, now: DateTime<Utc>, phase: SvtPhase) {
        if self.phase == phase {
            return;
        }
        self.phase_entered_elapsed_ms = self.elapsed_since_start(now);
        self.phase = phase;
        self.note(now, "phase", format!("Entered phase {}", phase.as_str()));
    }

    fn time_in_phase_ms(&self, now: DateTime<Utc>) -> i64 {
        self.elapsed_since_start(now) - self.phase_entered_elapsed_ms
    }

    // ── Interventions ────────────────────────────────────────────────

    pub fn record_monitor_on(&mut self, now: DateTime<Utc>) {
        if self.monitor_on_ts.is_none() {
            self.monitor_on_ts = Some(now);
            self.note(now, "intervention", "Cardiac monitor applied");
            if self.phase == SvtPhase::Presentation {
                self.enter_phase(now, SvtPhase::SvtOnset);
            }
        }
    }

    pub fn record_iv_access(&mut self, now: DateTime<Utc>) {
        if self.iv_access_ts.is_none() {
            self.iv_access_ts = Some(now);
            self.note(now, "intervention", "IV access established");
            if self.phase == SvtPhase::SvtOnset {
                self.enter_phase(now, SvtPhase::InitialManagement);
            }
        }
    }

    pub fn record_ecg_ordered(&mut self, now: DateTime<Utc>) {
        if self.ecg_ordered_ts.is_none() {
            self.ecg_ordered_ts = Some(now);
            self.ecg_ordered_elapsed_ms = Some(self.elapsed_since_start(now));
            self.note(now, "order", "12-lead ECG obtained");
            if self.phase == SvtPhase::Presentation {
                self.enter_phase(now, SvtPhase::SvtOnset);
            }
        }
    }

    // ── Treatments ───────────────────────────────────────────────────

    pub fn apply_vagal(&mut self, now: DateTime<Utc>) -> SvtDirective {
        self.vagal_attempts += 1;
        self.vagal_attempt_ts = Some(now);
        self.note(
            now,
            "treatment",
            format!("Vagal maneuver attempt #{}", self.vagal_attempts),
        );
        self.advance_on_treatment(now);

        if self.vagal_converts && !self.converted {
            return self.convert(now, "vagal");
        }
        SvtDirective::default()
    }

    pub fn apply_adenosine(
        &mut self,
        now: DateTime<Utc>,
        demo: &Demographics,
        dose_mg: f64,
        rapid_push: bool,
        flush_given: bool,
    ) -> SvtDirective {
        let dose_number = self.adenosine_doses.len() as u32 + 1;
        let dose_mg_kg = dose_mg / demo.weight_kg;
        self.adenosine_doses.push(AdenosineDose {
            ts: now,
            dose_mg,
            dose_mg_kg,
            dose_number,
            rapid_push,
            flush_given,
        });

        // IV access is implied: the nurse places a line to push the drug.
        self.record_iv_access(now);

        let class = classify_adenosine(dose_mg_kg, dose_number);
        match class {
            DoseClass::Underdose => self.note_negative(
                now,
                "treatment",
                format!("Adenosine dose #{dose_number} underdosed at {dose_mg_kg:.3} mg/kg"),
            ),
            DoseClass::Correct => self.note(
                now,
                "treatment",
                format!("Adenosine dose #{dose_number} given at {dose_mg_kg:.3} mg/kg"),
            ),
            DoseClass::ModerateOverdose | DoseClass::SevereOverdose => self.note_negative(
                now,
                "treatment",
                format!("Adenosine dose #{dose_number} overdosed at {dose_mg_kg:.3} mg/kg"),
            ),
        }
        self.advance_on_treatment(now);

        let adequate =
            adequate_for_conversion(dose_mg_kg, dose_number) && rapid_push && flush_given;
        if adequate && !self.converted {
            let method = if dose_number == 1 {
                "adenosine_first"
            } else {
                "adenosine_repeat"
            };
            self.rule_triggers.push(format!("adenosine_conversion_{dose_number}"));
            return self.convert(now, method);
        }
        if !flush_given {
            self.note_negative(now, "treatment", "Adenosine given without a rapid flush");
        }
        SvtDirective::default()
    }

    pub fn apply_cardioversion(
        &mut self,
        now: DateTime<Utc>,
        joules_per_kg: f64,
        synchronized: bool,
        sedated: bool,
    ) -> SvtDirective {
        let effectively_sedated = sedated || self.flags.sedation_given;
        self.cardioversion_attempts.push(CardioversionAttempt {
            ts: now,
            joules_per_kg,
            synchronized,
            sedated: effectively_sedated,
        });

        // A responsive patient shocked without sedation is a flagged error.
        if !effectively_sedated && self.stability_level >= 2 {
            self.flags.unsedated_cardioversion = true;
            self.note_negative(
                now,
                "treatment",
                "Cardioversion delivered without sedation on a responsive patient",
            );
        } else {
            self.note(
                now,
                "treatment",
                format!("Cardioversion at {joules_per_kg:.2} J/kg"),
            );
        }
        self.advance_on_treatment(now);

        let in_range = (0.5..=2.0).contains(&joules_per_kg);
        if synchronized && in_range && !self.converted {
            self.rule_triggers.push("cardioversion_conversion".into());
            return self.convert(now, "cardioversion");
        }
        if !synchronized {
            self.note_negative(now, "treatment", "Unsynchronized shock in SVT with a pulse");
        }
        SvtDirective::default()
    }

    pub fn record_sedation(&mut self, now: DateTime<Utc>) {
        self.flags.sedation_given = true;
        self.note(now, "treatment", "Procedural sedation given");
    }

    fn advance_on_treatment(&mut self, now: DateTime<Utc>) {
        if self.first_treatment_elapsed_ms.is_none() {
            self.first_treatment_elapsed_ms = Some(self.elapsed_since_start(now));
        }
        if matches!(
            self.phase,
            SvtPhase::Presentation | SvtPhase::SvtOnset | SvtPhase::InitialManagement
        ) {
            self.enter_phase(now, SvtPhase::Treatment);
        }
    }

    fn convert(&mut self, now: DateTime<Utc>, method: &str) -> SvtDirective {
        self.converted = true;
        self.conversion_method = Some(method.to_string());
        self.current_rhythm = "sinus".into();
        self.stability_level = 4;
        self.note(now, "response", format!("Rhythm converted to sinus ({method})"));
        self.enter_phase(now, SvtPhase::PostTreatment);
        SvtDirective {
            converted_now: true,
            vitals_override: Some(self.post_conversion_vitals.clone()),
            rhythm: Some("sinus".into()),
        }
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    /// Phase dwell transitions and stability decay. Called once per
    /// heartbeat; a no-op while the clock is paused.
    pub fn tick(&mut self, now: DateTime<Utc>) -> SvtDirective {
        if self.clock_paused_at.is_some() {
            return SvtDirective::default();
        }

        match self.phase {
            SvtPhase::Presentation => {
                if self.time_in_phase_ms(now) >= 30_000 {
                    self.enter_phase(now, SvtPhase::SvtOnset);
                }
            }
            SvtPhase::SvtOnset => {
                if self.stability_level < 3 || self.time_in_phase_ms(now) >= 45_000 {
                    self.enter_phase(now, SvtPhase::InitialManagement);
                }
            }
            SvtPhase::PostTreatment => {
                if self.converted && self.time_in_phase_ms(now) >= 60_000 {
                    self.enter_phase(now, SvtPhase::Resolution);
                }
            }
            _ => {}
        }

        // Untreated SVT slowly decompensates.
        if !self.converted && self.in_svt() {
            let elapsed = self.elapsed_since_start(now);
            let expected = 3u8.saturating_sub((elapsed / 120_000).min(2) as u8);
            if expected.max(1) < self.stability_level {
                self.stability_level = expected.max(1);
                self.note_negative(
                    now,
                    "response",
                    format!("Patient tiring — stability now {}", self.stability_level),
                );
            }
            if self.stability_level <= 2 && self.phase != SvtPhase::Decompensating {
                self.enter_phase(now, SvtPhase::Decompensating);
            }
        }

        SvtDirective::default()
    }
}

/// What the scenario engine should apply after a sub-engine step.
#[derive(Debug, Clone, Default)]
pub struct SvtDirective {
    pub converted_now: bool,
    pub vitals_override: Option<Vitals>,
    pub rhythm: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgeGroup;
    use chrono::Duration;

    fn teen() -> Demographics {
        Demographics {
            age_years: 14.0,
            weight_kg: 50.0,
            age_group: AgeGroup::Teen,
        }
    }

    fn sinus_vitals() -> Vitals {
        Vitals {
            hr: 96,
            bp: "104/66".into(),
            spo2: 99,
            rr: 18,
            temp: 37.0,
        }
    }

    fn state(now: DateTime<Utc>) -> SvtState {
        SvtState::new(now, false, sinus_vitals())
    }

    #[test]
    fn first_dose_classification_bands() {
        assert_eq!(classify_adenosine(0.05, 1), DoseClass::Underdose);
        assert_eq!(classify_adenosine(0.08, 1), DoseClass::Correct);
        assert_eq!(classify_adenosine(0.15, 1), DoseClass::Correct);
        assert_eq!(classify_adenosine(0.2, 1), DoseClass::ModerateOverdose);
        assert_eq!(classify_adenosine(0.3, 1), DoseClass::SevereOverdose);
    }

    #[test]
    fn second_dose_bands_are_doubled() {
        assert_eq!(classify_adenosine(0.2, 2), DoseClass::Correct);
        assert_eq!(classify_adenosine(0.1, 2), DoseClass::Underdose);
    }

    #[test]
    fn adequate_first_dose_with_flush_converts() {
        let now = Utc::now();
        let mut svt = state(now);
        let directive = svt.apply_adenosine(now, &teen(), 5.0, true, true);
        assert!(directive.converted_now);
        assert!(svt.converted);
        assert_eq!(svt.conversion_method.as_deref(), Some("adenosine_first"));
        assert_eq!(svt.phase, SvtPhase::PostTreatment);
        assert_eq!(svt.current_rhythm, "sinus");
    }

    #[test]
    fn adequate_dose_without_flush_does_not_convert() {
        let now = Utc::now();
        let mut svt = state(now);
        let directive = svt.apply_adenosine(now, &teen(), 5.0, true, false);
        assert!(!directive.converted_now);
        assert!(!svt.converted);
    }

    #[test]
    fn underdose_does_not_convert() {
        let now = Utc::now();
        let mut svt = state(now);
        let directive = svt.apply_adenosine(now, &teen(), 2.0, true, true);
        assert!(!directive.converted_now);
        assert_eq!(svt.adenosine_doses[0].dose_number, 1);
    }

    #[test]
    fn vagal_does_not_convert_when_scenario_says_no() {
        let now = Utc::now();
        let mut svt = state(now);
        let directive = svt.apply_vagal(now);
        assert!(!directive.converted_now);
        assert_eq!(svt.vagal_attempts, 1);
        assert_eq!(svt.phase, SvtPhase::Treatment);
    }

    #[test]
    fn unsedated_cardioversion_sets_flag_but_converts() {
        let now = Utc::now();
        let mut svt = state(now);
        let directive = svt.apply_cardioversion(now, 1.0, true, false);
        assert!(directive.converted_now);
        assert!(svt.flags.unsedated_cardioversion);
        assert!(svt
            .timeline_events
            .iter()
            .any(|e| e.negative && e.description.contains("without sedation")));
    }

    #[test]
    fn sedated_cardioversion_is_clean() {
        let now = Utc::now();
        let mut svt = state(now);
        svt.record_sedation(now);
        let directive = svt.apply_cardioversion(now, 1.0, true, false);
        assert!(directive.converted_now);
        assert!(!svt.flags.unsedated_cardioversion);
    }

    #[test]
    fn pause_freezes_elapsed() {
        let t0 = Utc::now();
        let mut svt = state(t0);
        let t30 = t0 + Duration::seconds(30);
        svt.pause_clock(t30);
        let t90 = t0 + Duration::seconds(90);
        assert_eq!(svt.elapsed_since_start(t90), 30_000);
        svt.resume_clock(t90);
        assert_eq!(svt.total_paused_ms, 60_000);
        let t100 = t0 + Duration::seconds(100);
        assert_eq!(svt.elapsed_since_start(t100), 40_000);
    }

    #[test]
    fn elapsed_is_monotone_across_pause_resume() {
        let t0 = Utc::now();
        let mut svt = state(t0);
        let mut last = 0;
        for (offset, action) in [
            (10, "none"),
            (20, "pause"),
            (40, "none"),
            (50, "resume"),
            (70, "none"),
        ] {
            let now = t0 + Duration::seconds(offset);
            match action {
                "pause" => svt.pause_clock(now),
                "resume" => svt.resume_clock(now),
                _ => {}
            }
            let elapsed = svt.elapsed_since_start(now);
            assert!(elapsed >= last, "elapsed went backwards at +{offset}s");
            last = elapsed;
        }
    }

    #[test]
    fn untreated_svt_decompensates_over_time() {
        let t0 = Utc::now();
        let mut svt = state(t0);
        svt.tick(t0 + Duration::seconds(250));
        assert_eq!(svt.stability_level, 1);
        assert_eq!(svt.phase, SvtPhase::Decompensating);
    }

    #[test]
    fn monitor_then_iv_advances_phases() {
        let t0 = Utc::now();
        let mut svt = state(t0);
        svt.record_monitor_on(t0);
        assert_eq!(svt.phase, SvtPhase::SvtOnset);
        svt.record_iv_access(t0 + Duration::seconds(10));
        assert_eq!(svt.phase, SvtPhase::InitialManagement);
    }
}
