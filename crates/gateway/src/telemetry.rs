//! Telemetry waveform synthesis and monitor alarms.
//!
//! The waveform is a deterministic function of heart rate and rhythm
//! label — enough for the client to animate a strip, not a render.
//! Alarms are edge-triggered: one alert when a vital crosses its
//! threshold, another only after it recovers and crosses again.

use pg_engine::{AgeGroup, Vitals};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Waveform
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Samples in one synthesized strip (two seconds at 60 Hz).
pub const WAVEFORM_SAMPLES: usize = 120;
const STRIP_SECONDS: f32 = 2.0;

/// Synthesize a two-second telemetry strip for the given rate.
pub fn synthesize_waveform(hr: u32, rhythm: &str) -> Vec<f32> {
    let hr = hr.max(1) as f32;
    let beats_per_sec = hr / 60.0;
    // Narrow-complex rhythms get a spikier, smaller QRS.
    let (qrs_width, amplitude) = if rhythm == "svt" { (0.04, 0.8) } else { (0.08, 1.0) };

    (0..WAVEFORM_SAMPLES)
        .map(|i| {
            let t = i as f32 / WAVEFORM_SAMPLES as f32 * STRIP_SECONDS;
            let phase = (t * beats_per_sec).fract();
            if phase < qrs_width {
                // R wave up-down spike.
                let x = phase / qrs_width;
                if x < 0.5 { amplitude * x * 2.0 } else { amplitude * (1.0 - x) * 2.0 }
            } else if phase > 0.25 && phase < 0.33 && rhythm != "svt" {
                // T wave bump; SVT at rate buries it.
                0.15
            } else {
                0.0
            }
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alarms
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    Spo2Low,
    HrHigh,
    HrLow,
}

impl AlarmKind {
    pub fn message(&self, vitals: &Vitals) -> String {
        match self {
            Self::Spo2Low => format!("Monitor alarm — saturation {}%", vitals.spo2),
            Self::HrHigh => format!("Monitor alarm — heart rate {} and climbing", vitals.hr),
            Self::HrLow => format!("Monitor alarm — heart rate down to {}", vitals.hr),
        }
    }
}

/// Per-age alarm thresholds.
struct Thresholds {
    spo2_low: u32,
    hr_high: u32,
    hr_low: u32,
}

fn thresholds(group: AgeGroup) -> Thresholds {
    match group {
        AgeGroup::Infant => Thresholds { spo2_low: 90, hr_high: 200, hr_low: 90 },
        AgeGroup::Toddler => Thresholds { spo2_low: 90, hr_high: 190, hr_low: 80 },
        AgeGroup::Preschool => Thresholds { spo2_low: 90, hr_high: 180, hr_low: 70 },
        AgeGroup::Child => Thresholds { spo2_low: 90, hr_high: 170, hr_low: 60 },
        AgeGroup::Teen => Thresholds { spo2_low: 90, hr_high: 150, hr_low: 50 },
    }
}

/// Edge-trigger bookkeeping, one per session runtime.
#[derive(Debug, Default)]
pub struct AlarmState {
    spo2_low_active: bool,
    hr_high_active: bool,
    hr_low_active: bool,
}

impl AlarmState {
    /// Evaluate the vitals; returns only the alarms that newly fired on
    /// this evaluation.
    pub fn evaluate(&mut self, vitals: &Vitals, group: AgeGroup) -> Vec<AlarmKind> {
        let t = thresholds(group);
        let mut fired = Vec::new();

        let spo2_low = vitals.spo2 < t.spo2_low;
        if spo2_low && !self.spo2_low_active {
            fired.push(AlarmKind::Spo2Low);
        }
        self.spo2_low_active = spo2_low;

        let hr_high = vitals.hr > t.hr_high;
        if hr_high && !self.hr_high_active {
            fired.push(AlarmKind::HrHigh);
        }
        self.hr_high_active = hr_high;

        let hr_low = vitals.hr < t.hr_low;
        if hr_low && !self.hr_low_active {
            fired.push(AlarmKind::HrLow);
        }
        self.hr_low_active = hr_low;

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vitals(hr: u32, spo2: u32) -> Vitals {
        Vitals {
            hr,
            bp: "100/60".into(),
            spo2,
            rr: 20,
            temp: 37.0,
        }
    }

    #[test]
    fn waveform_is_deterministic_and_sized() {
        let a = synthesize_waveform(220, "svt");
        let b = synthesize_waveform(220, "svt");
        assert_eq!(a, b);
        assert_eq!(a.len(), WAVEFORM_SAMPLES);
        assert!(a.iter().any(|s| *s > 0.0));
    }

    #[test]
    fn faster_rate_means_more_spikes() {
        let count_spikes = |w: &[f32]| {
            w.windows(2)
                .filter(|p| p[0] == 0.0 && p[1] > 0.0)
                .count()
        };
        let slow = synthesize_waveform(60, "sinus");
        let fast = synthesize_waveform(180, "sinus");
        assert!(count_spikes(&fast) > count_spikes(&slow));
    }

    #[test]
    fn alarms_are_edge_triggered() {
        let mut state = AlarmState::default();

        // First crossing fires.
        let fired = state.evaluate(&vitals(220, 97), AgeGroup::Teen);
        assert_eq!(fired, vec![AlarmKind::HrHigh]);

        // Still high: no repeat.
        let fired = state.evaluate(&vitals(222, 97), AgeGroup::Teen);
        assert!(fired.is_empty());

        // Recovered, then crossed again: fires again.
        state.evaluate(&vitals(96, 97), AgeGroup::Teen);
        let fired = state.evaluate(&vitals(210, 97), AgeGroup::Teen);
        assert_eq!(fired, vec![AlarmKind::HrHigh]);
    }

    #[test]
    fn multiple_alarms_fire_together() {
        let mut state = AlarmState::default();
        let fired = state.evaluate(&vitals(40, 82), AgeGroup::Child);
        assert!(fired.contains(&AlarmKind::Spo2Low));
        assert!(fired.contains(&AlarmKind::HrLow));
    }

    #[test]
    fn thresholds_are_age_adjusted() {
        let mut state = AlarmState::default();
        // 160 bpm is alarming for a teen, normal-high for an infant.
        assert_eq!(
            state.evaluate(&vitals(160, 97), AgeGroup::Teen),
            vec![AlarmKind::HrHigh]
        );
        let mut state = AlarmState::default();
        assert!(state.evaluate(&vitals(160, 97), AgeGroup::Infant).is_empty());
    }
}
