//! Per-session USD cost estimation with one-shot budget latches.
//!
//! The controller only counts and latches; the consequences of a crossing
//! (closing the realtime adapter, pinning fallback, blocking resume) are
//! the orchestrator's.

use serde::Serialize;

use pg_domain::config::BudgetConfig;

/// One usage sample from an adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSample {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub audio_seconds: f64,
}

/// Which limit, if any, this sample crossed. Each fires at most once for
/// the life of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCrossing {
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostController {
    #[serde(skip)]
    config: BudgetConfig,
    pub usd_estimate: f64,
    pub voice_seconds: f64,
    pub soft_fired: bool,
    pub hard_fired: bool,
}

impl CostController {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            usd_estimate: 0.0,
            voice_seconds: 0.0,
            soft_fired: false,
            hard_fired: false,
        }
    }

    /// Accumulate usage. When a sample crosses both limits at once, the
    /// hard crossing wins (and the soft latch still sets).
    pub fn add_usage(&mut self, sample: UsageSample) -> BudgetCrossing {
        let pricing = &self.config.pricing;
        self.usd_estimate += sample.input_tokens as f64 / 1000.0 * pricing.input_per_1k
            + sample.output_tokens as f64 / 1000.0 * pricing.output_per_1k
            + sample.audio_seconds * pricing.audio_per_sec;
        self.voice_seconds += sample.audio_seconds;

        if self.usd_estimate >= self.config.hard_usd && !self.hard_fired {
            self.hard_fired = true;
            self.soft_fired = true;
            return BudgetCrossing::Hard;
        }
        if self.usd_estimate >= self.config.soft_usd && !self.soft_fired {
            self.soft_fired = true;
            return BudgetCrossing::Soft;
        }
        BudgetCrossing::None
    }

    pub fn over_hard(&self) -> bool {
        self.hard_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_domain::config::PricingConfig;

    fn config() -> BudgetConfig {
        BudgetConfig {
            soft_usd: 1.0,
            hard_usd: 2.0,
            pricing: PricingConfig {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
                audio_per_sec: 0.001,
            },
        }
    }

    #[test]
    fn accumulates_tokens_and_audio() {
        let mut cost = CostController::new(config());
        cost.add_usage(UsageSample {
            input_tokens: 1000,
            output_tokens: 1000,
            audio_seconds: 10.0,
        });
        assert!((cost.usd_estimate - 0.05).abs() < 1e-9);
        assert!((cost.voice_seconds - 10.0).abs() < 1e-9);
    }

    #[test]
    fn soft_fires_exactly_once() {
        let mut cost = CostController::new(config());
        // 0.6 USD per sample.
        let sample = UsageSample {
            output_tokens: 20_000,
            ..Default::default()
        };
        assert_eq!(cost.add_usage(sample), BudgetCrossing::None);
        assert_eq!(cost.add_usage(sample), BudgetCrossing::Soft);
        assert_eq!(cost.add_usage(sample), BudgetCrossing::None);
    }

    #[test]
    fn hard_fires_once_and_latches() {
        let mut cost = CostController::new(config());
        let sample = UsageSample {
            output_tokens: 40_000, // 1.2 USD
            ..Default::default()
        };
        assert_eq!(cost.add_usage(sample), BudgetCrossing::Soft);
        assert_eq!(cost.add_usage(sample), BudgetCrossing::Hard);
        assert!(cost.over_hard());
        assert_eq!(cost.add_usage(sample), BudgetCrossing::None);
    }

    #[test]
    fn giant_sample_reports_hard_not_soft() {
        let mut cost = CostController::new(config());
        let sample = UsageSample {
            output_tokens: 100_000, // 3 USD
            ..Default::default()
        };
        assert_eq!(cost.add_usage(sample), BudgetCrossing::Hard);
        assert!(cost.soft_fired);
    }
}
