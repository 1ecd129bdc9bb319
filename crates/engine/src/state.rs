//! Engine state: the full per-session clinical record.
//!
//! Everything here is plain serializable data. The snapshot of this state
//! is what persistence stores and what hydration restores; the engine in
//! `engine.rs` is the only writer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intent::ToolIntent;
use crate::myocarditis::MyocarditisState;
use crate::svt::SvtState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vitals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The recognized vital signs. The key set is closed — unknown keys fail
/// deserialization at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Vitals {
    /// Heart rate, beats per minute.
    pub hr: u32,
    /// Blood pressure as `"sys/dia"`.
    pub bp: String,
    /// Oxygen saturation, percent.
    pub spo2: u32,
    /// Respiratory rate, breaths per minute.
    pub rr: u32,
    /// Core temperature, degrees Celsius.
    pub temp: f64,
}

impl Vitals {
    /// Render the vitals as a single nurse-readable line.
    pub fn summary_line(&self) -> String {
        format!(
            "HR {}, BP {}, SpO2 {}%, RR {}, T {:.1}°C",
            self.hr, self.bp, self.spo2, self.rr, self.temp
        )
    }

    /// Systolic component of the blood pressure, if parseable.
    pub fn systolic(&self) -> Option<u32> {
        self.bp.split('/').next()?.trim().parse().ok()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exam & interventions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lungs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perfusion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neuro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lung_audio_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvAccess {
    pub gauge: u32,
    pub site: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oxygen {
    /// Delivery mode, e.g. `"nasal_cannula"`, `"non_rebreather"`.
    pub mode: String,
    pub lpm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ett {
    pub size: f64,
    pub depth_cm: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interventions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<IvAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oxygen: Option<Oxygen>,
    #[serde(default)]
    pub monitor: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ett: Option<Ett>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Vitals,
    Ekg,
    Labs,
    Imaging,
    CardiacExam,
    LungExam,
    GeneralExam,
    IvAccess,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vitals => "vitals",
            Self::Ekg => "ekg",
            Self::Labs => "labs",
            Self::Imaging => "imaging",
            Self::CardiacExam => "cardiac_exam",
            Self::LungExam => "lung_exam",
            Self::GeneralExam => "general_exam",
            Self::IvAccess => "iv_access",
        }
    }

    /// Simulated turnaround before the order result comes back.
    pub fn eta_ms(&self) -> i64 {
        match self {
            Self::Vitals => 5_000,
            Self::Ekg => 20_000,
            Self::Labs => 45_000,
            Self::Imaging => 60_000,
            Self::CardiacExam | Self::LungExam | Self::GeneralExam => 8_000,
            Self::IvAccess => 15_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Complete,
}

/// One clinical order. Invariant: `Pending` orders carry neither `result`
/// nor `completed_at`; `Complete` orders carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered_by: Option<String>,
    /// Line parameters captured at order time, applied on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_params: Option<crate::intent::IvParams>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Histories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EkgEntry {
    pub ts: DateTime<Utc>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rhythm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentEntry {
    pub ts: DateTime<Utc>,
    pub treatment_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Kept EKG strips. Older entries roll off.
pub const EKG_HISTORY_LIMIT: usize = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Demographics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Infant,
    Toddler,
    Preschool,
    Child,
    Teen,
}

impl AgeGroup {
    /// Derive the group from age in years.
    pub fn from_age_years(age: f64) -> Self {
        if age < 1.0 {
            Self::Infant
        } else if age < 3.0 {
            Self::Toddler
        } else if age < 6.0 {
            Self::Preschool
        } else if age < 13.0 {
            Self::Child
        } else {
            Self::Teen
        }
    }
}

/// Patient demographics. Immutable once the session starts; weight drives
/// all dose math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub age_years: f64,
    pub weight_kg: f64,
    pub age_group: AgeGroup,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending effects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A scheduled state change (treatment decay, order completion). Fired by
/// `tick` in `(fire_at, seq)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEffect {
    pub fire_at: DateTime<Utc>,
    pub seq: u64,
    pub intent: ToolIntent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extended (complex-scenario) state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtendedState {
    Svt(SvtState),
    Myocarditis(MyocarditisState),
}

impl ExtendedState {
    pub fn timeline_len(&self) -> usize {
        match self {
            Self::Svt(s) => s.timeline_events.len(),
            Self::Myocarditis(m) => m.timeline_events.len(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The complete per-session clinical state. This is the persistence
/// snapshot; `hydrate(snapshot(s)) == s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub scenario_id: String,
    pub stage_id: String,
    pub stage_ids: Vec<String>,
    pub stage_entered_at: DateTime<Utc>,
    pub scenario_started_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub vitals: Vitals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam: Option<Exam>,
    pub interventions: Interventions,
    pub telemetry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rhythm_summary: Option<String>,
    pub findings: BTreeSet<String>,
    pub orders: Vec<Order>,
    pub next_order_id: u64,
    pub ekg_history: Vec<EkgEntry>,
    pub telemetry_history: Vec<TelemetryEntry>,
    pub treatment_history: Vec<TreatmentEntry>,
    pub pending_effects: Vec<PendingEffect>,
    pub next_effect_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<ExtendedState>,
    pub demographics: Demographics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_vitals_key_is_rejected() {
        let raw = r#"{"hr": 120, "bp": "100/60", "spo2": 98, "rr": 20, "temp": 37.0, "glucose": 90}"#;
        assert!(serde_json::from_str::<Vitals>(raw).is_err());
    }

    #[test]
    fn vitals_systolic_parses() {
        let v = Vitals {
            hr: 120,
            bp: "88/54".into(),
            spo2: 94,
            rr: 30,
            temp: 37.0,
        };
        assert_eq!(v.systolic(), Some(88));
    }

    #[test]
    fn age_group_boundaries() {
        assert_eq!(AgeGroup::from_age_years(0.5), AgeGroup::Infant);
        assert_eq!(AgeGroup::from_age_years(1.0), AgeGroup::Toddler);
        assert_eq!(AgeGroup::from_age_years(3.0), AgeGroup::Preschool);
        assert_eq!(AgeGroup::from_age_years(6.0), AgeGroup::Child);
        assert_eq!(AgeGroup::from_age_years(14.0), AgeGroup::Teen);
    }
}
