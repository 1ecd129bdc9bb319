//! The `sim_state` broadcast payload and its outbound validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pg_engine::state::{
    EkgEntry, Exam, ExtendedState, Interventions, Order, OrderStatus, TelemetryEntry,
    TreatmentEntry, Vitals,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Auscultation clips revealed by completed exam orders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExamAudio {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lung_audio_url: Option<String>,
}

impl ExamAudio {
    pub fn is_empty(&self) -> bool {
        self.heart_audio_url.is_none() && self.lung_audio_url.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetView {
    pub usd_estimate: f64,
    pub soft_limit_reached: bool,
    pub hard_limit_reached: bool,
}

/// Role-gated session snapshot. The gateway builds one per role; gated
/// fields are simply absent (vitals gate to `{}` so clients can bind
/// without null checks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimState {
    pub session_id: String,
    pub stage_id: String,
    pub scenario_id: String,
    /// Gated for participants until a vitals order completes or telemetry
    /// is on; serializes as `{}` when hidden.
    #[serde(with = "gated_vitals")]
    pub vitals: Option<Vitals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam: Option<Exam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam_audio: Option<ExamAudio>,
    pub interventions: Interventions,
    pub telemetry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rhythm_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_waveform: Option<Vec<f32>>,
    pub findings: Vec<String>,
    pub orders: Vec<Order>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ekg_history: Option<Vec<EkgEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_history: Option<Vec<TelemetryEntry>>,
    pub treatment_history: Vec<TreatmentEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_entered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    pub fallback: bool,
    pub voice_fallback: bool,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetView>,
    /// Presenter only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<ExtendedState>,
    /// Presenter only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_ids: Option<Vec<String>>,
}

/// Hidden vitals serialize as an empty object rather than null.
mod gated_vitals {
    use super::Vitals;
    use serde::de::Deserializer;
    use serde::ser::{SerializeMap, Serializer};
    use serde::{Deserialize, Serialize};

    pub fn serialize<S: Serializer>(v: &Option<Vitals>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(vitals) => vitals.serialize(s),
            None => s.serialize_map(Some(0))?.end(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vitals>, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        match &value {
            serde_json::Value::Object(map) if map.is_empty() => Ok(None),
            _ => serde_json::from_value(value)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shape-check a snapshot before broadcast. On failure the gateway drops
/// the broadcast and logs — it never sends a malformed state.
pub fn validate_sim_state(state: &SimState) -> Result<(), String> {
    if state.session_id.is_empty() {
        return Err("empty session_id".into());
    }
    if state.correlation_id.is_empty() {
        return Err("empty correlation_id".into());
    }

    for order in &state.orders {
        match order.status {
            OrderStatus::Pending => {
                if order.completed_at.is_some() || order.result.is_some() {
                    return Err(format!(
                        "pending order {} carries completion fields",
                        order.id
                    ));
                }
            }
            OrderStatus::Complete => {
                if order.completed_at.is_none() || order.result.is_none() {
                    return Err(format!(
                        "complete order {} is missing completion fields",
                        order.id
                    ));
                }
            }
        }
    }

    if let Some(vitals) = &state.vitals {
        if vitals.spo2 > 100 {
            return Err(format!("spo2 {} out of range", vitals.spo2));
        }
        if !(20.0..=46.0).contains(&vitals.temp) {
            return Err(format!("temp {} out of range", vitals.temp));
        }
    }

    // Extended state and the stage list travel together (presenter view)
    // or not at all (participant view).
    if state.extended.is_some() != state.stage_ids.is_some() {
        return Err("presenter-only fields partially present".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_engine::state::OrderType;

    fn base_state() -> SimState {
        SimState {
            session_id: "s1".into(),
            stage_id: "presentation".into(),
            scenario_id: "teen_svt_complex_v1".into(),
            vitals: None,
            exam: None,
            exam_audio: None,
            interventions: Interventions::default(),
            telemetry: false,
            rhythm_summary: None,
            telemetry_waveform: None,
            findings: Vec::new(),
            orders: Vec::new(),
            ekg_history: None,
            telemetry_history: None,
            treatment_history: Vec::new(),
            scenario_started_at: None,
            stage_entered_at: None,
            elapsed_seconds: Some(0),
            fallback: false,
            voice_fallback: false,
            correlation_id: "corr-1".into(),
            budget: None,
            extended: None,
            stage_ids: None,
        }
    }

    #[test]
    fn gated_vitals_serialize_as_empty_object() {
        let state = base_state();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["vitals"], serde_json::json!({}));

        let back: SimState = serde_json::from_value(json).unwrap();
        assert!(back.vitals.is_none());
    }

    #[test]
    fn visible_vitals_round_trip() {
        let mut state = base_state();
        state.vitals = Some(Vitals {
            hr: 220,
            bp: "96/62".into(),
            spo2: 97,
            rr: 24,
            temp: 37.0,
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["vitals"]["hr"], 220);
        let back: SimState = serde_json::from_value(json).unwrap();
        assert_eq!(back.vitals.unwrap().hr, 220);
    }

    #[test]
    fn pending_order_with_result_fails_validation() {
        let mut state = base_state();
        state.orders.push(Order {
            id: 1,
            order_type: OrderType::Ekg,
            status: OrderStatus::Pending,
            result: Some("oops".into()),
            completed_at: None,
            ordered_by: None,
            iv_params: None,
        });
        assert!(validate_sim_state(&state).is_err());
    }

    #[test]
    fn complete_order_needs_both_fields() {
        let mut state = base_state();
        state.orders.push(Order {
            id: 1,
            order_type: OrderType::Vitals,
            status: OrderStatus::Complete,
            result: Some("HR 220".into()),
            completed_at: None,
            ordered_by: None,
            iv_params: None,
        });
        assert!(validate_sim_state(&state).is_err());
    }

    #[test]
    fn presenter_fields_travel_together() {
        let mut state = base_state();
        state.stage_ids = Some(vec!["presentation".into()]);
        assert!(validate_sim_state(&state).is_err());
    }

    #[test]
    fn valid_state_passes() {
        assert!(validate_sim_state(&base_state()).is_ok());
    }
}
