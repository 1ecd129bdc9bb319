//! Order handler: pending order placement with ETA-scheduled completion
//! and a debounce window against voice double-utterances.
//!
//! Completion itself is an engine pending effect — the heartbeat fires it
//! and the orchestrator broadcasts the result line when the completion
//! event surfaces.

use chrono::{DateTime, Utc};

use pg_engine::{OrderType, ToolIntent};
use pg_protocol::OrderPayload;

use crate::orchestrator;
use crate::runtime::SessionRuntime;
use crate::state::AppState;

pub async fn handle_order(
    state: &AppState,
    session_id: &str,
    user_id: &str,
    payload: OrderPayload,
    runtime: &mut SessionRuntime,
    now: DateTime<Utc>,
) {
    let window = std::time::Duration::from_millis(state.config.gateway.order_debounce_ms);
    if runtime.order_debounced(payload.order_type, window, now) {
        tracing::debug!(
            session_id,
            order_type = payload.order_type.as_str(),
            "duplicate order suppressed inside debounce window"
        );
        return;
    }

    let events = runtime.engine.apply_intent(
        &ToolIntent::SubmitOrder {
            order_type: payload.order_type,
            ordered_by: Some(user_id.to_string()),
            iv_params: payload.iv_params,
        },
        now,
    );
    orchestrator::process_engine_events(state, session_id, runtime, &events).await;

    let hint = format!("order:{}", payload.order_type.as_str());
    if let Some(evt) = runtime
        .engine
        .evaluate_automatic_transitions(&[hint], now)
    {
        orchestrator::process_engine_events(state, session_id, runtime, &[evt]).await;
    }

    orchestrator::nurse_line(state, session_id, order_ack(payload.order_type));
}

fn order_ack(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Vitals => "Getting a fresh set of vitals.",
        OrderType::Ekg => "On it — hooking up the 12-lead now.",
        OrderType::Labs => "Drawing labs, I'll send them stat.",
        OrderType::Imaging => "Calling imaging, they'll be right up.",
        OrderType::CardiacExam => "Cardiac exam coming up.",
        OrderType::LungExam => "Listening to the lungs.",
        OrderType::GeneralExam => "Doing a quick head-to-toe.",
        OrderType::IvAccess => "Setting up for an IV.",
    }
}

/// Keyword classifier: does this utterance read as a spoken order? Pure
/// declared keyword sets, no model involved.
pub fn parse_spoken_order(text: &str) -> Option<OrderType> {
    let lower = text.to_lowercase();
    let wants = ["order", "get", "obtain", "need", "give me", "let's", "can we"]
        .iter()
        .any(|v| lower.contains(v));
    if !wants {
        return None;
    }

    const KEYWORDS: &[(&str, OrderType)] = &[
        ("12-lead", OrderType::Ekg),
        ("12 lead", OrderType::Ekg),
        ("ekg", OrderType::Ekg),
        ("ecg", OrderType::Ekg),
        ("labs", OrderType::Labs),
        ("blood work", OrderType::Labs),
        ("x-ray", OrderType::Imaging),
        ("chest film", OrderType::Imaging),
        ("echo", OrderType::Imaging),
        ("imaging", OrderType::Imaging),
        ("vitals", OrderType::Vitals),
        ("iv access", OrderType::IvAccess),
        ("an iv", OrderType::IvAccess),
    ];
    KEYWORDS
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoken_orders_parse() {
        assert_eq!(parse_spoken_order("let's get an EKG"), Some(OrderType::Ekg));
        assert_eq!(
            parse_spoken_order("can we order a 12-lead please"),
            Some(OrderType::Ekg)
        );
        assert_eq!(parse_spoken_order("I need labs"), Some(OrderType::Labs));
        assert_eq!(
            parse_spoken_order("get a chest film"),
            Some(OrderType::Imaging)
        );
    }

    #[test]
    fn conversation_is_not_an_order() {
        assert_eq!(parse_spoken_order("how are you feeling"), None);
        // Keyword without a request verb is not an order.
        assert_eq!(parse_spoken_order("the ekg looks fine"), None);
    }
}
