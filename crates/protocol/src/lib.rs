//! Wire protocol for the `/ws/voice` endpoint: inbound and outbound
//! message envelopes, the closed voice-command set, and outbound
//! sim-state validation.
//!
//! Both directions are JSON text frames with a `type` discriminant.
//! Unknown types and unknown command payload keys fail to parse; that is
//! the inbound validator. The outbound validator ([`validate_sim_state`])
//! is the safety net against shape drift before a broadcast leaves the
//! gateway.

mod messages;
mod sim_state;

pub use messages::*;
pub use sim_state::*;
