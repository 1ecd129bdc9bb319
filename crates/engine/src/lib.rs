//! Deterministic clinical scenario engine for the PulseGate gateway.
//!
//! The engine is a synchronous state machine: stages with declared exit
//! rules, a closed intent set validated by the tool gate, table-driven
//! treatment effects with scheduled decay, and complex-scenario
//! sub-engines (SVT, myocarditis) with their own phase machines and
//! deterministic debrief scoring.

pub mod engine;
pub mod gate;
pub mod intent;
pub mod myocarditis;
pub mod rhythm;
pub mod scenarios;
pub mod stages;
pub mod state;
pub mod svt;
pub mod treatments;

pub use engine::{EngineEvent, ScenarioEngine};
pub use gate::{GateDecision, ToolGate};
pub use intent::{IntentKind, IvParams, ToolIntent, VitalsDelta};
pub use state::{
    AgeGroup, Demographics, EngineState, ExtendedState, Order, OrderStatus, OrderType, Vitals,
};
pub use treatments::{TreatmentRequest, TreatmentType};
