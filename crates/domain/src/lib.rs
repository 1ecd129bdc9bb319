//! Shared domain types for the PulseGate simulation voice gateway.
//!
//! Everything here is dependency-light: the error type, the typed
//! configuration record, structured trace events, and the stream
//! primitives used by the chat adapter.

pub mod config;
pub mod error;
pub mod events;
pub mod stream;
