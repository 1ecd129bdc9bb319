//! Speech-provider interfaces for the PulseGate gateway.
//!
//! Four pluggable adapters — STT, TTS, a streaming chat LLM, and a
//! full-duplex realtime voice API — plus the bounded retry helper and
//! scripted stub implementations used by tests and insecure dev mode.
//!
//! Adapters own their network resources and never touch engine state;
//! the realtime adapter surfaces everything it hears as [`RealtimeEvent`]s
//! on a channel the orchestrator drains.

pub mod retry;
pub mod stub;
pub mod traits;

pub use retry::with_retry;
pub use traits::{
    ChatAdapter, ChatMessage, ChatRole, RealtimeAdapter, RealtimeEvent, SttAdapter, TtsAdapter,
    VoiceAdapters,
};
