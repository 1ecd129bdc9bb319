use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use pg_domain::error::Result;
use pg_domain::stream::{BoxStream, ChatDelta, Usage};
use pg_engine::ToolIntent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Speech-to-text. `Ok(None)` is a soft failure (nothing intelligible);
/// `Err` is a transport failure and goes through the retry wrapper.
#[async_trait::async_trait]
pub trait SttAdapter: Send + Sync {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<Option<String>>;
}

/// Text-to-speech. `Ok(None)` is a soft failure.
#[async_trait::async_trait]
pub trait TtsAdapter: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Option<Vec<u8>>>;
}

/// Streaming chat LLM used for character fallbacks (patient, nurse) and
/// debrief narratives.
#[async_trait::async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<BoxStream<'static, Result<ChatDelta>>>;
}

/// Events emitted by the realtime adapter. The adapter owns its socket
/// and mutates nothing — the orchestrator serializes these against the
/// session state lock.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    AudioOut(Vec<u8>),
    TranscriptDelta { text: String, is_final: bool },
    ToolIntent(ToolIntent),
    Usage(Usage),
    Disconnected,
}

/// Full-duplex realtime voice API.
#[async_trait::async_trait]
pub trait RealtimeAdapter: Send + Sync {
    async fn send_audio_chunk(&self, audio: &[u8]) -> Result<()>;
    async fn commit_audio(&self) -> Result<()>;
    /// Suppress the in-flight model response (floor loss, explicit
    /// non-patient routing).
    async fn cancel_response(&self) -> Result<()>;
    async fn close(&self);
    /// Take the event receiver. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<RealtimeEvent>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The adapter set a session runtime is wired with. The realtime factory
/// is optional — without it sessions run the STT/TTS path only.
#[derive(Clone)]
pub struct VoiceAdapters {
    pub stt: Arc<dyn SttAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
    pub chat: Arc<dyn ChatAdapter>,
    pub realtime_factory: Option<Arc<dyn Fn() -> Arc<dyn RealtimeAdapter> + Send + Sync>>,
}

impl VoiceAdapters {
    pub fn new_realtime(&self) -> Option<Arc<dyn RealtimeAdapter>> {
        self.realtime_factory.as_ref().map(|f| f())
    }
}
