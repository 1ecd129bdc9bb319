//! Scripted stub adapters.
//!
//! Back the gateway in tests and in insecure dev mode where no provider
//! credentials exist. Deterministic: fixed transcripts, canned audio,
//! word-by-word chat streams, and a realtime adapter that records every
//! call and lets the test inject events.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use pg_domain::error::{Error, Result};
use pg_domain::stream::{BoxStream, ChatDelta, Usage};

use crate::traits::{
    ChatAdapter, ChatMessage, RealtimeAdapter, RealtimeEvent, SttAdapter, TtsAdapter,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// STT / TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Returns a fixed transcript for every chunk.
pub struct FixedStt {
    pub transcript: Option<String>,
}

#[async_trait::async_trait]
impl SttAdapter for FixedStt {
    async fn transcribe(&self, _audio: &[u8], _mime_type: &str) -> Result<Option<String>> {
        Ok(self.transcript.clone())
    }
}

/// Fails every call; exercises the retry and degraded paths.
pub struct FailingStt;

#[async_trait::async_trait]
impl SttAdapter for FailingStt {
    async fn transcribe(&self, _audio: &[u8], _mime_type: &str) -> Result<Option<String>> {
        Err(Error::Adapter {
            adapter: "stt-stub".into(),
            message: "provider unavailable".into(),
        })
    }
}

/// Emits a short silent payload tagged with the voice ID.
pub struct CannedTts;

#[async_trait::async_trait]
impl TtsAdapter for CannedTts {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Option<Vec<u8>>> {
        if text.is_empty() {
            return Ok(None);
        }
        let mut bytes = voice_id.as_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        Ok(Some(bytes))
    }
}

pub struct FailingTts;

#[async_trait::async_trait]
impl TtsAdapter for FailingTts {
    async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<Option<Vec<u8>>> {
        Err(Error::Adapter {
            adapter: "tts-stub".into(),
            message: "provider unavailable".into(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streams a canned reply word by word, then `Done` with the full text.
pub struct ScriptedChat {
    pub reply: String,
}

#[async_trait::async_trait]
impl ChatAdapter for ScriptedChat {
    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> Result<BoxStream<'static, Result<ChatDelta>>> {
        let reply = self.reply.clone();
        let stream = async_stream::stream! {
            let mut accumulated = String::new();
            for word in reply.split_whitespace() {
                let token = if accumulated.is_empty() {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                accumulated.push_str(&token);
                yield Ok(ChatDelta::Token { text: token });
            }
            yield Ok(ChatDelta::Done {
                full_text: accumulated,
                usage: Some(Usage {
                    input_tokens: 40,
                    output_tokens: 25,
                }),
            });
        };
        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Realtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records every call; the test side injects events via
/// [`ScriptedRealtime::event_sender`].
pub struct ScriptedRealtime {
    calls: Mutex<Vec<String>>,
    events_rx: Mutex<Option<mpsc::Receiver<RealtimeEvent>>>,
    events_tx: mpsc::Sender<RealtimeEvent>,
    closed: Mutex<bool>,
}

impl ScriptedRealtime {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            events_rx: Mutex::new(Some(rx)),
            events_tx: tx,
            closed: Mutex::new(false),
        })
    }

    pub fn event_sender(&self) -> mpsc::Sender<RealtimeEvent> {
        self.events_tx.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait::async_trait]
impl RealtimeAdapter for ScriptedRealtime {
    async fn send_audio_chunk(&self, audio: &[u8]) -> Result<()> {
        self.calls.lock().push(format!("send:{}", audio.len()));
        Ok(())
    }

    async fn commit_audio(&self) -> Result<()> {
        self.calls.lock().push("commit".into());
        Ok(())
    }

    async fn cancel_response(&self) -> Result<()> {
        self.calls.lock().push("cancel".into());
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock() = true;
        self.calls.lock().push("close".into());
    }

    fn take_events(&self) -> Option<mpsc::Receiver<RealtimeEvent>> {
        self.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_chat_streams_and_accumulates() {
        let chat = ScriptedChat {
            reply: "I feel dizzy".into(),
        };
        let mut stream = chat.stream(vec![]).await.unwrap();
        let mut tokens = Vec::new();
        let mut full = None;
        while let Some(evt) = stream.next().await {
            match evt.unwrap() {
                ChatDelta::Token { text } => tokens.push(text),
                ChatDelta::Done { full_text, .. } => full = Some(full_text),
                ChatDelta::Error { message } => panic!("unexpected error: {message}"),
            }
        }
        assert_eq!(tokens.len(), 3);
        assert_eq!(full.as_deref(), Some("I feel dizzy"));
    }

    #[tokio::test]
    async fn scripted_realtime_records_calls_and_takes_events_once() {
        let rt = ScriptedRealtime::new();
        rt.send_audio_chunk(&[0u8; 320]).await.unwrap();
        rt.commit_audio().await.unwrap();
        rt.cancel_response().await.unwrap();
        assert_eq!(rt.calls(), vec!["send:320", "commit", "cancel"]);

        assert!(rt.take_events().is_some());
        assert!(rt.take_events().is_none());

        rt.close().await;
        assert!(rt.is_closed());
    }
}
