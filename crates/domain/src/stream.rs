use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for chat adapter streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted while streaming a character reply from the chat adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatDelta {
    /// A text token chunk.
    Token { text: String },

    /// Stream finished; carries the accumulated full text.
    Done {
        full_text: String,
        usage: Option<Usage>,
    },

    /// An error occurred mid-stream.
    Error { message: String },
}

/// Token usage for a completion or realtime exchange.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}
