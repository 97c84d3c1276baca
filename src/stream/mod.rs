pub mod normalizer;
pub mod sse;

pub use normalizer::{normalize_frame, normalized_stream, FrameOutcome};
pub use sse::{frame_stream, SseParser, Utf8ChunkDecoder};

use serde::{Deserialize, Serialize};

/// Literal payload that closes an OpenAI-style completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A decoded SSE protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event {
        event: Option<String>,
        data: String,
        id: Option<String>,
    },
    /// A `retry:` field asking the client to change its reconnection delay (ms).
    RetryInterval(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Event,
    RetryInterval,
}

impl Frame {
    /// Unnamed event frame carrying `data`.
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Frame::Event {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Event { .. } => FrameKind::Event,
            Frame::RetryInterval(_) => FrameKind::RetryInterval,
        }
    }

    /// Payload of an event frame, `None` for retry frames.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match self {
            Frame::Event { data, .. } => Some(data),
            Frame::RetryInterval(_) => None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.payload()
            .is_some_and(|data| data.trim() == DONE_SENTINEL)
    }
}

/// Token counters reported by the provider on the final frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One provider-agnostic increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedDelta {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl NormalizedDelta {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
            finish_reason: None,
        }
    }
}
