//! Normalized stream events.
//!
//! Every provider stream handler reduces its wire events to this
//! alphabet. Ordering guarantees within one stream: `Content` and
//! `Thought` deltas preserve provider order, `FunctionCall` is emitted
//! only once its arguments are completely assembled, and `Usage`
//! precedes `Done`.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;

/// A fully assembled tool invocation request from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Provider correlation id (`call_…`, `toolu_…`, or synthesized).
    pub id: String,
    /// Declared tool name.
    pub name: String,
    /// Complete arguments as a JSON-encoded string.
    pub arguments: String,
}

/// Token usage for one model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Accumulate usage across the streams of a multi-cycle turn.
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One normalized event from a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    Content(String),

    /// Incremental reasoning/thinking text. Whether this is surfaced to
    /// end users is the embedder's decision.
    Thought(String),

    /// One or more fully assembled tool calls.
    FunctionCall(Vec<FunctionCall>),

    /// Token usage. Emitted before `Done`.
    Usage(Usage),

    /// A recoverable in-stream error. The stream continues unless the
    /// transport itself died.
    Error {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Terminal event. Always last, even after an error.
    Done {
        /// Provider response id when one was supplied.
        response_id: Option<String>,
        /// Provider finish reason, verbatim.
        finish_reason: Option<String>,
    },
}

impl StreamEvent {
    /// Convenience constructor for a terminal event with no metadata.
    pub fn done() -> Self {
        Self::Done {
            response_id: None,
            finish_reason: None,
        }
    }
}

/// The stream type every provider hands back: normalized events or
/// transport-fatal errors.
pub type EventStream = Pin<Box<dyn Stream<Item = crate::Result<StreamEvent>> + Send>>;
