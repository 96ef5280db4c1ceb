//! Agent turn loop options.

use serde::Deserialize;

/// What to do when a new stream is requested while one is in flight
/// for the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPolicy {
    /// Reject the new stream with a `stream_in_progress` error.
    #[default]
    Reject,
    /// Cancel the in-flight stream and start the new one.
    CancelPrevious,
}

/// Tunables for the agent turn loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TurnOptions {
    /// Cap on tool-call → follow-up cycles per turn.
    pub max_tool_iterations: u32,

    /// Drop the stream if no bytes arrive within this window.
    pub idle_timeout_ms: u64,

    /// Total turn deadline.
    pub turn_timeout_ms: u64,

    /// Run tool executors in parallel within a turn.
    pub parallel_tool_calls: bool,

    /// Concurrent-stream policy per session.
    pub stream_policy: StreamPolicy,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            max_tool_iterations: 8,
            idle_timeout_ms: 60_000,
            turn_timeout_ms: 600_000,
            parallel_tool_calls: false,
            stream_policy: StreamPolicy::default(),
        }
    }
}
