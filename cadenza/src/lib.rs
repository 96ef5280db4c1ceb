//! Cadenza: a provider-agnostic agent-turn runtime.
//!
//! Cadenza drives conversational LLM providers (OpenAI Responses, OpenAI
//! Chat Completions, Anthropic Messages, Google Gemini) with streaming
//! and tool calling. Callers hand it a canonical conversation and a
//! session name; it translates to the provider's wire format, parses the
//! SSE stream into normalized events, executes tool calls locally, and
//! loops until the model finishes the turn.
//!
//! Everything hangs off an explicitly constructed [`Runtime`]; there are
//! no process-wide registries.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use cadenza::Runtime;
//! use llm::messages::{Message, Role};
//!
//! let config = config::Config::load("cadenza.toml")?;
//! let runtime = Runtime::new(config)?;
//!
//! let result = runtime
//!     .run_turn(
//!         "anthropic",
//!         "laptop",
//!         "claude-sonnet-4-20250514",
//!         vec![Message::text(Role::User, "List files")],
//!         None,
//!     )
//!     .await?;
//!
//! println!("{}", result.final_text);
//! # Ok(())
//! # }
//! ```

mod error;
mod runtime;
mod supervisor;
mod tools;
mod turn;

pub use error::{Partial, TurnError};
pub use runtime::{Runtime, SessionInit};
pub use supervisor::{StreamGuard, StreamSupervisor};
pub use tools::{DispatchOutcome, InlineData, ToolExecutor, ToolOutput, ToolRegistry};
pub use turn::{AuthSource, TurnRunner};

use llm::events::Usage;
use uuid::Uuid;

/// One tool call the model made during a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// The outcome of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Concatenated assistant text across all cycles.
    pub final_text: String,
    /// Every tool call executed, in emission order.
    pub tools_used: Vec<ToolInvocation>,
    /// Token usage accumulated across all cycles.
    pub usage: Usage,
    /// Correlates all streams of this turn.
    pub thread_id: Uuid,
    /// The id of the final stream.
    pub stream_id: Uuid,
}
