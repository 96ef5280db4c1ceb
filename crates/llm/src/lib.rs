//! Provider core for the Cadenza agent-turn runtime.
//!
//! This crate owns everything between a canonical conversation and a
//! provider's wire format:
//!
//! - the canonical chat model ([`messages`]) shared by every provider,
//! - pure request translators producing a [`request::RequestEnvelope`]
//!   per provider,
//! - the SSE framer ([`sse`]) and per-provider stream handlers turning
//!   framed events into the normalized [`events::StreamEvent`] alphabet,
//! - the tool-schema sanitizer and MCP tool-name qualification
//!   ([`schema`]).
//!
//! The conversion flow follows this pattern:
//!
//! ```text
//! ChatRequest → RequestEnvelope → HTTP POST → SSE → StreamEvent*
//! ```
//!
//! Nothing in this crate executes tools or loops over turns; that lives
//! in the runtime facade on top.

mod error;
mod http_client;

pub mod events;
pub mod messages;
pub mod provider;
pub mod request;
pub mod schema;
pub mod sse;

pub use error::{LlmError, LlmResult as Result};
