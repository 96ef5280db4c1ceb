//! Provider-agnostic canonical chat types.
//!
//! This module is the single internal representation every provider
//! boundary converts from. Translators consume these types and produce
//! wire-format request bodies; stream handlers never produce them (model
//! output is delivered as [`crate::events::StreamEvent`]s and appended by
//! the turn loop).
//!
//! Invariants the rest of the system relies on:
//!
//! - every [`ContentBlock::ToolCall`] id is referenced by exactly one
//!   later [`ContentBlock::ToolResult`] within the same conversation,
//! - the `System` role appears at most once and always first,
//! - `Tool`-role messages are produced locally, never by a model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete translation input: conversation, tools, and per-request
/// options the translators understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier, e.g. `"claude-sonnet-4-20250514"` or `"gpt-4o"`.
    pub model: String,

    /// Conversation messages, oldest first.
    pub messages: Vec<Message>,

    /// System instruction, handled per provider (dedicated field for
    /// Anthropic/Gemini, `instructions` for OpenAI Responses, a leading
    /// system message for Chat Completions).
    pub system: Option<String>,

    /// Maximum tokens to generate. Anthropic requires it; others pass it
    /// through when present.
    pub max_tokens: Option<u32>,

    /// Tools the model may call.
    pub tools: Vec<Tool>,

    /// How the model should use tools. `None` means provider default.
    pub tool_choice: Option<ToolChoice>,

    /// Whether the model may emit several tool calls in one response.
    pub parallel_tool_calls: bool,

    /// Prompt cache key passthrough (OpenAI Responses).
    pub prompt_cache_key: Option<String>,

    /// Reasoning effort passthrough for providers that support it.
    pub reasoning_effort: Option<String>,
}

impl ChatRequest {
    /// A request with only the required fields set.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: None,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            parallel_tool_calls: false,
            prompt_cache_key: None,
            reasoning_effort: None,
        }
    }

    /// Validate the structural invariants before translation.
    ///
    /// Translators call this once; the turn loop relies on translation
    /// failing fast rather than producing a request the provider will
    /// reject with an opaque 400.
    pub fn validate(&self) -> crate::Result<()> {
        if self.messages.is_empty() {
            return Err(crate::LlmError::EmptyMessages);
        }

        for (i, message) in self.messages.iter().enumerate() {
            if message.role == Role::System && i != 0 {
                return Err(crate::LlmError::InvalidRequest(
                    "system message must be first".to_string(),
                ));
            }
        }

        for tool in &self.tools {
            if !valid_tool_name(&tool.name) {
                return Err(crate::LlmError::InvalidRequest(format!(
                    "invalid tool name '{}'",
                    tool.name
                )));
            }
        }

        Ok(())
    }
}

/// One conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,
    /// Ordered content blocks. Plain conversations carry a single
    /// `Text` block; tool traffic mixes in calls and results.
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// A single-text-block message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Iterator over the tool calls carried by this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolCall { id, name, arguments } => {
                Some((id.as_str(), name.as_str(), arguments.as_str()))
            }
            _ => None,
        })
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that steer the model. At most one, always first.
    System,
    /// End-user input.
    User,
    /// Model output (text and tool calls).
    Assistant,
    /// Locally produced tool output.
    Tool,
}

/// Content block variants.
///
/// The tagged representation keeps pattern matching exhaustive at every
/// provider boundary; adding a variant breaks every translator on
/// purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },

    /// A model request to invoke a named tool.
    ToolCall {
        /// Correlation id, referenced by exactly one later `ToolResult`.
        id: String,
        /// Tool name; must match a declared tool.
        name: String,
        /// Arguments as a JSON-encoded string, exactly as assembled from
        /// the stream.
        arguments: String,
    },

    /// Locally produced output for a prior tool call.
    ToolResult {
        /// The `ToolCall` id this responds to.
        tool_call_id: String,
        /// Output string in the dispatcher's JSON convention.
        output: String,
    },

    /// Inline image data (tool outputs that produce binary content).
    ImageInline {
        /// MIME type, e.g. `"image/png"`.
        media_type: String,
        /// Base64-encoded bytes without a data-URL prefix.
        data: String,
    },
}

/// Tool declaration exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name, `[A-Za-z0-9_.-]{1,63}`.
    pub name: String,
    /// What the tool does; the model reads this to decide when to call.
    pub description: String,
    /// JSON Schema for the arguments. Sanitized per provider before it
    /// goes on the wire.
    pub parameters: Value,
    /// OpenAI strict-mode flag.
    pub strict: Option<bool>,
}

/// Controls how the model uses tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides.
    Auto,
    /// Tool usage disabled.
    None,
    /// Model must call at least one tool.
    Required,
    /// Model must call the named tool.
    Specific(String),
}

/// Tool names accepted on the wire: 1–63 chars of `[A-Za-z0-9_.-]`.
pub fn valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Message {
        Message::text(Role::User, text)
    }

    #[test]
    fn empty_messages_fail_validation() {
        let request = ChatRequest::new("gpt-4o", vec![]);
        assert!(matches!(request.validate(), Err(crate::LlmError::EmptyMessages)));
    }

    #[test]
    fn misplaced_system_message_fails_validation() {
        let request = ChatRequest::new(
            "gpt-4o",
            vec![user("hi"), Message::text(Role::System, "be terse")],
        );
        assert!(request.validate().is_err());
    }

    #[test]
    fn tool_name_charset() {
        assert!(valid_tool_name("run_shell_command"));
        assert!(valid_tool_name("srv__tool.v2-x"));
        assert!(!valid_tool_name(""));
        assert!(!valid_tool_name("spaces not allowed"));
        assert!(!valid_tool_name(&"x".repeat(64)));
    }

    #[test]
    fn joined_text_skips_non_text_blocks() {
        let message = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolCall {
                    id: "call_1".into(),
                    name: "t".into(),
                    arguments: "{}".into(),
                },
                ContentBlock::Text { text: "b".into() },
            ],
        };

        assert_eq!(message.joined_text(), "ab");
    }
}
