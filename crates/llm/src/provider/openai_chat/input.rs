//! Request building for the OpenAI Chat Completions API.

use config::ProviderConfig;
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    messages::{ChatRequest, ContentBlock, Role, ToolChoice},
    request::{RequestAuth, RequestEnvelope},
    schema::{SchemaDialect, sanitize},
};

pub(super) const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Request body for the Chat Completions API.
#[derive(Debug, Serialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    pub stream: bool,
    pub stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// One wire message. `content` stays `null` (not omitted) on assistant
/// messages that only carry tool calls; the API requires the field.
#[derive(Debug, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WireToolCall {
    pub id: String,
    pub r#type: &'static str,
    pub function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Build the streaming request envelope. Pure.
pub fn build(
    request: &ChatRequest,
    auth: &RequestAuth,
    config: &ProviderConfig,
) -> crate::Result<RequestEnvelope> {
    request.validate()?;

    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(WireMessage {
            role: "system",
            content: Some(system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in &request.messages {
        match message.role {
            Role::System => {
                if messages.first().is_none_or(|m| m.role != "system") {
                    messages.insert(
                        0,
                        WireMessage {
                            role: "system",
                            content: Some(message.joined_text()),
                            tool_calls: None,
                            tool_call_id: None,
                        },
                    );
                }
            }
            Role::User => {
                for block in &message.content {
                    if let ContentBlock::ImageInline { .. } = block {
                        log::warn!("Dropping inline image; not supported on this translation path");
                    }
                }
                messages.push(WireMessage {
                    role: "user",
                    content: Some(message.joined_text()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Role::Assistant => {
                let text = message.joined_text();
                let tool_calls: Vec<WireToolCall> = message
                    .tool_calls()
                    .map(|(id, name, arguments)| WireToolCall {
                        id: id.to_string(),
                        r#type: "function",
                        function: WireFunctionCall {
                            name: name.to_string(),
                            arguments: arguments.to_string(),
                        },
                    })
                    .collect();

                messages.push(WireMessage {
                    role: "assistant",
                    content: if text.is_empty() && !tool_calls.is_empty() {
                        None
                    } else {
                        Some(text)
                    },
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                });
            }
            Role::Tool => {
                for block in &message.content {
                    if let ContentBlock::ToolResult { tool_call_id, output } = block {
                        messages.push(WireMessage {
                            role: "tool",
                            content: Some(output.clone()),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id.clone()),
                        });
                    }
                }
            }
        }
    }

    let tools = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": sanitize(&tool.parameters, SchemaDialect::Generic),
                    "strict": tool.strict,
                }
            })
        })
        .collect();

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Specific(name) => json!({ "type": "function", "function": { "name": name } }),
    });

    let body = ChatCompletionsRequest {
        model: request.model.clone(),
        messages,
        tools,
        tool_choice,
        stream: true,
        stream_options: StreamOptions { include_usage: true },
    };

    let body = sonic_rs::to_vec(&body).map_err(|e| {
        log::error!("Failed to serialize Chat Completions request: {e}");
        crate::LlmError::InternalError(None)
    })?;

    let base = config
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());

    let envelope = RequestEnvelope::streaming_post(format!("{base}/v1/chat/completions"), body)
        .bearer(auth.token())
        .header("content-type", "application/json")
        .header("accept", "text/event-stream")
        .header("user-agent", config.user_agent.clone());

    Ok(envelope)
}
