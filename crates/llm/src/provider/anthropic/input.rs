//! Request building for the Anthropic Messages API.

use config::ProviderConfig;
use serde::Serialize;
use serde_json::Value;

use crate::{
    messages::{ChatRequest, ContentBlock, Message, Role},
    request::{RequestAuth, RequestEnvelope},
    schema::{SchemaDialect, sanitize},
};

pub(super) const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
pub(super) const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// System prompt Anthropic requires on OAuth-authenticated requests.
/// Byte-exact; the endpoint rejects variations.
pub const CLAUDE_CODE_SYSTEM: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// First-turn tool-parameter primer injected in OAuth mode.
pub const TOOL_PRIMER: &str = "Important context for using llxprt tools:\n\nTool Parameter Reference:\n- read_file uses parameter 'absolute_path' (not 'file_path')\n- write_file uses parameter 'file_path' (not 'path')\n- list_directory uses parameter 'path'\n- replace uses 'file_path', 'old_string', 'new_string'\n- search_file_content (grep) expects regex patterns, not literal text\n- todo_write requires 'todos' array with {id, content, status, priority}\n- All file paths must be absolute (starting with /)\n\n<LLXPRT_PROMPTS_HERE>";

/// Assistant acknowledgement paired with the primer.
pub const TOOL_PRIMER_ACK: &str = "I understand the llxprt tool parameters and context. I'll use the correct parameter names for each tool. Ready to help with your tasks.";

/// Synthetic result injected for a tool_use that never got an answer.
pub const INTERRUPTED_TOOL_RESULT: &str = "Error: Tool execution was interrupted. Please retry.";

/// Request body for the Anthropic Messages API.
#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct AnthropicMessage {
    pub role: &'static str,
    pub content: Vec<AnthropicContent>,
}

/// Content blocks in the Anthropic wire shape.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Image {
        source: AnthropicImageSource,
    },
}

#[derive(Debug, Serialize)]
pub struct AnthropicImageSource {
    pub r#type: &'static str,
    pub media_type: String,
    pub data: String,
}

/// Tool declaration in the Anthropic shape.
#[derive(Debug, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Build the streaming request envelope. Pure.
pub fn build(
    request: &ChatRequest,
    auth: &RequestAuth,
    config: &ProviderConfig,
) -> crate::Result<RequestEnvelope> {
    request.validate()?;

    let mut system = request.system.clone();
    let mut messages = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message.role {
            Role::System => {
                // The dedicated field wins; a leading system message only
                // fills it when the caller left it empty.
                if system.is_none() {
                    system = Some(message.joined_text());
                }
            }
            Role::User => messages.push(AnthropicMessage {
                role: "user",
                content: render_blocks(&message.content),
            }),
            Role::Assistant => messages.push(AnthropicMessage {
                role: "assistant",
                content: render_blocks(&message.content),
            }),
            // Tool results ride in user-role messages on this API.
            Role::Tool => messages.push(AnthropicMessage {
                role: "user",
                content: render_blocks(&message.content),
            }),
        }
    }

    if auth.is_oauth() {
        system = Some(CLAUDE_CODE_SYSTEM.to_string());

        let first_turn = !request.messages.iter().any(|m| m.role == Role::Assistant);
        if first_turn && config.anthropic_oauth_inject_primer {
            let mut primed = Vec::with_capacity(messages.len() + 2);
            primed.push(AnthropicMessage {
                role: "user",
                content: vec![AnthropicContent::Text {
                    text: TOOL_PRIMER.to_string(),
                }],
            });
            primed.push(AnthropicMessage {
                role: "assistant",
                content: vec![AnthropicContent::Text {
                    text: TOOL_PRIMER_ACK.to_string(),
                }],
            });
            primed.extend(messages);
            messages = primed;
        }
    }

    fix_missing_tool_results(&mut messages);

    let tools = request
        .tools
        .iter()
        .map(|tool| AnthropicTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: sanitize(&tool.parameters, SchemaDialect::Generic),
        })
        .collect();

    let body = AnthropicRequest {
        model: request.model.clone(),
        system,
        messages,
        tools,
        max_tokens: request.max_tokens.unwrap_or(config.max_tokens),
        stream: true,
    };

    let body = sonic_rs::to_vec(&body).map_err(|e| {
        log::error!("Failed to serialize Anthropic request: {e}");
        crate::LlmError::InternalError(None)
    })?;

    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string());

    let mut envelope = RequestEnvelope::streaming_post(format!("{base_url}/messages"), body)
        .header("content-type", "application/json")
        .header("accept", "text/event-stream")
        .header("anthropic-version", ANTHROPIC_VERSION);

    envelope = match auth {
        RequestAuth::ApiKey(key) => {
            use secrecy::ExposeSecret;
            envelope.header("x-api-key", key.expose_secret())
        }
        RequestAuth::Oauth { access_token, .. } => envelope
            .bearer(access_token)
            .header("anthropic-beta", OAUTH_BETA),
    };

    Ok(envelope)
}

fn render_blocks(blocks: &[ContentBlock]) -> Vec<AnthropicContent> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => AnthropicContent::Text { text: text.clone() },
            ContentBlock::ToolCall { id, name, arguments } => AnthropicContent::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: sonic_rs::from_str(arguments).unwrap_or_else(|_| {
                    log::warn!("Tool call {id} carries non-JSON arguments; sending empty object");
                    Value::Object(serde_json::Map::new())
                }),
            },
            ContentBlock::ToolResult { tool_call_id, output } => AnthropicContent::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: output.clone(),
            },
            ContentBlock::ImageInline { media_type, data } => AnthropicContent::Image {
                source: AnthropicImageSource {
                    r#type: "base64",
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
            },
        })
        .collect()
}

/// Consistency fix-up: any assistant `tool_use` without a matching later
/// `tool_result` gets a synthetic result injected right after it, so the
/// API never sees a dangling call.
fn fix_missing_tool_results(messages: &mut Vec<AnthropicMessage>) {
    let answered: std::collections::HashSet<String> = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|block| match block {
            AnthropicContent::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect();

    let mut index = 0;
    while index < messages.len() {
        let dangling: Vec<String> = if messages[index].role == "assistant" {
            messages[index]
                .content
                .iter()
                .filter_map(|block| match block {
                    AnthropicContent::ToolUse { id, .. } if !answered.contains(id) => Some(id.clone()),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };

        if !dangling.is_empty() {
            log::warn!("Injecting {} synthetic tool result(s) for interrupted calls", dangling.len());

            let content = dangling
                .into_iter()
                .map(|id| AnthropicContent::ToolResult {
                    tool_use_id: id,
                    content: INTERRUPTED_TOOL_RESULT.to_string(),
                })
                .collect();

            messages.insert(index + 1, AnthropicMessage { role: "user", content });
            index += 1;
        }

        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Tool;
    use config::ProviderKind;
    use secrecy::SecretString;
    use serde_json::json;

    fn provider_config() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::Anthropic)
    }

    fn api_key_auth() -> RequestAuth {
        RequestAuth::ApiKey(SecretString::from("test-key"))
    }

    fn oauth_auth() -> RequestAuth {
        RequestAuth::Oauth {
            access_token: SecretString::from("oauth-token"),
            account_id: None,
        }
    }

    fn shell_request() -> ChatRequest {
        let mut request = ChatRequest::new(
            "claude-sonnet-4-20250514",
            vec![Message::text(Role::User, "List files")],
        );
        request.tools = vec![Tool {
            name: "run_shell_command".to_string(),
            description: "Run a shell command".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
            strict: None,
        }];
        request
    }

    fn body_json(envelope: &RequestEnvelope) -> serde_json::Value {
        serde_json::from_slice(&envelope.body).unwrap()
    }

    #[test]
    fn api_key_request_has_versioned_headers_and_tool_schema() {
        let envelope = build(&shell_request(), &api_key_auth(), &provider_config()).unwrap();

        assert_eq!(envelope.url, "https://api.anthropic.com/v1/messages");
        assert!(envelope.headers.contains(&("x-api-key".into(), "test-key".into())));
        assert!(
            envelope
                .headers
                .contains(&("anthropic-version".into(), "2023-06-01".into()))
        );

        let body = body_json(&envelope);
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 64_000);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["name"], "run_shell_command");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn oauth_request_forces_system_and_injects_primer_on_first_turn() {
        let envelope = build(&shell_request(), &oauth_auth(), &provider_config()).unwrap();

        let auth_header = envelope
            .headers
            .iter()
            .find(|(name, _)| name == "authorization")
            .unwrap();
        assert_eq!(auth_header.1, "Bearer oauth-token");
        assert!(
            envelope
                .headers
                .contains(&("anthropic-beta".into(), "oauth-2025-04-20".into()))
        );

        let body = body_json(&envelope);
        assert_eq!(body["system"], CLAUDE_CODE_SYSTEM);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], TOOL_PRIMER);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][1]["content"][0]["text"], TOOL_PRIMER_ACK);
        assert_eq!(body["messages"][2]["content"][0]["text"], "List files");
    }

    #[test]
    fn primer_is_not_injected_after_the_first_turn() {
        let mut request = shell_request();
        request.messages.push(Message::text(Role::Assistant, "README.md"));
        request.messages.push(Message::text(Role::User, "thanks"));

        let envelope = build(&request, &oauth_auth(), &provider_config()).unwrap();
        let body = body_json(&envelope);

        assert_eq!(body["messages"][0]["content"][0]["text"], "List files");
    }

    #[test]
    fn tool_traffic_round_trips_into_tool_use_and_tool_result_blocks() {
        let mut request = shell_request();
        request.messages.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolCall {
                id: "call_123".into(),
                name: "run_shell_command".into(),
                arguments: r#"{"command":"ls -la"}"#.into(),
            }],
        });
        request.messages.push(Message {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_call_id: "call_123".into(),
                output: "README.md\nlib/\n".into(),
            }],
        });

        let envelope = build(&request, &api_key_auth(), &provider_config()).unwrap();
        let body = body_json(&envelope);

        let assistant = &body["messages"][1];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["content"][0]["type"], "tool_use");
        assert_eq!(assistant["content"][0]["id"], "call_123");
        assert_eq!(assistant["content"][0]["input"]["command"], "ls -la");

        let result = &body["messages"][2];
        assert_eq!(result["role"], "user");
        assert_eq!(result["content"][0]["type"], "tool_result");
        assert_eq!(result["content"][0]["tool_use_id"], "call_123");
        assert_eq!(result["content"][0]["content"], "README.md\nlib/\n");
    }

    #[test]
    fn dangling_tool_use_gets_a_synthetic_interrupted_result() {
        let mut request = shell_request();
        request.messages.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolCall {
                id: "call_lost".into(),
                name: "run_shell_command".into(),
                arguments: "{}".into(),
            }],
        });
        request.messages.push(Message::text(Role::User, "never mind"));

        let envelope = build(&request, &api_key_auth(), &provider_config()).unwrap();
        let body = body_json(&envelope);

        let synthetic = &body["messages"][2];
        assert_eq!(synthetic["role"], "user");
        assert_eq!(synthetic["content"][0]["type"], "tool_result");
        assert_eq!(synthetic["content"][0]["tool_use_id"], "call_lost");
        assert_eq!(synthetic["content"][0]["content"], INTERRUPTED_TOOL_RESULT);
        assert_eq!(body["messages"][3]["content"][0]["text"], "never mind");
    }

    #[test]
    fn translation_is_deterministic() {
        let request = shell_request();
        let config = provider_config();

        let a = build(&request, &api_key_auth(), &config).unwrap();
        let b = build(&request, &api_key_auth(), &config).unwrap();

        assert_eq!(a.body, b.body);
        assert_eq!(a.url, b.url);
        assert_eq!(a.headers, b.headers);
    }
}
