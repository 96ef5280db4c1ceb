//! Request building for the OpenAI Responses API.
//!
//! The Responses API takes an ordered `input` array mixing role messages,
//! `function_call` items, and `function_call_output` items instead of a
//! flat message list, and performs strict JSON Schema validation on tool
//! parameters. `FunctionCallOutput.output` must always be a plain
//! JSON-encoded string, never a nested object; nesting draws a 400.

use config::{ApplyPatchToolMode, ProviderConfig};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    messages::{ChatRequest, ContentBlock, Role},
    request::{RequestAuth, RequestEnvelope},
    schema::{SchemaDialect, sanitize},
};

pub(super) const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
pub(super) const CHATGPT_RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

/// Request body for the Responses API.
#[derive(Debug, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    pub tool_choice: &'static str,
    pub parallel_tool_calls: bool,
    pub stream: bool,
    pub store: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Reasoning {
    pub effort: String,
    pub summary: &'static str,
}

/// One entry of the ordered `input` array.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: &'static str,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    OutputText { text: String },
    InputImage { image_url: String },
}

/// Build the streaming request envelope. Pure given `stream_id`.
pub fn build(
    request: &ChatRequest,
    auth: &RequestAuth,
    config: &ProviderConfig,
    stream_id: Uuid,
) -> crate::Result<RequestEnvelope> {
    request.validate()?;

    let mut instructions = request.system.clone();
    let mut input = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if instructions.is_none() {
                    instructions = Some(message.joined_text());
                }
            }
            Role::User => input.push(InputItem::Message {
                role: "user",
                content: render_parts(&message.content, "user"),
            }),
            Role::Assistant => {
                let parts = render_parts(&message.content, "assistant");
                if !parts.is_empty() {
                    input.push(InputItem::Message {
                        role: "assistant",
                        content: parts,
                    });
                }
                for (id, name, arguments) in message.tool_calls() {
                    input.push(InputItem::FunctionCall {
                        call_id: id.to_string(),
                        name: name.to_string(),
                        arguments: arguments.to_string(),
                    });
                }
            }
            Role::Tool => {
                for block in &message.content {
                    if let ContentBlock::ToolResult { tool_call_id, output } = block {
                        input.push(InputItem::FunctionCallOutput {
                            call_id: tool_call_id.clone(),
                            output: output.clone(),
                        });
                    }
                }
            }
        }
    }

    let store = if auth.is_oauth() { false } else { config.store_responses };

    let reasoning_effort = request
        .reasoning_effort
        .clone()
        .or_else(|| config.reasoning_effort.clone());

    let include = if !store && reasoning_effort.is_some() {
        vec!["reasoning.encrypted_content"]
    } else {
        Vec::new()
    };

    let body = ResponsesRequest {
        model: request.model.clone(),
        instructions,
        input,
        tools: render_tools(request, config),
        tool_choice: "auto",
        parallel_tool_calls: false,
        stream: true,
        store,
        include,
        reasoning: reasoning_effort.map(|effort| Reasoning { effort, summary: "auto" }),
        prompt_cache_key: request.prompt_cache_key.clone(),
    };

    let body = sonic_rs::to_vec(&body).map_err(|e| {
        log::error!("Failed to serialize Responses request: {e}");
        crate::LlmError::InternalError(None)
    })?;

    let url = if auth.is_oauth() {
        CHATGPT_RESPONSES_URL.to_string()
    } else {
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string());
        format!("{base}/responses")
    };

    let mut envelope = RequestEnvelope::streaming_post(url, body)
        .bearer(auth.token())
        .header("content-type", "application/json; charset=utf-8")
        .header("accept", "text/event-stream")
        .header("openai-beta", "responses=experimental")
        .header("session_id", stream_id.to_string())
        .header("originator", config.originator.clone())
        .header("user-agent", config.user_agent.clone());

    if let Some(account_id) = auth.account_id() {
        envelope = envelope.header("chatgpt-account-id", account_id);
    }

    Ok(envelope)
}

fn render_parts(blocks: &[ContentBlock], role: &str) -> Vec<ContentPart> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(if role == "assistant" {
                ContentPart::OutputText { text: text.clone() }
            } else {
                ContentPart::InputText { text: text.clone() }
            }),
            ContentBlock::ImageInline { media_type, data } => Some(ContentPart::InputImage {
                image_url: format!("data:{media_type};base64,{data}"),
            }),
            // Tool calls and results become their own input items.
            ContentBlock::ToolCall { .. } | ContentBlock::ToolResult { .. } => None,
        })
        .collect()
}

fn render_tools(request: &ChatRequest, config: &ProviderConfig) -> Vec<Value> {
    let mut tools: Vec<Value> = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "strict": tool.strict.unwrap_or(false),
                "parameters": sanitize(&tool.parameters, SchemaDialect::OpenaiResponses),
            })
        })
        .collect();

    if config.tools_web_search_enabled {
        tools.push(json!({ "type": "web_search" }));
    }

    match config.apply_patch_tool_mode {
        ApplyPatchToolMode::Function => tools.push(json!({
            "type": "function",
            "name": "apply_patch",
            "description": "Apply a patch in the V4A diff format to the workspace.",
            "strict": false,
            "parameters": {
                "type": "object",
                "properties": {
                    "input": { "type": "string", "description": "The entire patch contents." }
                },
                "required": ["input"],
            },
        })),
        ApplyPatchToolMode::Freeform => tools.push(json!({
            "type": "custom",
            "name": "apply_patch",
            "description": "Apply a patch in the V4A diff format to the workspace.",
        })),
        ApplyPatchToolMode::None => {}
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Tool};
    use config::ProviderKind;
    use secrecy::SecretString;

    fn provider_config() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::OpenaiResponses)
    }

    fn api_key_auth() -> RequestAuth {
        RequestAuth::ApiKey(SecretString::from("sk-test"))
    }

    fn chatgpt_auth() -> RequestAuth {
        RequestAuth::Oauth {
            access_token: SecretString::from("oauth-token"),
            account_id: Some("acct_1".to_string()),
        }
    }

    fn shell_request() -> ChatRequest {
        let mut request = ChatRequest::new("gpt-5", vec![Message::text(Role::User, "List files")]);
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

    fn body_json(envelope: &RequestEnvelope) -> Value {
        serde_json::from_slice(&envelope.body).unwrap()
    }

    #[test]
    fn api_key_mode_posts_to_the_public_endpoint() {
        let stream_id = Uuid::new_v4();
        let envelope = build(&shell_request(), &api_key_auth(), &provider_config(), stream_id).unwrap();

        assert_eq!(envelope.url, "https://api.openai.com/v1/responses");
        assert!(
            envelope
                .headers
                .contains(&("openai-beta".into(), "responses=experimental".into()))
        );
        assert!(
            envelope
                .headers
                .contains(&("session_id".into(), stream_id.to_string()))
        );
        assert!(
            envelope
                .headers
                .contains(&("originator".into(), "codex_cli_rs".into()))
        );

        let body = body_json(&envelope);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["parallel_tool_calls"], false);
        assert_eq!(body["stream"], true);
        assert_eq!(body["store"], true);
        assert_eq!(body["input"][0]["type"], "message");
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
    }

    #[test]
    fn oauth_mode_uses_the_chatgpt_backend_and_disables_store() {
        let envelope = build(
            &shell_request(),
            &chatgpt_auth(),
            &provider_config(),
            Uuid::new_v4(),
        )
        .unwrap();

        assert_eq!(envelope.url, CHATGPT_RESPONSES_URL);
        assert!(
            envelope
                .headers
                .contains(&("chatgpt-account-id".into(), "acct_1".into()))
        );

        let body = body_json(&envelope);
        assert_eq!(body["store"], false);
    }

    #[test]
    fn reasoning_with_store_disabled_requests_encrypted_content() {
        let mut request = shell_request();
        request.reasoning_effort = Some("medium".to_string());

        let body = body_json(
            &build(&request, &chatgpt_auth(), &provider_config(), Uuid::new_v4()).unwrap(),
        );

        assert_eq!(body["reasoning"]["effort"], "medium");
        assert_eq!(body["include"][0], "reasoning.encrypted_content");
    }

    #[test]
    fn follow_up_items_preserve_call_order() {
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
                output: r#"{"output":"README.md\nlib/\n","metadata":{"exit_code":0,"duration_seconds":0.1}}"#.into(),
            }],
        });

        let body = body_json(
            &build(&request, &api_key_auth(), &provider_config(), Uuid::new_v4()).unwrap(),
        );

        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_123");
        assert_eq!(input[1]["arguments"], r#"{"command":"ls -la"}"#);
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["call_id"], "call_123");
        // The output is a plain JSON-encoded string, not a nested object.
        assert!(input[2]["output"].is_string());
    }

    #[test]
    fn integer_parameters_are_coerced_for_strict_validation() {
        let mut request = shell_request();
        request.tools[0].parameters = json!({
            "type": "object",
            "properties": { "count": { "type": "integer" } }
        });

        let body = body_json(
            &build(&request, &api_key_auth(), &provider_config(), Uuid::new_v4()).unwrap(),
        );

        assert_eq!(body["tools"][0]["parameters"]["properties"]["count"]["type"], "number");
    }

    #[test]
    fn web_search_tool_is_appended_when_enabled() {
        let mut config = provider_config();
        config.tools_web_search_enabled = true;

        let body = body_json(&build(&shell_request(), &api_key_auth(), &config, Uuid::new_v4()).unwrap());

        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.last().unwrap()["type"], "web_search");
    }
}
