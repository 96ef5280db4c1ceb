//! Request building for the Google Gemini GenerateContent API.
//!
//! Two dispatch modes share one inner request shape: the public
//! Generative Language endpoint authenticates with a `key` query
//! parameter, while the Code Assist endpoint takes a Bearer token and
//! wraps the request in a `{model, project, user_prompt_id, request}`
//! envelope.

use config::ProviderConfig;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    messages::{ChatRequest, ContentBlock, Role},
    request::{RequestAuth, RequestEnvelope},
    schema::{SchemaDialect, sanitize},
};

pub(super) const DEFAULT_GOOGLE_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub(super) const CODE_ASSIST_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal";

/// Inner request body shared by both endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerateRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
}

/// Code Assist request envelope.
#[derive(Debug, Serialize)]
pub struct CodeAssistEnvelope {
    pub model: String,
    pub project: String,
    pub user_prompt_id: String,
    pub request: GeminiGenerateRequest,
}

#[derive(Debug, Serialize)]
pub struct GeminiContent {
    pub role: &'static str,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Serialize)]
pub struct GeminiFunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Serialize)]
pub struct GeminiFunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Build the streaming request envelope. Pure given `stream_id`.
pub fn build(
    request: &ChatRequest,
    auth: &RequestAuth,
    config: &ProviderConfig,
    stream_id: Uuid,
) -> crate::Result<RequestEnvelope> {
    request.validate()?;

    let mut contents = Vec::new();
    let mut system_instruction = request.system.clone().map(|text| GeminiContent {
        role: "user",
        parts: vec![GeminiPart {
            text: Some(text),
            ..Default::default()
        }],
    });

    // Function responses must name the function, but the canonical form
    // only carries the call id; remember the id → name mapping as the
    // calls go by.
    let mut call_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if system_instruction.is_none() {
                    system_instruction = Some(GeminiContent {
                        role: "user",
                        parts: vec![GeminiPart {
                            text: Some(message.joined_text()),
                            ..Default::default()
                        }],
                    });
                }
            }
            Role::User => contents.push(GeminiContent {
                role: "user",
                parts: render_parts(&message.content, &mut call_names),
            }),
            Role::Assistant => {
                let parts = render_parts(&message.content, &mut call_names);
                if !parts.is_empty() {
                    contents.push(GeminiContent { role: "model", parts });
                }
            }
            // Function responses ride in user-role contents.
            Role::Tool => contents.push(GeminiContent {
                role: "user",
                parts: render_parts(&message.content, &mut call_names),
            }),
        }
    }

    let tools = (!request.tools.is_empty()).then(|| {
        vec![GeminiTool {
            function_declarations: request
                .tools
                .iter()
                .map(|tool| GeminiFunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(sanitize(&tool.parameters, SchemaDialect::Gemini)),
                })
                .collect(),
        }]
    });

    let inner = GeminiGenerateRequest {
        contents,
        system_instruction,
        tools,
        generation_config: request.max_tokens.map(|max_output_tokens| GeminiGenerationConfig {
            max_output_tokens: Some(max_output_tokens),
        }),
    };

    match auth {
        RequestAuth::ApiKey(key) => {
            use secrecy::ExposeSecret;

            let base = config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_GOOGLE_API_URL.to_string());

            let url = format!(
                "{base}/models/{}:streamGenerateContent?alt=sse&key={}",
                request.model,
                key.expose_secret()
            );

            let body = sonic_rs::to_vec(&inner).map_err(|e| {
                log::error!("Failed to serialize Gemini request: {e}");
                crate::LlmError::InternalError(None)
            })?;

            Ok(RequestEnvelope::streaming_post(url, body)
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .header("user-agent", config.user_agent.clone()))
        }
        RequestAuth::Oauth { access_token, account_id } => {
            let project = config
                .google_project
                .clone()
                .or_else(|| account_id.clone())
                .ok_or_else(|| {
                    crate::LlmError::InvalidRequest(
                        "Code Assist requests require a google_project".to_string(),
                    )
                })?;

            let envelope_body = CodeAssistEnvelope {
                model: request.model.clone(),
                project,
                user_prompt_id: stream_id.to_string(),
                request: inner,
            };

            let body = sonic_rs::to_vec(&envelope_body).map_err(|e| {
                log::error!("Failed to serialize Code Assist request: {e}");
                crate::LlmError::InternalError(None)
            })?;

            let url = format!("{CODE_ASSIST_URL}:streamGenerateContent?alt=sse");

            Ok(RequestEnvelope::streaming_post(url, body)
                .bearer(access_token)
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .header("user-agent", config.user_agent.clone()))
        }
    }
}

fn render_parts(
    blocks: &[ContentBlock],
    call_names: &mut std::collections::HashMap<String, String>,
) -> Vec<GeminiPart> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => GeminiPart {
                text: Some(text.clone()),
                ..Default::default()
            },
            ContentBlock::ToolCall { id, name, arguments } => {
                call_names.insert(id.clone(), name.clone());

                let args = sonic_rs::from_str(arguments).unwrap_or_else(|_| {
                    log::warn!("Tool call {id} carries non-JSON arguments; sending empty object");
                    Value::Object(serde_json::Map::new())
                });

                GeminiPart {
                    function_call: Some(GeminiFunctionCall {
                        id: Some(id.clone()),
                        name: name.clone(),
                        args,
                    }),
                    ..Default::default()
                }
            }
            ContentBlock::ToolResult { tool_call_id, output } => {
                let name = call_names.get(tool_call_id).cloned().unwrap_or_else(|| {
                    log::warn!("No function name recorded for call {tool_call_id}");
                    "unknown_function".to_string()
                });

                GeminiPart {
                    function_response: Some(GeminiFunctionResponse {
                        id: Some(tool_call_id.clone()),
                        name,
                        response: json!({ "output": output }),
                    }),
                    ..Default::default()
                }
            }
            ContentBlock::ImageInline { media_type, data } => GeminiPart {
                inline_data: Some(GeminiInlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Tool};
    use config::ProviderKind;
    use secrecy::SecretString;

    fn provider_config() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::Google)
    }

    fn body_json(envelope: &RequestEnvelope) -> Value {
        serde_json::from_slice(&envelope.body).unwrap()
    }

    fn read_file_request() -> ChatRequest {
        let mut request = ChatRequest::new(
            "gemini-2.5-pro",
            vec![Message::text(Role::User, "Read the diagram")],
        );
        request.tools = vec![Tool {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({
                "type": "object",
                "properties": { "absolute_path": { "type": "string" } },
                "additionalProperties": false
            }),
            strict: None,
        }];
        request
    }

    #[test]
    fn api_key_mode_authenticates_in_the_query_string() {
        let auth = RequestAuth::ApiKey(SecretString::from("g-key"));
        let envelope = build(&read_file_request(), &auth, &provider_config(), Uuid::new_v4()).unwrap();

        assert_eq!(
            envelope.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse&key=g-key"
        );

        let body = body_json(&envelope);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Read the diagram");
        // Gemini rejects additionalProperties; the sanitizer strips it.
        let declaration = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "read_file");
        assert!(declaration["parameters"].get("additionalProperties").is_none());
    }

    #[test]
    fn oauth_mode_wraps_the_request_in_a_code_assist_envelope() {
        let auth = RequestAuth::Oauth {
            access_token: SecretString::from("ya29.token"),
            account_id: None,
        };
        let mut config = provider_config();
        config.google_project = Some("my-project".to_string());

        let stream_id = Uuid::new_v4();
        let envelope = build(&read_file_request(), &auth, &config, stream_id).unwrap();

        assert_eq!(
            envelope.url,
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
        assert!(
            envelope
                .headers
                .iter()
                .any(|(name, value)| name == "authorization" && value == "Bearer ya29.token")
        );

        let body = body_json(&envelope);
        assert_eq!(body["model"], "gemini-2.5-pro");
        assert_eq!(body["project"], "my-project");
        assert_eq!(body["user_prompt_id"], stream_id.to_string());
        assert_eq!(body["request"]["contents"][0]["role"], "user");
    }

    #[test]
    fn oauth_without_project_is_rejected() {
        let auth = RequestAuth::Oauth {
            access_token: SecretString::from("t"),
            account_id: None,
        };

        let err = build(&read_file_request(), &auth, &provider_config(), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, crate::LlmError::InvalidRequest(_)));
    }

    #[test]
    fn binary_tool_output_renders_function_response_plus_inline_data() {
        let mut request = read_file_request();
        request.messages.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolCall {
                id: "fc1".into(),
                name: "read_file".into(),
                arguments: r#"{"absolute_path":"/abs/diagram.png"}"#.into(),
            }],
        });
        request.messages.push(Message {
            role: Role::Tool,
            content: vec![
                ContentBlock::ToolResult {
                    tool_call_id: "fc1".into(),
                    output: "Binary content of type image/png was processed.".into(),
                },
                ContentBlock::ImageInline {
                    media_type: "image/png".into(),
                    data: "aGVsbG8=".into(),
                },
            ],
        });

        let auth = RequestAuth::ApiKey(SecretString::from("g-key"));
        let body = body_json(&build(&request, &auth, &provider_config(), Uuid::new_v4()).unwrap());

        let model_turn = &body["contents"][1];
        assert_eq!(model_turn["role"], "model");
        assert_eq!(model_turn["parts"][0]["functionCall"]["id"], "fc1");
        assert_eq!(model_turn["parts"][0]["functionCall"]["args"]["absolute_path"], "/abs/diagram.png");

        let tool_turn = &body["contents"][2];
        assert_eq!(tool_turn["role"], "user");
        let response_part = &tool_turn["parts"][0]["functionResponse"];
        assert_eq!(response_part["id"], "fc1");
        assert_eq!(response_part["name"], "read_file");
        assert_eq!(
            response_part["response"]["output"],
            "Binary content of type image/png was processed."
        );
        let inline = &tool_turn["parts"][1]["inlineData"];
        assert_eq!(inline["mimeType"], "image/png");
        assert_eq!(inline["data"], "aGVsbG8=");
    }
}
