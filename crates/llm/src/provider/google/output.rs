//! Stream handling for the Google Gemini GenerateContent API.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    events::{FunctionCall, StreamEvent, Usage},
    provider::StreamProcessor,
    sse::SseEvent,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiStreamChunk {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiCandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiCandidateContent {
    #[serde(default)]
    pub parts: Vec<GeminiCandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidatePart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: bool,
    #[serde(default)]
    pub function_call: Option<GeminiFunctionCallPart>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiFunctionCallPart {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

/// Thought parts open with a bolded subject: `**subject** body`.
/// Split them so consumers get a readable line; anything else passes
/// through verbatim.
fn extract_thought(text: &str) -> String {
    let Some(rest) = text.strip_prefix("**") else {
        return text.to_string();
    };
    let Some(end) = rest.find("**") else {
        return text.to_string();
    };

    let subject = rest[..end].trim();
    let body = rest[end + 2..].trim();

    if body.is_empty() {
        subject.to_string()
    } else {
        format!("{subject}\n{body}")
    }
}

/// State machine over one Gemini stream.
pub struct GeminiStreamProcessor {
    /// The public endpoint omits function-call ids; synthesize stable
    /// per-stream ids so results correlate.
    synthesized_calls: u32,
}

impl GeminiStreamProcessor {
    pub fn new() -> Self {
        Self { synthesized_calls: 0 }
    }

    fn handle(&mut self, chunk: GeminiStreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.usage_metadata {
            let total = if usage.total_token_count > 0 {
                usage.total_token_count
            } else {
                usage.prompt_token_count + usage.candidates_token_count
            };
            events.push(StreamEvent::Usage(Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: total,
            }));
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return events;
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                let id = call.id.unwrap_or_else(|| {
                    self.synthesized_calls += 1;
                    format!("{}-{}", call.name, self.synthesized_calls)
                });

                let arguments = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());

                events.push(StreamEvent::FunctionCall(vec![FunctionCall {
                    id,
                    name: call.name,
                    arguments,
                }]));
                continue;
            }

            if let Some(text) = part.text {
                if part.thought {
                    events.push(StreamEvent::Thought(extract_thought(&text)));
                } else {
                    events.push(StreamEvent::Content(text));
                }
            }
        }

        if let Some(finish_reason) = candidate.finish_reason {
            events.push(StreamEvent::Done {
                response_id: None,
                finish_reason: Some(finish_reason),
            });
        }

        events
    }
}

impl Default for GeminiStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor for GeminiStreamProcessor {
    fn process(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        let parsed: Result<Value, _> = serde_json::from_str(&event.data);

        let chunk = parsed.and_then(|mut value| {
            // Code Assist wraps each chunk in a `response` envelope.
            if let Some(inner) = value.get_mut("response").map(Value::take) {
                serde_json::from_value::<GeminiStreamChunk>(inner)
            } else {
                serde_json::from_value::<GeminiStreamChunk>(value)
            }
        });

        match chunk {
            Ok(chunk) => self.handle(chunk),
            Err(e) => {
                log::warn!("Failed to parse Gemini streaming chunk: {e}");
                vec![StreamEvent::Error {
                    reason: format!("parse failure: {e}"),
                    retry_after: None,
                }]
            }
        }
    }
}
