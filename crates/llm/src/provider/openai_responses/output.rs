//! Stream handling for the OpenAI Responses API.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{
    events::{FunctionCall, StreamEvent, Usage},
    provider::StreamProcessor,
    sse::SseEvent,
};

/// Responses API stream event, tagged by the `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesStreamEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },

    /// Older models emit message content under this name.
    #[serde(rename = "response.message_content.delta")]
    MessageContentDelta { delta: String },

    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta { delta: String },

    #[serde(rename = "response.reasoning_text.delta")]
    ReasoningTextDelta { delta: String },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: ResponseItem },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ResponseItem },

    #[serde(rename = "response.completed")]
    Completed { response: ResponseEnvelope },

    #[serde(rename = "response.failed")]
    Failed { response: FailedResponse },

    #[serde(other)]
    Unknown,
}

/// An output item as carried by `output_item.added` / `.done`.
#[derive(Debug, Deserialize)]
pub struct ResponseItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct FailedResponse {
    #[serde(default)]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub message: Option<String>,
    /// Seconds until a retry is worth attempting, when the API says so.
    #[serde(default)]
    pub retry_after: Option<u64>,
}

/// Function call being assembled across argument deltas, keyed by the
/// output item id.
#[derive(Debug)]
struct OpenCall {
    call_id: String,
    name: String,
    arguments: String,
}

/// Some models wrap their whole answer in a reasoning JSON object
/// (`{"reasoning": …, "answer": …}`) streamed through ordinary text
/// deltas. The detector buffers text that looks like such an object and
/// rewrites it into a `Thinking:` preamble plus the answer; anything
/// provably not that shape is passed through unchanged.
#[derive(Debug)]
enum ReasoningDetector {
    /// No text seen yet.
    Start,
    /// Buffering a candidate JSON object.
    Buffering(String),
    /// Plain text; everything passes straight through.
    Passthrough,
}

/// Buffer cap before giving up on the JSON hypothesis.
const DETECTOR_LIMIT: usize = 4096;

impl ReasoningDetector {
    fn push(&mut self, delta: String) -> Vec<StreamEvent> {
        match self {
            Self::Passthrough => vec![StreamEvent::Content(delta)],

            Self::Start => {
                if delta.trim_start().starts_with('{') {
                    *self = Self::Buffering(delta);
                    self.try_resolve(false)
                } else if delta.trim().is_empty() {
                    // Leading whitespace decides nothing yet.
                    vec![StreamEvent::Content(delta)]
                } else {
                    *self = Self::Passthrough;
                    vec![StreamEvent::Content(delta)]
                }
            }

            Self::Buffering(buffer) => {
                buffer.push_str(&delta);
                self.try_resolve(false)
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.try_resolve(true)
    }

    fn try_resolve(&mut self, at_end: bool) -> Vec<StreamEvent> {
        let Self::Buffering(buffer) = self else {
            return Vec::new();
        };

        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(buffer) {
            if let Some(reasoning) = object.get("reasoning").and_then(Value::as_str) {
                let mut events = vec![StreamEvent::Content(format!("Thinking: {reasoning}\n\n"))];

                let answer = ["answer", "response", "next_speaker"]
                    .iter()
                    .find_map(|key| object.get(*key).and_then(Value::as_str));

                if let Some(answer) = answer {
                    events.push(StreamEvent::Content(answer.to_string()));
                }

                *self = Self::Passthrough;
                return events;
            }

            // Complete JSON without a reasoning field: not ours.
            let flushed = std::mem::take(buffer);
            *self = Self::Passthrough;
            return vec![StreamEvent::Content(flushed)];
        }

        let hopeless = at_end
            || buffer.len() > DETECTOR_LIMIT
            || (buffer.len() > 64 && !buffer.contains("\"reasoning\""));

        if hopeless {
            let flushed = std::mem::take(buffer);
            *self = Self::Passthrough;
            if flushed.is_empty() {
                return Vec::new();
            }
            return vec![StreamEvent::Content(flushed)];
        }

        Vec::new()
    }
}

/// State machine over one Responses stream.
pub struct ResponsesStreamProcessor {
    open_calls: HashMap<String, OpenCall>,
    detector: ReasoningDetector,
}

impl ResponsesStreamProcessor {
    pub fn new() -> Self {
        Self {
            open_calls: HashMap::new(),
            detector: ReasoningDetector::Start,
        }
    }

    fn handle(&mut self, event: ResponsesStreamEvent) -> Vec<StreamEvent> {
        match event {
            ResponsesStreamEvent::OutputTextDelta { delta }
            | ResponsesStreamEvent::MessageContentDelta { delta } => self.detector.push(delta),

            ResponsesStreamEvent::ReasoningSummaryTextDelta { delta }
            | ResponsesStreamEvent::ReasoningTextDelta { delta } => {
                vec![StreamEvent::Thought(delta)]
            }

            ResponsesStreamEvent::OutputItemAdded { item } => {
                if item.item_type == "function_call" {
                    let key = item.id.clone().or_else(|| item.call_id.clone());
                    if let (Some(key), Some(call_id)) = (key, item.call_id) {
                        self.open_calls.insert(
                            key,
                            OpenCall {
                                call_id,
                                name: item.name.unwrap_or_default(),
                                arguments: item.arguments.unwrap_or_default(),
                            },
                        );
                    } else {
                        log::warn!("function_call item without ids; dropping");
                    }
                }
                Vec::new()
            }

            ResponsesStreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                match item_id.and_then(|id| self.open_calls.get_mut(&id)) {
                    Some(call) => call.arguments.push_str(&delta),
                    None => log::debug!("arguments delta for unknown item; ignoring"),
                }
                Vec::new()
            }

            ResponsesStreamEvent::OutputItemDone { item } => {
                if item.item_type != "function_call" {
                    return Vec::new();
                }

                let key = item.id.clone().or_else(|| item.call_id.clone());
                let assembled = key.and_then(|k| self.open_calls.remove(&k));

                let call_id = item
                    .call_id
                    .or_else(|| assembled.as_ref().map(|c| c.call_id.clone()));
                let Some(call_id) = call_id else {
                    log::warn!("completed function_call without call_id; dropping");
                    return Vec::new();
                };

                // The done item carries the authoritative arguments; fall
                // back to whatever the deltas assembled.
                let arguments = item
                    .arguments
                    .filter(|a| !a.is_empty())
                    .or_else(|| assembled.as_ref().map(|c| c.arguments.clone()))
                    .unwrap_or_default();
                let arguments = if arguments.is_empty() { "{}".to_string() } else { arguments };

                let name = item
                    .name
                    .or_else(|| assembled.map(|c| c.name))
                    .unwrap_or_default();

                vec![StreamEvent::FunctionCall(vec![FunctionCall {
                    id: call_id,
                    name,
                    arguments,
                }])]
            }

            ResponsesStreamEvent::Completed { response } => {
                let mut events = Vec::new();

                if let Some(usage) = response.usage {
                    let total = if usage.total_tokens > 0 {
                        usage.total_tokens
                    } else {
                        usage.input_tokens + usage.output_tokens
                    };
                    events.push(StreamEvent::Usage(Usage {
                        prompt_tokens: usage.input_tokens,
                        completion_tokens: usage.output_tokens,
                        total_tokens: total,
                    }));
                }

                events.push(StreamEvent::Done {
                    response_id: response.id,
                    finish_reason: None,
                });
                events
            }

            ResponsesStreamEvent::Failed { response } => {
                let (reason, retry_after) = match response.error {
                    Some(error) => (
                        error.message.unwrap_or_else(|| "response failed".to_string()),
                        error.retry_after.map(std::time::Duration::from_secs),
                    ),
                    None => ("response failed".to_string(), None),
                };

                log::error!("Responses stream failed: {reason}");

                vec![
                    StreamEvent::Error { reason, retry_after },
                    StreamEvent::done(),
                ]
            }

            ResponsesStreamEvent::Unknown => Vec::new(),
        }
    }
}

impl Default for ResponsesStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor for ResponsesStreamProcessor {
    fn process(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        // The terminator is data-only on this API.
        if event.data.trim() == "[DONE]" {
            return Vec::new();
        }

        match sonic_rs::from_str::<ResponsesStreamEvent>(&event.data) {
            Ok(parsed) => self.handle(parsed),
            Err(e) => {
                log::warn!("Failed to parse Responses streaming event ({}): {e}", event.event_type);
                vec![StreamEvent::Error {
                    reason: format!("parse failure: {e}"),
                    retry_after: None,
                }]
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.detector.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: "message".to_string(),
            data: data.to_string(),
        }
    }

    fn run(datas: &[&str]) -> Vec<StreamEvent> {
        let mut processor = ResponsesStreamProcessor::new();
        let mut events: Vec<StreamEvent> = datas
            .iter()
            .flat_map(|data| processor.process(event(data)))
            .collect();
        events.extend(processor.finish());
        events
    }

    #[test]
    fn text_deltas_flow_through_as_content() {
        let events = run(&[
            r#"{"type":"response.output_text.delta","delta":"Hello "}"#,
            r#"{"type":"response.output_text.delta","delta":"world"}"#,
            r#"{"type":"response.completed","response":{"id":"resp_1","usage":{"input_tokens":4,"output_tokens":2,"total_tokens":6}}}"#,
        ]);

        assert_eq!(events[0], StreamEvent::Content("Hello ".into()));
        assert_eq!(events[1], StreamEvent::Content("world".into()));
        assert_eq!(
            events[2],
            StreamEvent::Usage(Usage { prompt_tokens: 4, completion_tokens: 2, total_tokens: 6 })
        );
        assert_eq!(
            events[3],
            StreamEvent::Done { response_id: Some("resp_1".into()), finish_reason: None }
        );
    }

    #[test]
    fn reasoning_deltas_are_thoughts() {
        let events = run(&[r#"{"type":"response.reasoning_summary_text.delta","delta":"hmm"}"#]);
        assert_eq!(events[0], StreamEvent::Thought("hmm".into()));
    }

    #[test]
    fn function_call_assembles_arguments_from_deltas() {
        let events = run(&[
            r#"{"type":"response.output_item.added","item":{"type":"function_call","id":"item_1","call_id":"call_123","name":"run_shell_command","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","item_id":"item_1","delta":"{\"command\":"}"#,
            r#"{"type":"response.function_call_arguments.delta","item_id":"item_1","delta":"\"ls -la\"}"}"#,
            r#"{"type":"response.output_item.done","item":{"type":"function_call","id":"item_1","call_id":"call_123","name":"run_shell_command"}}"#,
        ]);

        let StreamEvent::FunctionCall(calls) = &events[0] else {
            panic!("expected function call, got {events:?}");
        };
        assert_eq!(calls[0].id, "call_123");
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["command"], "ls -la");
    }

    #[test]
    fn reasoning_json_is_rewritten_into_thinking_preamble() {
        let events = run(&[
            r#"{"type":"response.output_text.delta","delta":"{\"reasoning\":\"check the dir\","}"#,
            r#"{"type":"response.output_text.delta","delta":"\"answer\":\"It is empty.\"}"}"#,
        ]);

        assert_eq!(
            events[0],
            StreamEvent::Content("Thinking: check the dir\n\n".into())
        );
        assert_eq!(events[1], StreamEvent::Content("It is empty.".into()));
    }

    #[test]
    fn non_json_text_is_not_withheld_forever() {
        let long = "x".repeat(100);
        let events = run(&[&format!(
            r#"{{"type":"response.output_text.delta","delta":"{{{long}"}}"#
        )]);

        // Flushed raw once the JSON hypothesis dies.
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Content(text) if text.starts_with('{')));
    }

    #[test]
    fn failed_response_emits_error_then_done() {
        let events = run(&[
            r#"{"type":"response.failed","response":{"error":{"message":"overloaded","retry_after":3}}}"#,
        ]);

        assert_eq!(
            events[0],
            StreamEvent::Error {
                reason: "overloaded".into(),
                retry_after: Some(std::time::Duration::from_secs(3)),
            }
        );
        assert!(matches!(events[1], StreamEvent::Done { .. }));
    }
}
