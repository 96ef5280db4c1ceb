//! Stream handling for the Anthropic Messages API.
//!
//! Anthropic streams typed events with a state-machine flow:
//!
//! 1. `message_start` — message metadata and input token usage
//! 2. `content_block_start` — a text or tool_use block begins
//! 3. `content_block_delta` — text or partial-JSON increments
//! 4. `content_block_stop` — the block is complete
//! 5. `message_delta` — stop reason and output token usage
//! 6. `message_stop` — end of stream
//!
//! The processor below reduces that flow to the normalized event
//! alphabet, assembling tool-call arguments until their block closes.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{
    events::{FunctionCall, StreamEvent, Usage},
    provider::StreamProcessor,
    sse::SseEvent,
};

/// Anthropic streaming event, tagged by the `type` field in the data
/// payload. Unknown types map to [`AnthropicStreamEvent::Unknown`] so a
/// new server-side event never kills a stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: AnthropicMessageDeltaData,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicStreamError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessageStart {
    pub id: String,
    #[allow(dead_code)]
    pub model: String,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text {
        #[allow(dead_code)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicBlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessageDeltaData {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Token usage. `input_tokens` may be omitted in `message_delta` events.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicStreamError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Tool call being assembled from `input_json_delta` fragments.
#[derive(Debug)]
struct ToolCallBuilder {
    id: String,
    name: String,
    input: String,
}

/// State machine over one Anthropic stream.
pub struct AnthropicStreamProcessor {
    response_id: Option<String>,
    finish_reason: Option<String>,
    usage: Usage,
    open_calls: HashMap<u32, ToolCallBuilder>,
}

impl AnthropicStreamProcessor {
    pub fn new() -> Self {
        Self {
            response_id: None,
            finish_reason: None,
            usage: Usage::default(),
            open_calls: HashMap::new(),
        }
    }

    fn merge_usage(&mut self, usage: AnthropicUsage) -> StreamEvent {
        if usage.input_tokens > 0 {
            self.usage.prompt_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.usage.completion_tokens = usage.output_tokens;
        }
        self.usage.total_tokens = self.usage.prompt_tokens + self.usage.completion_tokens;

        StreamEvent::Usage(self.usage)
    }

    fn handle(&mut self, event: AnthropicStreamEvent) -> Vec<StreamEvent> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.response_id = Some(message.id);
                vec![self.merge_usage(message.usage)]
            }

            AnthropicStreamEvent::ContentBlockStart { index, content_block } => {
                if let AnthropicContentBlock::ToolUse { id, name } = content_block {
                    self.open_calls.insert(
                        index,
                        ToolCallBuilder {
                            id,
                            name,
                            input: String::new(),
                        },
                    );
                }
                Vec::new()
            }

            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicBlockDelta::TextDelta { text } => vec![StreamEvent::Content(text)],
                AnthropicBlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(call) = self.open_calls.get_mut(&index) {
                        call.input.push_str(&partial_json);
                    }
                    Vec::new()
                }
                AnthropicBlockDelta::Other => Vec::new(),
            },

            AnthropicStreamEvent::ContentBlockStop { index } => {
                let Some(call) = self.open_calls.remove(&index) else {
                    return Vec::new();
                };

                // Tool calls with no arguments close with an empty input
                // buffer; that is a legitimate `{}`.
                let raw = if call.input.is_empty() { "{}" } else { &call.input };

                match sonic_rs::from_str::<Value>(raw) {
                    Ok(parsed) => {
                        let arguments =
                            serde_json::to_string(&parsed).unwrap_or_else(|_| "{}".to_string());
                        vec![StreamEvent::FunctionCall(vec![FunctionCall {
                            id: call.id,
                            name: call.name,
                            arguments,
                        }])]
                    }
                    Err(e) => {
                        log::warn!("Tool call {} assembled non-JSON input: {e}", call.id);
                        vec![
                            StreamEvent::Error {
                                reason: format!("parse failure in tool call {}: {e}", call.id),
                                retry_after: None,
                            },
                            StreamEvent::FunctionCall(vec![FunctionCall {
                                id: call.id,
                                name: call.name,
                                arguments: "{}".to_string(),
                            }]),
                        ]
                    }
                }
            }

            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                self.finish_reason = delta.stop_reason;
                match usage {
                    Some(usage) => vec![self.merge_usage(usage)],
                    None => Vec::new(),
                }
            }

            AnthropicStreamEvent::MessageStop => vec![StreamEvent::Done {
                response_id: self.response_id.take(),
                finish_reason: self.finish_reason.take(),
            }],

            AnthropicStreamEvent::Ping => Vec::new(),

            AnthropicStreamEvent::Error { error } => {
                log::error!("Anthropic stream error: {} - {}", error.error_type, error.message);
                vec![StreamEvent::Error {
                    reason: format!("{}: {}", error.error_type, error.message),
                    retry_after: None,
                }]
            }

            AnthropicStreamEvent::Unknown => Vec::new(),
        }
    }
}

impl Default for AnthropicStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor for AnthropicStreamProcessor {
    fn process(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        match sonic_rs::from_str::<AnthropicStreamEvent>(&event.data) {
            Ok(parsed) => self.handle(parsed),
            Err(e) => {
                log::warn!("Failed to parse Anthropic streaming event ({}): {e}", event.event_type);
                vec![StreamEvent::Error {
                    reason: format!("parse failure: {e}"),
                    retry_after: None,
                }]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, data: &str) -> SseEvent {
        SseEvent {
            event_type: event_type.to_string(),
            data: data.to_string(),
        }
    }

    fn run(events: &[(&str, &str)]) -> Vec<StreamEvent> {
        let mut processor = AnthropicStreamProcessor::new();
        events
            .iter()
            .flat_map(|(event_type, data)| processor.process(event(event_type, data)))
            .collect()
    }

    #[test]
    fn text_stream_emits_usage_content_and_done() {
        let events = run(&[
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet-4-20250514","usage":{"input_tokens":12,"output_tokens":0}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
            ),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ]);

        assert_eq!(events[0], StreamEvent::Usage(Usage { prompt_tokens: 12, completion_tokens: 0, total_tokens: 12 }));
        assert_eq!(events[1], StreamEvent::Content("Hello".into()));
        assert_eq!(events[2], StreamEvent::Content(" there".into()));
        assert_eq!(
            events[3],
            StreamEvent::Usage(Usage { prompt_tokens: 12, completion_tokens: 5, total_tokens: 17 })
        );
        assert_eq!(
            events[4],
            StreamEvent::Done {
                response_id: Some("msg_1".into()),
                finish_reason: Some("end_turn".into()),
            }
        );
    }

    #[test]
    fn tool_use_assembles_arguments_across_deltas() {
        let events = run(&[
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"call_123","name":"run_shell_command"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"comm"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"and\":\"ls -la\"}"}}"#,
            ),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
        ]);

        let StreamEvent::FunctionCall(calls) = &events[0] else {
            panic!("expected function call, got {events:?}");
        };
        assert_eq!(calls[0].id, "call_123");
        assert_eq!(calls[0].name, "run_shell_command");

        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["command"], "ls -la");
    }

    #[test]
    fn empty_tool_input_becomes_empty_object() {
        let events = run(&[
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"noop"}}"#,
            ),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
        ]);

        let StreamEvent::FunctionCall(calls) = &events[0] else {
            panic!("expected function call");
        };
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn malformed_data_yields_error_without_aborting() {
        let mut processor = AnthropicStreamProcessor::new();

        let first = processor.process(event("content_block_delta", "not json"));
        assert!(matches!(first[0], StreamEvent::Error { .. }));

        let next = processor.process(event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        ));
        assert_eq!(next[0], StreamEvent::Content("ok".into()));
    }

    #[test]
    fn ping_and_unknown_events_are_ignored() {
        let events = run(&[
            ("ping", r#"{"type":"ping"}"#),
            ("shiny_new_event", r#"{"type":"shiny_new_event","payload":1}"#),
        ]);

        assert!(events.is_empty());
    }
}
