//! Stream handling for the OpenAI Chat Completions API.
//!
//! Chat Completions streams plain delta chunks. Tool calls arrive as
//! indexed fragments that accumulate until the `tool_calls` finish
//! reason; with `stream_options.include_usage` the usage rides in a
//! final chunk after the finish reason and before the `[DONE]` sentinel,
//! which is why the terminal `Done` is held until the sentinel (or end
//! of stream) rather than emitted at the finish reason.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{
    events::{FunctionCall, StreamEvent, Usage},
    provider::StreamProcessor,
    sse::SseEvent,
};

#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool-call fragment. The first fragment for an index carries the id
/// and name; later ones only append to `arguments`.
#[derive(Debug, Deserialize)]
pub struct ChunkToolCall {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// State machine over one Chat Completions stream.
pub struct ChatStreamProcessor {
    response_id: Option<String>,
    builders: BTreeMap<usize, ToolCallBuilder>,
    pending_finish: Option<String>,
    done_emitted: bool,
}

impl ChatStreamProcessor {
    pub fn new() -> Self {
        Self {
            response_id: None,
            builders: BTreeMap::new(),
            pending_finish: None,
            done_emitted: false,
        }
    }

    fn emit_done(&mut self) -> StreamEvent {
        self.done_emitted = true;
        StreamEvent::Done {
            response_id: self.response_id.take(),
            finish_reason: self.pending_finish.take(),
        }
    }

    fn drain_tool_calls(&mut self) -> Vec<FunctionCall> {
        std::mem::take(&mut self.builders)
            .into_values()
            .map(|builder| FunctionCall {
                id: builder.id.unwrap_or_default(),
                name: builder.name,
                arguments: if builder.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    builder.arguments
                },
            })
            .collect()
    }

    fn handle(&mut self, chunk: ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if self.response_id.is_none() {
            self.response_id = chunk.id;
        }

        if let Some(usage) = chunk.usage {
            let total = if usage.total_tokens > 0 {
                usage.total_tokens
            } else {
                usage.prompt_tokens + usage.completion_tokens
            };
            events.push(StreamEvent::Usage(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: total,
            }));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            events.push(StreamEvent::Content(content));
        }

        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let builder = self.builders.entry(fragment.index).or_default();

            if let Some(id) = fragment.id
                && builder.id.is_none()
            {
                builder.id = Some(id);
            }

            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    builder.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    builder.arguments.push_str(&arguments);
                }
            }
        }

        match choice.finish_reason.as_deref() {
            Some("tool_calls") => {
                self.pending_finish = Some("tool_calls".to_string());
                let calls = self.drain_tool_calls();
                if !calls.is_empty() {
                    events.push(StreamEvent::FunctionCall(calls));
                }
            }
            Some(reason) => {
                self.pending_finish = Some(reason.to_string());
            }
            None => {}
        }

        events
    }
}

impl Default for ChatStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor for ChatStreamProcessor {
    fn process(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        if event.data.trim() == "[DONE]" {
            if self.done_emitted {
                return Vec::new();
            }
            return vec![self.emit_done()];
        }

        match sonic_rs::from_str::<ChatChunk>(&event.data) {
            Ok(chunk) => self.handle(chunk),
            Err(e) => {
                log::warn!("Failed to parse Chat Completions chunk: {e}");
                vec![StreamEvent::Error {
                    reason: format!("parse failure: {e}"),
                    retry_after: None,
                }]
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        // Stream closed without the sentinel; a recorded finish reason
        // still makes this a complete response.
        if !self.done_emitted && self.pending_finish.is_some() {
            return vec![self.emit_done()];
        }
        Vec::new()
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
        let mut processor = ChatStreamProcessor::new();
        let mut events: Vec<StreamEvent> = datas
            .iter()
            .flat_map(|data| processor.process(event(data)))
            .collect();
        events.extend(processor.finish());
        events
    }

    #[test]
    fn content_deltas_then_usage_then_done() {
        let events = run(&[
            r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"delta":{"content":"lo"},"finish_reason":null}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            "[DONE]",
        ]);

        assert_eq!(events[0], StreamEvent::Content("Hel".into()));
        assert_eq!(events[1], StreamEvent::Content("lo".into()));
        assert_eq!(
            events[2],
            StreamEvent::Usage(Usage { prompt_tokens: 5, completion_tokens: 2, total_tokens: 7 })
        );
        assert_eq!(
            events[3],
            StreamEvent::Done {
                response_id: Some("chatcmpl-1".into()),
                finish_reason: Some("stop".into()),
            }
        );
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn indexed_tool_fragments_aggregate_into_one_event() {
        let events = run(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"first","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"second","arguments":"{}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"x\":1}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);

        let StreamEvent::FunctionCall(calls) = &events[0] else {
            panic!("expected aggregated function call, got {events:?}");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[0].arguments, r#"{"x":1}"#);
        assert_eq!(calls[1].id, "call_b");
        assert_eq!(calls[1].arguments, "{}");

        assert!(matches!(
            &events[1],
            StreamEvent::Done { finish_reason: Some(reason), .. } if reason == "tool_calls"
        ));
    }

    #[test]
    fn missing_sentinel_still_produces_done_after_finish_reason() {
        let events = run(&[r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}]}"#]);

        assert_eq!(events[0], StreamEvent::Content("hi".into()));
        assert!(matches!(events[1], StreamEvent::Done { .. }));
    }
}
