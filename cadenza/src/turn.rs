//! The agent turn loop.
//!
//! One turn = one or more request/stream/tool-execution cycles against a
//! single provider, ending when the model produces terminal output with
//! no pending tool calls. The loop owns the accumulators (text, tool
//! calls, usage); handler state lives inside the provider stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use llm::events::{EventStream, FunctionCall, StreamEvent, Usage};
use llm::messages::{ChatRequest, ContentBlock, Message, Role};
use llm::provider::Provider;
use llm::request::RequestAuth;
use uuid::Uuid;

use crate::error::{Partial, TurnError};
use crate::supervisor::StreamGuard;
use crate::tools::{DispatchOutcome, ToolRegistry};
use crate::{ToolInvocation, TurnResult};

/// Where the loop gets (and refreshes) its credentials.
///
/// The 401-retry path needs a way to swap tokens mid-turn without the
/// loop knowing about stores or OAuth grants.
#[async_trait]
pub trait AuthSource: Send + Sync {
    /// Current credentials for the session.
    async fn auth(&self) -> Result<RequestAuth, TurnError>;

    /// Force a refresh and return the rotated credentials.
    async fn refresh(&self) -> Result<RequestAuth, TurnError>;
}

/// Total attempts (first try included) against a rate-limiting provider.
const RATE_LIMIT_ATTEMPTS: u32 = 5;

/// Runs turns against one provider with one tool registry.
pub struct TurnRunner<'a> {
    pub provider: &'a dyn Provider,
    pub tools: &'a ToolRegistry,
    pub max_tool_iterations: u32,
    pub parallel_tool_calls: bool,
}

/// What one stream cycle produced.
#[derive(Default)]
struct CycleOutcome {
    text: String,
    calls: Vec<FunctionCall>,
    usage: Option<Usage>,
    /// Set when the stream's terminal `Done` directly followed an
    /// `Error` event (provider failure or truncation).
    fatal_error: Option<String>,
}

impl TurnRunner<'_> {
    /// Drive the turn to completion.
    pub async fn run(
        &self,
        mut chat: ChatRequest,
        auth_source: &dyn AuthSource,
        guard: &StreamGuard,
    ) -> Result<TurnResult, TurnError> {
        let thread_id = Uuid::new_v4();
        let deadline = tokio::time::Instant::now() + guard.turn_timeout();

        let mut text = String::new();
        let mut tools_used: Vec<ToolInvocation> = Vec::new();
        let mut usage = Usage::default();

        for iteration in 0..self.max_tool_iterations {
            let stream_id = Uuid::new_v4();

            let stream = match self
                .open_with_retry(&chat, auth_source, stream_id, guard, deadline)
                .await
            {
                Ok(stream) => stream,
                Err(e) => return Err(fail_with_partial(e, &text, &tools_used)),
            };

            let cycle = match self.drain(stream, guard, deadline).await {
                Ok(cycle) => cycle,
                Err(e) => return Err(fail_with_partial(e, &text, &tools_used)),
            };

            if let Some(cycle_usage) = cycle.usage {
                usage.add(cycle_usage);
            }
            text.push_str(&cycle.text);

            if let Some(reason) = cycle.fatal_error {
                return Err(TurnError::Failed {
                    reason,
                    partial: Partial { text, tools_used },
                });
            }

            if cycle.calls.is_empty() {
                log::debug!("Turn {thread_id} finished after {} cycle(s)", iteration + 1);
                return Ok(TurnResult {
                    final_text: text,
                    tools_used,
                    usage,
                    thread_id,
                    stream_id,
                });
            }

            for call in &cycle.calls {
                tools_used.push(ToolInvocation {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
            }

            let outcomes = self.execute_calls(&cycle.calls).await;
            append_follow_up(&mut chat, &cycle.text, &cycle.calls, outcomes);

            log::debug!(
                "Turn {thread_id}: cycle {} ran {} tool call(s)",
                iteration + 1,
                cycle.calls.len()
            );
        }

        Err(TurnError::Failed {
            reason: format!("max_tool_iterations ({}) exceeded", self.max_tool_iterations),
            partial: Partial { text, tools_used },
        })
    }

    async fn execute_calls(&self, calls: &[FunctionCall]) -> Vec<DispatchOutcome> {
        if self.parallel_tool_calls {
            futures::future::join_all(calls.iter().map(|call| self.tools.dispatch(call))).await
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.tools.dispatch(call).await);
            }
            outcomes
        }
    }

    /// Open the stream, with one refresh-then-retry on auth failures
    /// (OAuth only) and bounded backoff on rate limits.
    async fn open_with_retry(
        &self,
        chat: &ChatRequest,
        auth_source: &dyn AuthSource,
        stream_id: Uuid,
        guard: &StreamGuard,
        deadline: tokio::time::Instant,
    ) -> Result<EventStream, TurnError> {
        let mut auth = auth_source.auth().await?;
        let mut refreshed = false;
        let mut attempts = 1u32;
        let mut backoff = Duration::from_secs(1);

        loop {
            if guard.token().is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            match self.provider.stream_chat(chat, &auth, stream_id).await {
                Ok(stream) => return Ok(stream),

                Err(e) if e.is_auth_failure() && auth.is_oauth() && !refreshed => {
                    log::warn!("Provider rejected the token; attempting a refresh: {e}");
                    refreshed = true;
                    auth = auth_source.refresh().await?;
                }

                Err(e) if e.is_rate_limited() && attempts < RATE_LIMIT_ATTEMPTS => {
                    let wait = e.retry_after().unwrap_or(backoff);
                    log::warn!(
                        "Rate limited (attempt {attempts}/{RATE_LIMIT_ATTEMPTS}); retrying in {wait:?}"
                    );
                    attempts += 1;
                    backoff = backoff.saturating_mul(2);

                    tokio::select! {
                        biased;
                        _ = guard.token().cancelled() => return Err(TurnError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Err(TurnError::Timeout),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }

                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drain one stream into a cycle outcome, honoring cancellation and
    /// both timeout budgets.
    async fn drain(
        &self,
        mut stream: EventStream,
        guard: &StreamGuard,
        deadline: tokio::time::Instant,
    ) -> Result<CycleOutcome, TurnError> {
        let mut outcome = CycleOutcome::default();
        let mut pending: Vec<FunctionCall> = Vec::new();
        let mut error_pending: Option<String> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = guard.token().cancelled() => return Err(TurnError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(TurnError::Timeout),
                next = tokio::time::timeout(guard.idle_timeout(), stream.next()) => next,
            };

            let item = match next {
                Err(_elapsed) => {
                    return Err(TurnError::Llm(llm::LlmError::IdleTimeout(guard.idle_timeout())));
                }
                Ok(None) => break,
                Ok(Some(item)) => item,
            };

            match item? {
                StreamEvent::Content(delta) => {
                    error_pending = None;
                    outcome.text.push_str(&delta);
                }
                StreamEvent::Thought(_) => {
                    // Exposed on stream_chat; the turn result carries
                    // only final text.
                    error_pending = None;
                }
                StreamEvent::FunctionCall(calls) => {
                    error_pending = None;
                    merge_calls(&mut pending, calls);
                }
                StreamEvent::Usage(usage) => {
                    error_pending = None;
                    outcome.usage = Some(usage);
                }
                StreamEvent::Error { reason, .. } => {
                    log::warn!("In-stream error: {reason}");
                    error_pending = Some(reason);
                }
                StreamEvent::Done { .. } => {
                    outcome.fatal_error = error_pending.take();
                    outcome.calls = pending;
                    return Ok(outcome);
                }
            }
        }

        // Handlers always terminate with Done; a bare end means the
        // transport vanished between events.
        Err(TurnError::Llm(llm::LlmError::TruncatedStream))
    }
}

/// Deduplicate by call id, keeping the first non-empty arguments.
fn merge_calls(pending: &mut Vec<FunctionCall>, incoming: Vec<FunctionCall>) {
    for call in incoming {
        match pending.iter_mut().find(|existing| existing.id == call.id) {
            Some(existing) => {
                if existing.arguments.trim().is_empty() && !call.arguments.trim().is_empty() {
                    *existing = call;
                } else {
                    log::debug!("Dropping duplicate tool call id {}", call.id);
                }
            }
            None => pending.push(call),
        }
    }
}

/// Append the canonical follow-up: the assistant turn that made the
/// calls, then a tool turn with the results. The translators render
/// these into each provider's follow-up encoding.
fn append_follow_up(
    chat: &mut ChatRequest,
    cycle_text: &str,
    calls: &[FunctionCall],
    outcomes: Vec<DispatchOutcome>,
) {
    let mut assistant_blocks = Vec::with_capacity(calls.len() + 1);
    if !cycle_text.is_empty() {
        assistant_blocks.push(ContentBlock::Text {
            text: cycle_text.to_string(),
        });
    }
    for call in calls {
        assistant_blocks.push(ContentBlock::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
    }
    chat.messages.push(Message {
        role: Role::Assistant,
        content: assistant_blocks,
    });

    let mut tool_blocks = Vec::with_capacity(outcomes.len());
    for (call, outcome) in calls.iter().zip(outcomes) {
        tool_blocks.push(ContentBlock::ToolResult {
            tool_call_id: call.id.clone(),
            output: outcome.content,
        });
        if let Some(inline) = outcome.inline_data {
            tool_blocks.push(ContentBlock::ImageInline {
                media_type: inline.media_type,
                data: inline.base64_data,
            });
        }
    }
    chat.messages.push(Message {
        role: Role::Tool,
        content: tool_blocks,
    });
}

fn fail_with_partial(err: TurnError, text: &str, tools_used: &[ToolInvocation]) -> TurnError {
    match err {
        TurnError::Cancelled => TurnError::Cancelled,
        err if text.is_empty() && tools_used.is_empty() => err,
        err => TurnError::Failed {
            reason: err.to_string(),
            partial: Partial {
                text: text.to_string(),
                tools_used: tools_used.to_vec(),
            },
        },
    }
}
