//! Provider implementations.
//!
//! Each submodule owns one wire protocol: a pure `input` half building
//! the request envelope from the canonical chat, and an `output` half
//! turning framed SSE events into normalized [`StreamEvent`]s via a
//! per-stream processor state machine. The module root here provides the
//! [`Provider`] capability trait, the shared HTTP send path, and the
//! driver that runs framer → processor → event stream.

pub mod anthropic;
pub mod google;
pub mod openai_chat;
pub mod openai_responses;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use futures::StreamExt;
use uuid::Uuid;

use crate::{
    events::{EventStream, StreamEvent},
    messages::ChatRequest,
    request::{RequestAuth, RequestEnvelope},
    sse::{SseEvent, SseStreamExt},
};

/// A provider capability: pure translation plus streaming dispatch.
///
/// Selected by [`ProviderKind`] at runtime; the fixed member set replaces
/// any reflection-style lookup.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which wire protocol this provider speaks.
    fn kind(&self) -> ProviderKind;

    /// Configured provider name (for logs and model prefixes).
    fn name(&self) -> &str;

    /// Pure translation: canonical chat → request envelope.
    ///
    /// `stream_id` correlates the request across retries and shows up in
    /// provider-side headers where the protocol wants one; passing it in
    /// keeps translation deterministic.
    fn translate(
        &self,
        request: &ChatRequest,
        auth: &RequestAuth,
        stream_id: Uuid,
    ) -> crate::Result<RequestEnvelope>;

    /// Open the streaming request and return normalized events.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        auth: &RequestAuth,
        stream_id: Uuid,
    ) -> crate::Result<EventStream>;

    /// List model identifiers this provider will accept.
    async fn list_models(&self, auth: &RequestAuth) -> anyhow::Result<Vec<String>>;
}

/// Construct the provider implementation for a descriptor.
pub fn build(name: String, config: ProviderConfig) -> crate::Result<Box<dyn Provider>> {
    Ok(match config.r#type {
        ProviderKind::OpenaiResponses => {
            Box::new(openai_responses::OpenaiResponsesProvider::new(name, config)?)
        }
        ProviderKind::OpenaiChat => Box::new(openai_chat::OpenaiChatProvider::new(name, config)?),
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicProvider::new(name, config)?),
        ProviderKind::Google => Box::new(google::GoogleProvider::new(name, config)?),
    })
}

/// Send an envelope and fail on non-success statuses with the shared
/// error mapping. Success leaves the response body unread so the caller
/// can stream it.
pub(crate) async fn send_streaming(
    client: &reqwest::Client,
    envelope: RequestEnvelope,
    provider: &str,
) -> crate::Result<reqwest::Response> {
    let mut builder = client.request(envelope.method, &envelope.url);

    for (name, value) in &envelope.headers {
        builder = builder.header(name, value);
    }

    let response = builder.body(envelope.body).send().await.map_err(|e| {
        crate::LlmError::ConnectionError(format!("Failed to send request to {provider}: {e}"))
    })?;

    let status = response.status();

    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        log::error!("{provider} API error ({status}): {error_text}");

        return Err(crate::LlmError::from_status(status.as_u16(), error_text, retry_after));
    }

    Ok(response)
}

/// `Retry-After` in seconds; HTTP-date forms are ignored.
pub(crate) fn parse_retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// A per-stream state machine reducing framed SSE events to normalized
/// events. One instance lives for exactly one request.
pub(crate) trait StreamProcessor: Send {
    /// Handle one framed event; may produce zero or more outputs.
    fn process(&mut self, event: SseEvent) -> Vec<StreamEvent>;

    /// The upstream closed; flush whatever is still buffered. The driver
    /// appends the truncation error and terminal `Done` itself when the
    /// processor never produced one.
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// Run framer → processor over a response body and yield normalized
/// events with the terminal guarantees applied: `Done` is always last,
/// and a stream that ends without one gets a truncation error first.
pub(crate) fn drive_stream<P>(response: reqwest::Response, processor: P) -> EventStream
where
    P: StreamProcessor + 'static,
{
    struct DriverState<S, P> {
        stream: S,
        processor: P,
        pending: VecDeque<StreamEvent>,
        saw_done: bool,
        upstream_closed: bool,
    }

    let sse_stream = response.bytes_stream().sse_events();

    let state = DriverState {
        stream: Box::pin(sse_stream),
        processor,
        pending: VecDeque::new(),
        saw_done: false,
        upstream_closed: false,
    };

    let events = futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                if matches!(event, StreamEvent::Done { .. }) {
                    state.saw_done = true;
                    state.upstream_closed = true;
                }
                return Some((Ok::<_, crate::LlmError>(event), state));
            }

            if state.upstream_closed {
                return None;
            }

            match state.stream.next().await {
                Some(Ok(sse_event)) => {
                    state.pending.extend(state.processor.process(sse_event));
                }
                Some(Err(e)) => {
                    log::warn!("Transport error mid-stream: {e}");
                    state.pending.push_back(StreamEvent::Error {
                        reason: e.to_string(),
                        retry_after: None,
                    });
                    state.pending.push_back(StreamEvent::done());
                }
                None => {
                    state.upstream_closed = true;
                    state.pending.extend(state.processor.finish());

                    let flushed_done = state
                        .pending
                        .iter()
                        .any(|event| matches!(event, StreamEvent::Done { .. }));

                    if !state.saw_done && !flushed_done {
                        state.pending.push_back(StreamEvent::Error {
                            reason: crate::LlmError::TruncatedStream.to_string(),
                            retry_after: None,
                        });
                        state.pending.push_back(StreamEvent::done());
                    }

                    if state.pending.is_empty() {
                        return None;
                    }
                }
            }
        }
    });

    Box::pin(events)
}
