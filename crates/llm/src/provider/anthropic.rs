pub(crate) mod input;
pub(crate) mod output;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use reqwest::Client;
use secrecy::ExposeSecret;
use uuid::Uuid;

use self::output::AnthropicStreamProcessor;

pub use self::input::{CLAUDE_CODE_SYSTEM, INTERRUPTED_TOOL_RESULT, TOOL_PRIMER, TOOL_PRIMER_ACK};

use crate::{
    events::EventStream,
    http_client::build_client,
    messages::ChatRequest,
    provider::{Provider, drive_stream, send_streaming},
    request::{RequestAuth, RequestEnvelope},
};

pub(crate) struct AnthropicProvider {
    client: Client,
    name: String,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(name: String, config: ProviderConfig) -> crate::Result<Self> {
        let client = build_client("Anthropic")?;
        Ok(Self { client, name, config })
    }

    fn base_url(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| input::DEFAULT_ANTHROPIC_API_URL.to_string())
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn translate(
        &self,
        request: &ChatRequest,
        auth: &RequestAuth,
        _stream_id: Uuid,
    ) -> crate::Result<RequestEnvelope> {
        input::build(request, auth, &self.config)
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        auth: &RequestAuth,
        stream_id: Uuid,
    ) -> crate::Result<EventStream> {
        let envelope = self.translate(request, auth, stream_id)?;

        log::debug!(
            "Opening Anthropic stream {stream_id} for model {} ({} messages)",
            request.model,
            request.messages.len()
        );

        let response = send_streaming(&self.client, envelope, "Anthropic").await?;

        Ok(drive_stream(response, AnthropicStreamProcessor::new()))
    }

    async fn list_models(&self, auth: &RequestAuth) -> anyhow::Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct ModelsResponse {
            data: Vec<ApiModel>,
        }

        #[derive(serde::Deserialize)]
        struct ApiModel {
            id: String,
        }

        let RequestAuth::ApiKey(api_key) = auth else {
            // The OAuth surface has no models endpoint; fall back to the
            // configured default.
            return Ok(self.config.default_model.iter().cloned().collect());
        };

        let response = self
            .client
            .get(format!("{}/models", self.base_url()))
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", input::ANTHROPIC_VERSION)
            .send()
            .await
            .context("failed to request Anthropic models")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            return Err(anyhow!("Anthropic models request failed with status {status}: {body}"));
        }

        let api_response: ModelsResponse = response
            .json()
            .await
            .context("failed to deserialize Anthropic models response")?;

        Ok(api_response.data.into_iter().map(|model| model.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::messages::{Message, Role};
    use axum::{
        Router,
        response::sse::{Event, Sse},
        routing::post,
    };
    use futures::StreamExt;
    use secrecy::SecretString;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    async fn serve_canned_stream(events: Vec<(&'static str, &'static str)>) -> String {
        let app = Router::new().route(
            "/v1/messages",
            post(move || async move {
                let stream = futures::stream::iter(events.into_iter().map(|(event_type, data)| {
                    Ok::<_, Infallible>(Event::default().event(event_type).data(data))
                }));
                Sse::new(stream)
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{address}/v1")
    }

    #[tokio::test]
    async fn streams_text_and_terminates_with_done() {
        let base_url = serve_canned_stream(vec![
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_a","model":"m","usage":{"input_tokens":3,"output_tokens":0}}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":1}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ])
        .await;

        let mut config = ProviderConfig::new(ProviderKind::Anthropic);
        config.base_url = Some(base_url);

        let provider = AnthropicProvider::new("anthropic".to_string(), config).unwrap();
        let request = ChatRequest::new("claude-sonnet-4-20250514", vec![Message::text(Role::User, "hi")]);
        let auth = RequestAuth::ApiKey(SecretString::from("k"));

        let stream = provider
            .stream_chat(&request, &auth, Uuid::new_v4())
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.map(|item| item.unwrap()).collect().await;

        assert!(matches!(events[0], StreamEvent::Usage(_)));
        assert_eq!(events[1], StreamEvent::Content("hi".into()));
        assert!(matches!(events.last().unwrap(), StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn stream_without_message_stop_reports_truncation() {
        let base_url = serve_canned_stream(vec![(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}"#,
        )])
        .await;

        let mut config = ProviderConfig::new(ProviderKind::Anthropic);
        config.base_url = Some(base_url);

        let provider = AnthropicProvider::new("anthropic".to_string(), config).unwrap();
        let request = ChatRequest::new("claude-sonnet-4-20250514", vec![Message::text(Role::User, "hi")]);
        let auth = RequestAuth::ApiKey(SecretString::from("k"));

        let stream = provider
            .stream_chat(&request, &auth, Uuid::new_v4())
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(events[0], StreamEvent::Content("partial".into()));
        assert!(matches!(events[1], StreamEvent::Error { .. }));
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }
}
