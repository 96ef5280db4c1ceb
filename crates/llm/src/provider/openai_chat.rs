pub(crate) mod input;
pub(crate) mod output;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use reqwest::Client;
use secrecy::ExposeSecret;
use uuid::Uuid;

use self::output::ChatStreamProcessor;

use crate::{
    events::EventStream,
    http_client::build_client,
    messages::ChatRequest,
    provider::{Provider, drive_stream, send_streaming},
    request::{RequestAuth, RequestEnvelope},
};

pub(crate) struct OpenaiChatProvider {
    client: Client,
    name: String,
    config: ProviderConfig,
}

impl OpenaiChatProvider {
    pub fn new(name: String, config: ProviderConfig) -> crate::Result<Self> {
        let client = build_client("OpenAI Chat")?;
        Ok(Self { client, name, config })
    }

    fn base_url(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| input::DEFAULT_OPENAI_BASE_URL.to_string())
    }
}

#[async_trait]
impl Provider for OpenaiChatProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenaiChat
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
            "Opening Chat Completions stream {stream_id} for model {} ({} messages)",
            request.model,
            request.messages.len()
        );

        let response = send_streaming(&self.client, envelope, "OpenAI Chat").await?;

        Ok(drive_stream(response, ChatStreamProcessor::new()))
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
            return Ok(self.config.default_model.iter().cloned().collect());
        };

        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url()))
            .bearer_auth(api_key.expose_secret())
            .send()
            .await
            .context("failed to request models")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            return Err(anyhow!("models request failed with status {status}: {body}"));
        }

        let api_response: ModelsResponse = response
            .json()
            .await
            .context("failed to deserialize models response")?;

        Ok(api_response.data.into_iter().map(|model| model.id).collect())
    }
}
