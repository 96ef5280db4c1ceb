pub(crate) mod input;
pub(crate) mod output;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use reqwest::Client;
use secrecy::ExposeSecret;
use uuid::Uuid;

use self::output::ResponsesStreamProcessor;

use crate::{
    events::EventStream,
    http_client::build_client,
    messages::ChatRequest,
    provider::{Provider, drive_stream, send_streaming},
    request::{RequestAuth, RequestEnvelope},
};

pub(crate) struct OpenaiResponsesProvider {
    client: Client,
    name: String,
    config: ProviderConfig,
}

impl OpenaiResponsesProvider {
    pub fn new(name: String, config: ProviderConfig) -> crate::Result<Self> {
        let client = build_client("OpenAI Responses")?;
        Ok(Self { client, name, config })
    }

    fn base_url(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| input::DEFAULT_OPENAI_API_URL.to_string())
    }
}

#[async_trait]
impl Provider for OpenaiResponsesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenaiResponses
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn translate(
        &self,
        request: &ChatRequest,
        auth: &RequestAuth,
        stream_id: Uuid,
    ) -> crate::Result<RequestEnvelope> {
        input::build(request, auth, &self.config, stream_id)
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        auth: &RequestAuth,
        stream_id: Uuid,
    ) -> crate::Result<EventStream> {
        let envelope = self.translate(request, auth, stream_id)?;

        log::debug!(
            "Opening Responses stream {stream_id} for model {} ({} messages)",
            request.model,
            request.messages.len()
        );

        let response = send_streaming(&self.client, envelope, "OpenAI Responses").await?;

        Ok(drive_stream(response, ResponsesStreamProcessor::new()))
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
            // No models endpoint behind the ChatGPT backend.
            return Ok(self.config.default_model.iter().cloned().collect());
        };

        let response = self
            .client
            .get(format!("{}/models", self.base_url()))
            .bearer_auth(api_key.expose_secret())
            .send()
            .await
            .context("failed to request OpenAI models")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            return Err(anyhow!("OpenAI models request failed with status {status}: {body}"));
        }

        let api_response: ModelsResponse = response
            .json()
            .await
            .context("failed to deserialize OpenAI models response")?;

        Ok(api_response.data.into_iter().map(|model| model.id).collect())
    }
}
