//! The runtime facade: session management and the public turn API.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use auth::oauth::{OauthEngine, PkceParams, TokenSet};
use auth::scheduler::RefreshScheduler;
use auth::store::{CredentialStore, Credentials, SessionKey};
use config::{AuthKind, Config, ProviderKind, TurnOptions};
use futures::Stream;
use llm::events::{EventStream, StreamEvent};
use llm::messages::{ChatRequest, Message};
use llm::provider::Provider;
use llm::request::RequestAuth;
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::TurnError;
use crate::supervisor::{StreamGuard, StreamSupervisor};
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::turn::{AuthSource, TurnRunner};
use crate::TurnResult;

/// How a new session gets its credentials.
pub enum SessionInit {
    /// Register a static API key.
    ApiKey(SecretString),
    /// Complete an OAuth flow with the pasted authorization code and the
    /// PKCE parameters from [`Runtime::authorization_url`].
    OauthCode { code: String, pkce: PkceParams },
}

/// The assembled runtime. Construct once, share by reference.
pub struct Runtime {
    providers: HashMap<String, Box<dyn Provider>>,
    provider_configs: HashMap<String, config::ProviderConfig>,
    turn_options: TurnOptions,
    store: Arc<CredentialStore>,
    oauth: Arc<OauthEngine>,
    scheduler: RefreshScheduler,
    supervisor: StreamSupervisor,
    tools: ToolRegistry,
}

impl Runtime {
    /// Build the runtime from configuration.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let secret = config
            .store
            .secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("store.secret is required (set CADENZA_STORE_SECRET)"))?;

        let store = Arc::new(CredentialStore::open(&config.store.path, &secret)?);
        let oauth = Arc::new(OauthEngine::new(config.oauth.clone(), store.clone()));
        let scheduler = RefreshScheduler::new(oauth.clone());
        let supervisor = StreamSupervisor::new(&config.turn);

        let mut providers = HashMap::new();
        let mut provider_configs = HashMap::new();
        for (name, provider_config) in &config.providers {
            providers.insert(
                name.clone(),
                llm::provider::build(name.clone(), provider_config.clone())?,
            );
            provider_configs.insert(name.clone(), provider_config.clone());
        }

        Ok(Self {
            providers,
            provider_configs,
            turn_options: config.turn,
            store,
            oauth,
            scheduler,
            supervisor,
            tools: ToolRegistry::new(),
        })
    }

    /// Register a tool available to every turn.
    pub fn register_tool(&mut self, tool: llm::messages::Tool, executor: Arc<dyn ToolExecutor>) {
        self.tools.register(tool, executor);
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn provider(&self, name: &str) -> Result<&dyn Provider, TurnError> {
        self.providers
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| TurnError::UnknownProvider(name.to_string()))
    }

    fn provider_kind(&self, name: &str) -> Result<ProviderKind, TurnError> {
        Ok(self.provider(name)?.kind())
    }

    /// Build the authorization URL for an OAuth sign-in.
    pub fn authorization_url(&self, provider: &str) -> Result<(url::Url, PkceParams), TurnError> {
        let kind = self.provider_kind(provider)?;
        Ok(self.oauth.authorization_url(kind)?)
    }

    /// Create (or replace) a session.
    pub async fn create_session(
        &self,
        provider: &str,
        name: &str,
        init: SessionInit,
    ) -> Result<SessionKey, TurnError> {
        let kind = self.provider_kind(provider)?;
        let name = auth::normalize_session_name(name)?;

        match init {
            SessionInit::ApiKey(api_key) => {
                let key = SessionKey::new(kind, AuthKind::ApiKey, name);
                let credentials = Credentials {
                    api_key: Some(api_key),
                    ..Default::default()
                };
                self.store.upsert(key.clone(), credentials, None).await?;
                Ok(key)
            }
            SessionInit::OauthCode { code, pkce } => {
                let tokens = self.oauth.exchange_code(kind, &name, &code, &pkce).await?;
                self.scheduler.schedule(kind, &name, tokens.expires_at);
                Ok(SessionKey::new(kind, AuthKind::Oauth, name))
            }
        }
    }

    /// Delete a session and stop its refresh job.
    pub async fn delete_session(
        &self,
        provider: &str,
        auth_type: AuthKind,
        name: &str,
    ) -> Result<bool, TurnError> {
        let kind = self.provider_kind(provider)?;
        let name = auth::normalize_session_name(name)?;

        if auth_type == AuthKind::Oauth {
            self.scheduler.cancel(kind, &name);
        }

        Ok(self
            .store
            .delete(&SessionKey::new(kind, auth_type, name))
            .await?)
    }

    /// List model ids the provider offers for this session.
    pub async fn list_models(
        &self,
        provider: &str,
        auth_type: AuthKind,
        name: &str,
    ) -> Result<Vec<String>, TurnError> {
        let kind = self.provider_kind(provider)?;
        let name = auth::normalize_session_name(name)?;
        let auth = self.auth_for(provider, kind, Some(auth_type), &name).await?;

        self.provider(provider)?
            .list_models(&auth)
            .await
            .map_err(|e| TurnError::Failed {
                reason: e.to_string(),
                partial: Default::default(),
            })
    }

    /// Refresh a session's OAuth tokens now and reschedule.
    pub async fn refresh_tokens(&self, provider: &str, name: &str) -> Result<TokenSet, TurnError> {
        let kind = self.provider_kind(provider)?;
        let name = auth::normalize_session_name(name)?;

        let tokens = self.oauth.refresh(kind, &name).await?;
        self.scheduler.schedule(kind, &name, tokens.expires_at);
        Ok(tokens)
    }

    /// Cancel the in-flight stream for a session, if any.
    pub fn cancel(&self, provider: &str, name: &str) -> bool {
        let Ok(name) = auth::normalize_session_name(name) else {
            return false;
        };
        self.supervisor.cancel(&session_slot(provider, &name))
    }

    /// Open a single model stream without the tool loop. The stream
    /// holds the session's slot until it is dropped.
    pub async fn stream_chat(
        &self,
        provider: &str,
        name: &str,
        request: ChatRequest,
    ) -> Result<EventStream, TurnError> {
        let kind = self.provider_kind(provider)?;
        let name = auth::normalize_session_name(name)?;
        let auth = self.auth_for(provider, kind, None, &name).await?;

        let guard = self.supervisor.begin(&session_slot(provider, &name))?;
        let stream = self
            .provider(provider)?
            .stream_chat(&request, &auth, Uuid::new_v4())
            .await?;

        let cancelled = guard.token().clone().cancelled_owned();

        Ok(Box::pin(GuardedStream {
            inner: stream,
            cancelled: Box::pin(cancelled),
            stage: GuardedStage::Streaming,
            _guard: guard,
        }))
    }

    /// Run a full agent turn: stream, execute tool calls, resubmit, and
    /// return the final result.
    ///
    /// `opts` overrides the loop bounds (`max_tool_iterations`,
    /// `parallel_tool_calls`); timeouts are runtime-wide.
    pub async fn run_turn(
        &self,
        provider: &str,
        name: &str,
        model: &str,
        messages: Vec<Message>,
        opts: Option<TurnOptions>,
    ) -> Result<TurnResult, TurnError> {
        let kind = self.provider_kind(provider)?;
        let name = auth::normalize_session_name(name)?;
        let options = opts.unwrap_or_else(|| self.turn_options.clone());

        let mut chat = ChatRequest::new(model, messages);
        chat.tools = self.tools.declarations();
        chat.parallel_tool_calls = options.parallel_tool_calls;

        if let Some(provider_config) = self.provider_configs.get(provider) {
            chat.max_tokens = Some(provider_config.max_tokens);
            chat.reasoning_effort = provider_config.reasoning_effort.clone();
        }

        let guard = self.supervisor.begin(&session_slot(provider, &name))?;

        let auth_source = SessionAuthSource {
            runtime: self,
            provider: provider.to_string(),
            kind,
            name: name.clone(),
        };

        let runner = TurnRunner {
            provider: self.provider(provider)?,
            tools: &self.tools,
            max_tool_iterations: options.max_tool_iterations,
            parallel_tool_calls: options.parallel_tool_calls,
        };

        runner.run(chat, &auth_source, &guard).await
    }

    /// Resolve request credentials for a session.
    ///
    /// With an explicit `auth_type` only that record is consulted.
    /// Otherwise: OAuth record (preferring an exchanged API key inside
    /// it), then API-key record, then the provider's configured key.
    async fn auth_for(
        &self,
        provider: &str,
        kind: ProviderKind,
        auth_type: Option<AuthKind>,
        name: &str,
    ) -> Result<RequestAuth, TurnError> {
        let consult_oauth = auth_type.is_none_or(|t| t == AuthKind::Oauth);
        let consult_api_key = auth_type.is_none_or(|t| t == AuthKind::ApiKey);

        if consult_oauth {
            let lookup = self
                .store
                .get(&SessionKey::new(kind, AuthKind::Oauth, name.to_string()))
                .await;

            match lookup {
                Ok(record) if !record.credentials.needs_reauth => {
                    if let Some(api_key) = record.credentials.api_key {
                        return Ok(RequestAuth::ApiKey(api_key));
                    }
                    if let Some(access_token) = record.credentials.access_token {
                        return Ok(RequestAuth::Oauth {
                            access_token,
                            account_id: record.credentials.account_id,
                        });
                    }
                }
                Ok(record) => {
                    log::warn!("Session {} requires re-authorization", record.key);
                }
                Err(_) => {}
            }
        }

        if consult_api_key {
            let lookup = self
                .store
                .get(&SessionKey::new(kind, AuthKind::ApiKey, name.to_string()))
                .await;

            if let Ok(record) = lookup
                && let Some(api_key) = record.credentials.api_key
            {
                return Ok(RequestAuth::ApiKey(api_key));
            }
        }

        if let Some(api_key) = self
            .provider_configs
            .get(provider)
            .and_then(|c| c.api_key.clone())
        {
            return Ok(RequestAuth::ApiKey(api_key));
        }

        Err(TurnError::MissingCredentials {
            provider: provider.to_string(),
            session: name.to_string(),
        })
    }
}

fn session_slot(provider: &str, name: &str) -> String {
    format!("{provider}/{name}")
}

struct SessionAuthSource<'a> {
    runtime: &'a Runtime,
    provider: String,
    kind: ProviderKind,
    name: String,
}

#[async_trait]
impl AuthSource for SessionAuthSource<'_> {
    async fn auth(&self) -> Result<RequestAuth, TurnError> {
        self.runtime
            .auth_for(&self.provider, self.kind, None, &self.name)
            .await
    }

    async fn refresh(&self) -> Result<RequestAuth, TurnError> {
        let tokens = self.runtime.oauth.refresh(self.kind, &self.name).await?;
        self.runtime
            .scheduler
            .schedule(self.kind, &self.name, tokens.expires_at);

        self.auth().await
    }
}

/// A provider stream that keeps the session slot claimed until dropped
/// and reacts to supervisor cancellation: the underlying connection is
/// dropped and the consumer sees a terminal `error` followed by `done`.
struct GuardedStream {
    inner: EventStream,
    cancelled: Pin<Box<tokio_util::sync::WaitForCancellationFutureOwned>>,
    stage: GuardedStage,
    _guard: StreamGuard,
}

enum GuardedStage {
    Streaming,
    CancelErrorEmitted,
    Finished,
}

impl Stream for GuardedStream {
    type Item = llm::Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        use std::future::Future;

        let this = self.get_mut();

        match this.stage {
            GuardedStage::Finished => Poll::Ready(None),
            GuardedStage::CancelErrorEmitted => {
                this.stage = GuardedStage::Finished;
                Poll::Ready(Some(Ok(StreamEvent::done())))
            }
            GuardedStage::Streaming => {
                if this.cancelled.as_mut().poll(cx).is_ready() {
                    // Drop the HTTP stream now; the guard stays for Drop.
                    this.inner = Box::pin(futures::stream::empty());
                    this.stage = GuardedStage::CancelErrorEmitted;
                    return Poll::Ready(Some(Ok(StreamEvent::Error {
                        reason: "cancelled".to_string(),
                        retry_after: None,
                    })));
                }

                match this.inner.as_mut().poll_next(cx) {
                    Poll::Ready(None) => {
                        this.stage = GuardedStage::Finished;
                        Poll::Ready(None)
                    }
                    other => other,
                }
            }
        }
    }
}
