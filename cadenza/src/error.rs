use thiserror::Error;

use crate::ToolInvocation;

/// What a failed turn managed to produce before it died.
#[derive(Debug, Clone, Default)]
pub struct Partial {
    pub text: String,
    pub tools_used: Vec<ToolInvocation>,
}

/// Turn-level errors surfaced by the runtime facade.
#[derive(Debug, Error)]
pub enum TurnError {
    /// No provider with that name is configured.
    #[error("Provider '{0}' is not configured")]
    UnknownProvider(String),

    /// No credentials could be resolved for the session.
    #[error("No credentials for session '{session}' on provider '{provider}'")]
    MissingCredentials { provider: String, session: String },

    /// Another stream is already running for this session.
    #[error("A stream is already in progress for session '{0}'")]
    StreamInProgress(String),

    /// The turn was cancelled by the caller.
    #[error("Turn cancelled")]
    Cancelled,

    /// The total-turn deadline elapsed.
    #[error("Turn deadline exceeded")]
    Timeout,

    /// The turn failed mid-flight; whatever accumulated is attached.
    #[error("Turn failed: {reason}")]
    Failed { reason: String, partial: Partial },

    /// Provider-core error (translation, transport, protocol).
    #[error(transparent)]
    Llm(#[from] llm::LlmError),

    /// Credential or OAuth error.
    #[error(transparent)]
    Auth(#[from] auth::AuthError),
}

impl TurnError {
    /// The partial result, when this failure carries one.
    pub fn partial(&self) -> Option<&Partial> {
        match self {
            Self::Failed { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
