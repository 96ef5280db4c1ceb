use std::time::Duration;

use thiserror::Error;

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Provider-core errors.
///
/// Transport and protocol failures live here; turn-level and auth-level
/// errors are separate taxonomies owned by their crates.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The request is malformed before it ever reaches the wire.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A canonical chat with no messages cannot be translated.
    #[error("Conversation contains no messages")]
    EmptyMessages,

    /// Authentication failed (missing or invalid API key / token).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Insufficient quota or permission at the provider.
    #[error("Insufficient quota: {0}")]
    InsufficientQuota(String),

    /// Model not found at the provider.
    #[error("{0}")]
    ModelNotFound(String),

    /// Rate limit exceeded; `retry_after` is parsed from the response
    /// when the provider supplies one.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Provider API returned an unexpected status.
    #[error("Provider API error ({status}): {message}")]
    ProviderApiError { status: u16, message: String },

    /// Network or connection error.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The SSE stream ended before the provider signalled completion.
    #[error("Stream ended before completion")]
    TruncatedStream,

    /// The stream was cancelled by the caller.
    #[error("Stream cancelled")]
    Cancelled,

    /// No bytes arrived within the idle window.
    #[error("Stream idle for longer than {0:?}")]
    IdleTimeout(Duration),

    /// A provider payload could not be parsed.
    #[error("Failed to parse provider payload: {0}")]
    ParseFailure(String),

    /// Internal error. If Some(message), it came from a provider and can
    /// be shown; if None, details should not leak.
    #[error("Internal error")]
    InternalError(Option<String>),
}

impl LlmError {
    /// Map a non-success provider HTTP status to the taxonomy.
    ///
    /// Every provider module funnels error responses through this so the
    /// 401-refresh and 429-backoff logic upstream sees one shape.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            400 => Self::InvalidRequest(body),
            401 => Self::AuthenticationFailed(body),
            403 => Self::InsufficientQuota(body),
            404 => Self::ModelNotFound(body),
            429 => Self::RateLimitExceeded {
                message: body,
                retry_after,
            },
            500 => Self::InternalError(Some(body)),
            _ => Self::ProviderApiError { status, message: body },
        }
    }

    /// True when a single OAuth refresh-and-retry is worth attempting.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// True for rate-limit errors eligible for bounded backoff.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Suggested wait before retrying, when the provider told us.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_retryable_cases() {
        assert!(LlmError::from_status(401, "nope".into(), None).is_auth_failure());
        assert!(LlmError::from_status(429, "slow down".into(), None).is_rate_limited());

        let err = LlmError::from_status(429, "slow down".into(), Some(Duration::from_secs(7)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        match LlmError::from_status(503, "overloaded".into(), None) {
            LlmError::ProviderApiError { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
