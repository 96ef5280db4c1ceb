use thiserror::Error;

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Credential and OAuth errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Session names are 3–50 chars of `[A-Za-z0-9_-]` after
    /// normalization.
    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),

    /// The authorization code was rejected by the provider.
    #[error("Invalid authorization code")]
    InvalidCode,

    /// The stored refresh token was rejected; the session needs a fresh
    /// authorization.
    #[error("Invalid refresh token; re-authorization required")]
    InvalidRefreshToken,

    /// No OAuth client id is configured for the provider.
    #[error("No OAuth client id configured for {0}")]
    MissingClientId(String),

    /// The provider returned something we could not interpret.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// The provider has no OAuth flow.
    #[error("Provider {0} does not support this auth flow")]
    UnsupportedProvider(String),

    /// Token endpoint rate limit.
    #[error("Rate limited by the authorization server")]
    RateLimited,

    /// Network failure talking to the authorization server.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// No credential record for the key.
    #[error("No session '{name}' for {provider}/{auth_type}")]
    NotFound {
        provider: String,
        auth_type: String,
        name: String,
    },

    /// Record-level validation failure.
    #[error("Invalid credential record: {0}")]
    Validation(String),

    /// SQLite-level failure.
    #[error("Credential store error: {0}")]
    Storage(String),

    /// Encryption or decryption failure (wrong secret, corrupt blob).
    #[error("Credential encryption error: {0}")]
    Crypto(String),
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
