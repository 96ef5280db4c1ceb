//! Credential store settings.

use secrecy::SecretString;
use serde::Deserialize;

/// Credential store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: String,

    /// Operator-supplied secret the encryption key is derived from.
    /// Usually set via `{{ env.CADENZA_STORE_SECRET }}`.
    pub secret: Option<SecretString>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "cadenza-sessions.db".to_string(),
            secret: None,
        }
    }
}
