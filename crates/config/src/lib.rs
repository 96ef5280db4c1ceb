//! Cadenza configuration structures to map the cadenza.toml configuration.

#![deny(missing_docs)]

mod loader;
mod oauth;
mod provider;
mod store;
mod turn;

use std::path::Path;

pub use oauth::{AnthropicOauthConfig, GoogleOauthConfig, OauthConfig, OpenaiOauthConfig};
pub use provider::{ApplyPatchToolMode, AuthKind, ProviderConfig, ProviderKind};
pub use store::StoreConfig;
pub use turn::{StreamPolicy, TurnOptions};

use serde::Deserialize;
use std::collections::BTreeMap;

/// Main configuration structure for the Cadenza runtime.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Provider descriptors keyed by a caller-chosen provider name.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// OAuth client settings per provider family.
    pub oauth: OauthConfig,
    /// Agent turn loop options.
    pub turn: TurnOptions,
    /// Credential store settings.
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Look up a provider descriptor by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}
