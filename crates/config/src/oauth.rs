//! OAuth client settings per provider family.

use serde::Deserialize;

/// OAuth client settings for every provider family that supports it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OauthConfig {
    /// OpenAI (ChatGPT / platform) OAuth client.
    pub openai: OpenaiOauthConfig,
    /// Anthropic (Claude) OAuth client.
    pub anthropic: AnthropicOauthConfig,
    /// Google Code Assist OAuth client.
    pub google: GoogleOauthConfig,
}

/// OpenAI OAuth client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenaiOauthConfig {
    /// OAuth client identifier.
    pub client_id: String,
    /// Redirect URI registered for the client.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Authorization endpoint.
    pub authorize_url: String,
    /// Token endpoint.
    pub token_url: String,
}

impl Default for OpenaiOauthConfig {
    fn default() -> Self {
        Self {
            client_id: "app_EMoamEEZ73f0CkXaXp7hrann".to_string(),
            redirect_uri: "http://localhost:1455/auth/callback".to_string(),
            scopes: ["openid", "profile", "email", "offline_access"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            authorize_url: "https://auth.openai.com/oauth/authorize".to_string(),
            token_url: "https://auth.openai.com/oauth/token".to_string(),
        }
    }
}

/// Anthropic OAuth client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnthropicOauthConfig {
    /// OAuth client identifier.
    pub client_id: String,
    /// Redirect URI registered for the client.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Authorization endpoint.
    pub authorize_url: String,
    /// Token endpoint.
    pub token_url: String,
}

impl Default for AnthropicOauthConfig {
    fn default() -> Self {
        Self {
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_string(),
            scopes: ["org:create_api_key", "user:profile", "user:inference"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            authorize_url: "https://claude.ai/oauth/authorize".to_string(),
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
        }
    }
}

/// Google Code Assist OAuth client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GoogleOauthConfig {
    /// OAuth client identifier.
    pub client_id: String,
    /// OAuth client secret (Google's installed-app flow requires one).
    pub client_secret: String,
    /// Token endpoint.
    pub token_url: String,
}

impl Default for GoogleOauthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}
