//! Provider descriptor configuration.

use secrecy::SecretString;
use serde::Deserialize;

/// The provider wire protocol a descriptor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI Responses API.
    OpenaiResponses,
    /// OpenAI Chat Completions API.
    OpenaiChat,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini GenerateContent API.
    Google,
}

impl ProviderKind {
    /// Stable lowercase name used in credential keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiResponses => "openai_responses",
            Self::OpenaiChat => "openai_chat",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai_responses" => Ok(Self::OpenaiResponses),
            "openai_chat" => Ok(Self::OpenaiChat),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// How a session authenticates against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Static API key.
    ApiKey,
    /// OAuth access/refresh token pair.
    Oauth,
}

impl AuthKind {
    /// Stable lowercase name used in credential keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Oauth => "oauth",
        }
    }
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_key" => Ok(Self::ApiKey),
            "oauth" => Ok(Self::Oauth),
            other => Err(format!("unknown auth type '{other}'")),
        }
    }
}

/// How the apply_patch capability is exposed to the OpenAI Responses API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPatchToolMode {
    /// Freeform (grammar-constrained) tool shape.
    Freeform,
    /// Plain function tool.
    Function,
    /// Do not expose the tool.
    #[default]
    None,
}

/// Configuration for a single provider descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Wire protocol for this provider.
    pub r#type: ProviderKind,

    /// Static API key. Optional; sessions may carry their own credentials.
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Base URL override. Defaults to the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Default model when the caller does not specify one.
    #[serde(default)]
    pub default_model: Option<String>,

    /// `originator` header value for the OpenAI Responses API.
    #[serde(default = "default_originator")]
    pub originator: String,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Whether the OpenAI Responses API should store the response.
    /// Forced off when authenticating with OAuth-ChatGPT.
    #[serde(default = "default_true")]
    pub store_responses: bool,

    /// Reasoning effort passthrough for providers that support it.
    #[serde(default)]
    pub reasoning_effort: Option<String>,

    /// Include the hosted web_search tool (OpenAI Responses only).
    #[serde(default)]
    pub tools_web_search_enabled: bool,

    /// How apply_patch is exposed (OpenAI Responses only).
    #[serde(default)]
    pub apply_patch_tool_mode: ApplyPatchToolMode,

    /// Inject the first-turn tool-parameter primer in Anthropic OAuth mode.
    #[serde(default = "default_true")]
    pub anthropic_oauth_inject_primer: bool,

    /// Google Cloud project for the Code Assist endpoint (OAuth mode).
    #[serde(default)]
    pub google_project: Option<String>,

    /// Maximum output tokens (Anthropic requires this field).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_originator() -> String {
    "codex_cli_rs".to_string()
}

fn default_user_agent() -> String {
    concat!("cadenza/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    64_000
}

impl ProviderConfig {
    /// A bare descriptor of the given kind with every option defaulted.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            r#type: kind,
            api_key: None,
            base_url: None,
            default_model: None,
            originator: default_originator(),
            user_agent: default_user_agent(),
            store_responses: true,
            reasoning_effort: None,
            tools_web_search_enabled: false,
            apply_patch_tool_mode: ApplyPatchToolMode::default(),
            anthropic_oauth_inject_primer: true,
            google_project: None,
            max_tokens: default_max_tokens(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips_through_str() {
        for kind in [
            ProviderKind::OpenaiResponses,
            ProviderKind::OpenaiChat,
            ProviderKind::Anthropic,
            ProviderKind::Google,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn minimal_provider_config_deserializes() {
        let config: ProviderConfig = toml::from_str(r#"type = "anthropic""#).unwrap();

        assert_eq!(config.r#type, ProviderKind::Anthropic);
        assert_eq!(config.max_tokens, 64_000);
        assert!(config.anthropic_oauth_inject_primer);
        assert!(config.store_responses);
    }
}
