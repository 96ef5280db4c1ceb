//! OAuth engine: PKCE authorization, code exchange, token refresh.
//!
//! Two interactive flows are supported (Anthropic and OpenAI, both PKCE
//! S256) plus refresh grants for Google Code Assist. The engine persists
//! every successful exchange into the credential store and is the only
//! writer of OAuth records besides the store's own rotation path.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use config::{AuthKind, OauthConfig, ProviderKind};
use jiff::Timestamp;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::store::{CredentialStore, Credentials, SessionKey};

/// PKCE parameters for one authorization attempt.
///
/// The verifier is secret; the challenge and state travel in the URL.
pub struct PkceParams {
    pub verifier: SecretString,
    pub challenge: String,
    pub state: String,
}

/// Generate fresh PKCE parameters from the OS CSPRNG: 32-byte verifier,
/// S256 challenge, and an independent opaque state.
pub fn generate_pkce() -> PkceParams {
    let mut verifier_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut verifier_bytes);
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

    let mut state_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut state_bytes);
    let state = URL_SAFE_NO_PAD.encode(state_bytes);

    PkceParams {
        verifier: SecretString::from(verifier),
        challenge,
        state,
    }
}

/// Tokens produced by an exchange or refresh.
#[derive(Debug, Default)]
pub struct TokenSet {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub id_token: Option<SecretString>,
    pub api_key: Option<SecretString>,
    pub scope: Option<String>,
    pub account_id: Option<String>,
    pub expires_at: Option<Timestamp>,
}

impl TokenSet {
    fn into_credentials(self) -> Credentials {
        Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            api_key: self.api_key,
            scope: self.scope,
            token_type: Some("Bearer".to_string()),
            account_id: self.account_id,
            needs_reauth: false,
        }
    }
}

/// Wire shape of every covered token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    account: Option<AccountInfo>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(default)]
    uuid: Option<String>,
}

/// Claims we read from the OpenAI id_token. The token arrived over TLS
/// from the issuer itself, so the payload is decoded without signature
/// verification.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(rename = "https://api.openai.com/auth", default)]
    auth: Option<OpenaiAuthClaim>,
}

#[derive(Debug, Deserialize)]
struct OpenaiAuthClaim {
    #[serde(default)]
    chatgpt_plan_type: Option<String>,
    #[serde(default)]
    chatgpt_account_id: Option<String>,
}

fn decode_id_token_claims(id_token: &str) -> crate::Result<IdTokenClaims> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| crate::AuthError::InvalidResponse("id_token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| crate::AuthError::InvalidResponse(format!("id_token payload: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| crate::AuthError::InvalidResponse(format!("id_token claims: {e}")))
}

/// OAuth engine bound to one credential store.
pub struct OauthEngine {
    client: reqwest::Client,
    config: OauthConfig,
    store: Arc<CredentialStore>,
}

impl OauthEngine {
    pub fn new(config: OauthConfig, store: Arc<CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            store,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Build the authorization URL and the PKCE parameters to hold on to.
    ///
    /// Parameter order matters: both consoles validate against the exact
    /// sequence their own clients produce.
    pub fn authorization_url(&self, provider: ProviderKind) -> crate::Result<(Url, PkceParams)> {
        let pkce = generate_pkce();

        let url = match provider {
            ProviderKind::Anthropic => {
                let oauth = &self.config.anthropic;
                if oauth.client_id.is_empty() {
                    return Err(crate::AuthError::MissingClientId(provider.to_string()));
                }

                let mut url = Url::parse(&oauth.authorize_url)
                    .map_err(|e| crate::AuthError::InvalidResponse(e.to_string()))?;
                url.query_pairs_mut()
                    .append_pair("code", "true")
                    .append_pair("client_id", &oauth.client_id)
                    .append_pair("response_type", "code")
                    .append_pair("redirect_uri", &oauth.redirect_uri)
                    .append_pair("scope", &oauth.scopes.join(" "))
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", "S256")
                    // This console echoes the verifier back through state.
                    .append_pair("state", pkce.verifier.expose_secret());
                url
            }

            ProviderKind::OpenaiResponses | ProviderKind::OpenaiChat => {
                let oauth = &self.config.openai;
                if oauth.client_id.is_empty() {
                    return Err(crate::AuthError::MissingClientId(provider.to_string()));
                }

                let mut url = Url::parse(&oauth.authorize_url)
                    .map_err(|e| crate::AuthError::InvalidResponse(e.to_string()))?;
                url.query_pairs_mut()
                    .append_pair("response_type", "code")
                    .append_pair("client_id", &oauth.client_id)
                    .append_pair("redirect_uri", &oauth.redirect_uri)
                    .append_pair("scope", &oauth.scopes.join(" "))
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", "S256")
                    .append_pair("id_token_add_organizations", "true")
                    .append_pair("codex_cli_simplified_flow", "true")
                    .append_pair("state", &pkce.state);
                url
            }

            ProviderKind::Google => {
                return Err(crate::AuthError::UnsupportedProvider(provider.to_string()));
            }
        };

        Ok((url, pkce))
    }

    /// Exchange an authorization code, persist the resulting record
    /// under `(provider, oauth, session_name)`, and return the tokens.
    pub async fn exchange_code(
        &self,
        provider: ProviderKind,
        session_name: &str,
        code_input: &str,
        pkce: &PkceParams,
    ) -> crate::Result<TokenSet> {
        let session_name = crate::normalize_session_name(session_name)?;

        let tokens = match provider {
            ProviderKind::Anthropic => self.exchange_anthropic(code_input, pkce).await?,
            ProviderKind::OpenaiResponses | ProviderKind::OpenaiChat => {
                self.exchange_openai(code_input, pkce).await?
            }
            ProviderKind::Google => {
                return Err(crate::AuthError::UnsupportedProvider(provider.to_string()));
            }
        };

        let key = SessionKey::new(provider, AuthKind::Oauth, session_name);
        self.persist(key, &tokens).await?;

        Ok(tokens)
    }

    async fn exchange_anthropic(&self, code_input: &str, pkce: &PkceParams) -> crate::Result<TokenSet> {
        let oauth = &self.config.anthropic;
        if oauth.client_id.is_empty() {
            return Err(crate::AuthError::MissingClientId("anthropic".to_string()));
        }

        // The console hands back `code#state` in one copy-paste blob.
        let (code, state) = match code_input.split_once('#') {
            Some((code, state)) => (code, state),
            None => (code_input, ""),
        };

        let response = self
            .client
            .post(&oauth.token_url)
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "code": code,
                "state": state,
                "client_id": oauth.client_id,
                "redirect_uri": oauth.redirect_uri,
                "code_verifier": pkce.verifier.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| crate::AuthError::NetworkError(e.to_string()))?;

        let response = check_token_status(response, crate::AuthError::InvalidCode).await?;
        token_set_from_response(response, None)
    }

    async fn exchange_openai(&self, code: &str, pkce: &PkceParams) -> crate::Result<TokenSet> {
        let oauth = &self.config.openai;
        if oauth.client_id.is_empty() {
            return Err(crate::AuthError::MissingClientId("openai".to_string()));
        }

        let response = self
            .client
            .post(&oauth.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", oauth.redirect_uri.as_str()),
                ("client_id", oauth.client_id.as_str()),
                ("code_verifier", pkce.verifier.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| crate::AuthError::NetworkError(e.to_string()))?;

        let response = check_token_status(response, crate::AuthError::InvalidCode).await?;

        let id_token = response
            .id_token
            .clone()
            .ok_or_else(|| crate::AuthError::InvalidResponse("missing id_token".to_string()))?;

        let claims = decode_id_token_claims(&id_token)?;
        log::debug!(
            "OpenAI id_token iss={:?} plan={:?}",
            claims.iss,
            claims.auth.as_ref().and_then(|a| a.chatgpt_plan_type.as_deref())
        );

        let auth_claim = claims.auth.unwrap_or(OpenaiAuthClaim {
            chatgpt_plan_type: None,
            chatgpt_account_id: None,
        });

        let chatgpt_mode = auth_claim
            .chatgpt_plan_type
            .as_deref()
            .is_some_and(|plan| !plan.is_empty() && plan != "none");

        if chatgpt_mode {
            return token_set_from_response(response, auth_claim.chatgpt_account_id);
        }

        // Platform accounts trade the id_token for a plain API key.
        let exchange = self
            .client
            .post(&oauth.token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
                ("client_id", oauth.client_id.as_str()),
                ("requested_token", "openai-api-key"),
                ("subject_token", id_token.as_str()),
                ("subject_token_type", "urn:ietf:params:oauth:token-type:id_token"),
            ])
            .send()
            .await
            .map_err(|e| crate::AuthError::NetworkError(e.to_string()))?;

        let exchange = check_token_status(exchange, crate::AuthError::InvalidCode).await?;

        let api_key = exchange
            .access_token
            .ok_or_else(|| crate::AuthError::InvalidResponse("token exchange returned no key".to_string()))?;

        let mut tokens = token_set_from_response(response, auth_claim.chatgpt_account_id)?;
        tokens.api_key = Some(SecretString::from(api_key));
        Ok(tokens)
    }

    /// Refresh the `(provider, oauth, session_name)` record and persist
    /// the rotated tokens. A terminal rejection marks the record as
    /// needing re-authorization and stops the scheduler's retries.
    pub async fn refresh(&self, provider: ProviderKind, session_name: &str) -> crate::Result<TokenSet> {
        let session_name = crate::normalize_session_name(session_name)?;
        let key = SessionKey::new(provider, AuthKind::Oauth, session_name);

        let record = self.store.get(&key).await?;
        let Some(refresh_token) = record.credentials.refresh_token.clone() else {
            return Err(crate::AuthError::InvalidRefreshToken);
        };

        let result = self.refresh_grant(provider, &refresh_token).await;

        let mut tokens = match result {
            Ok(tokens) => tokens,
            Err(crate::AuthError::InvalidRefreshToken) => {
                log::warn!("Refresh token for {key} rejected; marking for re-auth");
                self.store.mark_needs_reauth(&key).await?;
                return Err(crate::AuthError::InvalidRefreshToken);
            }
            Err(other) => return Err(other),
        };

        // Providers may omit rotation fields; carry the old ones forward.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        if tokens.account_id.is_none() {
            tokens.account_id = record.credentials.account_id.clone();
        }
        if tokens.api_key.is_none() {
            tokens.api_key = record.credentials.api_key.clone();
        }
        if tokens.id_token.is_none() {
            tokens.id_token = record.credentials.id_token.clone();
        }

        self.persist(key, &tokens).await?;
        Ok(tokens)
    }

    async fn refresh_grant(
        &self,
        provider: ProviderKind,
        refresh_token: &SecretString,
    ) -> crate::Result<TokenSet> {
        let response = match provider {
            ProviderKind::Anthropic => {
                let oauth = &self.config.anthropic;
                self.client
                    .post(&oauth.token_url)
                    .json(&serde_json::json!({
                        "grant_type": "refresh_token",
                        "refresh_token": refresh_token.expose_secret(),
                        "client_id": oauth.client_id,
                    }))
                    .send()
                    .await
            }
            ProviderKind::OpenaiResponses | ProviderKind::OpenaiChat => {
                let oauth = &self.config.openai;
                self.client
                    .post(&oauth.token_url)
                    .form(&[
                        ("client_id", oauth.client_id.as_str()),
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token.expose_secret()),
                        ("scope", "openid profile email"),
                    ])
                    .send()
                    .await
            }
            ProviderKind::Google => {
                let oauth = &self.config.google;
                if oauth.client_id.is_empty() {
                    return Err(crate::AuthError::MissingClientId("google".to_string()));
                }
                self.client
                    .post(&oauth.token_url)
                    .form(&[
                        ("client_id", oauth.client_id.as_str()),
                        ("client_secret", oauth.client_secret.as_str()),
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token.expose_secret()),
                    ])
                    .send()
                    .await
            }
        };

        let response = response.map_err(|e| crate::AuthError::NetworkError(e.to_string()))?;
        let response = check_token_status(response, crate::AuthError::InvalidRefreshToken).await?;
        token_set_from_response(response, None)
    }

    async fn persist(&self, key: SessionKey, tokens: &TokenSet) -> crate::Result<()> {
        let credentials = TokenSet {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
            api_key: tokens.api_key.clone(),
            scope: tokens.scope.clone(),
            account_id: tokens.account_id.clone(),
            expires_at: tokens.expires_at,
        }
        .into_credentials();

        self.store.upsert(key, credentials, tokens.expires_at).await
    }
}

/// Map the token endpoint status before parsing: 400/401 become the
/// caller's rejection error, 429 is rate limiting, anything else
/// non-success is an invalid response.
async fn check_token_status(
    response: reqwest::Response,
    rejection: crate::AuthError,
) -> crate::Result<TokenResponse> {
    let status = response.status();

    if status.is_success() {
        return response
            .json::<TokenResponse>()
            .await
            .map_err(|e| crate::AuthError::InvalidResponse(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    log::warn!("Token endpoint returned {status}: {body}");

    match status.as_u16() {
        400 | 401 => Err(rejection),
        429 => Err(crate::AuthError::RateLimited),
        _ => Err(crate::AuthError::InvalidResponse(format!("{status}: {body}"))),
    }
}

fn token_set_from_response(
    response: TokenResponse,
    account_id: Option<String>,
) -> crate::Result<TokenSet> {
    let expires_at = response
        .expires_in
        .map(|seconds| {
            Timestamp::now()
                .checked_add(jiff::SignedDuration::from_secs(seconds as i64))
                .map_err(|e| crate::AuthError::InvalidResponse(format!("expires_in: {e}")))
        })
        .transpose()?;

    Ok(TokenSet {
        access_token: response.access_token.map(SecretString::from),
        refresh_token: response.refresh_token.map(SecretString::from),
        id_token: response.id_token.map(SecretString::from),
        api_key: None,
        scope: response.scope,
        account_id: account_id.or(response.account.and_then(|a| a.uuid)),
        expires_at,
    })
}
