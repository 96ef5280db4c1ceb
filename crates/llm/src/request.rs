//! Request envelopes and the auth view translators receive.

use secrecy::{ExposeSecret, SecretString};

/// How the request authenticates, as the translator needs to see it.
///
/// This is a *view* over a stored credential record: the auth crate
/// resolves `(provider, auth_type, session)` to one of these before
/// translation.
#[derive(Clone)]
pub enum RequestAuth {
    /// Static API key (`x-api-key` / `Authorization: Bearer` / URL key,
    /// per provider convention).
    ApiKey(SecretString),

    /// OAuth access token.
    Oauth {
        access_token: SecretString,
        /// ChatGPT account id (OpenAI) or Cloud project (Google), when
        /// the flow yielded one.
        account_id: Option<String>,
    },
}

impl RequestAuth {
    /// The bearer secret, whichever variant carries it.
    pub fn token(&self) -> &SecretString {
        match self {
            Self::ApiKey(key) => key,
            Self::Oauth { access_token, .. } => access_token,
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Oauth { .. })
    }

    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::Oauth { account_id, .. } => account_id.as_deref(),
            Self::ApiKey(_) => None,
        }
    }
}

impl std::fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("RequestAuth::ApiKey(…)"),
            Self::Oauth { account_id, .. } => f
                .debug_struct("RequestAuth::Oauth")
                .field("account_id", account_id)
                .finish_non_exhaustive(),
        }
    }
}

/// A fully translated provider request, ready for the HTTP layer.
///
/// Translation is pure: building an envelope performs no I/O and is
/// deterministic for a given `(chat, auth, options)` triple, which is
/// what makes the translators unit-testable body-for-body.
pub struct RequestEnvelope {
    /// Always POST for the covered providers, kept explicit anyway.
    pub method: http::Method,
    /// Absolute request URL.
    pub url: String,
    /// Header name/value pairs in insertion order. Secrets are already
    /// exposed here; envelopes must not be logged wholesale.
    pub headers: Vec<(String, String)>,
    /// Serialized JSON body.
    pub body: Vec<u8>,
    /// Expected response content type (`text/event-stream`).
    pub expected_content_type: &'static str,
}

impl RequestEnvelope {
    /// Standard streaming envelope with the given URL and body.
    pub fn streaming_post(url: String, body: Vec<u8>) -> Self {
        Self {
            method: http::Method::POST,
            url,
            headers: Vec::new(),
            body,
            expected_content_type: "text/event-stream",
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &SecretString) -> Self {
        let value = format!("Bearer {}", token.expose_secret());
        self.header("authorization", value)
    }
}

impl std::fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();

        f.debug_struct("RequestEnvelope")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("body_len", &self.body.len())
            .finish()
    }
}
