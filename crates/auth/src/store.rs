//! Encrypted credential store.
//!
//! One SQLite table keyed by `(provider, auth_type, name)`, with the
//! credential payload encrypted at rest (AES-256-GCM, key derived from
//! an operator-supplied secret via SHA-256, random 96-bit nonce
//! prepended to the ciphertext). All operations go through
//! `spawn_blocking`; the UPSERT write path keeps rotation atomic with
//! last-successful-refresh-wins semantics.

use std::path::{Path, PathBuf};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use config::{AuthKind, ProviderKind};
use jiff::Timestamp;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Store key: one credential record per `(provider, auth_type, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub provider: ProviderKind,
    pub auth_type: AuthKind,
    pub name: String,
}

impl SessionKey {
    pub fn new(provider: ProviderKind, auth_type: AuthKind, name: impl Into<String>) -> Self {
        Self {
            provider,
            auth_type,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.auth_type, self.name)
    }
}

/// Credential material for one session.
#[derive(Clone, Default)]
pub struct Credentials {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub id_token: Option<SecretString>,
    pub api_key: Option<SecretString>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub account_id: Option<String>,
    /// Set when a refresh failed terminally; cleared by a successful
    /// exchange.
    pub needs_reauth: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "…"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "…"))
            .field("api_key", &self.api_key.as_ref().map(|_| "…"))
            .field("account_id", &self.account_id)
            .field("needs_reauth", &self.needs_reauth)
            .finish_non_exhaustive()
    }
}

/// Plaintext serialization shape; exists only on its way into or out of
/// the cipher.
#[derive(Serialize, Deserialize)]
struct CredentialsPayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    api_key: Option<String>,
    scope: Option<String>,
    token_type: Option<String>,
    account_id: Option<String>,
    #[serde(default)]
    needs_reauth: bool,
}

impl From<&Credentials> for CredentialsPayload {
    fn from(c: &Credentials) -> Self {
        let expose = |s: &Option<SecretString>| s.as_ref().map(|v| v.expose_secret().to_string());
        Self {
            access_token: expose(&c.access_token),
            refresh_token: expose(&c.refresh_token),
            id_token: expose(&c.id_token),
            api_key: expose(&c.api_key),
            scope: c.scope.clone(),
            token_type: c.token_type.clone(),
            account_id: c.account_id.clone(),
            needs_reauth: c.needs_reauth,
        }
    }
}

impl From<CredentialsPayload> for Credentials {
    fn from(p: CredentialsPayload) -> Self {
        Self {
            access_token: p.access_token.map(SecretString::from),
            refresh_token: p.refresh_token.map(SecretString::from),
            id_token: p.id_token.map(SecretString::from),
            api_key: p.api_key.map(SecretString::from),
            scope: p.scope,
            token_type: p.token_type,
            account_id: p.account_id,
            needs_reauth: p.needs_reauth,
        }
    }
}

/// One stored record.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub credentials: Credentials,
    pub expires_at: Option<Timestamp>,
    pub inserted_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SessionRecord {
    /// Expiry hint: true when the record expires within `window`.
    pub fn expires_within(&self, window: std::time::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let deadline = Timestamp::now()
                    .checked_add(jiff::SignedDuration::try_from(window).unwrap_or(jiff::SignedDuration::ZERO))
                    .unwrap_or(expires_at);
                expires_at <= deadline
            }
            None => false,
        }
    }
}

#[derive(Clone)]
struct StoreCipher {
    cipher: Aes256Gcm,
}

const NONCE_LEN: usize = 12;

impl StoreCipher {
    fn new(secret: &SecretString) -> Self {
        let digest = Sha256::digest(secret.expose_secret().as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest));
        Self { cipher }
    }

    fn encrypt(&self, plaintext: &[u8]) -> crate::Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| crate::AuthError::Crypto("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> crate::Result<Vec<u8>> {
        if blob.len() <= NONCE_LEN {
            return Err(crate::AuthError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| crate::AuthError::Crypto("decryption failed; wrong store secret?".to_string()))
    }
}

/// SQLite-backed credential store.
pub struct CredentialStore {
    db_path: PathBuf,
    cipher: StoreCipher,
}

impl CredentialStore {
    /// Open (and bootstrap) the store at `path`.
    pub fn open(path: impl AsRef<Path>, secret: &SecretString) -> crate::Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                name TEXT NOT NULL,
                credentials BLOB NOT NULL,
                expires_at INTEGER,
                inserted_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_key ON sessions(provider, auth_type, name)",
            [],
        )?;

        Ok(Self {
            db_path,
            cipher: StoreCipher::new(secret),
        })
    }

    fn validate(key: &SessionKey, credentials: &Credentials, expires_at: Option<Timestamp>) -> crate::Result<()> {
        match key.auth_type {
            AuthKind::Oauth => {
                if expires_at.is_none() {
                    return Err(crate::AuthError::Validation(
                        "OAuth records require expires_at".to_string(),
                    ));
                }
            }
            AuthKind::ApiKey => {
                let empty = credentials
                    .api_key
                    .as_ref()
                    .is_none_or(|k| k.expose_secret().is_empty());
                if empty {
                    return Err(crate::AuthError::Validation(
                        "API-key records require a non-empty key".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Insert or update a record. The write is a single UPSERT, so the
    /// latest successful refresh wins without read-modify-write races.
    pub async fn upsert(
        &self,
        key: SessionKey,
        credentials: Credentials,
        expires_at: Option<Timestamp>,
    ) -> crate::Result<()> {
        Self::validate(&key, &credentials, expires_at)?;

        let payload = serde_json::to_vec(&CredentialsPayload::from(&credentials))
            .map_err(|e| crate::AuthError::Storage(e.to_string()))?;
        let blob = self.cipher.encrypt(&payload)?;

        let db_path = self.db_path.clone();
        let now = Timestamp::now().as_second();
        let expires = expires_at.map(|t| t.as_second());

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO sessions (provider, auth_type, name, credentials, expires_at, inserted_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(provider, auth_type, name) DO UPDATE SET
                    credentials = excluded.credentials,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    key.provider.as_str(),
                    key.auth_type.as_str(),
                    key.name,
                    blob,
                    expires,
                    now,
                ],
            )?;
            Ok::<(), crate::AuthError>(())
        })
        .await
        .map_err(|e| crate::AuthError::Storage(e.to_string()))?
    }

    /// Fetch a record.
    pub async fn get(&self, key: &SessionKey) -> crate::Result<SessionRecord> {
        let db_path = self.db_path.clone();
        let lookup = key.clone();

        let row = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT credentials, expires_at, inserted_at, updated_at
                 FROM sessions WHERE provider = ?1 AND auth_type = ?2 AND name = ?3",
            )?;

            let mut rows = stmt.query(rusqlite::params![
                lookup.provider.as_str(),
                lookup.auth_type.as_str(),
                lookup.name,
            ])?;

            let Some(row) = rows.next()? else {
                return Ok::<Option<(Vec<u8>, Option<i64>, i64, i64)>, crate::AuthError>(None);
            };

            Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        })
        .await
        .map_err(|e| crate::AuthError::Storage(e.to_string()))??;

        let Some((blob, expires_at, inserted_at, updated_at)) = row else {
            return Err(crate::AuthError::NotFound {
                provider: key.provider.to_string(),
                auth_type: key.auth_type.to_string(),
                name: key.name.clone(),
            });
        };

        let payload: CredentialsPayload = serde_json::from_slice(&self.cipher.decrypt(&blob)?)
            .map_err(|e| crate::AuthError::Crypto(format!("payload decode failed: {e}")))?;

        Ok(SessionRecord {
            key: key.clone(),
            credentials: payload.into(),
            expires_at: expires_at.and_then(|s| Timestamp::from_second(s).ok()),
            inserted_at: Timestamp::from_second(inserted_at)
                .map_err(|e| crate::AuthError::Storage(e.to_string()))?,
            updated_at: Timestamp::from_second(updated_at)
                .map_err(|e| crate::AuthError::Storage(e.to_string()))?,
        })
    }

    /// Delete a record; true when something was removed.
    pub async fn delete(&self, key: &SessionKey) -> crate::Result<bool> {
        let db_path = self.db_path.clone();
        let lookup = key.clone();

        let removed = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)?;
            let n = conn.execute(
                "DELETE FROM sessions WHERE provider = ?1 AND auth_type = ?2 AND name = ?3",
                rusqlite::params![
                    lookup.provider.as_str(),
                    lookup.auth_type.as_str(),
                    lookup.name,
                ],
            )?;
            Ok::<usize, crate::AuthError>(n)
        })
        .await
        .map_err(|e| crate::AuthError::Storage(e.to_string()))??;

        Ok(removed > 0)
    }

    /// List all keys with their expiry instants.
    pub async fn list(&self) -> crate::Result<Vec<(SessionKey, Option<Timestamp>)>> {
        let db_path = self.db_path.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)?;
            let mut stmt = conn
                .prepare("SELECT provider, auth_type, name, expires_at FROM sessions ORDER BY provider, name")?;

            let mut rows = stmt.query([])?;
            let mut out: Vec<(String, String, String, Option<i64>)> = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
            }
            Ok::<_, crate::AuthError>(out)
        })
        .await
        .map_err(|e| crate::AuthError::Storage(e.to_string()))??;

        rows.into_iter()
            .map(|(provider, auth_type, name, expires)| {
                let provider = provider
                    .parse::<ProviderKind>()
                    .map_err(crate::AuthError::Storage)?;
                let auth_type = auth_type.parse::<AuthKind>().map_err(crate::AuthError::Storage)?;
                Ok((
                    SessionKey::new(provider, auth_type, name),
                    expires.and_then(|s| Timestamp::from_second(s).ok()),
                ))
            })
            .collect()
    }

    /// Flag a record as needing re-authorization (terminal refresh
    /// failure). Keeps the tokens so the operator can inspect, but the
    /// scheduler stops retrying.
    pub async fn mark_needs_reauth(&self, key: &SessionKey) -> crate::Result<()> {
        let mut record = self.get(key).await?;
        record.credentials.needs_reauth = true;
        self.upsert(key.clone(), record.credentials, record.expires_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(
            dir.path().join("sessions.db"),
            &SecretString::from("operator-secret"),
        )
        .unwrap();
        (dir, store)
    }

    fn oauth_credentials() -> Credentials {
        Credentials {
            access_token: Some(SecretString::from("at-1")),
            refresh_token: Some(SecretString::from("rt-1")),
            token_type: Some("Bearer".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_trips_an_oauth_record() {
        let (_dir, store) = store();
        let key = SessionKey::new(ProviderKind::Anthropic, AuthKind::Oauth, "laptop");
        let expires = Timestamp::now().checked_add(jiff::SignedDuration::from_secs(3600)).unwrap();

        store
            .upsert(key.clone(), oauth_credentials(), Some(expires))
            .await
            .unwrap();

        let record = store.get(&key).await.unwrap();
        assert_eq!(
            record.credentials.access_token.unwrap().expose_secret(),
            "at-1"
        );
        assert_eq!(record.expires_at.unwrap().as_second(), expires.as_second());
        assert!(!record.credentials.needs_reauth);
    }

    #[tokio::test]
    async fn oauth_records_require_expiry() {
        let (_dir, store) = store();
        let key = SessionKey::new(ProviderKind::Anthropic, AuthKind::Oauth, "laptop");

        let err = store.upsert(key, oauth_credentials(), None).await.unwrap_err();
        assert!(matches!(err, crate::AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn api_key_records_require_a_key() {
        let (_dir, store) = store();
        let key = SessionKey::new(ProviderKind::OpenaiChat, AuthKind::ApiKey, "ci");

        let err = store
            .upsert(key.clone(), Credentials::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::AuthError::Validation(_)));

        let credentials = Credentials {
            api_key: Some(SecretString::from("sk-live")),
            ..Default::default()
        };
        store.upsert(key.clone(), credentials, None).await.unwrap();
        assert!(store.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn upsert_rotates_in_place() {
        let (_dir, store) = store();
        let key = SessionKey::new(ProviderKind::OpenaiResponses, AuthKind::Oauth, "laptop");
        let expires = Timestamp::now().checked_add(jiff::SignedDuration::from_secs(3600)).unwrap();

        store
            .upsert(key.clone(), oauth_credentials(), Some(expires))
            .await
            .unwrap();

        let rotated = Credentials {
            access_token: Some(SecretString::from("at-2")),
            refresh_token: Some(SecretString::from("rt-2")),
            ..Default::default()
        };
        let later = expires.checked_add(jiff::SignedDuration::from_secs(3600)).unwrap();
        store.upsert(key.clone(), rotated, Some(later)).await.unwrap();

        let record = store.get(&key).await.unwrap();
        assert_eq!(record.credentials.access_token.unwrap().expose_secret(), "at-2");
        assert_eq!(record.expires_at.unwrap().as_second(), later.as_second());

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn wrong_secret_fails_decryption_not_deserialization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let key = SessionKey::new(ProviderKind::Anthropic, AuthKind::ApiKey, "laptop");

        let store = CredentialStore::open(&path, &SecretString::from("secret-a")).unwrap();
        let credentials = Credentials {
            api_key: Some(SecretString::from("sk-live")),
            ..Default::default()
        };
        store.upsert(key.clone(), credentials, None).await.unwrap();

        let other = CredentialStore::open(&path, &SecretString::from("secret-b")).unwrap();
        let err = other.get(&key).await.unwrap_err();
        assert!(matches!(err, crate::AuthError::Crypto(_)));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let (_dir, store) = store();
        let key = SessionKey::new(ProviderKind::Google, AuthKind::ApiKey, "laptop");
        let credentials = Credentials {
            api_key: Some(SecretString::from("g-key")),
            ..Default::default()
        };

        store.upsert(key.clone(), credentials, None).await.unwrap();
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(matches!(
            store.get(&key).await.unwrap_err(),
            crate::AuthError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn mark_needs_reauth_round_trips() {
        let (_dir, store) = store();
        let key = SessionKey::new(ProviderKind::Anthropic, AuthKind::Oauth, "laptop");
        let expires = Timestamp::now().checked_add(jiff::SignedDuration::from_secs(600)).unwrap();

        store
            .upsert(key.clone(), oauth_credentials(), Some(expires))
            .await
            .unwrap();
        store.mark_needs_reauth(&key).await.unwrap();

        assert!(store.get(&key).await.unwrap().credentials.needs_reauth);
    }
}
