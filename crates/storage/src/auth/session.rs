//! TTL-bound mirror of session state.
//!
//! The mirror is a read cache written alongside the token store at issue
//! time. It is advisory: entries may disappear early (TTL, eviction, a backend
//! restart), and redemption decisions never consult it. Readers that miss
//! rebuild the entry from the access-token row instead of denying.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    auth::ClaimMap, backend::StorageBackend, error::StorageResult, memory::MemoryBackend,
};

/// Storage key prefix for mirrored sessions.
pub const SESSION_PREFIX: &str = "sessions/";

/// Mirrored session state, keyed by the access token's `jti`.
#[derive(Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct SessionEntry {
    /// Subject the session belongs to.
    #[builder(into)]
    pub subject: String,

    /// Sensitive claims for downstream services.
    #[builder(default)]
    #[serde(default)]
    pub secret_claims: ClaimMap,

    /// Issue instant of the access token.
    pub issued_on: DateTime<Utc>,

    /// Public JWK that verifies the session's access token.
    pub verification_jwk: serde_json::Value,
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEntry")
            .field("subject", &self.subject)
            .field("secret_claims", &format_args!("<{} redacted>", self.secret_claims.len()))
            .field("issued_on", &self.issued_on)
            .field("verification_jwk", &self.verification_jwk)
            .finish()
    }
}

/// TTL-bound storage of [`SessionEntry`] rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Writes `entry` under `jwt_id`; it disappears after `ttl`.
    async fn put(&self, jwt_id: &str, entry: &SessionEntry, ttl: Duration) -> StorageResult<()>;

    /// Reads the entry for `jwt_id`, if it is still present.
    async fn get(&self, jwt_id: &str) -> StorageResult<Option<SessionEntry>>;

    /// Drops the entry for `jwt_id`.
    async fn remove(&self, jwt_id: &str) -> StorageResult<()>;
}

/// [`SessionStore`] over any TTL-capable [`StorageBackend`].
#[derive(Clone, Default)]
pub struct SessionMirror<B> {
    backend: B,
}

/// Session mirror over the in-memory backend.
pub type MemorySessionMirror = SessionMirror<MemoryBackend>;

impl<B: StorageBackend> SessionMirror<B> {
    /// Creates a mirror over `backend`.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn key(jwt_id: &str) -> Vec<u8> {
        format!("{SESSION_PREFIX}{jwt_id}").into_bytes()
    }
}

#[async_trait]
impl<B: StorageBackend> SessionStore for SessionMirror<B> {
    #[tracing::instrument(skip(self, entry))]
    async fn put(&self, jwt_id: &str, entry: &SessionEntry, ttl: Duration) -> StorageResult<()> {
        let value = serde_json::to_vec(entry)?;
        self.backend.set_with_ttl(Self::key(jwt_id), value, ttl).await
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, jwt_id: &str) -> StorageResult<Option<SessionEntry>> {
        match self.backend.get(&Self::key(jwt_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, jwt_id: &str) -> StorageResult<()> {
        self.backend.delete(&Self::key(jwt_id)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry() -> SessionEntry {
        let mut secret = ClaimMap::new();
        secret.insert("upstream".into(), json!("s3cr3t"));
        SessionEntry::builder()
            .subject("user-7")
            .secret_claims(secret)
            .issued_on(Utc::now())
            .verification_jwk(json!({"kty": "OKP", "crv": "Ed25519", "kid": "k1", "x": "abc"}))
            .build()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let mirror = MemorySessionMirror::default();
        let session = entry();

        mirror.put("jwt-1", &session, Duration::from_secs(60)).await.unwrap();
        assert_eq!(mirror.get("jwt-1").await.unwrap(), Some(session));

        mirror.remove("jwt-1").await.unwrap();
        assert!(mirror.get("jwt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_with_ttl() {
        let mirror = MemorySessionMirror::default();
        mirror.put("jwt-1", &entry(), Duration::from_millis(30)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(mirror.get("jwt-1").await.unwrap().is_none());
    }

    #[test]
    fn test_debug_redacts_secret_claims() {
        let rendered = format!("{:?}", entry());
        assert!(!rendered.contains("s3cr3t"));
    }
}
