//! Durable storage of access-token and refresh-token rows.
//!
//! # Key layout
//!
//! | Row | Key | Value |
//! |-----|-----|-------|
//! | access token | `access-tokens/{jti}` | [`AccessToken`] JSON |
//! | refresh token | `refresh-tokens/{uuid}` | [`RefreshToken`] JSON |
//! | refresh `jti` index | `refresh-token-jti/{jti}` | row `uuid` |
//!
//! The `jti` index is claimed with insert-if-absent, so two live refresh
//! rows can never share a `jti`. An index entry pointing at a dead row
//! (expired, redeemed, or missing) may be taken over.
//!
//! # Redemption
//!
//! [`TokenStore::compare_and_swap_refresh`] is the only mutation of a
//! refresh row. It re-reads the stored bytes, checks that they still hold the
//! caller's version, and writes the successor with a byte-level
//! compare-and-set against exactly those bytes. A concurrent winner changes
//! the bytes, so every other contender gets [`StorageError::Conflict`].

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fail::fail_point;
use uuid::Uuid;

use crate::{
    auth::{AccessToken, RefreshToken},
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    types::prefix_range,
};

/// Storage key prefix for access-token rows.
pub const ACCESS_TOKEN_PREFIX: &str = "access-tokens/";

/// Storage key prefix for refresh-token rows.
pub const REFRESH_TOKEN_PREFIX: &str = "refresh-tokens/";

/// Storage key prefix for the refresh-token `jti` index.
pub const REFRESH_JTI_INDEX_PREFIX: &str = "refresh-token-jti/";

/// Number of rows removed by one [`TokenStore::delete_expired`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredTokenCounts {
    /// Deleted access-token rows.
    pub access_tokens: usize,
    /// Deleted refresh-token rows.
    pub refresh_tokens: usize,
}

/// Persistence layer for token bookkeeping.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Records an issued access token.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the `jti` is already recorded.
    async fn put_access_token(&self, token: &AccessToken) -> StorageResult<()>;

    /// Retrieves an access-token row by `jti`.
    async fn get_access_token(&self, jti: &str) -> StorageResult<Option<AccessToken>>;

    /// Records a new refresh token.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if a live row already holds the
    /// same `jti`, or a row with the same `uuid` exists.
    async fn put_refresh_token(&self, token: &RefreshToken) -> StorageResult<()>;

    /// Retrieves a refresh-token row by `uuid`, whatever its state.
    async fn get_refresh_token(&self, uuid: Uuid) -> StorageResult<Option<RefreshToken>>;

    /// Finds the redeemable row for `jti`: unexpired at `now` and not redeemed.
    async fn find_refresh_by_jti_not_expired(
        &self,
        jti: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<RefreshToken>>;

    /// Replaces `current` with `updated` if the stored row still holds
    /// `current.version_no`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if the row changed since `current` was
    ///   read, was deleted, or `updated` is not exactly one version ahead.
    async fn compare_and_swap_refresh(
        &self,
        current: &RefreshToken,
        updated: &RefreshToken,
    ) -> StorageResult<()>;

    /// Deletes every access and refresh row that expired at or before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<ExpiredTokenCounts>;

    /// Returns the key IDs referenced by rows still unexpired at `now`.
    async fn referenced_key_ids(&self, now: DateTime<Utc>) -> StorageResult<HashSet<String>>;
}

/// [`TokenStore`] over any [`StorageBackend`].
#[derive(Clone, Default)]
pub struct BackendTokenStore<B> {
    backend: B,
}

/// Token store over the in-memory backend.
pub type MemoryTokenStore = BackendTokenStore<MemoryBackend>;

impl<B: StorageBackend> BackendTokenStore<B> {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn access_key(jti: &str) -> Vec<u8> {
        format!("{ACCESS_TOKEN_PREFIX}{jti}").into_bytes()
    }

    fn refresh_key(uuid: Uuid) -> Vec<u8> {
        format!("{REFRESH_TOKEN_PREFIX}{uuid}").into_bytes()
    }

    fn jti_index_key(jti: &str) -> Vec<u8> {
        format!("{REFRESH_JTI_INDEX_PREFIX}{jti}").into_bytes()
    }

    fn decode_refresh(bytes: &Bytes) -> StorageResult<RefreshToken> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn decode_index(bytes: &Bytes) -> StorageResult<Uuid> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| StorageError::serialization("refresh jti index does not hold a uuid"))
    }

    /// Points the `jti` index at `uuid`, taking over an entry whose row is dead.
    async fn claim_jti(&self, jti: &str, uuid: Uuid, now: DateTime<Utc>) -> StorageResult<()> {
        let index_key = Self::jti_index_key(jti);
        let new_value = uuid.to_string().into_bytes();

        match self.backend.compare_and_set(&index_key, None, new_value.clone()).await {
            Err(StorageError::Conflict) => {},
            other => return other,
        }

        let Some(existing) = self.backend.get(&index_key).await? else {
            // Index vanished between the two calls; retry the insert once.
            return self.backend.compare_and_set(&index_key, None, new_value).await;
        };

        let holder = Self::decode_index(&existing)?;
        if let Some(row) = self.get_refresh_token(holder).await?
            && row.is_redeemable_at(now)
        {
            return Err(StorageError::Conflict);
        }

        self.backend.compare_and_set(&index_key, Some(&existing[..]), new_value).await
    }

    async fn scan_access(&self) -> StorageResult<Vec<AccessToken>> {
        self.backend
            .get_range(prefix_range(ACCESS_TOKEN_PREFIX.as_bytes()))
            .await?
            .into_iter()
            .map(|kv| serde_json::from_slice(&kv.value).map_err(StorageError::from))
            .collect()
    }

    async fn scan_refresh(&self) -> StorageResult<Vec<RefreshToken>> {
        self.backend
            .get_range(prefix_range(REFRESH_TOKEN_PREFIX.as_bytes()))
            .await?
            .iter()
            .map(|kv| Self::decode_refresh(&kv.value))
            .collect()
    }
}

#[async_trait]
impl<B: StorageBackend> TokenStore for BackendTokenStore<B> {
    #[tracing::instrument(skip(self, token), fields(jti = %token.jti, kid = %token.kid))]
    async fn put_access_token(&self, token: &AccessToken) -> StorageResult<()> {
        let value = serde_json::to_vec(token)?;
        self.backend.compare_and_set(&Self::access_key(&token.jti), None, value).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_access_token(&self, jti: &str) -> StorageResult<Option<AccessToken>> {
        match self.backend.get(&Self::access_key(jti)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, token), fields(jti = %token.jti, uuid = %token.uuid))]
    async fn put_refresh_token(&self, token: &RefreshToken) -> StorageResult<()> {
        let value = serde_json::to_vec(token)?;

        // Index first: a row without an index entry is unreachable, an index
        // entry without a row reads as dead and can be taken over.
        self.claim_jti(&token.jti, token.uuid, token.issued_on).await?;
        self.backend.compare_and_set(&Self::refresh_key(token.uuid), None, value).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_refresh_token(&self, uuid: Uuid) -> StorageResult<Option<RefreshToken>> {
        match self.backend.get(&Self::refresh_key(uuid)).await? {
            Some(bytes) => Ok(Some(Self::decode_refresh(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn find_refresh_by_jti_not_expired(
        &self,
        jti: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<RefreshToken>> {
        let Some(index) = self.backend.get(&Self::jti_index_key(jti)).await? else {
            return Ok(None);
        };
        let uuid = Self::decode_index(&index)?;

        Ok(self
            .get_refresh_token(uuid)
            .await?
            .filter(|row| row.jti == jti && row.is_redeemable_at(now)))
    }

    #[tracing::instrument(
        skip(self, current, updated),
        fields(
            uuid = %current.uuid,
            from_version = current.version_no,
            to_version = updated.version_no
        )
    )]
    async fn compare_and_swap_refresh(
        &self,
        current: &RefreshToken,
        updated: &RefreshToken,
    ) -> StorageResult<()> {
        if updated.uuid != current.uuid || updated.version_no != current.version_no + 1 {
            return Err(StorageError::Conflict);
        }

        let key = Self::refresh_key(current.uuid);
        let Some(stored) = self.backend.get(&key).await? else {
            return Err(StorageError::Conflict);
        };
        if Self::decode_refresh(&stored)?.version_no != current.version_no {
            return Err(StorageError::Conflict);
        }

        fail_point!("token-store-before-cas", |_| Err(StorageError::Conflict));

        let value = serde_json::to_vec(updated)?;
        self.backend.compare_and_set(&key, Some(&stored[..]), value).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<ExpiredTokenCounts> {
        let mut counts = ExpiredTokenCounts::default();

        for token in self.scan_access().await? {
            if token.is_expired_at(now) {
                self.backend.delete(&Self::access_key(&token.jti)).await?;
                counts.access_tokens += 1;
            }
        }

        for token in self.scan_refresh().await? {
            if !token.is_expired_at(now) {
                continue;
            }
            self.backend.delete(&Self::refresh_key(token.uuid)).await?;
            counts.refresh_tokens += 1;

            let index_key = Self::jti_index_key(&token.jti);
            if let Some(index) = self.backend.get(&index_key).await?
                && Self::decode_index(&index).ok() == Some(token.uuid)
            {
                self.backend.delete(&index_key).await?;
            }
        }

        if counts != ExpiredTokenCounts::default() {
            tracing::debug!(
                access_tokens = counts.access_tokens,
                refresh_tokens = counts.refresh_tokens,
                "deleted expired token rows"
            );
        }
        Ok(counts)
    }

    #[tracing::instrument(skip(self))]
    async fn referenced_key_ids(&self, now: DateTime<Utc>) -> StorageResult<HashSet<String>> {
        let mut kids: HashSet<String> = self
            .scan_access()
            .await?
            .into_iter()
            .filter(|token| !token.is_expired_at(now))
            .map(|token| token.kid)
            .collect();

        kids.extend(
            self.scan_refresh()
                .await?
                .into_iter()
                .filter(|token| !token.is_expired_at(now))
                .map(|token| token.kid),
        );
        Ok(kids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn refresh(jti: &str, now: DateTime<Utc>, ttl_secs: i64) -> RefreshToken {
        RefreshToken::builder()
            .jti(jti)
            .subject("user-1")
            .token(format!("token-for-{jti}"))
            .kid("k1")
            .issued_on(now)
            .expires_on(now + Duration::seconds(ttl_secs))
            .build()
    }

    fn access(jti: &str, kid: &str, now: DateTime<Utc>, ttl_secs: i64) -> AccessToken {
        AccessToken::builder()
            .jti(jti)
            .subject("user-1")
            .kid(kid)
            .issued_on(now)
            .expires_on(now + Duration::seconds(ttl_secs))
            .build()
    }

    #[tokio::test]
    async fn test_access_token_round_trip_and_insert_only() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        let token = access("a1", "k1", now, 300);

        store.put_access_token(&token).await.unwrap();
        assert_eq!(store.get_access_token("a1").await.unwrap(), Some(token.clone()));
        crate::assert_conflict!(store.put_access_token(&token).await);
    }

    #[tokio::test]
    async fn test_find_refresh_by_jti() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        let token = refresh("r1", now, 60);
        store.put_refresh_token(&token).await.unwrap();

        let found = store.find_refresh_by_jti_not_expired("r1", now).await.unwrap().unwrap();
        assert_eq!(found.uuid, token.uuid);
        assert!(store.find_refresh_by_jti_not_expired("other", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_refresh_excludes_expired() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        store.put_refresh_token(&refresh("r1", now, 60)).await.unwrap();

        let later = now + Duration::seconds(60);
        assert!(store.find_refresh_by_jti_not_expired("r1", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_live_jti_rejected() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        store.put_refresh_token(&refresh("r1", now, 60)).await.unwrap();

        let clash = store.put_refresh_token(&refresh("r1", now, 60)).await;
        crate::assert_conflict!(clash, "live jti already held");
    }

    #[tokio::test]
    async fn test_dead_jti_can_be_reused() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        let first = refresh("r1", now, 60);
        store.put_refresh_token(&first).await.unwrap();

        let later = now + Duration::seconds(61);
        let second = refresh("r1", later, 60);
        store.put_refresh_token(&second).await.unwrap();

        let found = store.find_refresh_by_jti_not_expired("r1", later).await.unwrap().unwrap();
        assert_eq!(found.uuid, second.uuid);
    }

    #[tokio::test]
    async fn test_compare_and_swap_refresh_once() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        let token = refresh("r1", now, 60);
        store.put_refresh_token(&token).await.unwrap();

        let redeemed = token.redeemed(now);
        store.compare_and_swap_refresh(&token, &redeemed).await.unwrap();

        // Stale reader loses.
        let again = store.compare_and_swap_refresh(&token, &token.redeemed(now)).await;
        crate::assert_conflict!(again);

        let stored = store.get_refresh_token(token.uuid).await.unwrap().unwrap();
        assert_eq!(stored.version_no, 1);
        assert!(stored.redeemed_on.is_some());
        assert!(store.find_refresh_by_jti_not_expired("r1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_swap_refresh_requires_next_version() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        let token = refresh("r1", now, 60);
        store.put_refresh_token(&token).await.unwrap();

        let mut skipped = token.redeemed(now);
        skipped.version_no = 5;
        let result = store.compare_and_swap_refresh(&token, &skipped).await;
        crate::assert_conflict!(result);
    }

    #[tokio::test]
    async fn test_concurrent_compare_and_swap_single_winner() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        let token = refresh("r1", now, 60);
        store.put_refresh_token(&token).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store.compare_and_swap_refresh(&token, &token.redeemed(now)).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, StorageError::Conflict))
        );
    }

    #[tokio::test]
    async fn test_delete_expired_and_referenced_key_ids() {
        let store = MemoryTokenStore::default();
        let now = Utc::now();
        store.put_access_token(&access("a-old", "k-old", now, 10)).await.unwrap();
        store.put_access_token(&access("a-new", "k-new", now, 600)).await.unwrap();
        store.put_refresh_token(&refresh("r-old", now, 10)).await.unwrap();

        let later = now + Duration::seconds(20);
        let kids = store.referenced_key_ids(later).await.unwrap();
        assert!(kids.contains("k-new"));
        assert!(!kids.contains("k-old"));
        assert!(!kids.contains("k1"), "expired refresh row no longer references k1");

        let counts = store.delete_expired(later).await.unwrap();
        assert_eq!(counts, ExpiredTokenCounts { access_tokens: 1, refresh_tokens: 1 });
        assert!(store.get_access_token("a-old").await.unwrap().is_none());
        assert!(store.get_access_token("a-new").await.unwrap().is_some());
        assert!(store.backend().get(b"refresh-token-jti/r-old").await.unwrap().is_none());

        // Idempotent.
        assert_eq!(store.delete_expired(later).await.unwrap(), ExpiredTokenCounts::default());
    }
}
