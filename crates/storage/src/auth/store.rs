//! Durable storage of signing key pairs and their block assignments.
//!
//! # Lifecycle
//!
//! ```text
//!  rotation tick                         reaper
//! ┌─────────────┐   ┌────────────────┐   ┌──────────────────────────┐
//! │put_key_pair │──►│ assign(block,  │──►│ delete_assignments_before│
//! │(insert-only)│   │        kid)    │   │ delete_unreferenced_...  │
//! └─────────────┘   └────────────────┘   └──────────────────────────┘
//! ```
//!
//! Nothing in this module updates a row in place. Concurrent rotation ticks
//! (for example two gateway replicas) can only race on inserting distinct
//! rows, and the reaper is idempotent.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    auth::{BlockAssignment, SigningKeyPair},
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    types::{encode_block, prefix_range},
};

/// Storage key prefix for signing key pairs.
pub const SIGNING_KEY_PREFIX: &str = "signing-keys/";

/// Storage key prefix for block assignments.
pub const BLOCK_ASSIGNMENT_PREFIX: &str = "block-assignments/";

/// Persistence layer for signing key pairs and block assignments.
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    /// Stores a new key pair.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if a pair with the same `kid` exists.
    async fn put_key_pair(&self, key_pair: &SigningKeyPair) -> StorageResult<()>;

    /// Retrieves a key pair by ID.
    async fn get_key_pair(&self, kid: &str) -> StorageResult<Option<SigningKeyPair>>;

    /// Lists every stored key pair, ordered by `kid`.
    async fn list_key_pairs(&self) -> StorageResult<Vec<SigningKeyPair>>;

    /// Assigns an existing key pair to the block starting at `block`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no pair with `kid` exists.
    async fn assign(&self, block: i64, kid: &str) -> StorageResult<BlockAssignment>;

    /// Returns the assignments for one block, oldest first.
    async fn assignments_for_block(&self, block: i64) -> StorageResult<Vec<BlockAssignment>>;

    /// Returns the distinct key pairs assigned to one block, in assignment order.
    ///
    /// Assignments whose pair has already been deleted are skipped.
    async fn keys_for_block(&self, block: i64) -> StorageResult<Vec<SigningKeyPair>> {
        let mut seen = HashSet::new();
        let mut pairs = Vec::new();
        for assignment in self.assignments_for_block(block).await? {
            if !seen.insert(assignment.kid.clone()) {
                continue;
            }
            if let Some(pair) = self.get_key_pair(&assignment.kid).await? {
                pairs.push(pair);
            }
        }
        Ok(pairs)
    }

    /// Returns the pair carrying the most recent assignment for `block` that
    /// can sign, if any.
    async fn signing_key_for_block(&self, block: i64) -> StorageResult<Option<SigningKeyPair>> {
        for assignment in self.assignments_for_block(block).await?.into_iter().rev() {
            if let Some(pair) = self.get_key_pair(&assignment.kid).await?
                && pair.can_sign()
            {
                return Ok(Some(pair));
            }
        }
        Ok(None)
    }

    /// Deletes every assignment for blocks strictly before `block`.
    ///
    /// Returns the number of deleted assignments.
    async fn delete_assignments_before(&self, block: i64) -> StorageResult<usize>;

    /// Deletes key pairs that expired at or before `expired_before` and are
    /// referenced neither by `in_use` nor by any block assignment.
    ///
    /// Returns the deleted key IDs. Referenced pairs are skipped, not errors.
    async fn delete_unreferenced_key_pairs(
        &self,
        expired_before: DateTime<Utc>,
        in_use: &HashSet<String>,
    ) -> StorageResult<Vec<String>>;
}

/// [`SigningKeyStore`] over any [`StorageBackend`].
///
/// Rows are JSON documents.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use tollgate_storage::auth::{MemorySigningKeyStore, SigningKeyPair, SigningKeyStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemorySigningKeyStore::default();
///
///     let pair = SigningKeyPair::builder()
///         .kid("k1")
///         .public_key("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo".to_owned())
///         .private_key("MC4CAQAwBQYDK2VwBCIEIJ1hsZ3v".to_owned())
///         .expires_on(Utc::now() + Duration::hours(25))
///         .build();
///     store.put_key_pair(&pair).await?;
///     store.assign(720, "k1").await?;
///
///     let current = store.signing_key_for_block(720).await?;
///     assert_eq!(current.map(|p| p.kid), Some("k1".to_owned()));
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct BackendSigningKeyStore<B> {
    backend: B,
}

/// Key store over the in-memory backend.
pub type MemorySigningKeyStore = BackendSigningKeyStore<MemoryBackend>;

impl<B: StorageBackend> BackendSigningKeyStore<B> {
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

    fn key_pair_key(kid: &str) -> Vec<u8> {
        format!("{SIGNING_KEY_PREFIX}{kid}").into_bytes()
    }

    fn block_prefix(block: i64) -> Vec<u8> {
        format!("{BLOCK_ASSIGNMENT_PREFIX}{}/", encode_block(block)).into_bytes()
    }

    fn assignment_key(assignment: &BlockAssignment) -> Vec<u8> {
        let mut key = Self::block_prefix(assignment.epoch_seconds_block);
        key.extend_from_slice(assignment.id.to_string().as_bytes());
        key
    }

    async fn scan<T>(&self, prefix: &[u8]) -> StorageResult<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        self.backend
            .get_range(prefix_range(prefix))
            .await?
            .into_iter()
            .map(|kv| serde_json::from_slice(&kv.value).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl<B: StorageBackend> SigningKeyStore for BackendSigningKeyStore<B> {
    #[tracing::instrument(skip(self, key_pair), fields(kid = %key_pair.kid))]
    async fn put_key_pair(&self, key_pair: &SigningKeyPair) -> StorageResult<()> {
        let value = serde_json::to_vec(key_pair)?;
        self.backend.compare_and_set(&Self::key_pair_key(&key_pair.kid), None, value).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_key_pair(&self, kid: &str) -> StorageResult<Option<SigningKeyPair>> {
        match self.backend.get(&Self::key_pair_key(kid)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list_key_pairs(&self) -> StorageResult<Vec<SigningKeyPair>> {
        self.scan(SIGNING_KEY_PREFIX.as_bytes()).await
    }

    #[tracing::instrument(skip(self))]
    async fn assign(&self, block: i64, kid: &str) -> StorageResult<BlockAssignment> {
        if self.backend.get(&Self::key_pair_key(kid)).await?.is_none() {
            return Err(StorageError::not_found(format!("{SIGNING_KEY_PREFIX}{kid}")));
        }

        let assignment = BlockAssignment::builder().epoch_seconds_block(block).kid(kid).build();
        let value = serde_json::to_vec(&assignment)?;
        self.backend.compare_and_set(&Self::assignment_key(&assignment), None, value).await?;
        Ok(assignment)
    }

    #[tracing::instrument(skip(self))]
    async fn assignments_for_block(&self, block: i64) -> StorageResult<Vec<BlockAssignment>> {
        let mut assignments: Vec<BlockAssignment> = self.scan(&Self::block_prefix(block)).await?;
        assignments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(assignments)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_assignments_before(&self, block: i64) -> StorageResult<usize> {
        let start = BLOCK_ASSIGNMENT_PREFIX.as_bytes().to_vec();
        let end = format!("{BLOCK_ASSIGNMENT_PREFIX}{}", encode_block(block)).into_bytes();

        let stale = self.backend.get_range(start.clone()..end.clone()).await?.len();
        if stale > 0 {
            self.backend.clear_range(start..end).await?;
            tracing::debug!(deleted = stale, "deleted stale block assignments");
        }
        Ok(stale)
    }

    #[tracing::instrument(skip(self, in_use), fields(in_use = in_use.len()))]
    async fn delete_unreferenced_key_pairs(
        &self,
        expired_before: DateTime<Utc>,
        in_use: &HashSet<String>,
    ) -> StorageResult<Vec<String>> {
        let assigned: HashSet<String> = self
            .scan::<BlockAssignment>(BLOCK_ASSIGNMENT_PREFIX.as_bytes())
            .await?
            .into_iter()
            .map(|assignment| assignment.kid)
            .collect();

        // Only expired pairs are candidates, and the rotator never assigns an
        // expired pair, so no new reference can appear after the scan above.
        let mut deleted = Vec::new();
        for pair in self.list_key_pairs().await? {
            if pair.expires_on > expired_before
                || in_use.contains(&pair.kid)
                || assigned.contains(&pair.kid)
            {
                continue;
            }
            self.backend.delete(&Self::key_pair_key(&pair.kid)).await?;
            deleted.push(pair.kid);
        }

        if !deleted.is_empty() {
            tracing::info!(
                audit.action = "delete_key_pairs",
                audit.count = deleted.len(),
                "audit_event"
            );
        }
        Ok(deleted)
    }
}
