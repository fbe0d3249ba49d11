//! The byte-level contract every credential store is written against.
//!
//! Stores own their key layout and entity encoding; a backend only moves
//! bytes. What the stores need from it:
//!
//! - ordered prefix scans, for block assignments and token indexes
//! - a single-key conditional write, which backs insert-only entities and
//!   optimistic refresh redemption
//! - per-key expiry, used by the session mirror
//!
//! [`MemoryBackend`](crate::MemoryBackend) is the in-process implementation.

use std::{ops::RangeBounds, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::KeyValue};

/// Async ordered key-value storage.
///
/// Shared by request handlers and the rotation task, hence `Send + Sync`.
/// A key whose expiry has passed must behave exactly like a missing key for
/// every method.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads one key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Writes one key unconditionally, dropping any expiry it had.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Writes `new_value` only if the key currently holds `expected`.
    ///
    /// `None` means "only if absent". Any other state, including a value that
    /// differs by a single byte, fails with
    /// [`Conflict`](crate::StorageError::Conflict) and leaves the key as it
    /// was. Callers comparing serialized entities must serialize
    /// deterministically.
    ///
    /// ```
    /// use tollgate_storage::{MemoryBackend, StorageBackend, StorageError};
    ///
    /// # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    /// # rt.block_on(async {
    /// let backend = MemoryBackend::new();
    /// backend.compare_and_set(b"refresh:1", None, b"v0".to_vec()).await.unwrap();
    /// backend.compare_and_set(b"refresh:1", Some(b"v0"), b"v1".to_vec()).await.unwrap();
    ///
    /// let loser = backend.compare_and_set(b"refresh:1", Some(b"v0"), b"v1".to_vec()).await;
    /// assert!(matches!(loser, Err(StorageError::Conflict)));
    /// # });
    /// ```
    #[must_use = "a conflict means another writer won and must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Removes one key; a missing key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Live rows inside `range`, ascending by key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Removes every row inside `range`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Writes one key that disappears after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Fails if the backend cannot currently serve requests.
    #[must_use = "health check results must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
