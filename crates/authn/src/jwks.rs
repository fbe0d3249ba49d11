//! Conditionally invalidated JWKS cache.
//!
//! [`JwksCache`] publishes the verification keys of every block whose key may
//! have signed a still-unexpired access token, through the next block. With an
//! access-token TTL of at most one block that is previous, current, and next;
//! a longer TTL reaches further back. The cached snapshot stays valid until
//! the current block changes or [`JwksCache::invalidate`] is called.
//!
//! # Architecture
//!
//! ```text
//! get() ──► RwLock<snapshot> fresh? ──yes──► Arc clone (no I/O)
//!                 │no
//!                 ▼
//!         tokio Mutex (single flight)
//!                 │ re-check: fresh now? ──yes──► Arc clone
//!                 ▼
//!      SigningKeyStore::keys_for_block(oldest live ..= next)
//!                 │ ok                    │ err
//!                 ▼                       ▼
//!          store + return        stale snapshot? warn + serve
//!                                         │ none
//!                                         ▼
//!                                 StorageUnavailable
//! ```
//!
//! Keys outside the window (a refresh token can outlive many blocks) are
//! fetched from the store one by one and kept in a `moka` TTL
//! cache.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use fail::fail_point;
use jsonwebtoken::DecodingKey;
use moka::future::Cache;
use parking_lot::RwLock;
use tollgate_storage::{StorageError, auth::SigningKeyStore};

use crate::{
    block::{Clock, block_start, oldest_live_signing_block},
    config::CredentialConfig,
    error::AuthError,
    keys::{JwkSet, PublicJwk, decoding_key},
};

/// Default TTL for keys fetched outside the snapshot window.
pub const DEFAULT_FALLBACK_TTL: Duration = Duration::from_secs(300);

/// Default capacity of the out-of-window key cache.
pub const DEFAULT_FALLBACK_CAPACITY: u64 = 10_000;

/// An immutable set of published keys, computed for one block.
pub struct JwksSnapshot {
    block: i64,
    generation: u64,
    computed_at: DateTime<Utc>,
    jwk_set: JwkSet,
    decoding_keys: HashMap<String, Arc<DecodingKey>>,
}

impl JwksSnapshot {
    /// Block start the snapshot was computed for.
    #[must_use]
    pub fn block(&self) -> i64 {
        self.block
    }

    /// When the snapshot was computed.
    #[must_use]
    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    /// The publishable JWKS document.
    #[must_use]
    pub fn jwk_set(&self) -> &JwkSet {
        &self.jwk_set
    }

    /// Verification key for `kid`, if it is in the window.
    #[must_use]
    pub fn decoding_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.decoding_keys.get(kid).cloned()
    }

    /// Number of published keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jwk_set.keys.len()
    }

    /// Returns `true` if no key is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jwk_set.keys.is_empty()
    }
}

impl fmt::Debug for JwksSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksSnapshot")
            .field("block", &self.block)
            .field("generation", &self.generation)
            .field("computed_at", &self.computed_at)
            .field("kids", &self.jwk_set.keys.iter().map(|k| k.kid.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

/// Read-through cache of verification keys with single-flight recomputation.
pub struct JwksCache {
    key_store: Arc<dyn SigningKeyStore>,
    clock: Arc<dyn Clock>,
    block_size: NonZeroU32,
    access_ttl_secs: u64,
    snapshot: RwLock<Option<Arc<JwksSnapshot>>>,
    recompute_lock: tokio::sync::Mutex<()>,
    /// Bumped by [`invalidate`](Self::invalidate); a snapshot computed under an
    /// older generation is stale.
    invalidation_gen: AtomicU64,
    recompute_count: AtomicU64,
    fallback: Cache<String, Arc<DecodingKey>>,
}

impl JwksCache {
    /// Creates a cache over `key_store` for the configured block size and
    /// access-token TTL.
    pub fn new(
        key_store: Arc<dyn SigningKeyStore>,
        clock: Arc<dyn Clock>,
        config: &CredentialConfig,
    ) -> Self {
        Self::with_fallback_ttl(key_store, clock, config, DEFAULT_FALLBACK_TTL)
    }

    /// Creates a cache with an explicit TTL for out-of-window keys.
    pub fn with_fallback_ttl(
        key_store: Arc<dyn SigningKeyStore>,
        clock: Arc<dyn Clock>,
        config: &CredentialConfig,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            key_store,
            clock,
            block_size: config.block_size(),
            access_ttl_secs: config.access_token_ttl_secs(),
            snapshot: RwLock::new(None),
            recompute_lock: tokio::sync::Mutex::new(()),
            invalidation_gen: AtomicU64::new(0),
            recompute_count: AtomicU64::new(0),
            fallback: Cache::builder()
                .time_to_live(fallback_ttl)
                .max_capacity(DEFAULT_FALLBACK_CAPACITY)
                .build(),
        }
    }

    fn current_block(&self) -> i64 {
        block_start(self.clock.now_secs(), self.block_size, 0)
    }

    /// Returns the cached snapshot if the invalidation predicate is false.
    fn fresh_snapshot(&self, block: i64) -> Option<Arc<JwksSnapshot>> {
        let generation = self.invalidation_gen.load(Ordering::Acquire);
        self.snapshot
            .read()
            .as_ref()
            .filter(|s| s.block == block && s.generation == generation)
            .cloned()
    }

    /// Returns the key set for the current block window.
    ///
    /// Concurrent callers that observe a stale snapshot share one
    /// recomputation.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::StorageUnavailable`] if recomputation fails and no
    /// earlier snapshot exists.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self) -> Result<Arc<JwksSnapshot>, AuthError> {
        if let Some(snapshot) = self.fresh_snapshot(self.current_block()) {
            tracing::trace!(cache = "jwks", "cache hit");
            return Ok(snapshot);
        }

        let _guard = self.recompute_lock.lock().await;

        let block = self.current_block();
        if let Some(snapshot) = self.fresh_snapshot(block) {
            tracing::debug!(cache = "jwks", "recomputed by a concurrent caller");
            return Ok(snapshot);
        }
        tracing::debug!(cache = "jwks", block, "cache miss");

        // Read the generation before the fetch: an invalidation that lands
        // mid-fetch leaves this snapshot stale.
        let generation = self.invalidation_gen.load(Ordering::Acquire);

        match self.compute(block, generation).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.snapshot.write() = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            },
            Err(err) => {
                let stale = self.snapshot.read().clone();
                match stale {
                    Some(stale) => {
                        tracing::warn!(
                            error = %err,
                            stale_block = stale.block,
                            block,
                            "JWKS recomputation failed; serving stale snapshot"
                        );
                        Ok(stale)
                    },
                    None => Err(err),
                }
            },
        }
    }

    async fn compute(&self, block: i64, generation: u64) -> Result<JwksSnapshot, AuthError> {
        fail_point!("jwks-before-recompute", |_| {
            Err(AuthError::storage_unavailable(StorageError::connection(
                "injected failure before JWKS recompute",
            )))
        });

        self.recompute_count.fetch_add(1, Ordering::Relaxed);

        let mut seen = HashSet::new();
        let mut jwk_set = JwkSet::default();
        let mut decoding_keys = HashMap::new();

        let width = i64::from(self.block_size.get());
        let last = block_start(block, self.block_size, 1);
        let mut window_block =
            oldest_live_signing_block(block, self.block_size, self.access_ttl_secs);
        while window_block <= last {
            for pair in self.key_store.keys_for_block(window_block).await? {
                if !seen.insert(pair.kid.clone()) {
                    continue;
                }
                match decoding_key(&pair) {
                    Ok(key) => {
                        jwk_set.keys.push(PublicJwk::from(&pair));
                        decoding_keys.insert(pair.kid.clone(), Arc::new(key));
                    },
                    Err(err) => {
                        tracing::warn!(kid = %pair.kid, error = %err, "skipping unusable key");
                    },
                }
            }
            window_block += width;
        }

        tracing::info!(block, keys = jwk_set.keys.len(), "JWKS snapshot recomputed");

        Ok(JwksSnapshot {
            block,
            generation,
            computed_at: self.clock.now(),
            jwk_set,
            decoding_keys,
        })
    }

    /// Returns the verification key for `kid`.
    ///
    /// Looks in the current snapshot first, then fetches keys outside the
    /// window directly from the store.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidSignature`] if no usable key with that `kid`
    ///   exists
    /// - [`AuthError::StorageUnavailable`] if the store fails
    #[tracing::instrument(skip(self))]
    pub async fn decoding_key(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        let snapshot = self.get().await?;
        if let Some(key) = snapshot.decoding_key(kid) {
            return Ok(key);
        }

        if let Some(key) = self.fallback.get(kid).await {
            tracing::debug!(cache = "fallback", "cache hit");
            return Ok(key);
        }
        tracing::debug!(cache = "fallback", "cache miss");

        let Some(pair) = self.key_store.get_key_pair(kid).await? else {
            return Err(AuthError::invalid_signature());
        };
        if pair.is_expired_at(self.clock.now()) {
            tracing::debug!(kid, "key pair expired");
            return Err(AuthError::invalid_signature());
        }

        let key = Arc::new(decoding_key(&pair).map_err(|_| AuthError::invalid_signature())?);
        self.fallback.insert(kid.to_owned(), Arc::clone(&key)).await;
        Ok(key)
    }

    /// Forces the next [`get`](Self::get) to recompute and drops
    /// out-of-window keys.
    #[tracing::instrument(skip(self))]
    pub fn invalidate(&self) {
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        self.fallback.invalidate_all();
        tracing::info!(
            audit.action = "jwks_invalidated",
            audit.generation = self.invalidation_gen.load(Ordering::Relaxed),
            "audit_event"
        );
    }

    /// Number of recomputations performed so far.
    #[must_use]
    pub fn recompute_count(&self) -> u64 {
        self.recompute_count.load(Ordering::Relaxed)
    }

    /// Block of the cached snapshot, if any.
    #[must_use]
    pub fn cached_block(&self) -> Option<i64> {
        self.snapshot.read().as_ref().map(|s| s.block)
    }
}
