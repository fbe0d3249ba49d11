//! Signing-key rotation and reaping.
//!
//! Each tick of [`KeyRotationScheduler`] makes sure every block from the
//! current one through the *horizon* has its signing keys, then reaps what
//! can no longer be needed.
//!
//! ```text
//! now = 235, block size 240, access TTL 300
//!
//!   target  = max(next block start, now + ttl) = max(240, 535) = 535
//!   horizon = first block start >= target      = 720
//!
//!   ├──────┼──────┼──────┼──────┼──────┤
//!   0     240    480    720    960
//!   [key]  [key]  [key]  [key]
//! ```
//!
//! The horizon guarantees that a token signed now is verified by a key the
//! JWKS window still publishes when the token expires.
//!
//! # Reaping
//!
//! 1. Token rows expired at `now` are deleted.
//! 2. Block assignments older than the oldest block the JWKS window still
//!    publishes, minus `retention_margin`, are deleted.
//! 3. Key pairs with `expires_on + retention_margin <= now` are deleted unless
//!    an unexpired token or a surviving assignment still references them.
//!
//! Every step is idempotent; a failed tick is retried by the next one.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tollgate_storage::auth::{ExpiredTokenCounts, SigningKeyStore, TokenStore};

use crate::{
    block::{Clock, block_start, first_block_at_or_after, oldest_live_signing_block},
    config::CredentialConfig,
    error::AuthError,
    jwks::JwksCache,
    keys::generate_key_pair,
};

/// Outcome of one rotation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Block containing `now`.
    pub current_block: i64,
    /// Last block the tick provisioned.
    pub horizon_block: i64,
    /// Number of key pairs generated.
    pub keys_generated: usize,
    /// What the reaper removed.
    pub reap: ReapReport,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Expired token rows deleted.
    pub expired_tokens: ExpiredTokenCounts,
    /// Block assignments deleted.
    pub assignments_deleted: usize,
    /// Key IDs of deleted key pairs.
    pub key_pairs_deleted: Vec<String>,
}

/// Provisions signing keys ahead of time and reaps expired state.
pub struct KeyRotationScheduler {
    config: CredentialConfig,
    clock: Arc<dyn Clock>,
    key_store: Arc<dyn SigningKeyStore>,
    token_store: Arc<dyn TokenStore>,
    jwks: Arc<JwksCache>,
    /// Serializes ticks from the background task and direct callers.
    tick_lock: tokio::sync::Mutex<()>,
    cancel_token: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    tick_count: AtomicU64,
    failed_tick_count: AtomicU64,
    keys_generated: AtomicU64,
}

impl KeyRotationScheduler {
    /// Creates a scheduler. Nothing runs until [`tick`](Self::tick) or
    /// [`start`](Self::start) is called.
    pub fn new(
        config: CredentialConfig,
        clock: Arc<dyn Clock>,
        key_store: Arc<dyn SigningKeyStore>,
        token_store: Arc<dyn TokenStore>,
        jwks: Arc<JwksCache>,
    ) -> Self {
        Self {
            config,
            clock,
            key_store,
            token_store,
            jwks,
            tick_lock: tokio::sync::Mutex::new(()),
            cancel_token: CancellationToken::new(),
            task_handle: Mutex::new(None),
            tick_count: AtomicU64::new(0),
            failed_tick_count: AtomicU64::new(0),
            keys_generated: AtomicU64::new(0),
        }
    }

    /// Runs one provisioning and reaping pass.
    ///
    /// # Errors
    ///
    /// Returns the first [`AuthError::KeyGenerationFailed`] or
    /// [`AuthError::StorageUnavailable`] hit. Work completed before the
    /// failure is kept, and reaping is attempted even when provisioning fails.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, AuthError> {
        let _guard = self.tick_lock.lock().await;
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let size = self.config.block_size();
        let current_block = block_start(now.timestamp(), size, 0);
        let access_ttl = i64::try_from(self.config.access_token_ttl_secs()).unwrap_or(i64::MAX);
        let target =
            block_start(now.timestamp(), size, 1).max(now.timestamp().saturating_add(access_ttl));
        let horizon_block = first_block_at_or_after(target, size);

        let mut keys_generated = 0;
        let provisioned = self.provision(current_block, horizon_block, &mut keys_generated).await;
        if keys_generated > 0 {
            self.keys_generated.fetch_add(keys_generated as u64, Ordering::Relaxed);
            self.jwks.invalidate();
        }
        let reaped = self.reap(now, current_block).await;

        let result = match (provisioned, reaped) {
            (Ok(()), Ok(reap)) => {
                Ok(TickReport { current_block, horizon_block, keys_generated, reap })
            },
            (Err(err), _) | (Ok(()), Err(err)) => Err(err),
        };

        match &result {
            Ok(report) => tracing::info!(
                current_block,
                horizon_block,
                keys_generated,
                assignments_deleted = report.reap.assignments_deleted,
                key_pairs_deleted = report.reap.key_pairs_deleted.len(),
                "rotation tick complete"
            ),
            Err(err) => {
                self.failed_tick_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    keys_generated,
                    "rotation tick failed; retrying next tick"
                );
            },
        }
        result
    }

    async fn provision(
        &self,
        current_block: i64,
        horizon_block: i64,
        keys_generated: &mut usize,
    ) -> Result<(), AuthError> {
        let width = i64::from(self.config.block_size().get());
        let wanted = self.config.signing_keys_per_block() as usize;

        let mut block = current_block;
        while block <= horizon_block {
            let assigned = self.key_store.assignments_for_block(block).await?.len();
            if assigned < wanted {
                let expires_on = DateTime::from_timestamp(
                    block.saturating_add(self.config.key_lifetime_secs()),
                    0,
                )
                .ok_or_else(|| AuthError::key_generation_failed("key expiry out of range"))?;

                for _ in assigned..wanted {
                    let pair = generate_key_pair(expires_on)?;
                    self.key_store.put_key_pair(&pair).await?;
                    self.key_store.assign(block, &pair.kid).await?;
                    *keys_generated += 1;

                    tracing::info!(
                        audit.action = "signing_key_assigned",
                        audit.kid = %pair.kid,
                        audit.block = block,
                        audit.expires_on = %expires_on,
                        "audit_event"
                    );
                }
            }
            block += width;
        }
        Ok(())
    }

    async fn reap(&self, now: DateTime<Utc>, current_block: i64) -> Result<ReapReport, AuthError> {
        let margin = i64::try_from(self.config.retention_margin_secs()).unwrap_or(i64::MAX);

        let expired_tokens = self.token_store.delete_expired(now).await?;

        // Published keys must outlive every access token they signed.
        let oldest_published = oldest_live_signing_block(
            current_block,
            self.config.block_size(),
            self.config.access_token_ttl_secs(),
        );
        let assignment_cutoff = oldest_published.saturating_sub(margin);
        let assignments_deleted =
            self.key_store.delete_assignments_before(assignment_cutoff).await?;

        let in_use = self.token_store.referenced_key_ids(now).await?;
        let expired_before = TimeDelta::try_seconds(margin)
            .and_then(|margin| now.checked_sub_signed(margin))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let key_pairs_deleted =
            self.key_store.delete_unreferenced_key_pairs(expired_before, &in_use).await?;

        for kid in &key_pairs_deleted {
            tracing::info!(audit.action = "signing_key_reaped", audit.kid = %kid, "audit_event");
        }

        Ok(ReapReport { expired_tokens, assignments_deleted, key_pairs_deleted })
    }

    /// Spawns the background task: one tick now, then one every `interval`.
    ///
    /// Calling `start` on a running scheduler does nothing.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut handle = self.task_handle.lock();
        if handle.is_some() {
            tracing::warn!("rotation task already running");
            return;
        }

        let scheduler = Arc::clone(self);
        let token = self.cancel_token.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("rotation task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged and counted by tick().
                        let _ = scheduler.tick().await;
                    }
                }
            }
        }));
    }

    /// Stops the background task and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "rotation task panicked");
        }
    }

    /// Cancellation token of the background task, for wiring into an
    /// external shutdown signal.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Ticks run so far, successful or not.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Ticks that returned an error.
    #[must_use]
    pub fn failed_tick_count(&self) -> u64 {
        self.failed_tick_count.load(Ordering::Relaxed)
    }

    /// Key pairs generated so far.
    #[must_use]
    pub fn keys_generated(&self) -> u64 {
        self.keys_generated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tollgate_storage::{
        auth::{SigningKeyStore, TokenStore},
        testutil::{access_token, refresh_token},
    };

    use super::*;
    use crate::testutil::TestEngine;

    fn config(keys_per_block: u32) -> CredentialConfig {
        CredentialConfig::builder().signing_keys_per_block(keys_per_block).build().unwrap()
    }

    #[tokio::test]
    async fn test_tick_provisions_through_horizon() {
        let engine = TestEngine::new(235);
        let report = engine.scheduler.tick().await.unwrap();

        assert_eq!(report.current_block, 0);
        assert_eq!(report.horizon_block, 720);
        assert_eq!(report.keys_generated, 4);
        for block in [0, 240, 480, 720] {
            assert_eq!(engine.keys.keys_for_block(block).await.unwrap().len(), 1, "block {block}");
        }
        assert!(engine.keys.keys_for_block(960).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let engine = TestEngine::new(235);
        engine.scheduler.tick().await.unwrap();
        let second = engine.scheduler.tick().await.unwrap();

        assert_eq!(second.keys_generated, 0);
        assert_eq!(engine.scheduler.keys_generated(), 4);
        assert_eq!(engine.scheduler.tick_count(), 2);
    }

    #[tokio::test]
    async fn test_keys_per_block() {
        let engine = TestEngine::with_config(235, config(3));
        let report = engine.scheduler.tick().await.unwrap();
        assert_eq!(report.keys_generated, 12);

        let pairs = engine.keys.keys_for_block(480).await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_ne!(pairs[0].kid, pairs[1].kid);
    }

    #[tokio::test]
    async fn test_key_expiry_covers_longest_token() {
        let engine = TestEngine::new(235);
        engine.scheduler.tick().await.unwrap();

        let pair = engine.keys.signing_key_for_block(240).await.unwrap().unwrap();
        assert_eq!(pair.expires_on.timestamp(), 240 + 240 + 86_400);
    }

    #[tokio::test]
    async fn test_tick_invalidates_jwks_only_when_keys_change() {
        let engine = TestEngine::new(235);
        engine.jwks.get().await.unwrap();
        assert_eq!(engine.jwks.recompute_count(), 1);

        engine.scheduler.tick().await.unwrap();
        assert_eq!(engine.jwks.get().await.unwrap().len(), 2, "current and next block");
        assert_eq!(engine.jwks.recompute_count(), 2);

        engine.scheduler.tick().await.unwrap();
        engine.jwks.get().await.unwrap();
        assert_eq!(engine.jwks.recompute_count(), 2);
    }

    #[tokio::test]
    async fn test_reap_deletes_old_assignments_and_unreferenced_keys() {
        let engine = TestEngine::new(235);
        engine.scheduler.tick().await.unwrap();
        let old = engine.keys.signing_key_for_block(0).await.unwrap().unwrap();

        // Key for block 0 expires at 86_880; add the 240 s margin.
        engine.clock.set(87_200);
        let report = engine.scheduler.tick().await.unwrap();

        assert!(report.reap.assignments_deleted >= 4);
        assert!(report.reap.key_pairs_deleted.contains(&old.kid));
        assert!(engine.keys.get_key_pair(&old.kid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reap_keeps_keys_referenced_by_live_tokens() {
        let engine = TestEngine::new(235);
        engine.scheduler.tick().await.unwrap();
        let old = engine.keys.signing_key_for_block(0).await.unwrap().unwrap();

        let issued_at = DateTime::from_timestamp(87_000, 0).unwrap();
        let live = refresh_token("live", &old.kid, issued_at, 3_600);
        engine.tokens.put_refresh_token(&live).await.unwrap();

        engine.clock.set(87_200);
        let report = engine.scheduler.tick().await.unwrap();
        assert!(!report.reap.key_pairs_deleted.contains(&old.kid));
        assert!(engine.keys.get_key_pair(&old.kid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reap_deletes_expired_tokens() {
        let engine = TestEngine::new(235);
        let issued_at = DateTime::from_timestamp(0, 0).unwrap();
        engine.tokens.put_access_token(&access_token("a1", "k", issued_at, 100)).await.unwrap();
        engine.tokens.put_refresh_token(&refresh_token("r1", "k", issued_at, 100)).await.unwrap();

        let report = engine.scheduler.tick().await.unwrap();
        assert_eq!(report.reap.expired_tokens.access_tokens, 1);
        assert_eq!(report.reap.expired_tokens.refresh_tokens, 1);
    }

    #[tokio::test]
    async fn test_background_task_ticks_and_stops() {
        let engine = TestEngine::new(235);
        engine.scheduler.start(Duration::from_millis(10));
        engine.scheduler.start(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.scheduler.shutdown().await;

        let ticks = engine.scheduler.tick_count();
        assert!(ticks >= 1, "first tick runs immediately");
        assert_eq!(engine.scheduler.keys_generated(), 4);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.scheduler.tick_count(), ticks, "no ticks after shutdown");
    }
}
