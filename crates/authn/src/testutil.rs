//! Shared test utilities for the credential engine.
//!
//! Feature-gated behind `testutil` so none of it reaches production builds.
//!
//! ```toml
//! [dev-dependencies]
//! tollgate-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! - [`ManualClock`]: a clock tests move by hand across block boundaries
//! - [`CountingKeyStore`]: a key store that counts block reads and can be
//!   slowed down or made to fail
//! - [`TestEngine`]: every component wired over in-memory stores
//! - [`craft_raw_jwt`]: unsigned tokens for attack inputs

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tollgate_storage::{
    StorageError, StorageResult,
    auth::{
        BlockAssignment, MemorySigningKeyStore, MemoryTokenStore, SessionStore, SigningKeyPair,
        SigningKeyStore,
    },
};

use crate::{
    block::Clock,
    config::CredentialConfig,
    jwks::JwksCache,
    jwt::TokenIssuer,
    refresh::RefreshExchange,
    rotation::{KeyRotationScheduler, TickReport},
};

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `secs` epoch seconds.
    pub fn new(secs: i64) -> Self {
        Self { secs: AtomicI64::new(secs) }
    }

    /// Jumps to `secs`.
    pub fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    /// Moves forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.secs.load(Ordering::SeqCst), 0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn now_secs(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// [`SigningKeyStore`] wrapper that counts `assignments_for_block` calls.
///
/// A configurable delay widens race windows; the failure switch makes every
/// call return [`StorageError::Connection`].
#[derive(Default)]
pub struct CountingKeyStore {
    inner: MemorySigningKeyStore,
    block_reads: AtomicU64,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl CountingKeyStore {
    /// Number of `assignments_for_block` calls so far.
    pub fn block_reads(&self) -> u64 {
        self.block_reads.load(Ordering::SeqCst)
    }

    /// Makes every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every block read by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected key store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SigningKeyStore for CountingKeyStore {
    async fn put_key_pair(&self, key_pair: &SigningKeyPair) -> StorageResult<()> {
        self.check()?;
        self.inner.put_key_pair(key_pair).await
    }

    async fn get_key_pair(&self, kid: &str) -> StorageResult<Option<SigningKeyPair>> {
        self.check()?;
        self.inner.get_key_pair(kid).await
    }

    async fn list_key_pairs(&self) -> StorageResult<Vec<SigningKeyPair>> {
        self.check()?;
        self.inner.list_key_pairs().await
    }

    async fn assign(&self, block: i64, kid: &str) -> StorageResult<BlockAssignment> {
        self.check()?;
        self.inner.assign(block, kid).await
    }

    async fn assignments_for_block(&self, block: i64) -> StorageResult<Vec<BlockAssignment>> {
        self.block_reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.inner.assignments_for_block(block).await
    }

    async fn delete_assignments_before(&self, block: i64) -> StorageResult<usize> {
        self.check()?;
        self.inner.delete_assignments_before(block).await
    }

    async fn delete_unreferenced_key_pairs(
        &self,
        expired_before: DateTime<Utc>,
        in_use: &HashSet<String>,
    ) -> StorageResult<Vec<String>> {
        self.check()?;
        self.inner.delete_unreferenced_key_pairs(expired_before, in_use).await
    }
}

/// Every engine component wired over in-memory stores and a [`ManualClock`].
pub struct TestEngine {
    /// Engine configuration.
    pub config: CredentialConfig,
    /// The shared clock.
    pub clock: Arc<ManualClock>,
    /// Key store.
    pub keys: Arc<CountingKeyStore>,
    /// Token store.
    pub tokens: Arc<MemoryTokenStore>,
    /// JWKS cache.
    pub jwks: Arc<JwksCache>,
    /// Token issuer.
    pub issuer: Arc<TokenIssuer>,
    /// Refresh exchange.
    pub exchange: Arc<RefreshExchange>,
    /// Rotation scheduler.
    pub scheduler: Arc<KeyRotationScheduler>,
}

impl TestEngine {
    /// Default configuration, clock at `now`.
    pub fn new(now: i64) -> Self {
        Self::build(now, CredentialConfig::default(), None)
    }

    /// Custom configuration, clock at `now`.
    pub fn with_config(now: i64, config: CredentialConfig) -> Self {
        Self::build(now, config, None)
    }

    /// Default configuration with a session mirror attached to the issuer.
    pub fn with_sessions(now: i64, sessions: Arc<dyn SessionStore>) -> Self {
        Self::build(now, CredentialConfig::default(), Some(sessions))
    }

    fn build(now: i64, config: CredentialConfig, sessions: Option<Arc<dyn SessionStore>>) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let keys = Arc::new(CountingKeyStore::default());
        let tokens = Arc::new(MemoryTokenStore::default());
        let jwks = Arc::new(JwksCache::new(keys.clone(), clock.clone(), &config));

        let issuer = Arc::new(
            TokenIssuer::builder()
                .config(config.clone())
                .clock(clock.clone())
                .key_store(keys.clone())
                .token_store(tokens.clone())
                .jwks(jwks.clone())
                .maybe_sessions(sessions)
                .build(),
        );
        let exchange = Arc::new(RefreshExchange::new(issuer.clone()));
        let scheduler = Arc::new(KeyRotationScheduler::new(
            config.clone(),
            clock.clone(),
            keys.clone(),
            tokens.clone(),
            jwks.clone(),
        ));

        Self { config, clock, keys, tokens, jwks, issuer, exchange, scheduler }
    }

    /// Runs one rotation tick.
    ///
    /// # Panics
    ///
    /// Panics if the tick fails.
    #[allow(clippy::expect_used)]
    pub async fn rotate(&self) -> TickReport {
        self.scheduler.tick().await.expect("rotation tick")
    }
}

/// Builds `{header}.{payload}.` from arbitrary JSON, with an empty signature.
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[allow(clippy::expect_used)]
pub fn craft_raw_jwt(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// Like [`craft_raw_jwt`] but with an already-encoded payload segment.
pub fn craft_jwt_with_payload_segment(
    header_json: &serde_json::Value,
    payload_b64: &str,
) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json.to_string());
    format!("{header_b64}.{payload_b64}.")
}

/// Asserts that a `Result<T, AuthError>` is an `Err` of the given variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tollgate_authn::{AuthError, assert_auth_error};
///
/// let result: Result<(), AuthError> = Err(AuthError::concurrent_redemption());
/// assert_auth_error!(result, ConcurrentRedemption);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::AuthError;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_secs(), 100);
        clock.advance(140);
        assert_eq!(clock.now().timestamp(), 240);
        clock.set(-5);
        assert_eq!(clock.now_secs(), -5);
    }

    #[tokio::test]
    async fn test_counting_store_counts_and_fails() {
        let store = CountingKeyStore::default();
        assert!(store.assignments_for_block(0).await.unwrap().is_empty());
        assert_eq!(store.block_reads(), 1);

        store.set_failing(true);
        assert!(store.assignments_for_block(0).await.is_err());
        assert!(store.get_key_pair("k").await.is_err());
    }

    #[test]
    fn test_craft_raw_jwt_format() {
        let jwt = craft_raw_jwt(&json!({"alg": "none"}), &json!({"sub": "test"}));
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].is_empty());
    }

    #[test]
    fn test_assert_auth_error_macro() {
        let result: Result<(), AuthError> = Err(AuthError::payload_too_large(10));
        assert_auth_error!(result, PayloadTooLarge);
        let result: Result<(), AuthError> = Err(AuthError::malformed("x"));
        assert_auth_error!(result, Malformed, "malformed input");
    }
}
