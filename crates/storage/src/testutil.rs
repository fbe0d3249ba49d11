//! Fixtures for credential storage tests.
//!
//! Only compiled for this crate's tests or with the `testutil` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tollgate-storage = { path = "../storage", features = ["testutil"] }
//! ```

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::{AccessToken, RefreshToken, SigningKeyPair};

/// `"{prefix}:{idx:06}"` as bytes; byte order matches numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Key pair record with placeholder material.
///
/// The material is not a usable Ed25519 key; tests that sign need the
/// authn crate's generator.
#[must_use]
pub fn key_pair(kid: &str, expires_on: DateTime<Utc>) -> SigningKeyPair {
    SigningKeyPair::builder()
        .kid(kid)
        .public_key(format!("public-{kid}"))
        .private_key(format!("private-{kid}"))
        .expires_on(expires_on)
        .build()
}

/// Unredeemed refresh row for `user-1`, issued at `now`.
#[must_use]
pub fn refresh_token(jti: &str, kid: &str, now: DateTime<Utc>, ttl_secs: i64) -> RefreshToken {
    RefreshToken::builder()
        .uuid(Uuid::new_v4())
        .jti(jti)
        .subject("user-1")
        .token(format!("token-{jti}"))
        .kid(kid)
        .issued_on(now)
        .expires_on(now + Duration::seconds(ttl_secs))
        .build()
}

/// Access-token row for `user-1`, issued at `now`.
#[must_use]
pub fn access_token(jti: &str, kid: &str, now: DateTime<Utc>, ttl_secs: i64) -> AccessToken {
    AccessToken::builder()
        .jti(jti)
        .subject("user-1")
        .kid(kid)
        .issued_on(now)
        .expires_on(now + Duration::seconds(ttl_secs))
        .build()
}

/// Asserts that a [`StorageResult`](crate::StorageResult) is a lost
/// conditional write.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tollgate_storage::{StorageError, StorageResult, assert_conflict};
///
/// let result: StorageResult<()> = Err(StorageError::Conflict);
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        $crate::assert_conflict!($result, "expected a conflict")
    };
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "{}: got {:?}",
            $msg,
            result,
        );
    }};
}

/// Asserts that a [`StorageResult`](crate::StorageResult) reports a missing row.
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::NotFound { .. })),
            "expected a missing row, got {:?}",
            result,
        );
    }};
}
