//! Storage failures.
//!
//! The credential engine only ever branches on one distinction:
//! [`StorageError::Conflict`], meaning a conditional write lost to another
//! writer, versus everything else, meaning the store cannot be trusted right
//! now. The remaining variants exist for logs.
//!
//! ```
//! use tollgate_storage::{StorageError, StorageResult};
//!
//! fn assign(kid: &str) -> StorageResult<()> {
//!     Err(StorageError::not_found(format!("signing-key/{kid}")))
//! }
//!
//! let err = assign("k1").unwrap_err();
//! assert!(!err.is_conflict());
//! ```

use std::sync::Arc;

use thiserror::Error;

type Source = Arc<dyn std::error::Error + Send + Sync>;

/// Shorthand for results from backends and stores.
pub type StorageResult<T> = Result<T, StorageError>;

/// Why a storage operation failed.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum StorageError {
    /// A row the operation depends on is missing.
    #[error("no row at {key}")]
    NotFound {
        /// Key of the missing row.
        key: String,
    },

    /// A conditional write found something other than what it expected.
    ///
    /// Insert-only stores raise it for a duplicate row, and refresh
    /// redemption raises it for every contender but the winner.
    #[error("conditional write lost")]
    Conflict,

    /// The backend is unreachable.
    #[error("backend unreachable: {message}")]
    Connection {
        /// What went wrong.
        message: String,
    },

    /// A row could not be encoded, or stored bytes do not decode.
    #[error("corrupt row: {message}")]
    Serialization {
        /// What went wrong.
        message: String,
        /// Encoder or decoder error, when there is one.
        #[source]
        source: Option<Source>,
    },

    /// Any other backend failure.
    #[error("backend failure: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },

    /// The backend did not answer in time.
    #[error("backend timed out")]
    Timeout,
}

impl StorageError {
    /// Missing row at `key`.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Lost conditional write.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Unreachable backend.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Undecodable row with no underlying error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Other backend failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns `true` for a lost conditional write.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }

    /// Returns `true` if the same call may succeed later.
    ///
    /// A conflict never does: the expected value is already gone.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { message: "json".to_owned(), source: Some(Arc::new(err)) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::error::Error;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::missing(StorageError::not_found("blk/240"), "no row at blk/240", false)]
    #[case::conflict(StorageError::conflict(), "conditional write lost", false)]
    #[case::down(StorageError::connection("refused"), "backend unreachable: refused", true)]
    #[case::slow(StorageError::Timeout, "backend timed out", true)]
    #[case::other(StorageError::internal("boom"), "backend failure: boom", false)]
    fn test_display_and_transience(
        #[case] err: StorageError,
        #[case] display: &str,
        #[case] transient: bool,
    ) {
        assert_eq!(err.to_string(), display);
        assert_eq!(err.is_transient(), transient);
    }

    #[test]
    fn test_only_conflict_is_conflict() {
        assert!(StorageError::conflict().is_conflict());
        assert!(!StorageError::not_found("k").is_conflict());
        assert!(!StorageError::Timeout.is_conflict());
    }

    #[test]
    fn test_json_error_keeps_its_source() {
        let json_err = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        let err = StorageError::from(json_err);
        assert!(matches!(err, StorageError::Serialization { .. }));
        assert!(err.source().is_some());
    }
}
