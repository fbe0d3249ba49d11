//! Credential engine error types.
//!
//! [`AuthError`] is the single error surface of the engine. Request-path
//! callers map each variant to a distinct response; background tasks log and
//! retry the variants for which [`AuthError::is_background_retryable`] holds.

use thiserror::Error;
use tollgate_storage::StorageError;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Field name.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// Rejected value.
        value: String,
    },

    /// A field is malformed or inconsistent with another field.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Credential engine errors.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases; match expressions must carry
/// a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No live refresh token matches the presented one.
    #[error("Token not found or expired")]
    NotFoundOrExpired,

    /// The presented token does not verify against its signing key, or does
    /// not match the stored material.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Another redemption of the same refresh token won the race.
    #[error("Refresh token was redeemed concurrently")]
    ConcurrentRedemption,

    /// The token payload exceeds the configured size limit.
    #[error("Token payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The token cannot be parsed.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Ed25519 key generation or encoding failed.
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// The storage backend failed.
    ///
    /// Wraps the original [`StorageError`] to preserve the source chain.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),

    /// No signing key is assigned to the current block.
    #[error("No signing key assigned to block {block}")]
    NoSigningKey {
        /// Block start in epoch seconds.
        block: i64,
    },

    /// Algorithm not in the allowed list.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl AuthError {
    /// Creates a [`AuthError::NotFoundOrExpired`].
    #[must_use]
    pub fn not_found_or_expired() -> Self {
        Self::NotFoundOrExpired
    }

    /// Creates a [`AuthError::InvalidSignature`].
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::InvalidSignature
    }

    /// Creates a [`AuthError::ConcurrentRedemption`].
    #[must_use]
    pub fn concurrent_redemption() -> Self {
        Self::ConcurrentRedemption
    }

    /// Creates a [`AuthError::PayloadTooLarge`].
    #[must_use]
    pub fn payload_too_large(limit: usize) -> Self {
        Self::PayloadTooLarge { limit }
    }

    /// Creates a [`AuthError::Malformed`].
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Creates a [`AuthError::KeyGenerationFailed`].
    #[must_use]
    pub fn key_generation_failed(message: impl Into<String>) -> Self {
        Self::KeyGenerationFailed(message.into())
    }

    /// Creates a [`AuthError::StorageUnavailable`].
    #[must_use]
    pub fn storage_unavailable(err: StorageError) -> Self {
        Self::StorageUnavailable(err)
    }

    /// Creates a [`AuthError::NoSigningKey`].
    #[must_use]
    pub fn no_signing_key(block: i64) -> Self {
        Self::NoSigningKey { block }
    }

    /// Creates a [`AuthError::UnsupportedAlgorithm`].
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm(message.into())
    }

    /// Maps a storage error raised by a refresh compare-and-swap.
    ///
    /// A conflict means a concurrent redemption won; anything else is a
    /// storage failure.
    #[must_use]
    pub fn from_redemption_swap(err: StorageError) -> Self {
        if err.is_conflict() { Self::ConcurrentRedemption } else { Self::StorageUnavailable(err) }
    }

    /// Returns `true` for errors caused by the presented request itself.
    ///
    /// These are answered to the caller and never retried.
    #[must_use]
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            Self::NotFoundOrExpired
                | Self::InvalidSignature
                | Self::ConcurrentRedemption
                | Self::PayloadTooLarge { .. }
                | Self::Malformed(_)
                | Self::UnsupportedAlgorithm(_)
        )
    }

    /// Returns `true` for errors a background task should log and retry on
    /// its next tick.
    #[must_use]
    pub fn is_background_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyGenerationFailed(_) | Self::StorageUnavailable(_) | Self::NoSigningKey { .. }
        )
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::StorageUnavailable(err)
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::ExpiredSignature
            | ErrorKind::ImmatureSignature
            | ErrorKind::InvalidIssuer => AuthError::InvalidSignature,
            ErrorKind::InvalidAlgorithm => {
                AuthError::unsupported_algorithm("Algorithm not supported")
            },
            _ => AuthError::malformed(format!("JWT error: {err}")),
        }
    }
}

/// Result type alias for credential engine operations.
pub type Result<T> = std::result::Result<T, AuthError>;
