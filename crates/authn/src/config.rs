//! Credential engine configuration.
//!
//! [`CredentialConfig`] is built through a validating builder and
//! deserializes through the same validation, so an invalid value is rejected
//! whether it comes from code or from a config file.
//!
//! ```
//! use tollgate_authn::CredentialConfig;
//!
//! let config = CredentialConfig::builder()
//!     .block_size_secs(120)
//!     .access_token_ttl_secs(60)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.block_size().get(), 120);
//! assert_eq!(config.retention_margin_secs(), 120);
//! ```

use std::{num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default width of a key block.
pub const DEFAULT_BLOCK_SIZE_SECS: u32 = 240;

/// Default number of key pairs assigned to each block.
pub const DEFAULT_SIGNING_KEYS_PER_BLOCK: u32 = 1;

/// Default access-token lifetime.
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 300;

/// Default refresh-token lifetime (one day).
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: u64 = 86_400;

/// Default cap on a (decompressed) JWT payload.
pub const DEFAULT_JWT_SIZE_LIMIT_BYTES: usize = 4_096;

/// Default delay applied to failed credential requests by the caller.
pub const DEFAULT_FAILURE_PENALTY_MS: u64 = 500;

/// Default rotation tick interval.
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 30;

/// Default `iss` claim.
pub const DEFAULT_ISSUER: &str = "tollgate";

/// Validated configuration for the credential engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CredentialConfigFile", into = "CredentialConfigFile")]
pub struct CredentialConfig {
    block_size: NonZeroU32,
    signing_keys_per_block: u32,
    access_token_ttl_secs: u64,
    refresh_token_ttl_secs: u64,
    jwt_size_limit_bytes: usize,
    failure_penalty_ms: u64,
    rotation_interval_secs: u64,
    retention_margin_secs: u64,
    issuer: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            block_size: NonZeroU32::MIN.saturating_add(DEFAULT_BLOCK_SIZE_SECS - 1),
            signing_keys_per_block: DEFAULT_SIGNING_KEYS_PER_BLOCK,
            access_token_ttl_secs: DEFAULT_ACCESS_TOKEN_TTL_SECS,
            refresh_token_ttl_secs: DEFAULT_REFRESH_TOKEN_TTL_SECS,
            jwt_size_limit_bytes: DEFAULT_JWT_SIZE_LIMIT_BYTES,
            failure_penalty_ms: DEFAULT_FAILURE_PENALTY_MS,
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            retention_margin_secs: u64::from(DEFAULT_BLOCK_SIZE_SECS),
            issuer: DEFAULT_ISSUER.to_owned(),
        }
    }
}

fn below_minimum(field: &'static str, min: u64, value: u64) -> ConfigError {
    ConfigError::BelowMinimum { field, min: min.to_string(), value: value.to_string() }
}

#[bon::bon]
impl CredentialConfig {
    /// Creates a validated configuration.
    ///
    /// `retention_margin_secs` defaults to one block width.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if a width, count, TTL, or limit
    /// is zero, and [`ConfigError::Invalid`] if the issuer is blank or the
    /// rotation interval is longer than a block.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_BLOCK_SIZE_SECS)] block_size_secs: u32,
        #[builder(default = DEFAULT_SIGNING_KEYS_PER_BLOCK)] signing_keys_per_block: u32,
        #[builder(default = DEFAULT_ACCESS_TOKEN_TTL_SECS)] access_token_ttl_secs: u64,
        #[builder(default = DEFAULT_REFRESH_TOKEN_TTL_SECS)] refresh_token_ttl_secs: u64,
        #[builder(default = DEFAULT_JWT_SIZE_LIMIT_BYTES)] jwt_size_limit_bytes: usize,
        #[builder(default = DEFAULT_FAILURE_PENALTY_MS)] failure_penalty_ms: u64,
        #[builder(default = DEFAULT_ROTATION_INTERVAL_SECS)] rotation_interval_secs: u64,
        retention_margin_secs: Option<u64>,
        #[builder(into, default = DEFAULT_ISSUER.to_owned())] issuer: String,
    ) -> Result<Self, ConfigError> {
        let block_size = NonZeroU32::new(block_size_secs)
            .ok_or_else(|| below_minimum("block_size_secs", 1, 0))?;
        if signing_keys_per_block == 0 {
            return Err(below_minimum("signing_keys_per_block", 1, 0));
        }
        if access_token_ttl_secs == 0 {
            return Err(below_minimum("access_token_ttl_secs", 1, 0));
        }
        if refresh_token_ttl_secs == 0 {
            return Err(below_minimum("refresh_token_ttl_secs", 1, 0));
        }
        if jwt_size_limit_bytes == 0 {
            return Err(below_minimum("jwt_size_limit_bytes", 1, 0));
        }
        if rotation_interval_secs == 0 {
            return Err(below_minimum("rotation_interval_secs", 1, 0));
        }
        if rotation_interval_secs > u64::from(block_size_secs) {
            return Err(ConfigError::Invalid {
                field: "rotation_interval_secs",
                reason: format!(
                    "{rotation_interval_secs}s exceeds the block size of {block_size_secs}s"
                ),
            });
        }
        if issuer.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "issuer",
                reason: "must not be blank".into(),
            });
        }

        Ok(Self {
            block_size,
            signing_keys_per_block,
            access_token_ttl_secs,
            refresh_token_ttl_secs,
            jwt_size_limit_bytes,
            failure_penalty_ms,
            rotation_interval_secs,
            retention_margin_secs: retention_margin_secs.unwrap_or(u64::from(block_size_secs)),
            issuer,
        })
    }

    /// Width of a key block.
    #[must_use]
    pub fn block_size(&self) -> NonZeroU32 {
        self.block_size
    }

    /// Key pairs generated for each block.
    #[must_use]
    pub fn signing_keys_per_block(&self) -> u32 {
        self.signing_keys_per_block
    }

    /// Access-token lifetime in seconds.
    #[must_use]
    pub fn access_token_ttl_secs(&self) -> u64 {
        self.access_token_ttl_secs
    }

    /// Refresh-token lifetime in seconds.
    #[must_use]
    pub fn refresh_token_ttl_secs(&self) -> u64 {
        self.refresh_token_ttl_secs
    }

    /// Access-token lifetime.
    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    /// Maximum JWT payload size, after decompression.
    #[must_use]
    pub fn jwt_size_limit_bytes(&self) -> usize {
        self.jwt_size_limit_bytes
    }

    /// Delay the surrounding layer applies before answering a failed
    /// credential request.
    #[must_use]
    pub fn failure_penalty(&self) -> Duration {
        Duration::from_millis(self.failure_penalty_ms)
    }

    /// Interval between rotation ticks.
    #[must_use]
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// Grace period before expired keys and assignments are reaped.
    #[must_use]
    pub fn retention_margin_secs(&self) -> u64 {
        self.retention_margin_secs
    }

    /// `iss` claim of issued tokens.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Lifetime of a key pair generated for a block: the block itself plus
    /// the longest token lifetime.
    #[must_use]
    pub fn key_lifetime_secs(&self) -> i64 {
        let longest = self.access_token_ttl_secs.max(self.refresh_token_ttl_secs);
        i64::from(self.block_size.get()).saturating_add(i64::try_from(longest).unwrap_or(i64::MAX))
    }
}

/// Serialized form of [`CredentialConfig`]; every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CredentialConfigFile {
    #[serde(default = "default_block_size_secs")]
    block_size_secs: u32,
    #[serde(default = "default_signing_keys_per_block")]
    signing_keys_per_block: u32,
    #[serde(default = "default_access_token_ttl_secs")]
    access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_token_ttl_secs")]
    refresh_token_ttl_secs: u64,
    #[serde(default = "default_jwt_size_limit_bytes")]
    jwt_size_limit_bytes: usize,
    #[serde(default = "default_failure_penalty_ms")]
    failure_penalty_ms: u64,
    #[serde(default = "default_rotation_interval_secs")]
    rotation_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retention_margin_secs: Option<u64>,
    #[serde(default = "default_issuer")]
    issuer: String,
}

fn default_block_size_secs() -> u32 {
    DEFAULT_BLOCK_SIZE_SECS
}

fn default_signing_keys_per_block() -> u32 {
    DEFAULT_SIGNING_KEYS_PER_BLOCK
}

fn default_access_token_ttl_secs() -> u64 {
    DEFAULT_ACCESS_TOKEN_TTL_SECS
}

fn default_refresh_token_ttl_secs() -> u64 {
    DEFAULT_REFRESH_TOKEN_TTL_SECS
}

fn default_jwt_size_limit_bytes() -> usize {
    DEFAULT_JWT_SIZE_LIMIT_BYTES
}

fn default_failure_penalty_ms() -> u64 {
    DEFAULT_FAILURE_PENALTY_MS
}

fn default_rotation_interval_secs() -> u64 {
    DEFAULT_ROTATION_INTERVAL_SECS
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_owned()
}

impl TryFrom<CredentialConfigFile> for CredentialConfig {
    type Error = ConfigError;

    fn try_from(file: CredentialConfigFile) -> Result<Self, Self::Error> {
        CredentialConfig::builder()
            .block_size_secs(file.block_size_secs)
            .signing_keys_per_block(file.signing_keys_per_block)
            .access_token_ttl_secs(file.access_token_ttl_secs)
            .refresh_token_ttl_secs(file.refresh_token_ttl_secs)
            .jwt_size_limit_bytes(file.jwt_size_limit_bytes)
            .failure_penalty_ms(file.failure_penalty_ms)
            .rotation_interval_secs(file.rotation_interval_secs)
            .maybe_retention_margin_secs(file.retention_margin_secs)
            .issuer(file.issuer)
            .build()
    }
}

impl From<CredentialConfig> for CredentialConfigFile {
    fn from(config: CredentialConfig) -> Self {
        Self {
            block_size_secs: config.block_size.get(),
            signing_keys_per_block: config.signing_keys_per_block,
            access_token_ttl_secs: config.access_token_ttl_secs,
            refresh_token_ttl_secs: config.refresh_token_ttl_secs,
            jwt_size_limit_bytes: config.jwt_size_limit_bytes,
            failure_penalty_ms: config.failure_penalty_ms,
            rotation_interval_secs: config.rotation_interval_secs,
            retention_margin_secs: Some(config.retention_margin_secs),
            issuer: config.issuer,
        }
    }
}
