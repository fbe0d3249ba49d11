//! # Tollgate Credential Engine
//!
//! Signing-key rotation, JWKS publication, token issuance, and single-use
//! refresh-token redemption for the tollgate API gateway.
//!
//! ## Components
//!
//! ```text
//!               ┌──────────────────────┐
//!   ticker ───► │ KeyRotationScheduler │──► SigningKeyStore ◄──┐
//!               └──────────┬───────────┘                      │
//!                          │ invalidate()                     │
//!                          ▼                                  │
//!               ┌──────────────────────┐                      │
//!   JWKS ◄───── │      JwksCache       │──────────────────────┤
//!               └──────────▲───────────┘                      │
//!                          │ decoding_key(kid)                │
//!               ┌──────────┴───────────┐  signing key         │
//!   issue ────► │     TokenIssuer      │──────────────────────┘
//!               └──────────▲───────────┘──► TokenStore, SessionStore
//!                          │ mint
//!               ┌──────────┴───────────┐
//!   redeem ───► │   RefreshExchange    │──► JtiSniffer, TokenStore (CAS)
//!               └──────────────────────┘
//! ```
//!
//! - Keys are assigned to fixed-width time blocks; the issuer always signs
//!   with the current block's key
//! - Only EdDSA is accepted; symmetric algorithms and `none` are rejected
//! - Refresh tokens are redeemed through an optimistic compare-and-swap, so
//!   concurrent redemptions have exactly one winner
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tollgate_authn::{
//!     CredentialConfig, IssueRequest, JwksCache, KeyRotationScheduler, RefreshExchange,
//!     SystemClock, TokenIssuer,
//! };
//! use tollgate_storage::auth::{MemorySigningKeyStore, MemoryTokenStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CredentialConfig::default();
//! let clock = Arc::new(SystemClock);
//! let keys = Arc::new(MemorySigningKeyStore::default());
//! let tokens = Arc::new(MemoryTokenStore::default());
//!
//! let jwks = Arc::new(JwksCache::new(keys.clone(), clock.clone(), &config));
//! let scheduler = Arc::new(KeyRotationScheduler::new(
//!     config.clone(),
//!     clock.clone(),
//!     keys.clone(),
//!     tokens.clone(),
//!     jwks.clone(),
//! ));
//! scheduler.start(config.rotation_interval());
//!
//! let issuer = Arc::new(
//!     TokenIssuer::builder()
//!         .config(config)
//!         .clock(clock)
//!         .key_store(keys)
//!         .token_store(tokens)
//!         .jwks(jwks.clone())
//!         .build(),
//! );
//! let issued = issuer.issue(IssueRequest::builder().subject("user-42").build()).await?;
//!
//! let exchange = RefreshExchange::new(issuer.clone());
//! let rotated = exchange.redeem(&issued.refresh_token).await?;
//! let claims = issuer.verify_access_token(&rotated.access_token).await?;
//! assert_eq!(claims.sub, "user-42");
//!
//! let document = serde_json::to_string(jwks.get().await?.jwk_set())?;
//! # let _ = document;
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Time blocks and the injectable clock.
pub mod block;
/// Engine configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// Verification key cache.
pub mod jwks;
/// Token minting and verification.
pub mod jwt;
/// Ed25519 key material and JWKs.
pub mod keys;
/// Refresh-token redemption.
pub mod refresh;
/// Key provisioning and reaping.
pub mod rotation;
/// Bounded `jti` extraction.
pub mod sniffer;
/// Algorithm and `kid` validation.
pub mod validation;

/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub mod testutil;

pub use block::{
    Clock, SystemClock, block_start, first_block_at_or_after, oldest_live_signing_block,
};
pub use config::CredentialConfig;
pub use error::{AuthError, ConfigError, Result};
pub use jwks::{JwksCache, JwksSnapshot};
pub use jwt::{IssueRequest, IssuedTokens, TokenClaims, TokenIssuer};
pub use keys::{JwkSet, PublicJwk, generate_key_pair};
pub use refresh::RefreshExchange;
pub use rotation::{KeyRotationScheduler, ReapReport, TickReport};
pub use sniffer::{JtiSniffer, bearer_token};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
