//! Refresh-token redemption.
//!
//! A refresh token is single use. Redemption walks four states:
//!
//! ```text
//! PRESENTED ──sniff jti──► LOOKED_UP ──verify──► VALIDATED ──CAS N→N+1──► REDEEMED
//!     │                        │                     │                       │
//!     ▼                        ▼                     ▼                       ▼
//!  Malformed /          NotFoundOrExpired     InvalidSignature      ConcurrentRedemption
//!  PayloadTooLarge                                                  (or new token pair)
//! ```
//!
//! The only write to the presented row is the compare-and-swap, so concurrent
//! presentations of the same token produce exactly one winner without a
//! global lock. A redeemed row is invisible to the lookup, so a replay reads
//! as `NotFoundOrExpired`.
//!
//! The replacement pair is signed before the swap. Failing to find or use
//! the current signing key therefore leaves the presented token redeemable;
//! only a store write failing after a won swap can still spend it.

use std::sync::Arc;

use jsonwebtoken::decode_header;
use subtle::ConstantTimeEq;

use crate::{
    error::AuthError,
    jwt::{IssuedTokens, TokenIssuer},
    sniffer::JtiSniffer,
};

/// Exchanges a refresh token for a new token pair.
pub struct RefreshExchange {
    issuer: Arc<TokenIssuer>,
    sniffer: JtiSniffer,
}

impl RefreshExchange {
    /// Creates an exchange that mints through `issuer`.
    pub fn new(issuer: Arc<TokenIssuer>) -> Self {
        let sniffer = JtiSniffer::from_config(issuer.config());
        Self { issuer, sniffer }
    }

    /// Redeems `token` and returns the replacement pair.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Malformed`] or [`AuthError::PayloadTooLarge`] if the
    ///   `jti` cannot be sniffed
    /// - [`AuthError::NotFoundOrExpired`] if no redeemable row exists
    /// - [`AuthError::InvalidSignature`] if the token does not match the row
    ///   or fails verification
    /// - [`AuthError::ConcurrentRedemption`] if another caller redeemed it first
    /// - [`AuthError::StorageUnavailable`] if a store fails
    #[tracing::instrument(skip(self, token))]
    pub async fn redeem(&self, token: &str) -> Result<IssuedTokens, AuthError> {
        let jti = self.sniffer.extract(token)?;
        let now = self.issuer.clock().now();

        let Some(row) =
            self.issuer.token_store().find_refresh_by_jti_not_expired(&jti, now).await?
        else {
            tracing::debug!(jti = %jti, "no redeemable refresh token");
            return Err(AuthError::not_found_or_expired());
        };

        if !bool::from(row.token.as_bytes().ct_eq(token.as_bytes())) {
            tracing::warn!(jti = %jti, "presented refresh token differs from stored material");
            return Err(AuthError::invalid_signature());
        }

        let header = decode_header(token).map_err(|_| AuthError::invalid_signature())?;
        if header.kid.as_deref() != Some(row.kid.as_str()) {
            tracing::warn!(jti = %jti, "refresh token kid does not match its row");
            return Err(AuthError::invalid_signature());
        }

        let key = self.issuer.jwks().decoding_key(&row.kid).await?;
        let claims = self
            .issuer
            .decode_verified(token, &key)
            .map_err(|_| AuthError::invalid_signature())?;
        if !claims.is_refresh() || claims.jti != row.jti || claims.sub != row.subject {
            tracing::warn!(jti = %jti, "refresh token claims do not match its row");
            return Err(AuthError::invalid_signature());
        }

        // Sign the replacement first: a missing key must not spend the token.
        let signed = self.issuer.sign(&row.subject, &row.claims, now).await?;

        let redeemed = row.redeemed(now);
        self.issuer
            .token_store()
            .compare_and_swap_refresh(&row, &redeemed)
            .await
            .map_err(|err| {
                let err = AuthError::from_redemption_swap(err);
                if matches!(err, AuthError::ConcurrentRedemption) {
                    tracing::info!(jti = %jti, "lost refresh redemption race");
                }
                err
            })?;

        tracing::info!(
            audit.action = "refresh_token_redeemed",
            audit.jti = %jti,
            audit.version_no = redeemed.version_no,
            "audit_event"
        );

        self.issuer.record(signed, &row.secret_claims).await
    }
}
