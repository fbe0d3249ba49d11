//! Access-token and refresh-token records.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Claim map attached to tokens.
///
/// A `BTreeMap` keeps the serialized form deterministic.
pub type ClaimMap = BTreeMap<String, serde_json::Value>;

/// Bookkeeping row for an issued access token.
///
/// The reaper reads it to tell which signing keys are still referenced by
/// live tokens. Session lookups rebuild a mirror entry from it when the
/// mirror has lost one. Verification itself is stateless.
#[derive(Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct AccessToken {
    /// JWT ID (`jti` claim).
    #[builder(into)]
    pub jti: String,

    /// Subject the token was issued to.
    #[builder(into)]
    pub subject: String,

    /// Sensitive claims of the session. Never logged and never placed in a JWT.
    #[builder(default)]
    #[serde(default)]
    pub secret_claims: ClaimMap,

    /// Signing key that minted the token.
    #[builder(into)]
    pub kid: String,

    /// Issue instant.
    pub issued_on: DateTime<Utc>,

    /// Expiry instant (`exp` claim).
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    /// Returns `true` once `now` has reached `expires_on`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("jti", &self.jti)
            .field("subject", &self.subject)
            .field("secret_claims", &format_args!("<{} redacted>", self.secret_claims.len()))
            .field("kid", &self.kid)
            .field("issued_on", &self.issued_on)
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// A refresh token and everything needed to rotate it.
///
/// Mutated only through optimistic compare-and-swap: each successful
/// redemption writes `version_no + 1` together with `redeemed_on`.
///
/// # Example
///
/// ```
/// use chrono::{Duration, Utc};
/// use tollgate_storage::auth::RefreshToken;
///
/// let now = Utc::now();
/// let token = RefreshToken::builder()
///     .jti("7d1e6f60-5b7c-4a43-b9a4-4a1c0b7b3f1e")
///     .subject("user-42")
///     .token("eyJhbGciOiJFZERTQSJ9.e30.c2ln".to_owned())
///     .kid("k1")
///     .issued_on(now)
///     .expires_on(now + Duration::days(1))
///     .build();
///
/// assert_eq!(token.version_no, 0);
/// assert!(token.is_redeemable_at(now));
///
/// let redeemed = token.redeemed(now);
/// assert_eq!(redeemed.version_no, 1);
/// assert!(!redeemed.is_redeemable_at(now));
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct RefreshToken {
    /// Row identity.
    #[builder(default = Uuid::new_v4())]
    pub uuid: Uuid,

    /// JWT ID of the refresh token; unique among live rows.
    #[builder(into)]
    pub jti: String,

    /// Subject the token was issued to.
    #[builder(into)]
    pub subject: String,

    /// The exact refresh token string handed to the client.
    #[builder(into)]
    pub token: Zeroizing<String>,

    /// Public claims carried into every rotated access token.
    #[builder(default)]
    #[serde(default)]
    pub claims: ClaimMap,

    /// Sensitive claims. Never logged and never placed in a JWT.
    #[builder(default)]
    #[serde(default)]
    pub secret_claims: ClaimMap,

    /// Issue instant.
    pub issued_on: DateTime<Utc>,

    /// Expiry instant.
    pub expires_on: DateTime<Utc>,

    /// Signing key that minted the token.
    #[builder(into)]
    pub kid: String,

    /// Optimistic-lock version, incremented by every successful redemption.
    #[builder(default)]
    #[serde(default)]
    pub version_no: u64,

    /// When the token was redeemed; `None` while it is still usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_on: Option<DateTime<Utc>>,
}

impl RefreshToken {
    /// Returns `true` once `now` has reached `expires_on`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }

    /// Returns `true` if the token is unexpired and not yet redeemed.
    #[must_use]
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        self.redeemed_on.is_none() && !self.is_expired_at(now)
    }

    /// Returns the successor version of this row, marked redeemed at `now`.
    #[must_use]
    pub fn redeemed(&self, now: DateTime<Utc>) -> Self {
        Self { version_no: self.version_no + 1, redeemed_on: Some(now), ..self.clone() }
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken")
            .field("uuid", &self.uuid)
            .field("jti", &self.jti)
            .field("subject", &self.subject)
            .field("token", &"<redacted>")
            .field("claims", &self.claims)
            .field("secret_claims", &format_args!("<{} redacted>", self.secret_claims.len()))
            .field("issued_on", &self.issued_on)
            .field("expires_on", &self.expires_on)
            .field("kid", &self.kid)
            .field("version_no", &self.version_no)
            .field("redeemed_on", &self.redeemed_on)
            .finish()
    }
}
