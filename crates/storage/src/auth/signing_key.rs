//! Signing key pair and block assignment entities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// An Ed25519 signing key pair, identified by `kid`.
///
/// One entity serves both sides of the credential flow: the issuer holds the
/// private half and signs with it, verifiers only ever see the output of
/// [`to_public`](Self::to_public).
///
/// # Storage
///
/// - **Storage key**: `signing-keys/{kid}`
/// - **Lifecycle**: insert-only; deleted by the reaper once expired and
///   unreferenced
///
/// # Example
///
/// ```
/// use chrono::{Duration, Utc};
/// use tollgate_storage::auth::SigningKeyPair;
///
/// let pair = SigningKeyPair::builder()
///     .kid("k-2026-001")
///     .public_key("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo".to_owned())
///     .private_key("MC4CAQAwBQYDK2VwBCIEIJ1hsZ3v".to_owned())
///     .expires_on(Utc::now() + Duration::hours(25))
///     .build();
///
/// let published = pair.to_public();
/// assert!(published.private_key.is_none());
/// assert_eq!(published.kid, pair.kid);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct SigningKeyPair {
    /// Key ID, carried in the JWT `kid` header.
    #[builder(into)]
    pub kid: String,

    /// Ed25519 public key, base64url without padding (43 characters).
    #[builder(into)]
    pub public_key: String,

    /// PKCS#8 DER private key, base64url without padding.
    ///
    /// Present only on the issuing side; zeroed on drop and never published.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Zeroizing<String>>,

    /// When the pair was generated.
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    /// After this instant no token signed by the pair can still be valid.
    pub expires_on: DateTime<Utc>,
}

impl SigningKeyPair {
    /// Returns a copy with the private half removed.
    #[must_use]
    pub fn to_public(&self) -> Self {
        Self {
            kid: self.kid.clone(),
            public_key: self.public_key.clone(),
            private_key: None,
            created_at: self.created_at,
            expires_on: self.expires_on,
        }
    }

    /// Returns `true` if this pair can sign.
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.private_key.is_some()
    }

    /// Returns `true` once `now` has reached `expires_on`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("kid", &self.kid)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("created_at", &self.created_at)
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Association of a signing key pair with a time block.
///
/// # Storage
///
/// - **Storage key**: `block-assignments/{encoded_block}/{id}`, where the
///   block is encoded with [`encode_block`](crate::types::encode_block) so keys
///   sort by block
/// - **Lifecycle**: insert-only; deleted once the block falls behind the
///   retention window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct BlockAssignment {
    /// Row identity.
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Epoch-second start of the block.
    pub epoch_seconds_block: i64,

    /// Assigned key pair.
    #[builder(into)]
    pub kid: String,

    /// Orders assignments within a block; the latest one signs.
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn sample_pair() -> SigningKeyPair {
        SigningKeyPair::builder()
            .kid("k1")
            .public_key("public-material".to_owned())
            .private_key("private-material".to_owned())
            .expires_on(Utc::now() + Duration::hours(1))
            .build()
    }

    #[test]
    fn test_to_public_strips_private_key() {
        let pair = sample_pair();
        assert!(pair.can_sign());

        let public = pair.to_public();
        assert!(!public.can_sign());
        assert_eq!(public.public_key, pair.public_key);
        assert_eq!(public.expires_on, pair.expires_on);
    }

    #[test]
    fn test_public_serialization_omits_private_field() {
        let json = serde_json::to_value(sample_pair().to_public()).unwrap();
        assert!(json.get("private_key").is_none());
    }

    #[test]
    fn test_deserialization_rejects_unknown_fields() {
        let mut json = serde_json::to_value(sample_pair()).unwrap();
        json["surprise"] = serde_json::json!(true);
        assert!(serde_json::from_value::<SigningKeyPair>(json).is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let rendered = format!("{:?}", sample_pair());
        assert!(!rendered.contains("private-material"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("public-material"), "public half is not secret");
    }

    #[test]
    fn test_only_private_half_is_zeroized() {
        let pair = sample_pair();
        let public_key: &String = &pair.public_key;
        let private_key: Option<&Zeroizing<String>> = pair.private_key.as_ref();
        assert_eq!(public_key, "public-material");
        assert_eq!(private_key.map(|key| key.as_str()), Some("private-material"));
    }

    #[test]
    fn test_is_expired_at() {
        let pair = sample_pair();
        assert!(!pair.is_expired_at(pair.expires_on - Duration::seconds(1)));
        assert!(pair.is_expired_at(pair.expires_on));
    }

    #[test]
    fn test_block_assignment_builder_defaults() {
        let a = BlockAssignment::builder().epoch_seconds_block(720).kid("k1").build();
        let b = BlockAssignment::builder().epoch_seconds_block(720).kid("k1").build();
        assert_ne!(a.id, b.id, "each assignment gets a fresh id");
        assert_eq!(a.epoch_seconds_block, 720);
    }
}
