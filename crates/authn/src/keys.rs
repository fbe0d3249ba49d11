//! Ed25519 key generation and JWK publication.
//!
//! Key pairs are stored as base64url text: the raw 32-byte public key and
//! the PKCS#8 DER encoding of the private key. This module converts between
//! that stored form and the `jsonwebtoken` key types.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SigningKey, VerifyingKey};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tollgate_storage::{Zeroizing, auth::SigningKeyPair};
use uuid::Uuid;

use crate::error::AuthError;

/// PKCS#8 v1 prefix for an Ed25519 private key (RFC 8410), followed by the
/// 32-byte seed.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
];

/// Generates a fresh Ed25519 key pair with a random `kid`.
///
/// # Errors
///
/// Returns [`AuthError::KeyGenerationFailed`] if the generated key does not
/// round-trip through its stored encoding.
pub fn generate_key_pair(expires_on: DateTime<Utc>) -> Result<SigningKeyPair, AuthError> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

    let seed: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(Vec::with_capacity(PKCS8_ED25519_PREFIX.len() + 32));
    pkcs8_der.extend_from_slice(&PKCS8_ED25519_PREFIX);
    pkcs8_der.extend_from_slice(&*seed);
    let private_key = Zeroizing::new(URL_SAFE_NO_PAD.encode(&*pkcs8_der));

    let pair = SigningKeyPair::builder()
        .kid(Uuid::new_v4().to_string())
        .public_key(public_key)
        .private_key(private_key)
        .expires_on(expires_on)
        .build();

    // A pair that cannot be loaded back must never reach the store.
    encoding_key(&pair).map_err(|e| AuthError::key_generation_failed(e.to_string()))?;
    decoding_key(&pair).map_err(|e| AuthError::key_generation_failed(e.to_string()))?;

    Ok(pair)
}

/// Converts the stored public key into a verifier [`DecodingKey`].
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the public key is not a valid
/// base64url Ed25519 point.
pub fn decoding_key(pair: &SigningKeyPair) -> Result<DecodingKey, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(pair.public_key.as_bytes())
        .map_err(|e| AuthError::malformed(format!("public key base64: {e}")))?;

    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        AuthError::malformed(format!(
            "public key must be {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| AuthError::malformed(format!("invalid Ed25519 public key: {e}")))?;

    DecodingKey::from_ed_components(&pair.public_key)
        .map_err(|e| AuthError::malformed(format!("public key: {e}")))
}

/// Converts the stored private key into a signer [`EncodingKey`].
///
/// # Errors
///
/// Returns [`AuthError::KeyGenerationFailed`] if the pair has no private half
/// or the private half is not valid base64url.
pub fn encoding_key(pair: &SigningKeyPair) -> Result<EncodingKey, AuthError> {
    let private_key = pair.private_key.as_ref().ok_or_else(|| {
        AuthError::key_generation_failed(format!("key pair {} has no private key", pair.kid))
    })?;
    let der: Zeroizing<Vec<u8>> = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(private_key.as_bytes())
            .map_err(|e| AuthError::key_generation_failed(format!("private key base64: {e}")))?,
    );
    if der.len() != PKCS8_ED25519_PREFIX.len() + 32 || !der.starts_with(&PKCS8_ED25519_PREFIX) {
        return Err(AuthError::key_generation_failed("private key is not Ed25519 PKCS#8"));
    }
    Ok(EncodingKey::from_ed_der(&der))
}

/// One published verification key (RFC 8037 OKP form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    /// Key type, always `OKP`.
    pub kty: String,
    /// Curve, always `Ed25519`.
    pub crv: String,
    /// Algorithm, always `EdDSA`.
    pub alg: String,
    /// Public key use, always `sig`.
    #[serde(rename = "use")]
    pub key_use: String,
    /// Key ID.
    pub kid: String,
    /// Base64url public key.
    pub x: String,
}

impl From<&SigningKeyPair> for PublicJwk {
    fn from(pair: &SigningKeyPair) -> Self {
        Self {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            alg: "EdDSA".into(),
            key_use: "sig".into(),
            kid: pair.kid.clone(),
            x: pair.public_key.as_str().to_owned(),
        }
    }
}

/// A JWKS document: `{"keys": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys.
    pub keys: Vec<PublicJwk>,
}

impl JwkSet {
    /// Returns the key with the given `kid`.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&PublicJwk> {
        self.keys.iter().find(|jwk| jwk.kid == kid)
    }
}
