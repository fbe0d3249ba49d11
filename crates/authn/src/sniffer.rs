//! Bounded, unauthenticated extraction of a token's `jti`.
//!
//! Runs on every inbound request before any cryptographic check, so it
//! treats the token as hostile:
//!
//! ```text
//! token ──split('.')──► header ──b64──► {"zip"?}            (all else ignored)
//!                   └─► payload ─b64──► [inflate ≤ limit+1] ──► {"jti"}
//! ```
//!
//! Every step is bounded by the configured size limit: the encoded payload
//! length is checked before decoding, and DEFLATE output is read through a
//! `take(limit + 1)` so a decompression bomb costs at most `limit + 1` bytes.
//! The result is a correlation key, never an authentication decision.

use std::{borrow::Cow, io::Read};

use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use flate2::read::DeflateDecoder;
use serde::Deserialize;

use crate::{config::CredentialConfig, error::AuthError};

/// base64url that accepts both padded and unpadded input.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// `zip` header value for raw DEFLATE (RFC 7516 §4.1.3).
const ZIP_DEFLATE: &str = "DEF";

/// Slack allowed on top of the limit for the compressed form, which can be a
/// few bytes longer than its input when the data is incompressible.
const COMPRESSED_SLACK_BYTES: usize = 64;

#[derive(Deserialize)]
struct SniffedHeader<'a> {
    #[serde(borrow, default)]
    zip: Option<Cow<'a, str>>,
}

#[derive(Deserialize)]
struct SniffedClaims<'a> {
    #[serde(borrow, default)]
    jti: Option<Cow<'a, str>>,
}

/// Extracts `jti` claims without verifying signatures.
#[derive(Debug, Clone, Copy)]
pub struct JtiSniffer {
    limit: usize,
}

impl JtiSniffer {
    /// Creates a sniffer that rejects payloads larger than `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Creates a sniffer using the configured JWT size limit.
    #[must_use]
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(config.jwt_size_limit_bytes())
    }

    /// Payload size limit in bytes.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Extracts the `jti` claim from `token`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::PayloadTooLarge`] if the payload, after decompression,
    ///   exceeds the limit
    /// - [`AuthError::Malformed`] for a wrong segment count, undecodable
    ///   base64 or JSON, an unknown `zip` value, or a missing or empty `jti`
    ///
    /// # Examples
    ///
    /// ```
    /// use tollgate_authn::JtiSniffer;
    ///
    /// // {"alg":"EdDSA"} . {"jti":"abc-123"} . sig
    /// let token = "eyJhbGciOiJFZERTQSJ9.eyJqdGkiOiJhYmMtMTIzIn0.c2ln";
    /// assert_eq!(JtiSniffer::new(4096).extract(token).unwrap(), "abc-123");
    /// ```
    pub fn extract(&self, token: &str) -> Result<String, AuthError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(_signature), None) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            return Err(AuthError::malformed("token must have three segments"));
        };

        let zip = self.sniff_zip(header)?;

        let max_encoded = encoded_len(self.limit.saturating_add(COMPRESSED_SLACK_BYTES));
        if payload.len() > max_encoded {
            return Err(AuthError::payload_too_large(self.limit));
        }
        let raw = URL_SAFE_LENIENT
            .decode(payload)
            .map_err(|e| AuthError::malformed(format!("payload base64: {e}")))?;

        let claims_json = match zip.as_deref() {
            None => {
                if raw.len() > self.limit {
                    return Err(AuthError::payload_too_large(self.limit));
                }
                raw
            },
            Some(ZIP_DEFLATE) => self.inflate(&raw)?,
            Some(_) => return Err(AuthError::malformed("unsupported zip algorithm")),
        };

        let claims: SniffedClaims<'_> = serde_json::from_slice(&claims_json)
            .map_err(|e| AuthError::malformed(format!("payload json: {e}")))?;
        match claims.jti {
            Some(jti) if !jti.is_empty() => Ok(jti.into_owned()),
            _ => Err(AuthError::malformed("missing jti claim")),
        }
    }

    /// Hot-path form of [`extract`](Self::extract): any failure degrades to
    /// "no correlation key".
    #[must_use]
    pub fn correlation_key(&self, token: &str) -> Option<String> {
        match self.extract(token) {
            Ok(jti) => Some(jti),
            Err(err) => {
                tracing::debug!(error = %err, "no correlation key for token");
                None
            },
        }
    }

    fn sniff_zip(&self, header: &str) -> Result<Option<String>, AuthError> {
        if header.len() > encoded_len(self.limit) {
            return Err(AuthError::payload_too_large(self.limit));
        }
        let raw = URL_SAFE_LENIENT
            .decode(header)
            .map_err(|e| AuthError::malformed(format!("header base64: {e}")))?;
        let header: SniffedHeader<'_> = serde_json::from_slice(&raw)
            .map_err(|e| AuthError::malformed(format!("header json: {e}")))?;
        Ok(header.zip.map(Cow::into_owned))
    }

    fn inflate(&self, compressed: &[u8]) -> Result<Vec<u8>, AuthError> {
        let cap = u64::try_from(self.limit).unwrap_or(u64::MAX).saturating_add(1);
        let mut out = Vec::new();
        DeflateDecoder::new(compressed)
            .take(cap)
            .read_to_end(&mut out)
            .map_err(|e| AuthError::malformed(format!("payload inflate: {e}")))?;

        if out.len() > self.limit {
            return Err(AuthError::payload_too_large(self.limit));
        }
        Ok(out)
    }
}

/// Strips the `Bearer` scheme from an `Authorization` header value.
///
/// The scheme match is case-insensitive; returns `None` for any other scheme
/// or an empty credential.
#[must_use]
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, credential) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then_some(credential)
}

/// Unpadded base64 length of `n` bytes, plus room for padding.
fn encoded_len(n: usize) -> usize {
    n.div_ceil(3).saturating_mul(4)
}
