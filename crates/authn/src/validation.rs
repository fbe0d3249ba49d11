//! Header checks that run before any key lookup.
//!
//! A token whose `alg` or `kid` fails here never touches the JWKS cache or
//! the key store.

use crate::error::AuthError;

/// `alg` values rejected outright: unsigned, or HMAC where the verification
/// key could also mint.
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// `alg` values accepted. Signing keys are Ed25519, so only `EdDSA`.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["EdDSA"];

/// Longest `kid` accepted.
pub const MAX_KID_LENGTH: usize = 128;

/// Checks a header `alg` against the accepted set.
///
/// Matching is exact and case-sensitive.
///
/// # Errors
///
/// [`AuthError::UnsupportedAlgorithm`] naming the algorithm. Forbidden
/// algorithms and merely unknown ones get different messages so the two show
/// up separately in logs.
///
/// ```
/// use tollgate_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if ACCEPTED_ALGORITHMS.contains(&alg) {
        return Ok(());
    }
    let reason = if FORBIDDEN_ALGORITHMS.contains(&alg) { "forbidden" } else { "unsupported" };
    Err(AuthError::unsupported_algorithm(format!("{alg} is {reason}")))
}

/// Checks a header `kid`: 1 to [`MAX_KID_LENGTH`] bytes of `[A-Za-z0-9._-]`.
///
/// Generated key ids are UUIDs, which always pass.
///
/// # Errors
///
/// [`AuthError::Malformed`].
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    let problem = match kid.len() {
        0 => Some("empty kid"),
        n if n > MAX_KID_LENGTH => Some("kid too long"),
        _ if !kid.bytes().all(is_kid_byte) => Some("kid has disallowed characters"),
        _ => None,
    };
    problem.map_or(Ok(()), |message| Err(AuthError::malformed(message)))
}

fn is_kid_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}
