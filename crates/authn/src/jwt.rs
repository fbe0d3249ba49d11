//! Token minting and access-token verification.
//!
//! [`TokenIssuer`] signs with the key assigned to the current block and
//! records every token it mints. Access tokens are verified statelessly
//! against [`JwksCache`].
//!
//! # Token shapes
//!
//! | Claim | Access token | Refresh token |
//! |-------|--------------|---------------|
//! | `jti` | random UUID | random UUID |
//! | `sub` | subject | subject |
//! | `iss` | configured issuer | configured issuer |
//! | `iat`, `exp` | `exp = iat + access_ttl` | `exp = iat + refresh_ttl` |
//! | `typ` | absent | `refresh` |
//! | public claims | flattened into the payload | kept in the row only |
//!
//! Secret claims never enter a JWT; they live in the token rows and the
//! session mirror. [`TokenIssuer::session`] serves them back, from the mirror
//! when it has the entry and from the access-token row when it does not.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use tollgate_storage::{
    StorageError, Zeroizing,
    auth::{
        AccessToken, ClaimMap, RefreshToken, SessionEntry, SessionStore, SigningKeyPair,
        SigningKeyStore, TokenStore,
    },
};
use uuid::Uuid;

use crate::{
    block::{Clock, block_start},
    config::CredentialConfig,
    error::AuthError,
    jwks::JwksCache,
    keys::{PublicJwk, encoding_key},
    validation::{validate_algorithm, validate_kid},
};

/// `typ` claim carried by refresh tokens.
pub const REFRESH_TOKEN_TYPE: &str = "refresh";

/// Claim names the issuer owns; caller-supplied claims may not use them.
pub const RESERVED_CLAIMS: &[&str] = &["jti", "sub", "iss", "iat", "exp", "nbf", "aud", "typ"];

/// Verified JWT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// JWT ID.
    pub jti: String,
    /// Subject.
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Issued at (epoch seconds).
    pub iat: i64,
    /// Expiry (epoch seconds).
    pub exp: i64,
    /// Token type; `refresh` for refresh tokens, absent for access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Public claims.
    #[serde(flatten)]
    pub claims: ClaimMap,
}

impl TokenClaims {
    /// Returns `true` for a refresh token.
    #[must_use]
    pub fn is_refresh(&self) -> bool {
        self.typ.as_deref() == Some(REFRESH_TOKEN_TYPE)
    }

    /// Returns `true` once `now` (epoch seconds) has reached `exp`.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp <= now
    }
}

/// Input to [`TokenIssuer::issue`].
#[derive(Clone, bon::Builder)]
pub struct IssueRequest {
    /// Subject of both tokens.
    #[builder(into)]
    pub subject: String,

    /// Public claims, embedded in every access token minted for the session.
    #[builder(default)]
    pub claims: ClaimMap,

    /// Sensitive claims, kept server-side only.
    #[builder(default)]
    pub secret_claims: ClaimMap,
}

impl fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueRequest")
            .field("subject", &self.subject)
            .field("claims", &self.claims)
            .field("secret_claims", &format_args!("<{} redacted>", self.secret_claims.len()))
            .finish()
    }
}

/// An access token and refresh token minted together.
#[derive(Clone)]
pub struct IssuedTokens {
    /// Signed access token.
    pub access_token: Zeroizing<String>,
    /// `jti` of the access token.
    pub access_jti: String,
    /// Expiry of the access token.
    pub access_expires_on: DateTime<Utc>,
    /// Signed refresh token.
    pub refresh_token: Zeroizing<String>,
    /// `jti` of the refresh token.
    pub refresh_jti: String,
    /// Expiry of the refresh token.
    pub refresh_expires_on: DateTime<Utc>,
    /// Signing key of both tokens.
    pub kid: String,
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("access_token", &"<redacted>")
            .field("access_jti", &self.access_jti)
            .field("access_expires_on", &self.access_expires_on)
            .field("refresh_token", &"<redacted>")
            .field("refresh_jti", &self.refresh_jti)
            .field("refresh_expires_on", &self.refresh_expires_on)
            .field("kid", &self.kid)
            .finish()
    }
}

fn expiry(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    TimeDelta::try_seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX))
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn reject_reserved(claims: &ClaimMap) -> Result<(), AuthError> {
    match claims.keys().find(|name| RESERVED_CLAIMS.contains(&name.as_str())) {
        Some(name) => Err(AuthError::malformed(format!("claim '{name}' is reserved"))),
        None => Ok(()),
    }
}

fn session_entry(
    subject: &str,
    secret_claims: &ClaimMap,
    issued_on: DateTime<Utc>,
    pair: &SigningKeyPair,
) -> Result<SessionEntry, serde_json::Error> {
    Ok(SessionEntry::builder()
        .subject(subject)
        .secret_claims(secret_claims.clone())
        .issued_on(issued_on)
        .verification_jwk(serde_json::to_value(PublicJwk::from(pair))?)
        .build())
}

async fn mirror_session(
    sessions: &dyn SessionStore,
    jwt_id: &str,
    entry: &SessionEntry,
    ttl: Duration,
) {
    if let Err(err) = sessions.put(jwt_id, entry, ttl).await {
        tracing::warn!(jti = jwt_id, error = %err, "session mirror write failed");
    }
}

/// A token pair that is signed but not yet recorded anywhere.
pub(crate) struct SignedPair {
    pair: SigningKeyPair,
    issued_on: DateTime<Utc>,
    access_claims: TokenClaims,
    access_token: Zeroizing<String>,
    access_expires_on: DateTime<Utc>,
    refresh_claims: TokenClaims,
    refresh_token: Zeroizing<String>,
    refresh_expires_on: DateTime<Utc>,
}

/// Mints, records, and verifies tokens.
#[derive(bon::Builder)]
pub struct TokenIssuer {
    config: CredentialConfig,
    clock: Arc<dyn Clock>,
    key_store: Arc<dyn SigningKeyStore>,
    token_store: Arc<dyn TokenStore>,
    jwks: Arc<JwksCache>,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl TokenIssuer {
    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Clock used for `iat`, `exp`, and block selection.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Token bookkeeping store.
    #[must_use]
    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.token_store
    }

    /// Verification key cache.
    #[must_use]
    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Issues a fresh access token and refresh token for `request.subject`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Malformed`] if a claim name is reserved
    /// - [`AuthError::NoSigningKey`] if the current block has no usable key
    /// - [`AuthError::StorageUnavailable`] if a store fails
    #[tracing::instrument(skip(self, request), fields(subject = %request.subject))]
    pub async fn issue(&self, request: IssueRequest) -> Result<IssuedTokens, AuthError> {
        reject_reserved(&request.claims)?;
        let now = self.clock.now();
        self.mint(&request.subject, &request.claims, &request.secret_claims, now).await
    }

    pub(crate) async fn mint(
        &self,
        subject: &str,
        claims: &ClaimMap,
        secret_claims: &ClaimMap,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens, AuthError> {
        let signed = self.sign(subject, claims, now).await?;
        self.record(signed, secret_claims).await
    }

    /// Signs a token pair with the current block's key without writing a row.
    ///
    /// Every failure that is not a store write happens here, so a caller can
    /// sign before committing to anything irreversible.
    pub(crate) async fn sign(
        &self,
        subject: &str,
        claims: &ClaimMap,
        now: DateTime<Utc>,
    ) -> Result<SignedPair, AuthError> {
        let block = block_start(now.timestamp(), self.config.block_size(), 0);
        let Some(pair) = self.key_store.signing_key_for_block(block).await? else {
            tracing::warn!(block, "no signing key assigned to the current block");
            return Err(AuthError::no_signing_key(block));
        };
        let key = encoding_key(&pair)?;

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(pair.kid.clone());

        let access_expires_on = expiry(now, self.config.access_token_ttl_secs());
        let refresh_expires_on = expiry(now, self.config.refresh_token_ttl_secs());

        let access_claims = TokenClaims {
            jti: Uuid::new_v4().to_string(),
            sub: subject.to_owned(),
            iss: self.config.issuer().to_owned(),
            iat: now.timestamp(),
            exp: access_expires_on.timestamp(),
            typ: None,
            claims: claims.clone(),
        };
        let refresh_claims = TokenClaims {
            jti: Uuid::new_v4().to_string(),
            sub: subject.to_owned(),
            iss: self.config.issuer().to_owned(),
            iat: now.timestamp(),
            exp: refresh_expires_on.timestamp(),
            typ: Some(REFRESH_TOKEN_TYPE.to_owned()),
            claims: ClaimMap::new(),
        };

        let sign = |claims: &TokenClaims| {
            jsonwebtoken::encode(&header, claims, &key)
                .map(Zeroizing::new)
                .map_err(|e| AuthError::key_generation_failed(format!("signing failed: {e}")))
        };
        let access_token = sign(&access_claims)?;
        let refresh_token = sign(&refresh_claims)?;

        Ok(SignedPair {
            pair,
            issued_on: now,
            access_claims,
            access_token,
            access_expires_on,
            refresh_claims,
            refresh_token,
            refresh_expires_on,
        })
    }

    /// Writes the rows for a signed pair, mirrors the session, and hands the
    /// tokens out.
    pub(crate) async fn record(
        &self,
        signed: SignedPair,
        secret_claims: &ClaimMap,
    ) -> Result<IssuedTokens, AuthError> {
        let SignedPair {
            pair,
            issued_on,
            access_claims,
            access_token,
            access_expires_on,
            refresh_claims,
            refresh_token,
            refresh_expires_on,
        } = signed;

        self.token_store
            .put_access_token(
                &AccessToken::builder()
                    .jti(access_claims.jti.as_str())
                    .subject(access_claims.sub.as_str())
                    .secret_claims(secret_claims.clone())
                    .kid(pair.kid.as_str())
                    .issued_on(issued_on)
                    .expires_on(access_expires_on)
                    .build(),
            )
            .await?;
        self.token_store
            .put_refresh_token(
                &RefreshToken::builder()
                    .jti(refresh_claims.jti.as_str())
                    .subject(refresh_claims.sub.as_str())
                    .token(refresh_token.clone())
                    .claims(access_claims.claims.clone())
                    .secret_claims(secret_claims.clone())
                    .issued_on(issued_on)
                    .expires_on(refresh_expires_on)
                    .kid(pair.kid.as_str())
                    .build(),
            )
            .await?;

        if let Some(sessions) = &self.sessions {
            match session_entry(&access_claims.sub, secret_claims, issued_on, &pair) {
                Ok(entry) => {
                    let ttl = self.config.access_token_ttl();
                    mirror_session(sessions.as_ref(), &access_claims.jti, &entry, ttl).await;
                },
                Err(err) => tracing::warn!(error = %err, "session mirror skipped"),
            }
        }

        tracing::info!(
            audit.action = "tokens_issued",
            audit.kid = %pair.kid,
            audit.access_jti = %access_claims.jti,
            audit.refresh_jti = %refresh_claims.jti,
            "audit_event"
        );

        Ok(IssuedTokens {
            access_token,
            access_jti: access_claims.jti,
            access_expires_on,
            refresh_token,
            refresh_jti: refresh_claims.jti,
            refresh_expires_on,
            kid: pair.kid,
        })
    }

    /// Looks up the session behind an access token's `jti`.
    ///
    /// Reads the session mirror first. A miss, a mirror failure, or an
    /// issuer without a mirror falls through to the access-token row, and a
    /// rebuilt entry is written back to the mirror for the token's remaining
    /// lifetime.
    ///
    /// Returns `None` only when the access token is unknown or expired.
    ///
    /// # Errors
    ///
    /// [`AuthError::StorageUnavailable`] if the token store or key store
    /// fails. Mirror failures are logged and never surface.
    #[tracing::instrument(skip(self))]
    pub async fn session(&self, jwt_id: &str) -> Result<Option<SessionEntry>, AuthError> {
        if let Some(sessions) = &self.sessions {
            match sessions.get(jwt_id).await {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => tracing::debug!(jti = jwt_id, "session mirror miss"),
                Err(err) => {
                    tracing::warn!(jti = jwt_id, error = %err, "session mirror read failed");
                },
            }
        }

        let now = self.clock.now();
        let Some(row) = self.token_store.get_access_token(jwt_id).await? else {
            return Ok(None);
        };
        if row.is_expired_at(now) {
            return Ok(None);
        }
        let Some(pair) = self.key_store.get_key_pair(&row.kid).await? else {
            tracing::warn!(jti = jwt_id, kid = %row.kid, "access token outlived its signing key");
            return Ok(None);
        };
        let entry = session_entry(&row.subject, &row.secret_claims, row.issued_on, &pair)
            .map_err(StorageError::from)?;

        if let (Some(sessions), Ok(remaining)) =
            (&self.sessions, (row.expires_on - now).to_std())
        {
            mirror_session(sessions.as_ref(), jwt_id, &entry, remaining).await;
        }
        Ok(Some(entry))
    }

    /// Checks signature and issuer, leaving expiry to the caller.
    pub(crate) fn decode_verified(
        &self,
        token: &str,
        key: &DecodingKey,
    ) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_issuer(&[self.config.issuer()]);

        Ok(decode::<TokenClaims>(token, key, &validation)?.claims)
    }

    /// Verifies an access token and returns its claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Malformed`] if the token or its `kid` cannot be parsed
    /// - [`AuthError::UnsupportedAlgorithm`] for any algorithm but EdDSA
    /// - [`AuthError::InvalidSignature`] for an unknown key, a bad signature,
    ///   a foreign issuer, or a refresh token
    /// - [`AuthError::NotFoundOrExpired`] once the token has expired
    #[tracing::instrument(skip(self, token))]
    pub async fn verify_access_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::malformed(format!("JWT header: {e}")))?;
        validate_algorithm(&format!("{:?}", header.alg))?;

        let kid = header.kid.ok_or_else(|| AuthError::malformed("JWT header missing 'kid'"))?;
        validate_kid(&kid)?;

        let key = self.jwks.decoding_key(&kid).await?;
        let claims = self.decode_verified(token, &key)?;

        if claims.is_refresh() {
            tracing::debug!(kid = %kid, "refresh token presented as access token");
            return Err(AuthError::invalid_signature());
        }
        if claims.is_expired_at(self.clock.now_secs()) {
            return Err(AuthError::not_found_or_expired());
        }

        tracing::debug!(kid = %kid, jti = %claims.jti, "access token verified");
        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;
    use tollgate_storage::{
        MemoryBackend, StorageBackend,
        auth::{MemorySessionMirror, SESSION_PREFIX, SessionMirror, SessionStore},
    };

    use super::*;
    use crate::testutil::{TestEngine, craft_raw_jwt};

    #[tokio::test]
    async fn test_issue_without_key_fails() {
        let engine = TestEngine::new(1_000);
        let result = engine.issuer.issue(IssueRequest::builder().subject("user-1").build()).await;
        assert!(matches!(result, Err(AuthError::NoSigningKey { block: 960 })));
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;

        let mut claims = ClaimMap::new();
        claims.insert("scope".into(), json!("read"));
        let issued = engine
            .issuer
            .issue(IssueRequest::builder().subject("user-1").claims(claims).build())
            .await
            .unwrap();

        let verified = engine.issuer.verify_access_token(&issued.access_token).await.unwrap();
        assert_eq!(verified.sub, "user-1");
        assert_eq!(verified.jti, issued.access_jti);
        assert_eq!(verified.iss, "tollgate");
        assert_eq!(verified.exp - verified.iat, 300);
        assert_eq!(verified.claims["scope"], "read");
        assert!(verified.typ.is_none());
    }

    #[tokio::test]
    async fn test_issue_records_rows() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;
        let issued =
            engine.issuer.issue(IssueRequest::builder().subject("user-1").build()).await.unwrap();

        let access = engine.tokens.get_access_token(&issued.access_jti).await.unwrap().unwrap();
        assert_eq!(access.kid, issued.kid);
        assert_eq!(access.subject, "user-1");

        let refresh = engine
            .tokens
            .find_refresh_by_jti_not_expired(&issued.refresh_jti, engine.clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refresh.subject, "user-1");
        assert_eq!(*refresh.token, *issued.refresh_token);
        assert_eq!(refresh.version_no, 0);
    }

    #[tokio::test]
    async fn test_issue_mirrors_session() {
        let mirror = Arc::new(MemorySessionMirror::default());
        let engine = TestEngine::with_sessions(1_000, mirror.clone());
        engine.rotate().await;

        let mut secret = ClaimMap::new();
        secret.insert("ssn".into(), json!("000-00-0000"));
        let issued = engine
            .issuer
            .issue(IssueRequest::builder().subject("user-1").secret_claims(secret).build())
            .await
            .unwrap();

        let entry = mirror.get(&issued.access_jti).await.unwrap().unwrap();
        assert_eq!(entry.subject, "user-1");
        assert_eq!(entry.secret_claims["ssn"], "000-00-0000");
        assert_eq!(entry.verification_jwk["kid"], issued.kid.as_str());
    }

    async fn issue_with_secret(engine: &TestEngine) -> IssuedTokens {
        let mut secret = ClaimMap::new();
        secret.insert("ssn".into(), json!("000-00-0000"));
        engine
            .issuer
            .issue(IssueRequest::builder().subject("user-1").secret_claims(secret).build())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_read_from_mirror() {
        let mirror = Arc::new(MemorySessionMirror::default());
        let engine = TestEngine::with_sessions(1_000, mirror.clone());
        engine.rotate().await;
        let issued = issue_with_secret(&engine).await;

        let from_mirror = mirror.get(&issued.access_jti).await.unwrap().unwrap();
        let session = engine.issuer.session(&issued.access_jti).await.unwrap().unwrap();
        assert_eq!(session, from_mirror);
    }

    #[tokio::test]
    async fn test_session_falls_back_when_mirror_entry_is_gone() {
        let mirror = Arc::new(MemorySessionMirror::default());
        let engine = TestEngine::with_sessions(1_000, mirror.clone());
        engine.rotate().await;
        let issued = issue_with_secret(&engine).await;

        mirror.remove(&issued.access_jti).await.unwrap();
        let session = engine.issuer.session(&issued.access_jti).await.unwrap().unwrap();
        assert_eq!(session.subject, "user-1");
        assert_eq!(session.secret_claims["ssn"], "000-00-0000");
        assert_eq!(session.verification_jwk["kid"], issued.kid.as_str());
        assert_eq!(session.issued_on.timestamp(), 1_000);

        let restored = mirror.get(&issued.access_jti).await.unwrap();
        assert_eq!(restored, Some(session));
    }

    #[tokio::test]
    async fn test_session_survives_unreadable_mirror_entry() {
        let backend = MemoryBackend::new();
        let mirror = Arc::new(SessionMirror::new(backend.clone()));
        let engine = TestEngine::with_sessions(1_000, mirror.clone());
        engine.rotate().await;
        let issued = issue_with_secret(&engine).await;

        let key = format!("{SESSION_PREFIX}{}", issued.access_jti).into_bytes();
        backend.set(key, b"not json".to_vec()).await.unwrap();
        assert!(mirror.get(&issued.access_jti).await.is_err());

        let session = engine.issuer.session(&issued.access_jti).await.unwrap().unwrap();
        assert_eq!(session.secret_claims["ssn"], "000-00-0000");
    }

    #[tokio::test]
    async fn test_session_without_mirror_reads_token_rows() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;
        let issued = issue_with_secret(&engine).await;

        let session = engine.issuer.session(&issued.access_jti).await.unwrap().unwrap();
        assert_eq!(session.subject, "user-1");
        assert_eq!(session.secret_claims["ssn"], "000-00-0000");

        engine.clock.advance(300);
        assert!(engine.issuer.session(&issued.access_jti).await.unwrap().is_none());
        assert!(engine.issuer.session("unknown-jti").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_fallback_surfaces_key_store_failure() {
        let mirror = Arc::new(MemorySessionMirror::default());
        let engine = TestEngine::with_sessions(1_000, mirror.clone());
        engine.rotate().await;
        let issued = issue_with_secret(&engine).await;

        // A mirror hit never touches the key store.
        engine.keys.set_failing(true);
        assert!(engine.issuer.session(&issued.access_jti).await.unwrap().is_some());

        mirror.remove(&issued.access_jti).await.unwrap();
        let result = engine.issuer.session(&issued.access_jti).await;
        assert!(matches!(result, Err(AuthError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_secret_claims_stay_out_of_tokens() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;

        let mut secret = ClaimMap::new();
        secret.insert("ssn".into(), json!("000-00-0000"));
        let issued = engine
            .issuer
            .issue(IssueRequest::builder().subject("user-1").secret_claims(secret).build())
            .await
            .unwrap();

        let verified = engine.issuer.verify_access_token(&issued.access_token).await.unwrap();
        assert!(!verified.claims.contains_key("ssn"));
        assert!(!format!("{issued:?}").contains(issued.access_token.as_str()));
    }

    #[tokio::test]
    async fn test_reserved_claims_rejected() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;

        let mut claims = ClaimMap::new();
        claims.insert("exp".into(), json!(0));
        let result = engine
            .issuer
            .issue(IssueRequest::builder().subject("user-1").claims(claims).build())
            .await;
        assert!(matches!(result, Err(AuthError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_expired_access_token_rejected() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;
        let issued =
            engine.issuer.issue(IssueRequest::builder().subject("user-1").build()).await.unwrap();

        engine.clock.advance(300);
        let result = engine.issuer.verify_access_token(&issued.access_token).await;
        assert!(matches!(result, Err(AuthError::NotFoundOrExpired)));
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_an_access_token() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;
        let issued =
            engine.issuer.issue(IssueRequest::builder().subject("user-1").build()).await.unwrap();

        let result = engine.issuer.verify_access_token(&issued.refresh_token).await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_symmetric_algorithm_rejected_before_lookup() {
        let engine = TestEngine::new(1_000);
        let token = craft_raw_jwt(
            &json!({"alg": "HS256", "typ": "JWT", "kid": "k1"}),
            &json!({"jti": "a", "sub": "s"}),
        );
        let result = engine.issuer.verify_access_token(&token).await;
        assert!(matches!(result, Err(AuthError::UnsupportedAlgorithm(_))));
        assert_eq!(engine.jwks.recompute_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_or_hostile_kid_rejected() {
        let engine = TestEngine::new(1_000);
        let no_kid = craft_raw_jwt(&json!({"alg": "EdDSA"}), &json!({"jti": "a"}));
        assert!(matches!(
            engine.issuer.verify_access_token(&no_kid).await,
            Err(AuthError::Malformed(_))
        ));

        let traversal =
            craft_raw_jwt(&json!({"alg": "EdDSA", "kid": "../../etc"}), &json!({"jti": "a"}));
        assert!(matches!(
            engine.issuer.verify_access_token(&traversal).await,
            Err(AuthError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_kid_is_invalid_signature() {
        let engine = TestEngine::new(1_000);
        engine.rotate().await;
        let token = craft_raw_jwt(
            &json!({"alg": "EdDSA", "kid": "not-a-key"}),
            &json!({"jti": "a", "sub": "s", "iss": "tollgate", "iat": 0, "exp": 9_999_999_999i64}),
        );
        assert!(matches!(
            engine.issuer.verify_access_token(&token).await,
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_issue_request_debug_redacts_secret_claims() {
        let mut secret = ClaimMap::new();
        secret.insert("password".into(), json!("hunter2"));
        let request = IssueRequest::builder().subject("user-1").secret_claims(secret).build();
        let debug = format!("{request:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<1 redacted>"));
    }

    #[test]
    fn test_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(expiry(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(expiry(now, 60), now + TimeDelta::seconds(60));
    }
}
