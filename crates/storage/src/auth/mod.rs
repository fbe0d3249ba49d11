//! Credential entities and their stores.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌─────────────────┐   ┌──────────────────┐
//! │ SigningKeyStore  │   │   TokenStore    │   │  SessionMirror   │
//! │ key pairs +      │◄──│ access/refresh  │   │  TTL read cache  │
//! │ block assignments│kid│ rows, jti index │   │  (advisory)      │
//! └────────┬─────────┘   └────────┬────────┘   └────────┬─────────┘
//!          └──────────────────────┼─────────────────────┘
//!                                 ▼
//!                          StorageBackend
//! ```
//!
//! # Key Storage
//!
//! | Prefix | Entity |
//! |--------|--------|
//! | `signing-keys/` | [`SigningKeyPair`] |
//! | `block-assignments/` | [`BlockAssignment`] |
//! | `access-tokens/` | [`AccessToken`] |
//! | `refresh-tokens/`, `refresh-token-jti/` | [`RefreshToken`] and its `jti` index |
//! | `sessions/` | [`SessionEntry`] |
//!
//! Each store is generic over the backend; the `Memory*` aliases bind them to
//! [`MemoryBackend`](crate::MemoryBackend).

mod session;
mod signing_key;
mod store;
mod token;
mod token_store;

pub use session::{
    MemorySessionMirror, SESSION_PREFIX, SessionEntry, SessionMirror, SessionStore,
};
pub use signing_key::{BlockAssignment, SigningKeyPair};
pub use store::{
    BLOCK_ASSIGNMENT_PREFIX, BackendSigningKeyStore, MemorySigningKeyStore, SIGNING_KEY_PREFIX,
    SigningKeyStore,
};
pub use token::{AccessToken, ClaimMap, RefreshToken};
pub use token_store::{
    ACCESS_TOKEN_PREFIX, BackendTokenStore, ExpiredTokenCounts, MemoryTokenStore,
    REFRESH_JTI_INDEX_PREFIX, REFRESH_TOKEN_PREFIX, TokenStore,
};
