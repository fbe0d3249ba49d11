//! Persistence for tollgate credentials.
//!
//! Two layers:
//!
//! - [`StorageBackend`]: ordered bytes with conditional writes and expiry,
//!   implemented in-process by [`MemoryBackend`]
//! - [`auth`]: typed stores for signing keys, block assignments, issued
//!   tokens, and mirrored sessions, generic over any backend
//!
//! ```text
//!   tollgate-authn (rotation, JWKS, issuance, refresh)
//!          │
//!          ▼
//!   SigningKeyStore   TokenStore   SessionStore
//!          │               │             │
//!          └───────────────┼─────────────┘
//!                          ▼
//!                   StorageBackend ──► MemoryBackend
//! ```
//!
//! ```
//! use tollgate_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     backend.compare_and_set(b"refresh:1", None, b"v0".to_vec()).await?;
//!     assert!(backend.get(b"refresh:1").await?.is_some());
//!     Ok(())
//! }
//! ```
//!
//! Features: `testutil` exposes [`testutil`] fixtures and assertion macros;
//! `failpoints` arms the `fail` injection points in the memory backend and
//! the token store.

#![deny(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod types;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use types::KeyValue;
pub use zeroize::Zeroizing;
