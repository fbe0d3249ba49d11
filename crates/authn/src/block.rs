//! Time-block arithmetic and the injectable clock.
//!
//! Time is tiled into fixed-width blocks of `size` seconds. Signing keys are
//! assigned per block, so every component that needs "the current key" asks
//! for the key of `block_start(now, size, 0)`.
//!
//! ```text
//!   offset:   -1        0        +1
//!         ├────────┼────────┼────────┤
//!       -240       0  ▲    240      480
//!                     now = 100
//! ```

use std::num::NonZeroU32;

use chrono::{DateTime, Utc};

/// Returns the start of the block `offset` blocks away from the one that
/// contains `now`, in epoch seconds.
///
/// Floor division is Euclidean, so negative timestamps tile the same way as
/// positive ones.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroU32;
/// use tollgate_authn::block::block_start;
///
/// let size = NonZeroU32::new(10).unwrap();
/// assert_eq!(block_start(7, size, 0), 0);
/// assert_eq!(block_start(7, size, 1), 10);
/// assert_eq!(block_start(7, size, -1), -10);
/// ```
#[must_use]
pub fn block_start(now: i64, size: NonZeroU32, offset: i64) -> i64 {
    let size = i64::from(size.get());
    (now.div_euclid(size) + offset) * size
}

/// Returns the first block start that is `>= t`.
#[must_use]
pub fn first_block_at_or_after(t: i64, size: NonZeroU32) -> i64 {
    let start = block_start(t, size, 0);
    if start == t { start } else { start + i64::from(size.get()) }
}

/// Returns the oldest block whose key may have signed an access token that is
/// still unexpired somewhere inside `block`.
///
/// A token lives `access_ttl_secs` after issuance, so any instant in the block
/// starting at `block` can still see tokens issued after `block - ttl`. The
/// result never starts later than the previous block.
///
/// ```
/// use std::num::NonZeroU32;
/// use tollgate_authn::block::oldest_live_signing_block;
///
/// let size = NonZeroU32::new(240).unwrap();
/// assert_eq!(oldest_live_signing_block(480, size, 300), 0);
/// assert_eq!(oldest_live_signing_block(480, size, 60), 240);
/// ```
#[must_use]
pub fn oldest_live_signing_block(block: i64, size: NonZeroU32, access_ttl_secs: u64) -> i64 {
    let ttl = i64::try_from(access_ttl_secs).unwrap_or(i64::MAX);
    let issued_after = block_start(block, size, 0).saturating_sub(ttl);
    block_start(issued_after, size, 0).min(block_start(block, size, -1))
}

/// Source of the current time.
///
/// Every time-dependent component takes a clock so tests can drive block
/// boundaries deterministically.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time in epoch seconds.
    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
