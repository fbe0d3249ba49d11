//! Process-local [`StorageBackend`].
//!
//! Every credential store in this crate runs against [`MemoryBackend`] in
//! tests, and a single-node deployment can run on it directly. All rows live
//! in one ordered table guarded by a [`parking_lot::RwLock`]; each row carries
//! its own optional deadline.
//!
//! A row past its deadline is invisible to every read and to
//! [`compare_and_set`](StorageBackend::compare_and_set) the moment the
//! deadline passes. A sweeper task drops such rows from the table once per
//! [`SWEEP_INTERVAL`]; until then they only cost memory.
//!
//! ```
//! use tollgate_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//! backend.set(b"session:abc".to_vec(), b"{}".to_vec()).await.unwrap();
//! assert!(backend.get(b"session:abc").await.unwrap().is_some());
//! # });
//! ```

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    types::KeyValue,
};

/// How often the sweeper drops rows whose deadline has passed.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Row {
    value: Bytes,
    deadline: Option<Instant>,
}

impl Row {
    fn permanent(value: Vec<u8>) -> Self {
        Self { value: Bytes::from(value), deadline: None }
    }

    fn is_live_at(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| deadline > now)
    }
}

type Table = BTreeMap<Vec<u8>, Row>;

#[derive(Default)]
struct Shared {
    table: RwLock<Table>,
    sweeper_stopped: AtomicBool,
}

impl Shared {
    fn sweep(&self, now: Instant) -> usize {
        let mut table = self.table.write();
        let before = table.len();
        table.retain(|_, row| row.is_live_at(now));
        before - table.len()
    }
}

/// In-memory, ordered key-value table.
///
/// Clones share one table. The sweeper holds only a weak handle, so it
/// exits once the last clone is dropped; [`stop_sweeper`](Self::stop_sweeper)
/// ends it earlier.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Creates an empty backend and spawns its sweeper.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        tokio::spawn(run_sweeper(Arc::downgrade(&shared)));
        Self { shared }
    }

    /// Stops the sweeper. Expired rows stay invisible but are no longer
    /// reclaimed. Idempotent.
    pub fn stop_sweeper(&self) {
        self.shared.sweeper_stopped.store(true, Ordering::Release);
    }

    /// Number of rows held, counting expired rows not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.table.read().len()
    }

    /// Returns `true` if the table holds no rows at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.table.read().is_empty()
    }

    fn write_row(&self, key: Vec<u8>, row: Row) {
        self.shared.table.write().insert(key, row);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("rows", &self.len()).finish()
    }
}

async fn run_sweeper(shared: Weak<Shared>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.sweeper_stopped.load(Ordering::Acquire) {
            return;
        }
        let swept = shared.sweep(Instant::now());
        if swept > 0 {
            tracing::trace!(swept, "swept expired rows");
        }
    }
}

/// Converts owned-key bounds to slice bounds, or `None` when the range
/// cannot contain anything. `BTreeMap::range` panics on inverted bounds.
fn slice_bounds<R>(range: &R) -> Option<(Bound<&[u8]>, Bound<&[u8]>)>
where
    R: RangeBounds<Vec<u8>>,
{
    let start = range.start_bound().map(Vec::as_slice);
    let end = range.end_bound().map(Vec::as_slice);
    let empty = match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s) | Bound::Excluded(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
        _ => false,
    };
    (!empty).then_some((start, end))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let now = Instant::now();
        let table = self.shared.table.read();
        Ok(table.get(key).filter(|row| row.is_live_at(now)).map(|row| row.value.clone()))
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.write_row(key, Row::permanent(value));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        fail_point!("memory-compare-and-set", |_| {
            Err(StorageError::connection("injected compare_and_set failure"))
        });

        let now = Instant::now();
        let mut table = self.shared.table.write();
        let current = table.get(key).filter(|row| row.is_live_at(now)).map(|row| &row.value[..]);
        if current != expected {
            return Err(StorageError::Conflict);
        }
        table.insert(key.to_vec(), Row::permanent(new_value));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.shared.table.write().remove(key);
        Ok(())
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let Some(bounds) = slice_bounds(&range) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let table = self.shared.table.read();
        Ok(table
            .range::<[u8], _>(bounds)
            .filter(|(_, row)| row.is_live_at(now))
            .map(|(key, row)| KeyValue::new(Bytes::copy_from_slice(key), row.value.clone()))
            .collect())
    }

    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let Some(bounds) = slice_bounds(&range) else {
            return Ok(());
        };
        let mut table = self.shared.table.write();
        let doomed: Vec<Vec<u8>> =
            table.range::<[u8], _>(bounds).map(|(key, _)| key.clone()).collect();
        for key in &doomed {
            table.remove(key);
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let row = Row { value: Bytes::from(value), deadline: Instant::now().checked_add(ttl) };
        self.write_row(key, row);
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        fail_point!("memory-health-check", |_| {
            Err(StorageError::internal("injected health check failure"))
        });
        let rows = self.shared.table.read().len();
        tracing::trace!(rows, "memory backend healthy");
        Ok(())
    }
}
