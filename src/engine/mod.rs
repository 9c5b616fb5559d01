mod cache;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use cache::{CacheError, Lookup, ReadCache, Snapshot, SnapshotCache, Ticket};
pub use conflict::{conflicting, overlaps};
pub use error::{BookingError, StoreError};
pub use store::{BookingStore, InsertOutcome, UpdateOutcome, WalStore};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Re-run the overlap check when an update touches room, date or times.
    pub revalidate_updates: bool,
}

/// Booking core: overlap validation in front of the store, read cache beside it.
pub struct Engine<S = WalStore, C = SnapshotCache> {
    store: S,
    cache: C,
    config: EngineConfig,
}

impl Engine {
    /// WAL-backed store with the in-process snapshot cache.
    pub fn open(
        wal_path: PathBuf,
        compact_threshold: u64,
        cache_ttl: Option<Duration>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let store = WalStore::open(wal_path, compact_threshold)?;
        Ok(Self::new(store, SnapshotCache::new(cache_ttl), config))
    }
}

impl<S: BookingStore, C: ReadCache> Engine<S, C> {
    pub fn new(store: S, cache: C, config: EngineConfig) -> Self {
        Self { store, cache, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Drop the cached snapshot after a persisted mutation.
    ///
    /// The write already happened, so a cache failure is logged rather than
    /// reported as a failed mutation.
    fn invalidate_cache(&self) {
        if let Err(e) = self.cache.invalidate() {
            warn!("cache invalidation failed: {e}");
            metrics::counter!(crate::observability::CACHE_ERRORS_TOTAL).increment(1);
        }
    }
}
