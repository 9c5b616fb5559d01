//! Single-slot read cache for the "list all bookings" snapshot.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::model::Booking;

/// Shared, immutable view of every booking.
pub type Snapshot = Arc<Vec<Booking>>;

/// Issued on a miss. Handing it back to `set` proves no invalidation happened in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Snapshot),
    Miss(Ticket),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Cache seam injected into the engine.
pub trait ReadCache: Send + Sync {
    fn get(&self) -> Result<Lookup, CacheError>;

    /// Store `snapshot` unless the slot was invalidated after `ticket` was issued.
    /// Returns whether it was stored.
    fn set(&self, ticket: Ticket, snapshot: Snapshot) -> Result<bool, CacheError>;

    fn invalidate(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<(Snapshot, Instant)>,
    generation: u64,
}

/// In-process cache: one slot, one mutex, optional TTL.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    slot: Mutex<Slot>,
    ttl: Option<Duration>,
}

impl SnapshotCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            ttl,
        }
    }

    fn fresh(&self, stored_at: Instant) -> bool {
        self.ttl.is_none_or(|ttl| stored_at.elapsed() < ttl)
    }
}

impl ReadCache for SnapshotCache {
    fn get(&self) -> Result<Lookup, CacheError> {
        let slot = self.slot.lock().map_err(|_| CacheError::Poisoned)?;
        match &slot.snapshot {
            Some((snapshot, stored_at)) if self.fresh(*stored_at) => Ok(Lookup::Hit(snapshot.clone())),
            _ => Ok(Lookup::Miss(Ticket(slot.generation))),
        }
    }

    fn set(&self, ticket: Ticket, snapshot: Snapshot) -> Result<bool, CacheError> {
        let mut slot = self.slot.lock().map_err(|_| CacheError::Poisoned)?;
        if slot.generation != ticket.0 {
            return Ok(false);
        }
        slot.snapshot = Some((snapshot, Instant::now()));
        Ok(true)
    }

    fn invalidate(&self) -> Result<(), CacheError> {
        let mut slot = self.slot.lock().map_err(|_| CacheError::Poisoned)?;
        slot.snapshot = None;
        slot.generation += 1;
        Ok(())
    }
}
