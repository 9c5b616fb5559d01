use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS;
use crate::model::*;
use crate::wal::Wal;

use super::conflict::{conflicting, validate_booking};
use super::{BookingError, StoreError};

pub enum InsertOutcome {
    Inserted(Booking),
    /// Id of an existing booking that overlaps the candidate.
    Conflict(Ulid),
    /// The store already holds `MAX_BOOKINGS` records.
    Full,
}

pub enum UpdateOutcome {
    Updated(Booking),
    NotFound,
    Conflict(Ulid),
    /// The merged record is not a valid booking (e.g. start moved past end).
    Rejected(BookingError),
}

/// Storage seam under the engine.
///
/// `insert_if_free` and `update_by_id` run the overlap check and the write as one
/// atomic step; implementations must not let a concurrent write slip between them.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_overlapping(
        &self,
        room: &str,
        date: &str,
        range: &TimeRange,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn insert_if_free(&self, booking: Booking) -> Result<InsertOutcome, StoreError>;

    async fn find_all(&self) -> Result<Vec<Booking>, StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Merge `patch` into the stored record. With `revalidate`, the merged range is
    /// checked against the other bookings on its room/date first.
    async fn update_by_id(
        &self,
        id: Ulid,
        patch: &BookingPatch,
        revalidate: bool,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Number of records removed (0 or 1).
    async fn delete_by_id(&self, id: Ulid) -> Result<usize, StoreError>;

    async fn delete_all(&self) -> Result<usize, StoreError>;
}

// ── In-memory state ──────────────────────────────────────

type SlotKey = (String, String);

fn slot_key(b: &Booking) -> SlotKey {
    (b.room.clone(), b.date.clone())
}

#[derive(Debug, Default)]
struct StoreState {
    /// ULIDs sort by creation time, so iteration order is insertion order.
    bookings: BTreeMap<Ulid, Booking>,
    /// (room, date) → ids booked on it.
    slots: HashMap<SlotKey, Vec<Ulid>>,
    appends_since_compact: u64,
}

impl StoreState {
    fn on_slot<'a>(&'a self, room: &str, date: &str) -> impl Iterator<Item = &'a Booking> {
        self.slots
            .get(&(room.to_string(), date.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| self.bookings.get(id))
    }

    fn first_conflict(&self, candidate: &Booking, exclude: Option<Ulid>) -> Option<Ulid> {
        let range = candidate.time_range();
        conflicting(
            self.on_slot(&candidate.room, &candidate.date),
            &candidate.room,
            &candidate.date,
            &range,
            exclude,
        )
        .next()
        .map(|b| b.id)
    }

    fn index(&mut self, booking: &Booking) {
        self.slots.entry(slot_key(booking)).or_default().push(booking.id);
    }

    fn unindex(&mut self, booking: &Booking) {
        let key = slot_key(booking);
        if let Some(ids) = self.slots.get_mut(&key) {
            ids.retain(|id| *id != booking.id);
            if ids.is_empty() {
                self.slots.remove(&key);
            }
        }
    }

    fn remove(&mut self, id: &Ulid) -> Option<Booking> {
        let removed = self.bookings.remove(id)?;
        self.unindex(&removed);
        Some(removed)
    }

    fn put(&mut self, booking: Booking) {
        self.remove(&booking.id);
        self.index(&booking);
        self.bookings.insert(booking.id, booking);
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                self.put(booking.clone());
            }
            Event::BookingDeleted { id } => {
                self.remove(id);
            }
            Event::AllBookingsDeleted => {
                self.bookings.clear();
                self.slots.clear();
            }
        }
    }

    /// Minimal event list that recreates this state.
    fn compacted_events(&self) -> Vec<Event> {
        self.bookings
            .values()
            .map(|b| Event::BookingCreated { booking: b.clone() })
            .collect()
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL file.
/// Blocks for one append, drains every append already queued, then pays for a
/// single fsync and answers the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, flushes: Arc<AtomicU64>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_compact(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        flushes.fetch_add(1, Ordering::Relaxed);
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_compact(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after a failed append so stray buffered bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_compact(wal: &mut Wal, cmd: WalCommand) {
    if let WalCommand::Compact { events, response } = cmd {
        let result =
            Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
        let _ = response.send(result);
    }
}

// ── Slot locks ───────────────────────────────────────────

type SlotLocks = StdMutex<HashMap<SlotKey, Arc<Mutex<()>>>>;

/// Exclusive hold on one (room, date), from the overlap check until the event is applied.
struct SlotGuard<'a> {
    locks: &'a SlotLocks,
    key: SlotKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Nobody else holds or waits on it.
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Creates that passed the limit check but are not applied yet.
struct PendingCreate<'a>(&'a AtomicUsize);

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Slots a write to `current` touches: where it is, and where `patch` moves it.
fn slot_keys(current: &Booking, patch: Option<&BookingPatch>) -> Vec<SlotKey> {
    let mut keys = vec![slot_key(current)];
    if let Some(patch) = patch {
        keys.push(slot_key(&patch.merged_into(current)));
    }
    keys
}

// ── WAL-backed store ─────────────────────────────────────

/// Bookings held in memory, every mutation made durable in the WAL before it is applied.
///
/// Lock order: `barrier`, then slot locks in key order, then `state`. Writers on
/// different slots overlap their WAL round trips and share group-commit flushes.
pub struct WalStore {
    state: RwLock<StoreState>,
    /// Shared by single-slot writers; exclusive for delete-all and compaction.
    barrier: RwLock<()>,
    slot_locks: SlotLocks,
    pending_creates: AtomicUsize,
    wal_tx: mpsc::Sender<WalCommand>,
    compact_threshold: u64,
    flushes: Arc<AtomicU64>,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf, compact_threshold: u64) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let mut state = StoreState::default();
        for event in &events {
            state.apply(event);
        }
        debug!(
            events = events.len(),
            bookings = state.bookings.len(),
            "replayed {}",
            wal_path.display()
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let flushes = Arc::new(AtomicU64::new(0));
        tokio::spawn(wal_writer_loop(wal, wal_rx, flushes.clone()));

        Ok(Self {
            state: RwLock::new(state),
            barrier: RwLock::new(()),
            slot_locks: StdMutex::new(HashMap::new()),
            pending_creates: AtomicUsize::new(0),
            wal_tx,
            compact_threshold,
            flushes,
        })
    }

    async fn send_and_wait(
        &self,
        build: impl FnOnce(oneshot::Sender<io::Result<()>>) -> WalCommand,
    ) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx.send(build(tx)).await.map_err(|_| StoreError::Shutdown)?;
        rx.await
            .map_err(|_| StoreError::Shutdown)?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn lock_slots(&self, mut keys: Vec<SlotKey>) -> Vec<SlotGuard<'_>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = {
                let mut locks = self.slot_locks.lock().unwrap_or_else(PoisonError::into_inner);
                locks.entry(key.clone()).or_default().clone()
            };
            guards.push(SlotGuard {
                locks: &self.slot_locks,
                key,
                guard: Some(lock.lock_owned().await),
            });
        }
        guards
    }

    /// Lock every slot a write to booking `id` touches and return its current record.
    /// `None` if the booking does not exist.
    async fn lock_booking(
        &self,
        id: Ulid,
        patch: Option<&BookingPatch>,
    ) -> Option<(Vec<SlotGuard<'_>>, Booking)> {
        loop {
            let keys = {
                let state = self.state.read().await;
                slot_keys(state.bookings.get(&id)?, patch)
            };
            let guards = self.lock_slots(keys.clone()).await;
            let state = self.state.read().await;
            let current = state.bookings.get(&id)?;
            // Moved by a writer that held its old slot before we got it.
            if slot_keys(current, patch) == keys {
                return Some((guards, current.clone()));
            }
        }
    }

    /// WAL-append then apply. Caller holds the locks for every slot `event` touches.
    /// Returns whether compaction is due.
    async fn persist(&self, event: Event) -> Result<bool, StoreError> {
        self.send_and_wait(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?;
        let mut state = self.state.write().await;
        state.apply(&event);
        state.appends_since_compact += 1;
        Ok(state.appends_since_compact >= self.compact_threshold)
    }

    /// Caller holds `barrier` exclusively, so no append is in flight.
    async fn compact_exclusive(&self) -> Result<(), StoreError> {
        let events = self.state.read().await.compacted_events();
        let count = events.len();
        self.send_and_wait(|response| WalCommand::Compact { events, response })
            .await?;
        self.state.write().await.appends_since_compact = 0;
        debug!(bookings = count, "compacted WAL");
        Ok(())
    }

    async fn compact_after_write(&self) {
        // The mutation is already durable; a failed compaction only costs disk.
        if let Err(e) = self.compact_exclusive().await {
            warn!("WAL compaction failed: {e}");
        }
    }

    /// Called with no locks held after a write that crossed the threshold.
    async fn compact_if_due(&self, due: bool) {
        if !due {
            return;
        }
        let _exclusive = self.barrier.write().await;
        let still_due = self.state.read().await.appends_since_compact >= self.compact_threshold;
        if still_due {
            self.compact_after_write().await;
        }
    }

    /// Rewrite the WAL as one create per live booking.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.barrier.write().await;
        self.compact_exclusive().await
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.state.read().await.appends_since_compact
    }

    /// Group-commit flushes performed by the WAL writer so far.
    pub fn wal_flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.bookings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn find_overlapping(
        &self,
        room: &str,
        date: &str,
        range: &TimeRange,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError> {
        let state = self.state.read().await;
        Ok(conflicting(state.on_slot(room, date), room, date, range, exclude)
            .cloned()
            .collect())
    }

    async fn insert_if_free(&self, booking: Booking) -> Result<InsertOutcome, StoreError> {
        let due = {
            let _shared = self.barrier.read().await;
            let _slot = self.lock_slots(vec![slot_key(&booking)]).await;
            let in_flight = self.pending_creates.fetch_add(1, Ordering::AcqRel);
            let _pending = PendingCreate(&self.pending_creates);
            {
                let state = self.state.read().await;
                if state.bookings.len() + in_flight >= MAX_BOOKINGS {
                    return Ok(InsertOutcome::Full);
                }
                if let Some(existing) = state.first_conflict(&booking, None) {
                    return Ok(InsertOutcome::Conflict(existing));
                }
            }
            self.persist(Event::BookingCreated { booking: booking.clone() })
                .await?
        };
        self.compact_if_due(due).await;
        Ok(InsertOutcome::Inserted(booking))
    }

    async fn find_all(&self) -> Result<Vec<Booking>, StoreError> {
        Ok(self.state.read().await.bookings.values().cloned().collect())
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.state.read().await.bookings.get(&id).cloned())
    }

    async fn update_by_id(
        &self,
        id: Ulid,
        patch: &BookingPatch,
        revalidate: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let (merged, due) = {
            let _shared = self.barrier.read().await;
            let Some((_slots, current)) = self.lock_booking(id, Some(patch)).await else {
                return Ok(UpdateOutcome::NotFound);
            };
            let merged = patch.merged_into(&current);
            if let Err(e) = validate_booking(&merged) {
                return Ok(UpdateOutcome::Rejected(e));
            }
            if revalidate {
                let conflict = self.state.read().await.first_conflict(&merged, Some(id));
                if let Some(existing) = conflict {
                    return Ok(UpdateOutcome::Conflict(existing));
                }
            }
            let due = self
                .persist(Event::BookingUpdated { booking: merged.clone() })
                .await?;
            (merged, due)
        };
        self.compact_if_due(due).await;
        Ok(UpdateOutcome::Updated(merged))
    }

    async fn delete_by_id(&self, id: Ulid) -> Result<usize, StoreError> {
        let due = {
            let _shared = self.barrier.read().await;
            let Some((_slots, _)) = self.lock_booking(id, None).await else {
                return Ok(0);
            };
            self.persist(Event::BookingDeleted { id }).await?
        };
        self.compact_if_due(due).await;
        Ok(1)
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let _exclusive = self.barrier.write().await;
        let count = self.state.read().await.bookings.len();
        if self.persist(Event::AllBookingsDeleted).await? {
            self.compact_after_write().await;
        }
        Ok(count)
    }
}
