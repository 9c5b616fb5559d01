use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use super::*;
use crate::model::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomdesk_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(name: &str) -> Engine {
    open_engine_with(name, EngineConfig::default())
}

fn open_engine_with(name: &str, config: EngineConfig) -> Engine {
    Engine::open(test_wal_path(name), 1000, None, config).unwrap()
}

fn slot(room: &str, date: &str, start: &str, end: &str) -> NewBooking {
    NewBooking {
        room: room.into(),
        name: "Ada".into(),
        date: date.into(),
        start_time: start.into(),
        end_time: end.into(),
        phone: None,
    }
}

fn at(start: &str, end: &str) -> NewBooking {
    slot("A", "2024-01-01", start, end)
}

fn is_cached<S: BookingStore, C: ReadCache>(engine: &Engine<S, C>) -> bool {
    matches!(engine.cache().get(), Ok(Lookup::Hit(_)))
}

// ── Overlap rule ─────────────────────────────────────────

#[tokio::test]
async fn booking_scenario_half_open_boundaries() {
    let engine = open_engine("scenario.wal");

    let first = engine.create(at("09:00", "10:00")).await.unwrap();
    let err = engine.create(at("09:30", "10:30")).await.unwrap_err();
    assert!(matches!(err, BookingError::Conflict(id) if id == first.id));
    engine.create(at("10:00", "11:00")).await.unwrap();

    let all = engine.list_all().await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn every_overlap_shape_conflicts() {
    let engine = open_engine("overlap_shapes.wal");
    let existing = engine.create(at("10:00", "12:00")).await.unwrap();

    for (start, end) in [
        ("10:00", "12:00"), // exact
        ("10:30", "11:30"), // inside
        ("09:00", "13:00"), // covers
        ("09:00", "10:01"), // straddles start
        ("11:59", "13:00"), // straddles end
        ("10:00", "10:30"), // shares start
        ("11:00", "12:00"), // shares end
    ] {
        match engine.create(at(start, end)).await {
            Err(BookingError::Conflict(id)) => assert_eq!(id, existing.id),
            other => panic!("{start}-{end}: expected conflict, got {other:?}"),
        }
    }
    assert_eq!(engine.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn adjacent_and_disjoint_slots_are_free() {
    let engine = open_engine("adjacent.wal");
    engine.create(at("10:00", "12:00")).await.unwrap();

    engine.create(at("08:00", "10:00")).await.unwrap();
    engine.create(at("12:00", "13:00")).await.unwrap();
    engine.create(at("15:00", "16:00")).await.unwrap();
    assert_eq!(engine.list_all().await.unwrap().len(), 4);
}

#[tokio::test]
async fn other_room_or_date_never_conflicts() {
    let engine = open_engine("other_room.wal");
    engine.create(at("10:00", "12:00")).await.unwrap();

    engine
        .create(slot("B", "2024-01-01", "10:00", "12:00"))
        .await
        .unwrap();
    engine
        .create(slot("A", "2024-01-02", "10:00", "12:00"))
        .await
        .unwrap();
    assert_eq!(engine.list_all().await.unwrap().len(), 3);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_storage() {
    let engine = open_engine("invalid_input.wal");

    let mut empty_room = at("09:00", "10:00");
    empty_room.room = String::new();
    let mut long_name = at("09:00", "10:00");
    long_name.name = "x".repeat(crate::limits::MAX_NAME_LEN + 1);

    for bad in [
        at("10:00", "10:00"),
        at("11:00", "10:00"),
        at("9:00", "10:00"),
        at("09:00", "24:30"),
        slot("A", "2024-13-01", "09:00", "10:00"),
        slot("A", "01/01/2024", "09:00", "10:00"),
        empty_room,
    ] {
        match engine.create(bad.clone()).await {
            Err(BookingError::InvalidInput(_)) => {}
            other => panic!("{bad:?}: expected invalid input, got {other:?}"),
        }
    }
    assert!(matches!(
        engine.create(long_name).await,
        Err(BookingError::LimitExceeded("name"))
    ));
    assert!(engine.store().is_empty().await);
}

#[tokio::test]
async fn find_conflicts_lists_overlapping_bookings() {
    let engine = open_engine("find_conflicts.wal");
    let morning = engine.create(at("09:00", "10:00")).await.unwrap();
    let noon = engine.create(at("11:00", "12:00")).await.unwrap();
    engine.create(at("14:00", "15:00")).await.unwrap();

    let hits = engine
        .find_conflicts("A", "2024-01-01", &TimeRange::new("09:30", "11:30"))
        .await
        .unwrap();
    let ids: Vec<_> = hits.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![morning.id, noon.id]);

    assert!(
        !engine
            .conflicts("A", "2024-01-01", &TimeRange::new("10:00", "11:00"))
            .await
            .unwrap()
    );
    assert!(matches!(
        engine
            .conflicts("A", "2024-01-01", &TimeRange::new("11:00", "10:00"))
            .await,
        Err(BookingError::InvalidInput(_))
    ));
}

// ── Read cache ───────────────────────────────────────────

#[tokio::test]
async fn list_is_served_from_cache_until_mutation() {
    let engine = open_engine("cache_hit.wal");
    engine.create(at("09:00", "10:00")).await.unwrap();

    let first = engine.list_all().await.unwrap();
    assert!(is_cached(&engine));
    let second = engine.list_all().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn no_stale_list_after_any_mutation() {
    let engine = open_engine("cache_stale.wal");
    let booking = engine.create(at("09:00", "10:00")).await.unwrap();
    assert_eq!(engine.list_all().await.unwrap().len(), 1);

    let other = engine.create(at("10:00", "11:00")).await.unwrap();
    assert!(!is_cached(&engine));
    assert_eq!(engine.list_all().await.unwrap().len(), 2);

    let patch = BookingPatch {
        name: Some("Grace".into()),
        ..Default::default()
    };
    engine.update(booking.id, patch).await.unwrap();
    assert!(!is_cached(&engine));
    let all = engine.list_all().await.unwrap();
    assert_eq!(all[0].name, "Grace");

    engine.delete_one(other.id).await.unwrap();
    assert!(!is_cached(&engine));
    assert_eq!(engine.list_all().await.unwrap().len(), 1);

    assert_eq!(engine.delete_all().await.unwrap(), 1);
    assert!(engine.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_mutations_keep_cache() {
    let engine = open_engine("cache_kept.wal");
    engine.create(at("09:00", "10:00")).await.unwrap();
    engine.list_all().await.unwrap();

    assert!(engine.create(at("09:15", "09:45")).await.is_err());
    assert!(is_cached(&engine));

    assert!(matches!(
        engine.delete_one(Ulid::new()).await,
        Err(BookingError::NotFound(_))
    ));
    assert!(is_cached(&engine));

    let patch = BookingPatch {
        name: Some("Grace".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update(Ulid::new(), patch).await,
        Err(BookingError::NotFound(_))
    ));
    assert!(is_cached(&engine));
}

#[tokio::test]
async fn create_then_delete_all_leaves_nothing() {
    let engine = open_engine("delete_all.wal");
    for (start, end) in [("08:00", "09:00"), ("09:00", "10:00"), ("10:00", "11:00")] {
        engine.create(at(start, end)).await.unwrap();
    }
    engine.list_all().await.unwrap();

    assert_eq!(engine.delete_all().await.unwrap(), 3);
    assert!(engine.list_all().await.unwrap().is_empty());
    assert_eq!(engine.delete_all().await.unwrap(), 0);
}

// ── Updates ──────────────────────────────────────────────

#[tokio::test]
async fn empty_patch_is_invalid_even_for_unknown_id() {
    let engine = open_engine("empty_patch.wal");
    let err = engine
        .update(Ulid::new(), BookingPatch::default())
        .await
        .unwrap_err();
    match err {
        BookingError::InvalidInput(msg) => assert_eq!(msg, "no data provided for update"),
        other => panic!("expected invalid input, got {other:?}"),
    }
}

#[tokio::test]
async fn update_merges_and_clears_phone() {
    let engine = open_engine("update_merge.wal");
    let mut new = at("09:00", "10:00");
    new.phone = Some("555-0100".into());
    let booking = engine.create(new).await.unwrap();

    let patch = BookingPatch {
        end_time: Some("10:30".into()),
        phone: Some(None),
        ..Default::default()
    };
    let updated = engine.update(booking.id, patch).await.unwrap();
    assert_eq!(updated.id, booking.id);
    assert_eq!(updated.start_time, "09:00");
    assert_eq!(updated.end_time, "10:30");
    assert_eq!(updated.phone, None);
    assert_eq!(engine.get(booking.id).await.unwrap(), updated);
}

#[tokio::test]
async fn update_rejects_malformed_fields() {
    let engine = open_engine("update_malformed.wal");
    let booking = engine.create(at("09:00", "10:00")).await.unwrap();

    let bad_time = BookingPatch {
        start_time: Some("nine".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update(booking.id, bad_time).await,
        Err(BookingError::InvalidInput(_))
    ));

    let inverted = BookingPatch {
        start_time: Some("11:00".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update(booking.id, inverted).await,
        Err(BookingError::InvalidInput(_))
    ));
    assert_eq!(engine.get(booking.id).await.unwrap(), booking);
}

#[tokio::test]
async fn update_skips_overlap_check_by_default() {
    let engine = open_engine("update_no_recheck.wal");
    engine.create(at("09:00", "10:00")).await.unwrap();
    let later = engine.create(at("11:00", "12:00")).await.unwrap();

    let patch = BookingPatch {
        start_time: Some("09:30".into()),
        ..Default::default()
    };
    let moved = engine.update(later.id, patch).await.unwrap();
    assert_eq!(moved.start_time, "09:30");
}

#[tokio::test]
async fn update_rechecks_overlap_when_configured() {
    let engine = open_engine_with(
        "update_recheck.wal",
        EngineConfig {
            revalidate_updates: true,
        },
    );
    let early = engine.create(at("09:00", "10:00")).await.unwrap();
    let later = engine.create(at("11:00", "12:00")).await.unwrap();

    let into_early = BookingPatch {
        start_time: Some("09:30".into()),
        ..Default::default()
    };
    match engine.update(later.id, into_early).await {
        Err(BookingError::Conflict(id)) => assert_eq!(id, early.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    // Extending over its own old range only collides with itself.
    let extend = BookingPatch {
        start_time: Some("10:00".into()),
        ..Default::default()
    };
    engine.update(later.id, extend).await.unwrap();

    let other_room = BookingPatch {
        room: Some("B".into()),
        start_time: Some("09:00".into()),
        ..Default::default()
    };
    engine.update(later.id, other_room).await.unwrap();
}

#[tokio::test]
async fn delete_one_removes_only_target() {
    let engine = open_engine("delete_one.wal");
    let a = engine.create(at("09:00", "10:00")).await.unwrap();
    let b = engine.create(at("10:00", "11:00")).await.unwrap();

    engine.delete_one(a.id).await.unwrap();
    assert!(matches!(engine.get(a.id).await, Err(BookingError::NotFound(_))));
    assert_eq!(engine.get(b.id).await.unwrap(), b);

    // The freed slot can be booked again.
    engine.create(at("09:00", "10:00")).await.unwrap();
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_bookings() {
    let path = test_wal_path("replay.wal");
    let (kept, updated) = {
        let engine = Engine::open(path.clone(), 1000, None, EngineConfig::default()).unwrap();
        let kept = engine.create(at("09:00", "10:00")).await.unwrap();
        let gone = engine.create(at("10:00", "11:00")).await.unwrap();
        let moved = engine.create(at("12:00", "13:00")).await.unwrap();
        engine.delete_one(gone.id).await.unwrap();
        let patch = BookingPatch {
            room: Some("B".into()),
            ..Default::default()
        };
        (kept, engine.update(moved.id, patch).await.unwrap())
    };

    let engine = Engine::open(path, 1000, None, EngineConfig::default()).unwrap();
    let all = engine.list_all().await.unwrap();
    assert_eq!(all.as_slice(), &[kept, updated]);

    // Replayed bookings still block their slots.
    assert!(matches!(
        engine.create(at("09:30", "10:30")).await,
        Err(BookingError::Conflict(_))
    ));
}

#[tokio::test]
async fn wal_replay_after_delete_all() {
    let path = test_wal_path("replay_delete_all.wal");
    {
        let engine = Engine::open(path.clone(), 1000, None, EngineConfig::default()).unwrap();
        engine.create(at("09:00", "10:00")).await.unwrap();
        engine.delete_all().await.unwrap();
        engine.create(at("11:00", "12:00")).await.unwrap();
    }

    let engine = Engine::open(path, 1000, None, EngineConfig::default()).unwrap();
    let all = engine.list_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].start_time, "11:00");
}

#[tokio::test]
async fn compaction_runs_at_threshold() {
    let path = test_wal_path("compact_threshold.wal");
    {
        let engine = Engine::open(path.clone(), 3, None, EngineConfig::default()).unwrap();
        let a = engine.create(at("08:00", "09:00")).await.unwrap();
        engine.create(at("09:00", "10:00")).await.unwrap();
        assert_eq!(engine.store().appends_since_compact().await, 2);
        engine.delete_one(a.id).await.unwrap();
        assert_eq!(engine.store().appends_since_compact().await, 0);
        engine.create(at("10:00", "11:00")).await.unwrap();
        assert_eq!(engine.store().appends_since_compact().await, 1);
    }

    let engine = Engine::open(path, 3, None, EngineConfig::default()).unwrap();
    let starts: Vec<_> = engine
        .list_all()
        .await
        .unwrap()
        .iter()
        .map(|b| b.start_time.clone())
        .collect();
    assert_eq!(starts, ["09:00", "10:00"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_commit_shares_flushes_across_slots() {
    let path = test_wal_path("group_commit.wal");
    let engine = Arc::new(Engine::open(path.clone(), 1000, None, EngineConfig::default()).unwrap());

    let n = 200;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create(slot(&format!("R{i}"), "2024-01-01", "09:00", "10:00"))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_all().await.unwrap().len(), n);

    // Writes on different slots wait on the WAL together.
    let flushes = engine.store().wal_flushes();
    assert!(flushes < n as u64, "{flushes} flushes for {n} creates");

    let engine2 = Engine::open(path, 1000, None, EngineConfig::default()).unwrap();
    assert_eq!(engine2.list_all().await.unwrap().len(), n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_and_create_on_one_slot_admit_exactly_one() {
    let config = EngineConfig {
        revalidate_updates: true,
    };
    for round in 0..20 {
        let engine = Arc::new(open_engine_with(&format!("move_race_{round}.wal"), config));
        let other = engine
            .create(slot("B", "2024-01-01", "09:00", "10:00"))
            .await
            .unwrap();

        let mover = {
            let eng = engine.clone();
            tokio::spawn(async move {
                let patch = BookingPatch {
                    room: Some("A".into()),
                    ..Default::default()
                };
                eng.update(other.id, patch).await
            })
        };
        let creator = {
            let eng = engine.clone();
            tokio::spawn(async move { eng.create(at("09:30", "10:30")).await })
        };
        let moved = mover.await.unwrap().is_ok();
        let created = creator.await.unwrap().is_ok();
        assert!(moved != created, "round {round}: moved={moved} created={created}");

        let on_a = engine
            .find_conflicts("A", "2024-01-01", &TimeRange::new("00:00", "23:59"))
            .await
            .unwrap();
        assert_eq!(on_a.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_under_concurrent_writes_keeps_every_booking() {
    let path = test_wal_path("compact_concurrent.wal");
    let engine = Arc::new(Engine::open(path.clone(), 7, None, EngineConfig::default()).unwrap());

    let n = 60;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create(slot(&format!("C{i}"), "2024-01-01", "09:00", "10:00"))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert!(engine.store().appends_since_compact().await < 7);

    let engine2 = Engine::open(path, 7, None, EngineConfig::default()).unwrap();
    assert_eq!(engine2.list_all().await.unwrap().len(), n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_on_one_slot_admit_exactly_one() {
    let engine = Arc::new(open_engine("race.wal"));

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        // Every candidate overlaps every other one.
        let start = format!("09:{:02}", i);
        handles.push(tokio::spawn(async move { eng.create(at(&start, "10:00")).await }));
    }

    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(BookingError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(engine.list_all().await.unwrap().len(), 1);
}

// ── Failure handling ─────────────────────────────────────

struct FailingStore;

fn down() -> StoreError {
    StoreError::Wal("disk unavailable".into())
}

#[async_trait]
impl BookingStore for FailingStore {
    async fn find_overlapping(
        &self,
        _room: &str,
        _date: &str,
        _range: &TimeRange,
        _exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError> {
        Err(down())
    }

    async fn insert_if_free(&self, _booking: Booking) -> Result<InsertOutcome, StoreError> {
        Err(down())
    }

    async fn find_all(&self) -> Result<Vec<Booking>, StoreError> {
        Err(down())
    }

    async fn find_by_id(&self, _id: Ulid) -> Result<Option<Booking>, StoreError> {
        Err(down())
    }

    async fn update_by_id(
        &self,
        _id: Ulid,
        _patch: &BookingPatch,
        _revalidate: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        Err(down())
    }

    async fn delete_by_id(&self, _id: Ulid) -> Result<usize, StoreError> {
        Err(down())
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        Err(down())
    }
}

struct FailingCache;

impl ReadCache for FailingCache {
    fn get(&self) -> Result<Lookup, CacheError> {
        Err(CacheError::Backend("cache offline".into()))
    }

    fn set(&self, _ticket: Ticket, _snapshot: Snapshot) -> Result<bool, CacheError> {
        Err(CacheError::Backend("cache offline".into()))
    }

    fn invalidate(&self) -> Result<(), CacheError> {
        Err(CacheError::Backend("cache offline".into()))
    }
}

fn seed_cache(cache: &SnapshotCache) {
    let Ok(Lookup::Miss(ticket)) = cache.get() else {
        panic!("expected empty cache");
    };
    assert!(cache.set(ticket, Arc::new(Vec::new())).unwrap());
}

#[tokio::test]
async fn store_failure_surfaces_and_keeps_cache() {
    let engine = Engine::new(FailingStore, SnapshotCache::new(None), EngineConfig::default());
    seed_cache(engine.cache());

    assert!(matches!(
        engine.create(at("09:00", "10:00")).await,
        Err(BookingError::StorageUnavailable(_))
    ));
    let patch = BookingPatch {
        name: Some("Grace".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update(Ulid::new(), patch).await,
        Err(BookingError::StorageUnavailable(_))
    ));
    assert!(matches!(
        engine.delete_one(Ulid::new()).await,
        Err(BookingError::StorageUnavailable(_))
    ));
    assert!(matches!(
        engine.delete_all().await,
        Err(BookingError::StorageUnavailable(_))
    ));
    assert!(is_cached(&engine));
}

#[tokio::test]
async fn unreadable_store_makes_validation_unavailable() {
    let engine = Engine::new(FailingStore, SnapshotCache::new(None), EngineConfig::default());
    let err = engine
        .find_conflicts("A", "2024-01-01", &TimeRange::new("09:00", "10:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::ValidationUnavailable(_)));
    assert_eq!(err.http_status(), 500);
}

#[tokio::test]
async fn list_miss_with_failing_store_errors_without_caching() {
    let engine = Engine::new(FailingStore, SnapshotCache::new(None), EngineConfig::default());
    assert!(matches!(
        engine.list_all().await,
        Err(BookingError::StorageUnavailable(_))
    ));
    assert!(!is_cached(&engine));
}

#[tokio::test]
async fn failing_cache_falls_back_to_store() {
    let store = WalStore::open(test_wal_path("failing_cache.wal"), 1000).unwrap();
    let engine = Engine::new(store, FailingCache, EngineConfig::default());

    // Invalidation fails after the write; the create still succeeded.
    let booking = engine.create(at("09:00", "10:00")).await.unwrap();
    let all = engine.list_all().await.unwrap();
    assert_eq!(all.as_slice(), &[booking.clone()]);

    engine.delete_one(booking.id).await.unwrap();
    assert!(engine.list_all().await.unwrap().is_empty());
}
