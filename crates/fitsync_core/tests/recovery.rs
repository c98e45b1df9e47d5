//! Recovery tests: what a reopened store sees after clean shutdowns,
//! compactions and torn writes.

use fitsync_core::{
    Config, Database, ManualClock, OpKind, SyncCursor, SyncState, Timestamp, WorkoutId,
    WorkoutRecord, WriteBatch,
};
use fitsync_storage::{InMemoryBackend, StorageBackend};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn session(id: WorkoutId, revision: u64) -> WorkoutRecord {
    let mut record =
        WorkoutRecord::with_id(id, Timestamp::from_millis(0), Timestamp::from_millis(60_000));
    record.revision = revision;
    record.calories_burned = Some(revision as u32 * 10);
    record
}

fn open(backend: InMemoryBackend) -> Database {
    Database::open_with_backend(
        Box::new(backend),
        Config::default(),
        Arc::new(ManualClock::default()),
    )
    .unwrap()
}

#[test]
fn file_store_survives_restart_and_compaction() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("workouts.fjnl");
    let ids: Vec<_> = (0..5).map(|_| WorkoutId::new()).collect();

    {
        let db = Database::open(&path, Config::default()).unwrap();
        for (n, id) in ids.iter().enumerate() {
            let record = session(*id, n as u64 + 1);
            let mut batch = WriteBatch::new();
            batch
                .put_record(record.clone(), SyncState::PendingCreate)
                .enqueue(OpKind::Create, record, db.now());
            db.commit(batch).unwrap();
        }
        db.store().delete(ids[0]).unwrap();
        db.compact().unwrap();

        let mut batch = WriteBatch::new();
        batch.set_cursor(SyncCursor::new("after-compaction"));
        db.commit(batch).unwrap();
    }

    let db = Database::open(&path, Config::default()).unwrap();
    assert_eq!(db.store().len(), 5);
    assert!(db.store().get(ids[0]).unwrap().deleted);
    assert_eq!(db.store().list_active().count(), 4);
    assert_eq!(db.mutations().len(), 5);
    let order: Vec<_> = db.mutations().entries().iter().map(|e| e.target_id).collect();
    assert_eq!(order, ids);
    assert_eq!(db.cursor(), Some(SyncCursor::new("after-compaction")));
}

#[test]
fn corrupted_store_refuses_to_open() {
    let backend = InMemoryBackend::new();
    {
        let db = open(backend.clone());
        db.store().upsert(session(WorkoutId::new(), 1)).unwrap();
        db.store().upsert(session(WorkoutId::new(), 1)).unwrap();
    }
    // Inside the payload of the first op frame.
    backend.corrupt_byte(40, 0xFF);

    let result = Database::open_with_backend(
        Box::new(backend),
        Config::default(),
        Arc::new(ManualClock::default()),
    );
    assert!(matches!(result, Err(err) if err.is_corruption()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Cutting the journal anywhere yields exactly the batches that were
    /// complete before the cut.
    #[test]
    fn any_cut_recovers_a_committed_prefix(
        revisions in prop::collection::vec(1u64..100, 1..12),
        cut_fraction in 0.0f64..1.0,
    ) {
        let backend = InMemoryBackend::new();
        let id = WorkoutId::new();
        let mut sizes = Vec::new();
        {
            let db = open(backend.clone());
            for rev in &revisions {
                db.store().upsert(session(id, *rev)).unwrap();
                sizes.push(db.journal_size().unwrap());
            }
        }

        let full = backend.data().len();
        let cut = (full as f64 * cut_fraction) as u64;
        let mut torn = backend.clone();
        torn.truncate(cut).unwrap();

        let db = open(backend.clone());
        let survived = sizes.iter().filter(|end| **end <= cut).count();
        let expected = survived.checked_sub(1).map(|i| revisions[i]);
        prop_assert_eq!(db.store().get(id).map(|r| r.revision), expected);
        prop_assert_eq!(
            backend.data().len() as u64,
            survived.checked_sub(1).map_or(0, |i| sizes[i])
        );
    }

    /// However intents are interleaved, each record has at most one entry
    /// and a reopened store agrees with the live one.
    #[test]
    fn queue_replays_identically(
        steps in prop::collection::vec((0usize..4, 0u8..3), 1..40),
    ) {
        let backend = InMemoryBackend::new();
        let ids: Vec<_> = (0..4u8).map(|n| WorkoutId::from_bytes([n + 1; 16])).collect();
        let db = open(backend.clone());
        let log = db.mutations();

        for (n, (target, kind)) in steps.iter().enumerate() {
            let kind = match kind {
                0 => OpKind::Create,
                1 => OpKind::Update,
                _ => OpKind::Delete,
            };
            // Rejections (update after delete) are part of the model.
            let _ = log.enqueue(kind, session(ids[*target], n as u64 + 1));
        }
        prop_assert!(log.len() <= ids.len());

        let reopened = open(backend);
        prop_assert_eq!(reopened.mutations().entries(), log.entries());
    }
}
