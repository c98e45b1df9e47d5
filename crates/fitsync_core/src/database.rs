//! The database handle: journal, in-memory state and record locks.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::CoreResult;
use crate::journal::{Journal, JournalOp};
use crate::mutation::{AbandonReason, MutationTicket};
use crate::mutation_log::MutationLog;
use crate::state::StoreState;
use crate::store::LocalStore;
use crate::types::{OpKind, SyncCursor, SyncState, Timestamp, WorkoutId};
use crate::workout::WorkoutRecord;
use fitsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An open workout store.
///
/// Cheap to clone; clones share the same journal and state. The
/// [`LocalStore`] and [`MutationLog`] views are obtained from it.
///
/// # Write discipline
///
/// Writers hold the [`RecordGuard`] of every record a batch touches, from
/// the read that decides what to write until [`Database::commit`] returns.
/// Readers never take record locks and always see whole batches.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

struct DbInner {
    config: Config,
    clock: Arc<dyn Clock>,
    journal: Mutex<Journal>,
    state: RwLock<StoreState>,
    locks: RecordLocks,
}

impl Database {
    /// Opens (or creates) a store in a journal file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or its journal is corrupt.
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        info!(path = %path.display(), "opening workout store");
        Self::open_with_backend(Box::new(backend), config, Arc::new(SystemClock))
    }

    /// Opens an empty store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Only fails if the in-memory journal cannot be initialized.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backend(
            Box::new(InMemoryBackend::new()),
            Config::default(),
            Arc::new(SystemClock),
        )
    }

    /// Opens a store over any backend with an explicit clock.
    ///
    /// # Errors
    ///
    /// Fails on storage errors and journal corruption.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let (journal, recovered) = Journal::open(backend, config.sync_on_commit)?;

        let mut state = StoreState::default();
        for batch in recovered.batches {
            for op in batch {
                state.apply(op);
            }
        }
        info!(
            records = state.records.len(),
            queued = state.entries.len(),
            discarded_bytes = recovered.discarded_bytes,
            "workout store ready"
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                config,
                clock,
                journal: Mutex::new(journal),
                state: RwLock::new(state),
                locks: RecordLocks::default(),
            }),
        })
    }

    /// Record view.
    #[must_use]
    pub fn store(&self) -> LocalStore {
        LocalStore::new(self.clone())
    }

    /// Mutation queue view.
    #[must_use]
    pub fn mutations(&self) -> MutationLog {
        MutationLog::new(self.clone())
    }

    /// Configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current time according to the store clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// The store clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Locks one record for writing.
    #[must_use]
    pub fn lock_record(&self, id: WorkoutId) -> RecordGuard {
        self.inner.locks.lock(id)
    }

    /// Locks several records, always in ascending id order so that
    /// concurrent multi-record writers cannot deadlock.
    #[must_use]
    pub fn lock_records(&self, ids: impl IntoIterator<Item = WorkoutId>) -> Vec<RecordGuard> {
        let mut ids: Vec<_> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| self.inner.locks.lock(id)).collect()
    }

    /// Durably writes a batch and then publishes it.
    ///
    /// Either every op of the batch becomes visible or none does.
    ///
    /// # Errors
    ///
    /// Returns the journal error; nothing is published in that case.
    pub fn commit(&self, batch: WriteBatch) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut journal = self.inner.journal.lock();
        let batch_id = journal.commit(&batch.ops)?;
        {
            let mut state = self.inner.state.write();
            for op in batch.ops {
                state.apply(op);
            }
        }
        debug!(batch = batch_id, "batch committed");

        let threshold = self.inner.config.compaction_threshold;
        if threshold > 0 && journal.size().is_ok_and(|size| size > threshold) {
            if let Err(err) = self.compact_locked(&mut journal) {
                warn!(error = %err, "journal compaction failed");
            }
        }
        Ok(())
    }

    /// Rewrites the journal as a single snapshot batch.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn compact(&self) -> CoreResult<()> {
        let mut journal = self.inner.journal.lock();
        self.compact_locked(&mut journal)
    }

    fn compact_locked(&self, journal: &mut Journal) -> CoreResult<()> {
        let before = journal.size()?;
        let ops = self.inner.state.read().snapshot();
        journal.rewrite(&ops)?;
        info!(before, after = journal.size()?, "journal compacted");
        Ok(())
    }

    /// Journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn journal_size(&self) -> CoreResult<u64> {
        self.inner.journal.lock().size()
    }

    /// Position of the last completed pull.
    #[must_use]
    pub fn cursor(&self) -> Option<SyncCursor> {
        self.inner.state.read().cursor.clone()
    }

    pub(crate) fn read_state<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.inner.state.read())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Database")
            .field("records", &state.records.len())
            .field("queued", &state.entries.len())
            .field("cursor", &state.cursor)
            .finish_non_exhaustive()
    }
}

/// Ops to be committed together.
///
/// Build one, then hand it to [`Database::commit`].
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<JournalOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if there is nothing to commit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Inserts or replaces a record, clearing any held conflict copy.
    pub fn put_record(&mut self, record: WorkoutRecord, state: SyncState) -> &mut Self {
        self.ops.push(JournalOp::PutRecord {
            record,
            state,
            conflict: None,
        });
        self
    }

    /// Stores a record as `Conflicted` along with the remote version.
    pub fn put_conflicted(&mut self, record: WorkoutRecord, remote: WorkoutRecord) -> &mut Self {
        self.ops.push(JournalOp::PutRecord {
            record,
            state: SyncState::Conflicted,
            conflict: Some(remote),
        });
        self
    }

    /// Physically removes a record.
    pub fn purge(&mut self, id: WorkoutId) -> &mut Self {
        self.ops.push(JournalOp::PurgeRecord { id });
        self
    }

    /// Queues an intent, coalescing with the existing entry.
    pub fn enqueue(&mut self, kind: OpKind, payload: WorkoutRecord, at: Timestamp) -> &mut Self {
        self.ops.push(JournalOp::Enqueue {
            target: payload.id,
            kind,
            payload,
            at,
        });
        self
    }

    /// Overwrites the queued entry's kind and payload in place.
    pub fn replace_entry(
        &mut self,
        kind: OpKind,
        payload: WorkoutRecord,
        at: Timestamp,
    ) -> &mut Self {
        self.ops.push(JournalOp::ReplaceEntry {
            target: payload.id,
            kind,
            payload,
            at,
        });
        self
    }

    /// Completes a successful push.
    pub fn acknowledge(&mut self, ticket: &MutationTicket) -> &mut Self {
        self.ops.push(JournalOp::Acknowledge {
            target: ticket.target_id,
            generation: ticket.generation,
        });
        self
    }

    /// Records a transient push failure.
    pub fn fail(
        &mut self,
        ticket: &MutationTicket,
        error: impl Into<String>,
        not_before: Timestamp,
        max_attempts: u32,
    ) -> &mut Self {
        self.ops.push(JournalOp::Fail {
            target: ticket.target_id,
            generation: ticket.generation,
            error: error.into(),
            not_before,
            max_attempts,
        });
        self
    }

    /// Gives up on the entry.
    pub fn abandon(
        &mut self,
        ticket: &MutationTicket,
        error: impl Into<String>,
        reason: AbandonReason,
    ) -> &mut Self {
        self.ops.push(JournalOp::Abandon {
            target: ticket.target_id,
            generation: ticket.generation,
            error: error.into(),
            reason,
        });
        self
    }

    /// Requeues an abandoned entry.
    pub fn revive(&mut self, target: WorkoutId) -> &mut Self {
        self.ops.push(JournalOp::Revive { target });
        self
    }

    /// Removes the entry for a record.
    pub fn discard(&mut self, target: WorkoutId) -> &mut Self {
        self.ops.push(JournalOp::Discard { target });
        self
    }

    /// Stores the pull cursor.
    pub fn set_cursor(&mut self, cursor: SyncCursor) -> &mut Self {
        self.ops.push(JournalOp::SetCursor { cursor });
        self
    }
}

/// Exclusive write access to one record.
pub struct RecordGuard {
    id: WorkoutId,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl RecordGuard {
    /// The locked record.
    #[must_use]
    pub fn id(&self) -> WorkoutId {
        self.id
    }
}

impl std::fmt::Debug for RecordGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RecordGuard").field(&self.id).finish()
    }
}

#[derive(Default)]
struct RecordLocks {
    table: Mutex<HashMap<WorkoutId, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    fn lock(&self, id: WorkoutId) -> RecordGuard {
        let slot = {
            let mut table = self.table.lock();
            // Drop slots nobody holds once the table grows.
            if table.len() > 1024 {
                table.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            Arc::clone(table.entry(id).or_default())
        };
        RecordGuard {
            id,
            _guard: slot.lock_arc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn open(backend: &InMemoryBackend) -> Database {
        Database::open_with_backend(
            Box::new(backend.clone()),
            Config::default(),
            Arc::new(ManualClock::new(Timestamp::from_millis(1_000))),
        )
        .unwrap()
    }

    fn workout() -> WorkoutRecord {
        WorkoutRecord::new(Timestamp::from_millis(0), Timestamp::from_millis(60_000))
    }

    #[test]
    fn batch_is_replayed_after_reopen() {
        let backend = InMemoryBackend::new();
        let record = workout();
        {
            let db = open(&backend);
            let mut batch = WriteBatch::new();
            batch
                .put_record(record.clone(), SyncState::PendingCreate)
                .enqueue(OpKind::Create, record.clone(), db.now())
                .set_cursor(SyncCursor::new("7"));
            db.commit(batch).unwrap();
        }

        let db = open(&backend);
        assert_eq!(db.store().get(record.id), Some(record.clone()));
        assert_eq!(db.mutations().pending_len(), 1);
        assert_eq!(db.cursor(), Some(SyncCursor::new("7")));
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let backend = InMemoryBackend::new();
        let db = open(&backend);
        db.commit(WriteBatch::new()).unwrap();
        assert_eq!(db.journal_size().unwrap(), 0);
    }

    #[test]
    fn compaction_keeps_contents() {
        let backend = InMemoryBackend::new();
        let record = workout();
        {
            let db = open(&backend);
            for rev in 1..=50u64 {
                let mut r = record.clone();
                r.revision = rev;
                let mut batch = WriteBatch::new();
                batch.put_record(r, SyncState::Clean);
                db.commit(batch).unwrap();
            }
            let before = db.journal_size().unwrap();
            db.compact().unwrap();
            assert!(db.journal_size().unwrap() < before);
        }

        let db = open(&backend);
        assert_eq!(db.store().get(record.id).map(|r| r.revision), Some(50));
    }

    #[test]
    fn automatic_compaction_over_threshold() {
        let backend = InMemoryBackend::new();
        let db = Database::open_with_backend(
            Box::new(backend.clone()),
            Config::default().compaction_threshold(2_000),
            Arc::new(ManualClock::default()),
        )
        .unwrap();

        let record = workout();
        for rev in 1..=100u64 {
            let mut r = record.clone();
            r.revision = rev;
            let mut batch = WriteBatch::new();
            batch.put_record(r, SyncState::Clean);
            db.commit(batch).unwrap();
        }
        assert!(db.journal_size().unwrap() <= 2_000);
        assert_eq!(db.store().get(record.id).map(|r| r.revision), Some(100));
    }

    #[test]
    fn record_locks_serialize_writers() {
        let db = Database::open_in_memory().unwrap();
        let id = WorkoutId::new();
        let guard = db.lock_record(id);

        let db2 = db.clone();
        let handle = std::thread::spawn(move || {
            let _guard = db2.lock_record(id);
            db2.now()
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn lock_records_sorts_and_dedups() {
        let db = Database::open_in_memory().unwrap();
        let a = WorkoutId::from_bytes([1; 16]);
        let b = WorkoutId::from_bytes([2; 16]);
        let guards = db.lock_records([b, a, b]);
        let ids: Vec<_> = guards.iter().map(RecordGuard::id).collect();
        assert_eq!(ids, vec![a, b]);
    }
}
