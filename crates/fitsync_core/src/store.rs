//! Local record store.

use crate::database::{Database, WriteBatch};
use crate::error::{CoreError, CoreResult};
use crate::state::StoredWorkout;
use crate::types::{SyncState, WorkoutId};
use crate::workout::WorkoutRecord;
use std::cmp::Reverse;

/// View of the workout records held on this device.
///
/// All reads are served locally; a write is durable when it returns. Writes
/// take the record lock, so callers must not hold that record's
/// [`crate::RecordGuard`] themselves (compose a [`WriteBatch`] instead).
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the record, tombstones included.
    #[must_use]
    pub fn get(&self, id: WorkoutId) -> Option<WorkoutRecord> {
        self.db
            .read_state(|state| state.records.get(&id).map(|s| s.record.clone()))
    }

    /// Returns the record with its sync bookkeeping.
    #[must_use]
    pub fn get_stored(&self, id: WorkoutId) -> Option<StoredWorkout> {
        self.db.read_state(|state| state.records.get(&id).cloned())
    }

    /// Sync state of a record.
    #[must_use]
    pub fn sync_state(&self, id: WorkoutId) -> Option<SyncState> {
        self.db
            .read_state(|state| state.records.get(&id).map(|s| s.sync_state))
    }

    /// Remote version held for a `Conflicted` record.
    #[must_use]
    pub fn conflict_copy(&self, id: WorkoutId) -> Option<WorkoutRecord> {
        self.db.read_state(|state| {
            state
                .records
                .get(&id)
                .and_then(|s| s.conflict.clone())
        })
    }

    /// Inserts or replaces a record by id, revision included.
    ///
    /// A new record starts `Clean`; an existing one keeps its sync state.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn upsert(&self, record: WorkoutRecord) -> CoreResult<()> {
        let _guard = self.db.lock_record(record.id);
        let state = self.sync_state(record.id).unwrap_or(SyncState::Clean);
        let mut batch = WriteBatch::new();
        batch.put_record(record, state);
        self.db.commit(batch)
    }

    /// Tombstones a record without removing it.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if there is no such record.
    pub fn delete(&self, id: WorkoutId) -> CoreResult<()> {
        let _guard = self.db.lock_record(id);
        let stored = self.get_stored(id).ok_or(CoreError::NotFound(id))?;
        let mut record = stored.record;
        record.deleted = true;
        let mut batch = WriteBatch::new();
        batch.put_record(record, stored.sync_state);
        self.db.commit(batch)
    }

    /// Sets the sync state of an existing record.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if there is no such record.
    pub fn set_sync_state(&self, id: WorkoutId, sync_state: SyncState) -> CoreResult<()> {
        let _guard = self.db.lock_record(id);
        let stored = self.get_stored(id).ok_or(CoreError::NotFound(id))?;
        let mut batch = WriteBatch::new();
        batch.put_record(stored.record, sync_state);
        self.db.commit(batch)
    }

    /// Physically removes a record. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn purge(&self, id: WorkoutId) -> CoreResult<bool> {
        let _guard = self.db.lock_record(id);
        if self.get_stored(id).is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.purge(id);
        self.db.commit(batch)?;
        Ok(true)
    }

    /// Lazily iterates non-tombstoned records, newest session first.
    ///
    /// The set of ids is fixed when the iterator is created; each record is
    /// read when reached, so it reflects the latest committed version and
    /// records deleted in the meantime are skipped.
    #[must_use]
    pub fn list_active(&self) -> ActiveRecords {
        let mut keys: Vec<_> = self.db.read_state(|state| {
            state
                .records
                .values()
                .filter(|s| !s.record.deleted)
                .map(|s| (Reverse(s.record.start_time), s.record.id))
                .collect()
        });
        keys.sort();
        ActiveRecords {
            store: self.clone(),
            ids: keys.into_iter().map(|(_, id)| id).collect(),
            pos: 0,
        }
    }

    /// Every record, tombstones included, in id order.
    #[must_use]
    pub fn list_all(&self) -> Vec<WorkoutRecord> {
        let mut all: Vec<_> = self
            .db
            .read_state(|state| state.records.values().map(|s| s.record.clone()).collect());
        all.sort_by_key(|r| r.id);
        all
    }

    /// Number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.db.read_state(|state| state.records.len())
    }

    /// True if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Restartable iterator returned by [`LocalStore::list_active`].
#[derive(Debug, Clone)]
pub struct ActiveRecords {
    store: LocalStore,
    ids: Vec<WorkoutId>,
    pos: usize,
}

impl ActiveRecords {
    /// Starts over from the first id.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Ids not yet visited (some may turn out deleted).
    #[must_use]
    pub fn remaining_ids(&self) -> &[WorkoutId] {
        &self.ids[self.pos..]
    }
}

impl Iterator for ActiveRecords {
    type Item = WorkoutRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.ids.get(self.pos).copied() {
            self.pos += 1;
            match self.store.get(id) {
                Some(record) if !record.deleted => return Some(record),
                _ => continue,
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len() - self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn session(start: i64) -> WorkoutRecord {
        WorkoutRecord::new(
            Timestamp::from_millis(start),
            Timestamp::from_millis(start + 1_000),
        )
    }

    #[test]
    fn upsert_get_and_replace() {
        let db = Database::open_in_memory().unwrap();
        let store = db.store();
        let mut record = session(0);
        store.upsert(record.clone()).unwrap();
        assert_eq!(store.get(record.id), Some(record.clone()));
        assert_eq!(store.sync_state(record.id), Some(SyncState::Clean));

        record.revision = 3;
        store.upsert(record.clone()).unwrap();
        assert_eq!(store.get(record.id).unwrap().revision, 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn upsert_keeps_sync_state() {
        let db = Database::open_in_memory().unwrap();
        let store = db.store();
        let record = session(0);
        store.upsert(record.clone()).unwrap();
        store
            .set_sync_state(record.id, SyncState::PendingUpdate)
            .unwrap();
        store.upsert(record.clone()).unwrap();
        assert_eq!(store.sync_state(record.id), Some(SyncState::PendingUpdate));
    }

    #[test]
    fn delete_tombstones_without_purging() {
        let db = Database::open_in_memory().unwrap();
        let store = db.store();
        let record = session(0);
        store.upsert(record.clone()).unwrap();
        store.delete(record.id).unwrap();

        assert!(store.get(record.id).unwrap().deleted);
        assert_eq!(store.list_active().count(), 0);
        assert_eq!(store.list_all().len(), 1);

        assert!(store.purge(record.id).unwrap());
        assert!(store.get(record.id).is_none());
        assert!(!store.purge(record.id).unwrap());
        assert!(matches!(store.delete(record.id), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn list_active_is_newest_first_and_restartable() {
        let db = Database::open_in_memory().unwrap();
        let store = db.store();
        let old = session(1_000);
        let new = session(5_000);
        store.upsert(old.clone()).unwrap();
        store.upsert(new.clone()).unwrap();

        let mut iter = store.list_active();
        assert_eq!(iter.next().map(|r| r.id), Some(new.id));
        assert_eq!(iter.next().map(|r| r.id), Some(old.id));
        assert!(iter.next().is_none());

        iter.rewind();
        assert_eq!(iter.count(), 2);
    }

    #[test]
    fn list_active_reads_lazily() {
        let db = Database::open_in_memory().unwrap();
        let store = db.store();
        let a = session(2_000);
        let b = session(1_000);
        store.upsert(a.clone()).unwrap();
        store.upsert(b.clone()).unwrap();

        let mut iter = store.list_active();
        assert_eq!(iter.remaining_ids().len(), 2);
        store.delete(b.id).unwrap();
        let mut changed = a.clone();
        changed.notes = Some("edited".into());
        store.upsert(changed).unwrap();

        let first = iter.next().unwrap();
        assert_eq!(first.notes.as_deref(), Some("edited"));
        assert!(iter.next().is_none());
    }
}
