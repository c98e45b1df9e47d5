//! Application-facing workout repository.

use crate::engine::{SyncEngine, SyncEvent, SyncReport};
use crate::error::SyncResult;
use crate::remote::RemoteClient;
use crate::resolver::ConflictChoice;
use crate::scheduler::SyncTrigger;
use fitsync_core::stats;
use fitsync_core::{
    ActiveRecords, CoreError, CoreResult, Database, MutationLogEntry, OpKind, StoredWorkout,
    SyncState, WorkoutId, WorkoutRecord, WorkoutStats, WriteBatch,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Local-first access to the user's workouts.
///
/// Writes go to the local store and the mutation log in one batch and
/// return as soon as that batch is durable; the remote is updated later by
/// the sync engine. Reads never wait for the network.
///
/// ```ignore
/// let engine = Arc::new(SyncEngine::new(db, remote, SyncConfig::default()));
/// let worker = scheduler::spawn(Arc::clone(&engine));
/// let repo = WorkoutRepository::new(engine).with_trigger(worker.trigger());
///
/// let saved = repo.create(WorkoutRecord::new(start, end).calories(420))?;
/// ```
pub struct WorkoutRepository<R: RemoteClient> {
    db: Database,
    engine: Arc<SyncEngine<R>>,
    trigger: Option<SyncTrigger>,
}

impl<R: RemoteClient> WorkoutRepository<R> {
    /// Creates a repository over the engine's database.
    pub fn new(engine: Arc<SyncEngine<R>>) -> Self {
        Self {
            db: engine.database().clone(),
            engine,
            trigger: None,
        }
    }

    /// Wakes the given worker after every local write.
    pub fn with_trigger(mut self, trigger: SyncTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    /// Saves a new workout and queues it for upload.
    ///
    /// The stored copy gets `revision` 1 and `updated_at` now; it is
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgument`] if the workout does not validate
    /// - [`CoreError::AlreadyExists`] if the id is already stored
    pub fn create(&self, workout: WorkoutRecord) -> CoreResult<WorkoutRecord> {
        workout.validate()?;
        let id = workout.id;
        let record = {
            let _guard = self.db.lock_record(id);
            if self.db.store().get_stored(id).is_some() {
                return Err(CoreError::AlreadyExists(id));
            }

            let mut record = workout;
            record.revision = 1;
            record.updated_at = self.db.now();
            record.deleted = false;

            let mut batch = WriteBatch::new();
            batch
                .put_record(record.clone(), SyncState::PendingCreate)
                .enqueue(OpKind::Create, record.clone(), record.updated_at);
            self.db.commit(batch)?;
            record
        };
        debug!(%id, "workout created");
        self.changed(id);
        Ok(record)
    }

    /// Replaces a workout's content and queues the change.
    ///
    /// Sync metadata on `workout` is ignored: the revision is bumped from
    /// the stored one and `updated_at` never moves backwards.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgument`] if the workout does not validate
    /// - [`CoreError::NotFound`] if the id is unknown
    /// - [`CoreError::RecordDeleted`] if the workout was deleted
    pub fn update(&self, workout: WorkoutRecord) -> CoreResult<WorkoutRecord> {
        workout.validate()?;
        let id = workout.id;
        let record = {
            let _guard = self.db.lock_record(id);
            let stored = self.live(id)?;

            let mut record = workout;
            record.revision = stored.record.revision + 1;
            record.updated_at = self.db.now().max(stored.record.updated_at);
            record.deleted = false;

            let kind = self
                .db
                .mutations()
                .entry_for(id)
                .map_or(OpKind::Update, |entry| entry.op_kind.coalesce(OpKind::Update));
            let mut batch = WriteBatch::new();
            put_pending(&mut batch, &stored, record.clone(), kind);
            batch.enqueue(OpKind::Update, record.clone(), record.updated_at);
            self.db.commit(batch)?;
            record
        };
        debug!(%id, revision = record.revision, "workout updated");
        self.changed(id);
        Ok(record)
    }

    /// Deletes a workout locally and queues the deletion.
    ///
    /// The record stays as a tombstone, invisible to [`Self::get`] and
    /// [`Self::list_active`], until the remote confirms.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the id is unknown
    /// - [`CoreError::RecordDeleted`] if the workout was already deleted
    pub fn delete(&self, id: WorkoutId) -> CoreResult<()> {
        {
            let _guard = self.db.lock_record(id);
            let stored = self.live(id)?;

            let mut record = stored.record.clone();
            record.deleted = true;
            record.revision += 1;
            record.updated_at = self.db.now().max(record.updated_at);

            let mut batch = WriteBatch::new();
            put_pending(&mut batch, &stored, record.clone(), OpKind::Delete);
            batch.enqueue(OpKind::Delete, record.clone(), record.updated_at);
            self.db.commit(batch)?;
        }
        debug!(%id, "workout deleted");
        self.changed(id);
        Ok(())
    }

    /// A live workout by id.
    pub fn get(&self, id: WorkoutId) -> Option<WorkoutRecord> {
        self.db.store().get(id).filter(|record| !record.deleted)
    }

    /// Live workouts, newest session first.
    pub fn list_active(&self) -> ActiveRecords {
        self.db.store().list_active()
    }

    /// Sync state of a stored workout, tombstones included.
    pub fn sync_state(&self, id: WorkoutId) -> Option<SyncState> {
        self.db.store().sync_state(id)
    }

    /// Remote version held for a `Conflicted` workout.
    pub fn conflict_copy(&self, id: WorkoutId) -> Option<WorkoutRecord> {
        self.db.store().conflict_copy(id)
    }

    /// Subscribes to record and sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Asks the background worker for a cycle. Does nothing without a
    /// worker.
    pub fn request_sync(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.request_sync();
        }
    }

    /// Tells the background worker that the network is back.
    pub fn connectivity_restored(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.connectivity_restored();
        }
    }

    /// Runs a cycle on the caller's task and waits for it.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::run_cycle`].
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.engine.run_cycle().await
    }

    /// Mutations the engine gave up on, oldest first.
    pub fn list_abandoned(&self) -> Vec<MutationLogEntry> {
        self.db.mutations().list_abandoned()
    }

    /// Requeues an abandoned mutation with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the workout has no abandoned mutation.
    pub fn retry_abandoned(&self, id: WorkoutId) -> CoreResult<()> {
        self.db.mutations().retry_abandoned(id)?;
        self.request_sync();
        Ok(())
    }

    /// Drops an abandoned mutation and settles the local record.
    ///
    /// A discarded create or delete removes the local record; a discarded
    /// update keeps the local content and marks it `Clean`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the workout has no abandoned mutation.
    pub fn discard_abandoned(&self, id: WorkoutId) -> CoreResult<()> {
        let event = {
            let _guard = self.db.lock_record(id);
            let entry = self
                .db
                .mutations()
                .entry_for(id)
                .filter(|entry| !entry.is_pending())
                .ok_or(CoreError::NotFound(id))?;

            let mut batch = WriteBatch::new();
            batch.discard(id);
            let event = match (entry.op_kind, self.db.store().get_stored(id)) {
                (OpKind::Update, Some(stored)) => {
                    batch.put_record(stored.record, SyncState::Clean);
                    SyncEvent::RecordChanged(id)
                }
                _ => {
                    batch.purge(id);
                    SyncEvent::RecordRemoved(id)
                }
            };
            self.db.commit(batch)?;
            info!(%id, kind = %entry.op_kind, "abandoned mutation discarded");
            event
        };
        self.engine.emit(event);
        Ok(())
    }

    /// Settles a `Conflicted` workout.
    ///
    /// `KeepLocal` keeps the local version with a revision above both and
    /// queues it for upload. `AcceptRemote` stores the remote version and
    /// drops the local mutation.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the id is unknown
    /// - [`CoreError::InvalidArgument`] if the workout is not `Conflicted`
    pub fn resolve_conflict(&self, id: WorkoutId, choice: ConflictChoice) -> CoreResult<()> {
        let event = {
            let _guard = self.db.lock_record(id);
            let stored = self
                .db
                .store()
                .get_stored(id)
                .ok_or(CoreError::NotFound(id))?;
            let (SyncState::Conflicted, Some(remote)) = (stored.sync_state, stored.conflict)
            else {
                return Err(CoreError::invalid_argument(format!(
                    "workout {id} has no conflict to resolve"
                )));
            };

            let local = stored.record;
            let mut batch = WriteBatch::new();
            let event = match choice {
                ConflictChoice::KeepLocal => {
                    let mut record = local;
                    record.revision = record.revision.max(remote.revision) + 1;
                    record.updated_at = self
                        .db
                        .now()
                        .max(record.updated_at)
                        .max(remote.updated_at);
                    let kind = if record.deleted {
                        OpKind::Delete
                    } else {
                        OpKind::Update
                    };
                    batch
                        .put_record(record.clone(), SyncState::pending_for(kind))
                        .replace_entry(kind, record.clone(), record.updated_at);
                    SyncEvent::RecordChanged(id)
                }
                ConflictChoice::AcceptRemote => {
                    batch.discard(id);
                    if remote.deleted {
                        batch.purge(id);
                        SyncEvent::RecordRemoved(id)
                    } else {
                        let mut record = remote;
                        record.revision = record.revision.max(local.revision);
                        batch.put_record(record, SyncState::Clean);
                        SyncEvent::RecordChanged(id)
                    }
                }
            };
            self.db.commit(batch)?;
            info!(%id, ?choice, "conflict resolved");
            event
        };
        self.engine.emit(event);
        self.request_sync();
        Ok(())
    }

    /// Live sessions that ended within the last `days` days.
    pub fn sessions_since(&self, days: u32) -> Vec<WorkoutRecord> {
        stats::sessions_since(self.list_active(), self.db.now(), days)
    }

    /// Live sessions that ended on UTC day `day`.
    pub fn sessions_on_day(&self, day: i64) -> Vec<WorkoutRecord> {
        stats::sessions_on_day(self.list_active(), day)
    }

    /// Consecutive days up to today with at least one session.
    pub fn completion_streak(&self) -> u32 {
        stats::completion_streak(self.list_active(), self.db.now())
    }

    /// Totals and averages over the last `days` days.
    pub fn stats_since(&self, days: u32) -> WorkoutStats {
        stats::stats_since(self.list_active(), self.db.now(), days)
    }

    fn live(&self, id: WorkoutId) -> CoreResult<StoredWorkout> {
        let stored = self
            .db
            .store()
            .get_stored(id)
            .ok_or(CoreError::NotFound(id))?;
        if stored.record.deleted {
            return Err(CoreError::RecordDeleted(id));
        }
        Ok(stored)
    }

    fn changed(&self, id: WorkoutId) {
        self.engine.emit(SyncEvent::RecordChanged(id));
        self.request_sync();
    }
}

/// Writes a locally changed record, keeping a held conflict in place.
fn put_pending(batch: &mut WriteBatch, stored: &StoredWorkout, record: WorkoutRecord, kind: OpKind) {
    match (&stored.sync_state, &stored.conflict) {
        (SyncState::Conflicted, Some(remote)) => {
            batch.put_conflicted(record, remote.clone());
        }
        _ => {
            batch.put_record(record, SyncState::pending_for(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::InMemoryRemote;
    use fitsync_core::{Clock, Timestamp, MILLIS_PER_DAY};
    use fitsync_testkit::fixtures::{sessions, TestStore, FIXTURE_EPOCH};
    use std::time::Duration;

    fn repository(store: &TestStore) -> WorkoutRepository<Arc<InMemoryRemote>> {
        let engine = SyncEngine::new(
            store.db.clone(),
            Arc::new(InMemoryRemote::new()),
            SyncConfig::new().without_sync_interval(),
        );
        WorkoutRepository::new(Arc::new(engine))
    }

    #[test]
    fn create_assigns_sync_metadata() {
        let store = TestStore::memory();
        let repo = repository(&store);

        let mut draft = sessions::strength(Duration::ZERO);
        draft.revision = 42;
        let saved = repo.create(draft.clone()).unwrap();

        assert_eq!(saved.revision, 1);
        assert_eq!(saved.updated_at, store.clock.now());
        assert_eq!(repo.get(draft.id), Some(saved.clone()));
        assert_eq!(repo.sync_state(draft.id), Some(SyncState::PendingCreate));
        let entry = store.mutations().entry_for(draft.id).unwrap();
        assert_eq!(entry.op_kind, OpKind::Create);
        assert_eq!(entry.payload_snapshot, saved);

        assert!(matches!(
            repo.create(draft),
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn create_rejects_invalid_workout() {
        let store = TestStore::memory();
        let repo = repository(&store);
        let backwards = WorkoutRecord::new(Timestamp::from_millis(10), Timestamp::from_millis(5));
        assert!(matches!(
            repo.create(backwards),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(store.mutations().is_empty());
    }

    #[test]
    fn update_bumps_revision_and_keeps_create_pending() {
        let store = TestStore::memory();
        let repo = repository(&store);
        let saved = repo.create(sessions::run(Duration::ZERO)).unwrap();

        store.clock.advance(Duration::from_secs(5));
        let updated = repo.update(saved.clone().calories(512)).unwrap();
        assert_eq!(updated.revision, 2);
        assert!(updated.updated_at > saved.updated_at);
        assert_eq!(repo.sync_state(saved.id), Some(SyncState::PendingCreate));
        assert_eq!(store.mutations().len(), 1);
        assert_eq!(
            store.mutations().entry_for(saved.id).unwrap().op_kind,
            OpKind::Create
        );
    }

    #[test]
    fn missing_and_deleted_records() {
        let store = TestStore::memory();
        let repo = repository(&store);
        let unknown = sessions::run(Duration::ZERO);
        assert!(matches!(repo.update(unknown.clone()), Err(CoreError::NotFound(_))));
        assert!(matches!(repo.delete(unknown.id), Err(CoreError::NotFound(_))));

        let saved = repo.create(unknown).unwrap();
        repo.delete(saved.id).unwrap();
        assert_eq!(repo.get(saved.id), None);
        assert_eq!(repo.sync_state(saved.id), Some(SyncState::PendingDelete));
        assert!(matches!(repo.update(saved.clone()), Err(CoreError::RecordDeleted(_))));
        assert!(matches!(repo.delete(saved.id), Err(CoreError::RecordDeleted(_))));
    }

    #[test]
    fn writes_publish_events() {
        let store = TestStore::memory();
        let repo = repository(&store);
        let mut events = repo.subscribe();

        let saved = repo.create(sessions::strength(Duration::ZERO)).unwrap();
        repo.delete(saved.id).unwrap();

        assert_eq!(events.try_recv().unwrap(), SyncEvent::RecordChanged(saved.id));
        assert_eq!(events.try_recv().unwrap(), SyncEvent::RecordChanged(saved.id));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn resolve_requires_a_conflict() {
        let store = TestStore::memory();
        let repo = repository(&store);
        let saved = repo.create(sessions::strength(Duration::ZERO)).unwrap();
        assert!(matches!(
            repo.resolve_conflict(saved.id, ConflictChoice::KeepLocal),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            repo.discard_abandoned(saved.id),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn stats_over_live_sessions() {
        let store = TestStore::memory();
        let repo = repository(&store);
        let day = Duration::from_millis(MILLIS_PER_DAY as u64);
        let old = repo.create(sessions::strength(Duration::ZERO)).unwrap();
        let yesterday = repo.create(sessions::run(day * 11)).unwrap();
        let today = repo.create(sessions::strength(day * 12)).unwrap();
        repo.delete(old.id).unwrap();
        store
            .clock
            .set(FIXTURE_EPOCH.saturating_add(day * 12 + Duration::from_secs(7_200)));

        assert_eq!(repo.sessions_since(30).len(), 2);
        assert_eq!(repo.completion_streak(), 2);
        let summary = repo.stats_since(7);
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(
            summary.total_duration,
            today.duration() + yesterday.duration()
        );
        assert_eq!(summary.total_calories, 380 + 310);
        assert_eq!(
            repo.sessions_on_day(store.clock.now().day())
                .iter()
                .map(|r| r.id)
                .collect::<Vec<_>>(),
            vec![today.id]
        );
    }
}
