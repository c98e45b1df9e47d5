//! Sync engine: one pull, merge and push cycle at a time.

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{Ack, Mutation, RemoteClient};
use crate::resolver::{resolve, ConflictPolicy, ConflictRecord, Resolution, Side};
use fitsync_core::{
    Database, MutationLogEntry, MutationTicket, OpKind, StoredWorkout, SyncCursor,
    SyncState, Timestamp, WorkoutId, WorkoutRecord, WriteBatch,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Where the engine is in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No cycle running.
    Idle,
    /// Fetching remote changes.
    Pulling,
    /// Applying fetched changes to the local store.
    Merging,
    /// Sending queued local changes.
    Pushing,
    /// The last cycle ended with an error.
    Failed,
}

impl SyncPhase {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncPhase::Pulling | SyncPhase::Merging | SyncPhase::Pushing
        )
    }

    /// Returns true if a new cycle may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncPhase::Idle | SyncPhase::Failed)
    }
}

/// Notifications published by the engine and the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A record was written locally or by a merge.
    RecordChanged(WorkoutId),
    /// A record was physically removed.
    RecordRemoved(WorkoutId),
    /// A mutation will not be retried automatically.
    MutationAbandoned {
        /// The record.
        id: WorkoutId,
        /// Last error.
        error: String,
    },
    /// A cycle finished.
    CycleCompleted {
        /// Records fetched.
        pulled: usize,
        /// Mutations accepted by the remote.
        pushed: usize,
    },
    /// A cycle ended with an error.
    CycleFailed {
        /// The error.
        error: String,
    },
}

/// Cumulative statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that finished.
    pub cycles_completed: u64,
    /// Cycles that ended with an error.
    pub cycles_failed: u64,
    /// Records fetched.
    pub records_pulled: u64,
    /// Mutations accepted by the remote.
    pub mutations_pushed: u64,
    /// Conflicts met during merges.
    pub conflicts_resolved: u64,
    /// Mutations abandoned during pushes.
    pub mutations_abandoned: u64,
    /// When the last cycle finished.
    pub last_sync_at: Option<Timestamp>,
    /// Error of the last failed cycle.
    pub last_error: Option<String>,
}

/// A mutation abandoned during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedMutation {
    /// The record.
    pub id: WorkoutId,
    /// Kind of change.
    pub kind: OpKind,
    /// Why it was given up.
    pub error: String,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Records fetched, duplicates included.
    pub pulled: usize,
    /// Local records written or removed by the merge.
    pub applied: usize,
    /// Mutations accepted by the remote.
    pub pushed: usize,
    /// Pushes that failed transiently and will be retried.
    pub failed: usize,
    /// Mutations abandoned in this cycle.
    pub abandoned: Vec<AbandonedMutation>,
    /// Conflicts met during the merge.
    pub conflicts: Vec<ConflictRecord>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

struct Pulled {
    records: Vec<WorkoutRecord>,
    cursor: Option<SyncCursor>,
}

#[derive(Default)]
struct Merged {
    applied: usize,
    conflicts: Vec<ConflictRecord>,
    events: Vec<SyncEvent>,
}

impl Merged {
    fn changed(&mut self, id: WorkoutId) {
        self.applied += 1;
        self.events.push(SyncEvent::RecordChanged(id));
    }

    fn removed(&mut self, id: WorkoutId) {
        self.applied += 1;
        self.events.push(SyncEvent::RecordRemoved(id));
    }
}

/// Clears the running flag when a cycle ends, including when its future is
/// dropped mid-phase.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
    phase: &'a RwLock<SyncPhase>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut phase = self.phase.write();
        if phase.is_active() {
            *phase = SyncPhase::Idle;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Reconciles the local store with a remote service.
///
/// # Cycle
///
/// 1. **Pull** every page after the stored cursor. Nothing is applied yet.
/// 2. **Merge** all pulled records and the new cursor in one journal batch,
///    holding the locks of every touched record.
/// 3. **Push** the entries queued before the push began, oldest first.
///
/// Record locks are never held across a remote call. Cancellation is
/// checked between phases and between pushes.
pub struct SyncEngine<R: RemoteClient> {
    db: Database,
    remote: R,
    config: SyncConfig,
    phase: RwLock<SyncPhase>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
    running: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl<R: RemoteClient> SyncEngine<R> {
    /// Creates an engine for `db`.
    pub fn new(db: Database, remote: R, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            db,
            remote,
            config,
            phase: RwLock::new(SyncPhase::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            events,
        }
    }

    /// The local database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The remote client.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the current phase.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Asks the running cycle to stop at the next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
    }

    /// Runs one full cycle.
    ///
    /// # Errors
    ///
    /// - [`SyncError::CycleInProgress`] if a cycle is already running
    /// - [`SyncError::Cancelled`] if [`Self::cancel`] was called
    /// - [`SyncError::Remote`] or [`SyncError::Timeout`] if a pull failed
    /// - [`SyncError::Local`] if the local store failed
    ///
    /// Push failures do not fail the cycle; they are recorded on the
    /// mutations and listed in the report.
    pub async fn run_cycle(&self) -> SyncResult<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::CycleInProgress);
        }
        let _running = RunningGuard {
            running: &self.running,
            phase: &self.phase,
        };
        self.reset_cancel();

        let start = Instant::now();
        let result = self.cycle().await;
        match result {
            Ok(mut report) => {
                report.duration = start.elapsed();
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.records_pulled += report.pulled as u64;
                    stats.mutations_pushed += report.pushed as u64;
                    stats.conflicts_resolved += report.conflicts.len() as u64;
                    stats.mutations_abandoned += report.abandoned.len() as u64;
                    stats.last_sync_at = Some(self.db.now());
                }
                self.set_phase(SyncPhase::Idle);
                info!(
                    pulled = report.pulled,
                    applied = report.applied,
                    pushed = report.pushed,
                    failed = report.failed,
                    abandoned = report.abandoned.len(),
                    conflicts = report.conflicts.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "sync cycle completed"
                );
                self.emit(SyncEvent::CycleCompleted {
                    pulled: report.pulled,
                    pushed: report.pushed,
                });
                Ok(report)
            }
            Err(err) => {
                {
                    let mut stats = self.stats.write();
                    stats.cycles_failed += 1;
                    stats.last_error = Some(err.to_string());
                }
                self.set_phase(SyncPhase::Failed);
                warn!(error = %err, retryable = err.is_retryable(), "sync cycle failed");
                self.emit(SyncEvent::CycleFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn cycle(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        self.set_phase(SyncPhase::Pulling);
        let pulled = self.pull_all().await?;
        report.pulled = pulled.records.len();
        self.check_cancelled()?;

        self.set_phase(SyncPhase::Merging);
        let merged = self.merge(pulled)?;
        report.applied = merged.applied;
        report.conflicts = merged.conflicts;
        for event in merged.events {
            self.emit(event);
        }
        self.check_cancelled()?;

        self.set_phase(SyncPhase::Pushing);
        self.push_pending(&mut report).await?;
        Ok(report)
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, RemoteError>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn pull_all(&self) -> SyncResult<Pulled> {
        let start_cursor = self.db.cursor();
        let mut cursor = start_cursor.clone();
        let mut records = Vec::new();
        loop {
            let page = self
                .call(self.remote.pull(cursor.as_ref(), self.config.pull_page_size))
                .await?;
            debug!(
                records = page.records.len(),
                cursor = %page.cursor,
                has_more = page.has_more,
                "pulled page"
            );
            records.extend(page.records);
            let done = !page.has_more;
            cursor = Some(page.cursor);
            if done {
                break;
            }
            self.check_cancelled()?;
        }
        Ok(Pulled {
            records,
            cursor: cursor.filter(|c| Some(c) != start_cursor.as_ref()),
        })
    }

    fn merge(&self, pulled: Pulled) -> SyncResult<Merged> {
        let mut latest = BTreeMap::new();
        for record in pulled.records {
            latest.insert(record.id, record);
        }

        let _guards = self.db.lock_records(latest.keys().copied());
        let store = self.db.store();
        let log = self.db.mutations();
        let mut batch = WriteBatch::new();
        let mut merged = Merged::default();

        for (id, remote) in latest {
            match (store.get_stored(id), log.entry_for(id)) {
                (None, _) => {
                    if !remote.deleted {
                        batch.put_record(remote, SyncState::Clean);
                        merged.changed(id);
                    }
                }
                (Some(stored), None) => {
                    apply_remote(&mut batch, &mut merged, &stored.record, remote);
                }
                (Some(stored), Some(entry)) => {
                    self.merge_pending(&mut batch, &mut merged, stored, &entry, remote);
                }
            }
        }

        if let Some(cursor) = pulled.cursor {
            batch.set_cursor(cursor);
        }
        self.db.commit(batch)?;
        Ok(merged)
    }

    fn merge_pending(
        &self,
        batch: &mut WriteBatch,
        merged: &mut Merged,
        stored: StoredWorkout,
        entry: &MutationLogEntry,
        remote: WorkoutRecord,
    ) {
        let id = stored.record.id;
        let local = stored.record;

        if stored.sync_state == SyncState::Conflicted {
            debug!(%id, "refreshing held remote version");
            batch.put_conflicted(local, remote);
            return;
        }

        if remote.revision == local.revision && remote.same_content(&local) {
            // Our own version came back: the push landed but its ack did not.
            debug!(%id, revision = remote.revision, "pending mutation already applied remotely");
            batch.discard(id);
            if local.deleted {
                batch.purge(id);
                merged.removed(id);
            } else {
                batch.put_record(local, SyncState::Clean);
                merged.changed(id);
            }
            return;
        }

        let policy = self.config.conflict_policy;
        let mut conflict = ConflictRecord {
            id,
            local_updated_at: local.updated_at,
            remote_updated_at: remote.updated_at,
            winner: None,
            policy,
        };

        if policy == ConflictPolicy::Manual && !remote.same_content(&local) {
            info!(%id, pending = %entry.op_kind, "conflict held for a decision");
            batch.put_conflicted(local, remote);
            merged.conflicts.push(conflict);
            merged.changed(id);
            return;
        }

        let resolution = resolve(&local, &remote).unwrap_or_else(|err| {
            error!(error = %err, "conflict resolution failed, taking the remote version");
            Resolution {
                winner: Side::Remote,
                record: remote.clone(),
            }
        });
        debug!(%id, winner = ?resolution.winner, "conflict resolved");
        conflict.winner = Some(resolution.winner);
        merged.conflicts.push(conflict);

        match resolution.winner {
            Side::Remote => {
                // No entry remains, so the record is Clean even if its content is unchanged.
                batch.discard(id);
                let mut record = resolution.record;
                if record.deleted {
                    batch.purge(id);
                    merged.removed(id);
                } else {
                    record.revision = record.revision.max(local.revision);
                    batch.put_record(record, SyncState::Clean);
                    merged.changed(id);
                }
            }
            Side::Local => {
                let record = resolution.record;
                let kind = if record.deleted {
                    OpKind::Delete
                } else {
                    OpKind::Update
                };
                batch.put_record(record.clone(), SyncState::pending_for(kind));
                batch.replace_entry(kind, record, self.db.now());
                merged.changed(id);
            }
        }
    }

    async fn push_pending(&self, report: &mut SyncReport) -> SyncResult<()> {
        let log = self.db.mutations();
        let watermark = log.watermark();
        let mut attempted = HashSet::new();

        while let Some(entry) = log.dequeue_next_before(watermark, &attempted) {
            self.check_cancelled()?;
            attempted.insert(entry.target_id);
            let ticket = entry.ticket();
            let mutation = Mutation {
                kind: entry.op_kind,
                record: entry.payload_snapshot,
            };

            match self.call(self.remote.push(&mutation)).await {
                Ok(ack) => {
                    self.complete_push(&ticket, ack)?;
                    report.pushed += 1;
                }
                Err(SyncError::Remote(RemoteError::Permanent(message))) => {
                    log.abandon(&ticket, &message)?;
                    self.abandoned(report, &ticket, message);
                }
                Err(err) if err.is_retryable() => {
                    let message = err.to_string();
                    report.failed += 1;
                    let updated = log.mark_failed(&ticket, &message)?;
                    if updated.map_or(false, |entry| !entry.is_pending()) {
                        self.abandoned(report, &ticket, message);
                    }
                    debug!(id = %ticket.target_id, "push failed, ending push phase");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn complete_push(&self, ticket: &MutationTicket, ack: Ack) -> SyncResult<()> {
        let id = ticket.target_id;
        let _guard = self.db.lock_record(id);
        let store = self.db.store();
        let Some(current) = self.db.mutations().entry_for(id) else {
            return Ok(());
        };
        let superseded = current.generation != ticket.generation;

        let mut batch = WriteBatch::new();
        batch.acknowledge(ticket);
        let mut event = None;
        match store.get_stored(id) {
            Some(_) if !superseded && ticket.op_kind == OpKind::Delete => {
                batch.purge(id);
                event = Some(SyncEvent::RecordRemoved(id));
            }
            Some(stored) if !superseded => {
                let mut record = stored.record;
                record.revision = record.revision.max(ack.revision);
                batch.put_record(record, SyncState::Clean);
                event = Some(SyncEvent::RecordChanged(id));
            }
            Some(stored)
                if ticket.op_kind == OpKind::Create
                    && stored.sync_state == SyncState::PendingCreate =>
            {
                batch.put_record(stored.record, SyncState::PendingUpdate);
            }
            _ => {}
        }
        self.db.commit(batch)?;
        debug!(%id, kind = %ticket.op_kind, superseded, "push acknowledged");
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    fn abandoned(&self, report: &mut SyncReport, ticket: &MutationTicket, error: String) {
        report.abandoned.push(AbandonedMutation {
            id: ticket.target_id,
            kind: ticket.op_kind,
            error: error.clone(),
        });
        self.emit(SyncEvent::MutationAbandoned {
            id: ticket.target_id,
            error,
        });
    }
}

/// Writes an accepted remote version over a record with nothing pending.
fn apply_remote(
    batch: &mut WriteBatch,
    merged: &mut Merged,
    local: &WorkoutRecord,
    mut remote: WorkoutRecord,
) {
    let id = local.id;
    if remote.deleted {
        batch.purge(id);
        merged.removed(id);
        return;
    }
    if remote.revision <= local.revision && remote.same_content(local) {
        return;
    }
    remote.revision = remote.revision.max(local.revision);
    batch.put_record(remote, SyncState::Clean);
    merged.changed(id);
}
