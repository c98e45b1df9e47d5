//! Durable queue of pending local mutations.

use crate::database::{Database, WriteBatch};
use crate::error::{CoreError, CoreResult};
use crate::mutation::{AbandonReason, EntryStatus, MutationLogEntry, MutationTicket};
use crate::types::{OpKind, Timestamp, WorkoutId};
use crate::workout::WorkoutRecord;
use std::collections::HashSet;
use tracing::{info, warn};

/// View of the pending-mutation queue.
///
/// Holds at most one entry per record. New intents for a record fold into
/// its existing entry (see [`OpKind::coalesce`]); the folded entry keeps its
/// place in the queue and gets a new generation, so a push that was already
/// in flight for the old payload cannot remove it.
#[derive(Debug, Clone)]
pub struct MutationLog {
    db: Database,
}

impl MutationLog {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queues an intent for `payload.id` and returns the resulting entry.
    ///
    /// # Errors
    ///
    /// [`CoreError::RecordDeleted`] when a create or update is queued on
    /// top of a pending delete.
    pub fn enqueue(&self, kind: OpKind, payload: WorkoutRecord) -> CoreResult<MutationLogEntry> {
        let id = payload.id;
        let _guard = self.db.lock_record(id);
        if let Some(existing) = self.entry_for(id) {
            if existing.op_kind == OpKind::Delete && kind != OpKind::Delete {
                return Err(CoreError::RecordDeleted(id));
            }
        }
        let mut batch = WriteBatch::new();
        batch.enqueue(kind, payload, self.db.now());
        self.db.commit(batch)?;
        self.entry_for(id).ok_or(CoreError::NotFound(id))
    }

    /// Oldest entry that may be pushed now, without removing it.
    ///
    /// Skips abandoned entries, entries still backing off and entries of
    /// records waiting for a conflict decision.
    #[must_use]
    pub fn dequeue_next(&self) -> Option<MutationLogEntry> {
        self.dequeue_next_before(u64::MAX, &HashSet::new())
    }

    /// Like [`Self::dequeue_next`], restricted to entries with
    /// `seq < watermark` whose target is not in `skip`.
    #[must_use]
    pub fn dequeue_next_before(
        &self,
        watermark: u64,
        skip: &HashSet<WorkoutId>,
    ) -> Option<MutationLogEntry> {
        let now = self.db.now();
        self.db.read_state(|state| {
            state
                .queued()
                .take_while(|entry| entry.seq < watermark)
                .find(|entry| {
                    entry.is_eligible(now)
                        && !skip.contains(&entry.target_id)
                        && !state.is_on_hold(&entry.target_id)
                })
                .cloned()
        })
    }

    /// Removes the entry if it was not superseded since it was dequeued.
    ///
    /// Returns true if the entry is gone. A superseded entry stays queued
    /// with its newer payload; a superseded create turns into an update.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn mark_succeeded(&self, ticket: &MutationTicket) -> CoreResult<bool> {
        let _guard = self.db.lock_record(ticket.target_id);
        let mut batch = WriteBatch::new();
        batch.acknowledge(ticket);
        self.db.commit(batch)?;
        Ok(self.entry_for(ticket.target_id).is_none())
    }

    /// Records a transient failure.
    ///
    /// The entry goes to the back of the queue and backs off according to
    /// the retry policy; once the retry ceiling is reached it is abandoned
    /// instead. Returns the updated entry.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn mark_failed(
        &self,
        ticket: &MutationTicket,
        error: &str,
    ) -> CoreResult<Option<MutationLogEntry>> {
        let _guard = self.db.lock_record(ticket.target_id);
        let Some(current) = self.entry_for(ticket.target_id) else {
            return Ok(None);
        };

        let retry = &self.db.config().retry;
        let attempt = current.attempt_count + 1;
        let not_before = self.db.now().saturating_add(retry.delay_for_attempt(attempt));

        let mut batch = WriteBatch::new();
        batch.fail(ticket, error, not_before, retry.max_attempts);
        self.db.commit(batch)?;

        let updated = self.entry_for(ticket.target_id);
        if let Some(entry) = &updated {
            if matches!(entry.status, EntryStatus::Abandoned(_)) {
                warn!(
                    target = %entry.target_id,
                    attempts = entry.attempt_count,
                    error,
                    "mutation abandoned after retry ceiling"
                );
            }
        }
        Ok(updated)
    }

    /// Gives up on an entry after a permanent failure.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn abandon(&self, ticket: &MutationTicket, error: &str) -> CoreResult<()> {
        let _guard = self.db.lock_record(ticket.target_id);
        let mut batch = WriteBatch::new();
        batch.abandon(ticket, error, AbandonReason::Rejected);
        self.db.commit(batch)?;
        warn!(target = %ticket.target_id, error, "mutation rejected by remote");
        Ok(())
    }

    /// Abandoned entries, oldest first.
    #[must_use]
    pub fn list_abandoned(&self) -> Vec<MutationLogEntry> {
        self.db.read_state(|state| {
            state
                .queued()
                .filter(|entry| !entry.is_pending())
                .cloned()
                .collect()
        })
    }

    /// Puts an abandoned entry back in the queue with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the record has no abandoned entry.
    pub fn retry_abandoned(&self, id: WorkoutId) -> CoreResult<()> {
        let _guard = self.db.lock_record(id);
        match self.entry_for(id) {
            Some(entry) if !entry.is_pending() => {
                let mut batch = WriteBatch::new();
                batch.revive(id);
                self.db.commit(batch)?;
                info!(target = %id, "abandoned mutation requeued");
                Ok(())
            }
            _ => Err(CoreError::NotFound(id)),
        }
    }

    /// Drops the entry for a record and returns it.
    ///
    /// # Errors
    ///
    /// Returns the journal error.
    pub fn discard(&self, id: WorkoutId) -> CoreResult<Option<MutationLogEntry>> {
        let _guard = self.db.lock_record(id);
        let entry = self.entry_for(id);
        if entry.is_some() {
            let mut batch = WriteBatch::new();
            batch.discard(id);
            self.db.commit(batch)?;
        }
        Ok(entry)
    }

    /// The queued entry for a record, pending or abandoned.
    #[must_use]
    pub fn entry_for(&self, id: WorkoutId) -> Option<MutationLogEntry> {
        self.db.read_state(|state| state.entries.get(&id).cloned())
    }

    /// All entries in queue order.
    #[must_use]
    pub fn entries(&self) -> Vec<MutationLogEntry> {
        self.db
            .read_state(|state| state.queued().cloned().collect())
    }

    /// Number of entries not abandoned.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.db
            .read_state(|state| state.queued().filter(|e| e.is_pending()).count())
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.db.read_state(|state| state.entries.len())
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number the next new entry will get.
    ///
    /// Everything already queued has a smaller seq, which makes this a
    /// watermark for "entries that existed when a push phase began".
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.db.read_state(|state| state.next_seq)
    }

    /// Earliest backoff deadline among pending entries that are waiting.
    #[must_use]
    pub fn next_eligible_at(&self) -> Option<Timestamp> {
        let now = self.db.now();
        self.db.read_state(|state| {
            state
                .queued()
                .filter(|e| e.is_pending() && !state.is_on_hold(&e.target_id))
                .filter_map(|e| e.not_before)
                .filter(|t| *t > now)
                .min()
        })
    }
}
