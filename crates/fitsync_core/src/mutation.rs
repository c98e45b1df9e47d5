//! Queued mutation entries.

use crate::types::{OpKind, Timestamp, WorkoutId};
use crate::workout::WorkoutRecord;
use serde::{Deserialize, Serialize};

/// One intended change waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationLogEntry {
    /// Queue position; lower is older.
    pub seq: u64,
    /// Record the change applies to.
    pub target_id: WorkoutId,
    /// Kind of change.
    pub op_kind: OpKind,
    /// The record as it should exist remotely after the change.
    pub payload_snapshot: WorkoutRecord,
    /// When the first intent for this entry was queued.
    pub enqueued_at: Timestamp,
    /// Failed push attempts since the last new intent.
    pub attempt_count: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Earliest time the entry may be pushed again.
    pub not_before: Option<Timestamp>,
    /// Bumped every time a newer intent is folded into this entry.
    pub generation: u64,
    /// Pending or abandoned.
    pub status: EntryStatus,
}

impl MutationLogEntry {
    /// Ticket identifying exactly this version of the entry.
    #[must_use]
    pub fn ticket(&self) -> MutationTicket {
        MutationTicket {
            target_id: self.target_id,
            seq: self.seq,
            generation: self.generation,
            op_kind: self.op_kind,
        }
    }

    /// True if the entry is waiting to be pushed (not abandoned).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    /// True if the entry may be pushed at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.is_pending() && self.not_before.map_or(true, |t| t <= now)
    }
}

/// Lifecycle of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Waiting for (another) push attempt.
    Pending,
    /// Given up on; waits for the caller to retry or discard it.
    Abandoned(AbandonReason),
}

/// Why an entry was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    /// The remote refused the change.
    Rejected,
    /// Transient failures exhausted the retry budget.
    RetryCeiling,
}

/// Handle returned by a dequeue and handed back on completion.
///
/// Carries the entry's generation so that completing a push for a payload
/// that has since been superseded does not drop the newer intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationTicket {
    /// Target record.
    pub target_id: WorkoutId,
    /// Queue position at dequeue time.
    pub seq: u64,
    /// Entry generation at dequeue time.
    pub generation: u64,
    /// Kind at dequeue time.
    pub op_kind: OpKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> MutationLogEntry {
        let record = WorkoutRecord::new(Timestamp::from_millis(0), Timestamp::from_millis(60_000));
        MutationLogEntry {
            seq: 4,
            target_id: record.id,
            op_kind: OpKind::Create,
            payload_snapshot: record,
            enqueued_at: Timestamp::from_millis(0),
            attempt_count: 0,
            last_error: None,
            not_before: None,
            generation: 2,
            status: EntryStatus::Pending,
        }
    }

    #[test]
    fn eligibility_follows_backoff_and_status() {
        let mut entry = entry();
        assert!(entry.is_eligible(Timestamp::from_millis(0)));

        entry.not_before = Some(Timestamp::from_millis(1_000));
        assert!(!entry.is_eligible(Timestamp::from_millis(999)));
        assert!(entry.is_eligible(Timestamp::from_millis(1_000)));

        entry.status = EntryStatus::Abandoned(AbandonReason::Rejected);
        assert!(!entry.is_pending());
        assert!(!entry.is_eligible(Timestamp::from_millis(5_000)));
    }

    #[test]
    fn ticket_captures_generation() {
        let entry = entry();
        let ticket = entry.ticket();
        assert_eq!(ticket.target_id, entry.target_id);
        assert_eq!(ticket.seq, 4);
        assert_eq!(ticket.generation, 2);
        assert_eq!(ticket.op_kind, OpKind::Create);
    }
}
