//! Journal operations.

use crate::mutation::{AbandonReason, MutationLogEntry};
use crate::types::{OpKind, SyncCursor, SyncState, Timestamp, WorkoutId};
use crate::workout::WorkoutRecord;
use serde::{Deserialize, Serialize};

/// One state change recorded in the journal.
///
/// Ops carry every input their effect depends on (timestamps, backoff
/// deadlines, retry ceilings), so replaying a journal rebuilds exactly the
/// state the live commits produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Inserts or replaces a record together with its sync state.
    PutRecord {
        /// The record.
        record: WorkoutRecord,
        /// Its sync state.
        state: SyncState,
        /// Remote version held while the record is conflicted.
        conflict: Option<WorkoutRecord>,
    },

    /// Physically removes a record.
    PurgeRecord {
        /// The record to remove.
        id: WorkoutId,
    },

    /// Queues a new intent, folding it into an existing entry if there is one.
    Enqueue {
        /// Target record.
        target: WorkoutId,
        /// Kind of the new intent.
        kind: OpKind,
        /// Desired remote state.
        payload: WorkoutRecord,
        /// Time of the intent.
        at: Timestamp,
    },

    /// Overwrites kind and payload of the queued entry, keeping its position.
    ReplaceEntry {
        /// Target record.
        target: WorkoutId,
        /// New kind.
        kind: OpKind,
        /// New payload.
        payload: WorkoutRecord,
        /// Used as `enqueued_at` if no entry exists yet.
        at: Timestamp,
    },

    /// A push of the given generation was accepted.
    Acknowledge {
        /// Target record.
        target: WorkoutId,
        /// Generation that was pushed.
        generation: u64,
    },

    /// A push of the given generation failed transiently.
    Fail {
        /// Target record.
        target: WorkoutId,
        /// Generation that was pushed.
        generation: u64,
        /// Error text.
        error: String,
        /// Backoff deadline if the entry stays pending.
        not_before: Timestamp,
        /// Retry ceiling in force.
        max_attempts: u32,
    },

    /// A push of the given generation failed for good.
    Abandon {
        /// Target record.
        target: WorkoutId,
        /// Generation that was pushed.
        generation: u64,
        /// Error text.
        error: String,
        /// Why it was given up on.
        reason: AbandonReason,
    },

    /// Puts an abandoned entry back at the tail of the queue.
    Revive {
        /// Target record.
        target: WorkoutId,
    },

    /// Drops the entry for a record.
    Discard {
        /// Target record.
        target: WorkoutId,
    },

    /// Restores an entry verbatim (compaction snapshots).
    RestoreEntry {
        /// The entry.
        entry: MutationLogEntry,
    },

    /// Records the position of the last completed pull.
    SetCursor {
        /// The cursor.
        cursor: SyncCursor,
    },

    /// Restores the queue sequence counter (compaction snapshots).
    SetNextSeq {
        /// Next sequence number to hand out.
        next: u64,
    },
}
