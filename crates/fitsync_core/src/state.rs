//! In-memory image of the journal.
//!
//! `StoreState::apply` is the only code that changes store contents. Live
//! commits and recovery both go through it, op by op, in journal order.

use crate::journal::JournalOp;
use crate::mutation::{AbandonReason, EntryStatus, MutationLogEntry};
use crate::types::{OpKind, SyncCursor, SyncState, Timestamp, WorkoutId};
use crate::workout::WorkoutRecord;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A record as held in the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorkout {
    /// The record (possibly a tombstone).
    pub record: WorkoutRecord,
    /// Its sync state.
    pub sync_state: SyncState,
    /// Remote version waiting for a decision while `Conflicted`.
    pub conflict: Option<WorkoutRecord>,
}

#[derive(Debug)]
pub(crate) struct StoreState {
    pub(crate) records: HashMap<WorkoutId, StoredWorkout>,
    pub(crate) entries: HashMap<WorkoutId, MutationLogEntry>,
    /// seq -> target, the queue order.
    pub(crate) queue: BTreeMap<u64, WorkoutId>,
    pub(crate) cursor: Option<SyncCursor>,
    pub(crate) next_seq: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            entries: HashMap::new(),
            queue: BTreeMap::new(),
            cursor: None,
            next_seq: 1,
        }
    }
}

impl StoreState {
    pub(crate) fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::PutRecord {
                record,
                state,
                conflict,
            } => {
                self.records.insert(
                    record.id,
                    StoredWorkout {
                        record,
                        sync_state: state,
                        conflict,
                    },
                );
            }

            JournalOp::PurgeRecord { id } => {
                self.records.remove(&id);
            }

            JournalOp::Enqueue {
                target,
                kind,
                payload,
                at,
            } => self.enqueue(target, kind, payload, at),

            JournalOp::ReplaceEntry {
                target,
                kind,
                payload,
                at,
            } => match self.entries.get_mut(&target) {
                Some(entry) => {
                    entry.op_kind = kind;
                    entry.payload_snapshot = payload;
                    entry.generation += 1;
                }
                None => self.insert_entry(target, kind, payload, at),
            },

            JournalOp::Acknowledge { target, generation } => {
                let Some(entry) = self.entries.get_mut(&target) else {
                    return;
                };
                if entry.generation == generation {
                    self.remove_entry(target);
                } else if entry.op_kind == OpKind::Create {
                    // The create landed; what is left is an update of it.
                    entry.op_kind = OpKind::Update;
                }
            }

            JournalOp::Fail {
                target,
                generation,
                error,
                not_before,
                max_attempts,
            } => {
                let Some(entry) = self.entries.get_mut(&target) else {
                    return;
                };
                if entry.generation != generation {
                    return;
                }
                entry.attempt_count += 1;
                entry.last_error = Some(error);
                if entry.attempt_count >= max_attempts {
                    entry.status = EntryStatus::Abandoned(AbandonReason::RetryCeiling);
                    entry.not_before = None;
                } else {
                    entry.not_before = Some(not_before);
                    self.move_to_tail(target);
                }
            }

            JournalOp::Abandon {
                target,
                generation,
                error,
                reason,
            } => {
                let Some(entry) = self.entries.get_mut(&target) else {
                    return;
                };
                if entry.generation != generation {
                    return;
                }
                entry.attempt_count += 1;
                entry.last_error = Some(error);
                entry.not_before = None;
                entry.status = EntryStatus::Abandoned(reason);
            }

            JournalOp::Revive { target } => {
                let Some(entry) = self.entries.get_mut(&target) else {
                    return;
                };
                entry.status = EntryStatus::Pending;
                entry.attempt_count = 0;
                entry.last_error = None;
                entry.not_before = None;
                self.move_to_tail(target);
            }

            JournalOp::Discard { target } => self.remove_entry(target),

            JournalOp::RestoreEntry { entry } => {
                self.next_seq = self.next_seq.max(entry.seq + 1);
                self.queue.insert(entry.seq, entry.target_id);
                self.entries.insert(entry.target_id, entry);
            }

            JournalOp::SetCursor { cursor } => self.cursor = Some(cursor),

            JournalOp::SetNextSeq { next } => self.next_seq = self.next_seq.max(next),
        }
    }

    fn enqueue(&mut self, target: WorkoutId, kind: OpKind, payload: WorkoutRecord, at: Timestamp) {
        let Some(entry) = self.entries.get_mut(&target) else {
            self.insert_entry(target, kind, payload, at);
            return;
        };

        let merged = entry.op_kind.coalesce(kind);
        debug!(
            target = %target,
            from = %entry.op_kind,
            to = %merged,
            seq = entry.seq,
            "coalescing mutation"
        );
        entry.op_kind = merged;
        entry.payload_snapshot = payload;
        entry.generation += 1;
        entry.attempt_count = 0;
        entry.last_error = None;
        entry.not_before = None;
        entry.status = EntryStatus::Pending;
    }

    fn insert_entry(&mut self, target: WorkoutId, kind: OpKind, payload: WorkoutRecord, at: Timestamp) {
        let seq = self.take_seq();
        self.queue.insert(seq, target);
        self.entries.insert(
            target,
            MutationLogEntry {
                seq,
                target_id: target,
                op_kind: kind,
                payload_snapshot: payload,
                enqueued_at: at,
                attempt_count: 0,
                last_error: None,
                not_before: None,
                generation: 0,
                status: EntryStatus::Pending,
            },
        );
    }

    fn remove_entry(&mut self, target: WorkoutId) {
        if let Some(entry) = self.entries.remove(&target) {
            self.queue.remove(&entry.seq);
        }
    }

    fn move_to_tail(&mut self, target: WorkoutId) {
        let seq = self.take_seq();
        if let Some(entry) = self.entries.get_mut(&target) {
            self.queue.remove(&entry.seq);
            entry.seq = seq;
            self.queue.insert(seq, target);
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Queue entries in push order.
    pub(crate) fn queued(&self) -> impl Iterator<Item = &MutationLogEntry> + '_ {
        self.queue
            .values()
            .filter_map(move |target| self.entries.get(target))
    }

    /// True if the record's queued entry must wait for a conflict decision.
    pub(crate) fn is_on_hold(&self, target: &WorkoutId) -> bool {
        self.records
            .get(target)
            .is_some_and(|stored| stored.sync_state == SyncState::Conflicted)
    }

    /// Ops that rebuild this exact state from an empty journal.
    pub(crate) fn snapshot(&self) -> Vec<JournalOp> {
        let mut ops = Vec::with_capacity(self.records.len() + self.entries.len() + 2);

        let mut ids: Vec<_> = self.records.keys().copied().collect();
        ids.sort();
        for id in ids {
            if let Some(stored) = self.records.get(&id) {
                ops.push(JournalOp::PutRecord {
                    record: stored.record.clone(),
                    state: stored.sync_state,
                    conflict: stored.conflict.clone(),
                });
            }
        }
        for entry in self.queued() {
            ops.push(JournalOp::RestoreEntry {
                entry: entry.clone(),
            });
        }
        if let Some(cursor) = &self.cursor {
            ops.push(JournalOp::SetCursor {
                cursor: cursor.clone(),
            });
        }
        ops.push(JournalOp::SetNextSeq {
            next: self.next_seq,
        });
        ops
    }
}
