//! Remote client abstraction and an in-process remote service.
//!
//! [`RemoteClient`] is the seam between the engine and whatever holds the
//! authoritative copy of the user's workouts. [`InMemoryRemote`] is a
//! complete in-process implementation with a change feed, idempotent
//! accepts and fault injection, used by tests and demos.

use crate::error::RemoteError;
use async_trait::async_trait;
use fitsync_core::{OpKind, SyncCursor, WorkoutId, WorkoutRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One page of remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    /// Changed records, oldest change first. Tombstones included.
    pub records: Vec<WorkoutRecord>,
    /// Position after this page.
    pub cursor: SyncCursor,
    /// True if more pages follow.
    pub has_more: bool,
}

/// A local change sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Kind of change.
    pub kind: OpKind,
    /// The record as it should exist remotely (a tombstone for deletes).
    pub record: WorkoutRecord,
}

/// Remote confirmation of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The record.
    pub id: WorkoutId,
    /// Revision the remote now holds.
    pub revision: u64,
}

/// Access to the remote workout service.
///
/// Implementations must treat a repeated push of an already accepted
/// version as success without applying it twice.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetches changes after `since` (from the beginning if None).
    async fn pull(&self, since: Option<&SyncCursor>, limit: u32)
        -> Result<PullBatch, RemoteError>;

    /// Sends one local change.
    async fn push(&self, mutation: &Mutation) -> Result<Ack, RemoteError>;
}

#[async_trait]
impl<R: RemoteClient + ?Sized> RemoteClient for Arc<R> {
    async fn pull(
        &self,
        since: Option<&SyncCursor>,
        limit: u32,
    ) -> Result<PullBatch, RemoteError> {
        (**self).pull(since, limit).await
    }

    async fn push(&self, mutation: &Mutation) -> Result<Ack, RemoteError> {
        (**self).push(mutation).await
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    records: HashMap<WorkoutId, WorkoutRecord>,
    /// Every accepted version in acceptance order. Cursors index into it.
    feed: Vec<WorkoutRecord>,
}

/// In-process remote service.
///
/// Accepts a pushed version if the record is unknown or the pushed
/// revision is higher than the stored one. Pushing the stored version
/// again is acknowledged without change. Anything else is rejected as a
/// stale write.
///
/// Cursors are positions in the feed of accepted versions.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    fail_next: AtomicU32,
    reject_next: AtomicU32,
    drop_acks: AtomicU32,
    latency: Mutex<Option<Duration>>,
    pushes_received: AtomicU64,
    pushes_applied: AtomicU64,
}

impl InMemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail transiently until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next `n` calls (pull or push) transiently.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Rejects the next `n` pushes permanently.
    pub fn reject_next_pushes(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Applies the next `n` pushes but reports a transient failure, as if
    /// the acknowledgement were lost on the way back.
    pub fn drop_next_acks(&self, n: u32) {
        self.drop_acks.store(n, Ordering::SeqCst);
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Writes a version as another device would, bypassing the revision
    /// check.
    pub fn put_remote(&self, record: WorkoutRecord) {
        let mut state = self.state.lock();
        state.feed.push(record.clone());
        state.records.insert(record.id, record);
    }

    /// The stored version of a record.
    pub fn get(&self, id: WorkoutId) -> Option<WorkoutRecord> {
        self.state.lock().records.get(&id).cloned()
    }

    /// Number of records known, tombstones included.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// True if no record is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of versions in the change feed.
    pub fn feed_len(&self) -> usize {
        self.state.lock().feed.len()
    }

    /// Number of push calls received, failed ones included.
    pub fn push_count(&self) -> u64 {
        self.pushes_received.load(Ordering::SeqCst)
    }

    /// Number of pushes that changed the stored data.
    pub fn accepted_count(&self) -> u64 {
        self.pushes_applied.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("remote unreachable"));
        }
        if take_one(&self.fail_next) {
            return Err(RemoteError::transient("injected failure"));
        }
        Ok(())
    }

    fn accept(&self, mutation: &Mutation) -> Result<Ack, RemoteError> {
        let incoming = &mutation.record;
        let mut state = self.state.lock();
        if let Some(stored) = state.records.get(&incoming.id) {
            if incoming.revision == stored.revision && incoming.same_content(stored) {
                debug!(id = %incoming.id, revision = incoming.revision, "duplicate push");
                return Ok(Ack {
                    id: incoming.id,
                    revision: stored.revision,
                });
            }
            if incoming.revision <= stored.revision {
                return Err(RemoteError::permanent(format!(
                    "stale revision {} for {} (remote has {})",
                    incoming.revision, incoming.id, stored.revision
                )));
            }
        }

        state.feed.push(incoming.clone());
        state.records.insert(incoming.id, incoming.clone());
        self.pushes_applied.fetch_add(1, Ordering::SeqCst);
        Ok(Ack {
            id: incoming.id,
            revision: incoming.revision,
        })
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn pull(
        &self,
        since: Option<&SyncCursor>,
        limit: u32,
    ) -> Result<PullBatch, RemoteError> {
        self.enter().await?;
        let start = match since {
            None => 0,
            Some(cursor) => cursor
                .as_str()
                .parse::<usize>()
                .map_err(|_| RemoteError::permanent(format!("malformed cursor {cursor}")))?,
        };

        let state = self.state.lock();
        let start = start.min(state.feed.len());
        let end = start
            .saturating_add(limit.max(1) as usize)
            .min(state.feed.len());
        Ok(PullBatch {
            records: state.feed[start..end].to_vec(),
            cursor: SyncCursor::new(end.to_string()),
            has_more: end < state.feed.len(),
        })
    }

    async fn push(&self, mutation: &Mutation) -> Result<Ack, RemoteError> {
        self.pushes_received.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if take_one(&self.reject_next) {
            return Err(RemoteError::permanent(format!(
                "{} rejected by validation",
                mutation.record.id
            )));
        }
        let ack = self.accept(mutation)?;
        if take_one(&self.drop_acks) {
            return Err(RemoteError::transient("connection reset before response"));
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_core::Timestamp;

    fn record(revision: u64) -> WorkoutRecord {
        let mut record =
            WorkoutRecord::new(Timestamp::from_millis(0), Timestamp::from_millis(60_000));
        record.revision = revision;
        record
    }

    fn upsert(record: &WorkoutRecord) -> Mutation {
        Mutation {
            kind: OpKind::Update,
            record: record.clone(),
        }
    }

    #[tokio::test]
    async fn pull_pages_through_the_feed() {
        let remote = InMemoryRemote::new();
        for _ in 0..5 {
            remote.put_remote(record(1));
        }

        let first = remote.pull(None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);

        let second = remote.pull(Some(&first.cursor), 10).await.unwrap();
        assert_eq!(second.records.len(), 3);
        assert!(!second.has_more);

        let empty = remote.pull(Some(&second.cursor), 10).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.cursor, second.cursor);
    }

    #[tokio::test]
    async fn duplicate_push_is_acknowledged_once() {
        let remote = InMemoryRemote::new();
        let record = record(1).calories(300);

        let ack = remote.push(&upsert(&record)).await.unwrap();
        assert_eq!(ack.revision, 1);
        let again = remote.push(&upsert(&record)).await.unwrap();
        assert_eq!(again, ack);

        assert_eq!(remote.accepted_count(), 1);
        assert_eq!(remote.push_count(), 2);
        assert_eq!(remote.feed_len(), 1);
    }

    #[tokio::test]
    async fn stale_revision_is_rejected_permanently() {
        let remote = InMemoryRemote::new();
        let mut newer = record(3);
        remote.put_remote(newer.clone());

        newer.revision = 2;
        let err = remote.push(&upsert(&newer)).await.unwrap_err();
        assert!(!err.is_retryable());

        newer.revision = 3;
        newer.notes = Some("different".into());
        assert!(remote.push(&upsert(&newer)).await.is_err());

        newer.revision = 4;
        assert!(remote.push(&upsert(&newer)).await.is_ok());
    }

    #[tokio::test]
    async fn injected_faults() {
        let remote = InMemoryRemote::new();
        let record = record(1);

        remote.fail_next(1);
        assert!(remote.pull(None, 10).await.unwrap_err().is_retryable());
        assert!(remote.pull(None, 10).await.is_ok());

        remote.set_offline(true);
        assert!(remote.push(&upsert(&record)).await.unwrap_err().is_retryable());
        remote.set_offline(false);

        remote.reject_next_pushes(1);
        assert!(!remote.push(&upsert(&record)).await.unwrap_err().is_retryable());
        assert!(remote.is_empty());

        remote.drop_next_acks(1);
        assert!(remote.push(&upsert(&record)).await.unwrap_err().is_retryable());
        assert_eq!(remote.get(record.id), Some(record.clone()));
        assert!(remote.push(&upsert(&record)).await.is_ok());
        assert_eq!(remote.accepted_count(), 1);
    }

    #[tokio::test]
    async fn malformed_cursor() {
        let remote = InMemoryRemote::new();
        let err = remote
            .pull(Some(&SyncCursor::new("not-a-position")), 10)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
