//! Identifiers, timestamps and per-record sync bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Milliseconds in one UTC day.
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Stable, client-generated identifier of a workout.
///
/// Generated once on the device that creates the workout and never changed
/// afterwards.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkoutId(Uuid);

impl WorkoutId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates an id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkoutId({})", self.0)
    }
}

impl fmt::Display for WorkoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in time as Unix milliseconds (UTC).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    /// Creates a timestamp from Unix milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns Unix milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns this timestamp moved forward by `duration`, saturating.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Returns this timestamp moved back by `duration`, saturating.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0).max(0);
        Duration::from_millis(delta.unsigned_abs())
    }

    /// UTC day number (days since the epoch) this timestamp falls on.
    #[must_use]
    pub const fn day(self) -> i64 {
        self.0.div_euclid(MILLIS_PER_DAY)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Opaque position in the remote change stream.
///
/// Issued by the remote service and echoed back on the next pull. The
/// store never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Wraps a token issued by the remote.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synchronization status of one local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Local and remote agree.
    Clean,
    /// Created locally, not yet accepted remotely.
    PendingCreate,
    /// Changed locally, not yet accepted remotely.
    PendingUpdate,
    /// Deleted locally, tombstone not yet accepted remotely.
    PendingDelete,
    /// A remote change collided with a pending local one and is waiting for
    /// a caller decision.
    Conflicted,
}

impl SyncState {
    /// True for the three `Pending*` states.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete
        )
    }

    /// The pending state that matches a queued operation.
    #[must_use]
    pub const fn pending_for(kind: OpKind) -> Self {
        match kind {
            OpKind::Create => Self::PendingCreate,
            OpKind::Update => Self::PendingUpdate,
            OpKind::Delete => Self::PendingDelete,
        }
    }
}

/// Kind of change carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// First write of a record.
    Create,
    /// Replacement of an existing record.
    Update,
    /// Tombstoning of an existing record.
    Delete,
}

impl OpKind {
    /// The kind that results from queuing `next` on top of `self` for the
    /// same record: latest intent wins, a delete always supersedes, and a
    /// record never pushed stays a create.
    #[must_use]
    pub const fn coalesce(self, next: OpKind) -> OpKind {
        match (self, next) {
            (_, OpKind::Delete) => OpKind::Delete,
            (OpKind::Create, _) => OpKind::Create,
            (_, next) => next,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_rules() {
        assert_eq!(OpKind::Create.coalesce(OpKind::Update), OpKind::Create);
        assert_eq!(OpKind::Create.coalesce(OpKind::Delete), OpKind::Delete);
        assert_eq!(OpKind::Update.coalesce(OpKind::Update), OpKind::Update);
        assert_eq!(OpKind::Update.coalesce(OpKind::Delete), OpKind::Delete);
        assert_eq!(OpKind::Delete.coalesce(OpKind::Delete), OpKind::Delete);
    }

    #[test]
    fn day_uses_euclidean_division() {
        assert_eq!(Timestamp::from_millis(0).day(), 0);
        assert_eq!(Timestamp::from_millis(MILLIS_PER_DAY - 1).day(), 0);
        assert_eq!(Timestamp::from_millis(MILLIS_PER_DAY).day(), 1);
        assert_eq!(Timestamp::from_millis(-1).day(), -1);
    }

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(t.saturating_add(Duration::from_secs(2)).as_millis(), 3_000);
        assert_eq!(t.saturating_sub(Duration::from_secs(2)).as_millis(), -1_000);
        assert_eq!(
            Timestamp::from_millis(5_000).duration_since(t),
            Duration::from_secs(4)
        );
        assert_eq!(t.duration_since(Timestamp::from_millis(5_000)), Duration::ZERO);
    }

    #[test]
    fn pending_states() {
        assert!(SyncState::pending_for(OpKind::Delete).is_pending());
        assert!(!SyncState::Clean.is_pending());
        assert!(!SyncState::Conflicted.is_pending());
    }

    #[test]
    fn workout_id_display_is_uuid() {
        let uuid = Uuid::new_v4();
        let id = WorkoutId::from_uuid(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), &uuid);
    }
}
