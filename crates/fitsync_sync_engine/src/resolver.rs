//! Conflict resolution between a pending local version and an incoming
//! remote version of the same workout.
//!
//! ## Rules
//!
//! 1. A local tombstone loses to a live remote version only if the remote
//!    `updated_at` is strictly newer.
//! 2. Otherwise the newer `updated_at` wins, then the higher `revision`,
//!    then the remote.
//!
//! A local winner comes back with `revision = max(local, remote) + 1` so that
//! pushing it supersedes the remote version. A remote winner comes back
//! unchanged.
//!
//! The function is deterministic but not symmetric: ties go to the remote,
//! so swapping the arguments can change the outcome.

use fitsync_core::{Timestamp, WorkoutId, WorkoutRecord};
use std::cmp::Ordering;
use thiserror::Error;

/// Which version won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local pending version.
    Local,
    /// The incoming remote version.
    Remote,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The winning side.
    pub winner: Side,
    /// The version to keep.
    pub record: WorkoutRecord,
}

/// Inputs that cannot be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The two versions describe different workouts.
    #[error("cannot resolve {local} against {remote}: different workouts")]
    IdMismatch {
        /// Id of the local version.
        local: WorkoutId,
        /// Id of the remote version.
        remote: WorkoutId,
    },
}

/// Picks the version to keep.
///
/// # Errors
///
/// [`ResolveError::IdMismatch`] if the ids differ.
pub fn resolve(
    local: &WorkoutRecord,
    remote: &WorkoutRecord,
) -> Result<Resolution, ResolveError> {
    if local.id != remote.id {
        return Err(ResolveError::IdMismatch {
            local: local.id,
            remote: remote.id,
        });
    }

    let winner = if local.deleted && !remote.deleted {
        if remote.updated_at > local.updated_at {
            Side::Remote
        } else {
            Side::Local
        }
    } else {
        match local
            .updated_at
            .cmp(&remote.updated_at)
            .then(local.revision.cmp(&remote.revision))
        {
            Ordering::Greater => Side::Local,
            Ordering::Less | Ordering::Equal => Side::Remote,
        }
    };

    let record = match winner {
        Side::Local => {
            let mut record = local.clone();
            record.revision = local.revision.max(remote.revision) + 1;
            record
        }
        Side::Remote => remote.clone(),
    };
    Ok(Resolution { winner, record })
}

/// How the engine treats a remote change to a record with a pending local
/// mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Apply [`resolve`] during the merge.
    #[default]
    LastWriterWins,
    /// Park the record as `Conflicted` until the caller picks a side.
    Manual,
}

/// Caller decision for a `Conflicted` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Keep the local version and push it.
    KeepLocal,
    /// Take the remote version and drop the local mutation.
    AcceptRemote,
}

/// A conflict met during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// The workout.
    pub id: WorkoutId,
    /// `updated_at` of the local pending version.
    pub local_updated_at: Timestamp,
    /// `updated_at` of the incoming version.
    pub remote_updated_at: Timestamp,
    /// The side kept, or None while waiting for a manual decision.
    pub winner: Option<Side>,
    /// Policy in effect.
    pub policy: ConflictPolicy,
}
