//! # fitsync Core
//!
//! Durable local workout store for fitsync.
//!
//! This crate provides:
//! - Journal with batch atomicity and crash recovery
//! - Local store of workout records with per-record sync state
//! - Mutation log of pending local changes (coalescing, backoff, abandonment)
//! - Per-record write locks
//! - Session statistics
//!
//! ## Architecture
//!
//! A [`Database`] owns a journal on a [`fitsync_storage::StorageBackend`]
//! and an in-memory image rebuilt from it on open. Every change, whether a
//! record write, a queue update or a new pull cursor, is expressed as
//! journal ops collected in a [`WriteBatch`]. A batch is written and flushed
//! first and only then applied to the image, so readers see it whole or not
//! at all, before and after a crash.
//!
//! [`LocalStore`] and [`MutationLog`] are views over the same database;
//! code that must change both atomically builds one batch itself while
//! holding the affected [`RecordGuard`]s.
//!
//! ## Key Invariants
//!
//! - Local reads never touch the network
//! - A write is durable when it returns
//! - At most one queued mutation per record
//! - A mutation leaves the queue only after remote confirmation or an
//!   explicit caller decision

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
pub mod codec;
mod config;
mod database;
mod error;
pub mod journal;
mod mutation;
mod mutation_log;
mod state;
pub mod stats;
mod store;
mod types;
mod workout;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RetryPolicy};
pub use database::{Database, RecordGuard, WriteBatch};
pub use error::{CoreError, CoreResult};
pub use mutation::{AbandonReason, EntryStatus, MutationLogEntry, MutationTicket};
pub use mutation_log::MutationLog;
pub use state::StoredWorkout;
pub use stats::WorkoutStats;
pub use store::{ActiveRecords, LocalStore};
pub use types::{OpKind, SyncCursor, SyncState, Timestamp, WorkoutId, MILLIS_PER_DAY};
pub use workout::{
    EnergyLevel, ExerciseCategory, ExerciseEntry, ExerciseSet, Intensity, Mood, MuscleGroup,
    WorkoutRecord,
};
