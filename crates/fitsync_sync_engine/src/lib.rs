//! # fitsync Sync Engine
//!
//! Synchronization of the local workout store with a remote service.
//!
//! This crate provides:
//! - Sync engine (idle → pulling → merging → pushing)
//! - Last-writer-wins conflict resolution, with an opt-in manual policy
//! - Background worker driven by timers, requests and connectivity
//! - Remote client abstraction with in-memory and HTTP adapters
//! - The `WorkoutRepository` facade used by the application
//!
//! ## Architecture
//!
//! The engine implements a **pull-merge-push** model:
//! 1. Pull every remote change after the stored cursor
//! 2. Merge them and the new cursor into the store in one batch
//! 3. Push the local mutations that were queued before the push began
//!
//! Local writes never wait for the network. The repository records them in
//! the store and the mutation log together; the engine uploads them later
//! and retries transient failures with backoff.
//!
//! ## Key Invariants
//!
//! - Pull always happens before push
//! - A merge is atomic: after a crash every record is either before or
//!   after the merge
//! - Pushes are idempotent on the remote
//! - `revision` never decreases, locally or through merges
//! - No record lock is held across a remote call

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod http;
mod remote;
mod repository;
mod resolver;
pub mod scheduler;

pub use config::SyncConfig;
pub use engine::{AbandonedMutation, SyncEngine, SyncEvent, SyncPhase, SyncReport, SyncStats};
pub use error::{RemoteError, SyncError, SyncResult};
pub use http::{
    classify_status, HttpClient, HttpRemote, HttpResponse, LoopbackClient, LoopbackServer,
    PullRequest, PULL_PATH, PUSH_PATH,
};
pub use remote::{Ack, InMemoryRemote, Mutation, PullBatch, RemoteClient};
pub use repository::WorkoutRepository;
pub use resolver::{
    resolve, ConflictChoice, ConflictPolicy, ConflictRecord, Resolution, ResolveError, Side,
};
pub use scheduler::{SyncTrigger, SyncWorker};
