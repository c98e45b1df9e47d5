//! Configuration for the sync engine.

use crate::resolver::ConflictPolicy;
use std::time::Duration;

/// Configuration for sync cycles and the background worker.
///
/// Retry ceiling and backoff timings live in the store's
/// [`fitsync_core::RetryPolicy`]; the engine uses the same policy for
/// mutations and for whole failed cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of automatic sync (None = only on request).
    pub sync_interval: Option<Duration>,
    /// Limit for every single remote call.
    pub request_timeout: Duration,
    /// Maximum records requested per pull page.
    pub pull_page_size: u32,
    /// How concurrent local and remote edits are reconciled.
    pub conflict_policy: ConflictPolicy,
    /// Capacity of the event channel; slow subscribers lose old events.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            sync_interval: Some(Duration::from_secs(15 * 60)),
            request_timeout: Duration::from_secs(30),
            pull_page_size: 100,
            conflict_policy: ConflictPolicy::LastWriterWins,
            event_capacity: 256,
        }
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disables periodic sync.
    pub fn without_sync_interval(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the pull page size (at least 1).
    pub fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the event channel capacity (at least 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
