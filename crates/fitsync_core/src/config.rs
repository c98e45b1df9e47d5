//! Store configuration.

use rand::Rng;
use std::time::Duration;

/// Configuration for opening a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to `fsync` the journal on every commit (safer but slower).
    /// When false, commits are only flushed to the OS.
    pub sync_on_commit: bool,

    /// Journal size in bytes above which it is rewritten as a snapshot
    /// (0 = never compact).
    pub compaction_threshold: u64,

    /// Retry and backoff policy for failed mutation pushes.
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            compaction_threshold: 4 * 1024 * 1024, // 4 MB
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub const fn compaction_threshold(mut self, bytes: u64) -> Self {
        self.compaction_threshold = bytes;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Retry ceiling and exponential backoff for transient failures.
///
/// The same policy spaces out retries of individual mutations and of whole
/// failed sync cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after which a mutation is abandoned.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive failures.
    pub backoff_multiplier: f64,
    /// Maximum random extra delay as a fraction of the computed delay.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Creates a policy with the given ceiling and default timings.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier (at least `1.0`).
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the jitter fraction (clamped to `0.0..=1.0`).
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the `attempt`-th failure (1-based; 0 means no
    /// failure yet and yields zero).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        // Fields are public: re-apply the builder's bounds.
        let multiplier = self.backoff_multiplier.max(1.0);
        let base = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let extra = capped * jitter * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + extra)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}
