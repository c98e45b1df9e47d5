//! Crash simulation for journal recovery tests.
//!
//! [`CrashableBackend`] wraps a real backend and can be armed to "lose
//! power" after a given number of further bytes. The write that crosses the
//! limit lands partially, and from then on every mutating call fails, the
//! rollback truncate included. The inner backend keeps whatever bytes made
//! it, so reopening a store over it shows exactly what a crash would leave.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let memory = InMemoryBackend::new();
//! let backend = CrashableBackend::new(Box::new(memory.clone()));
//! let switch = backend.switch();
//! let db = Database::open_with_backend(Box::new(backend), config, clock)?;
//!
//! switch.crash_after(10);
//! assert!(db.commit(batch).is_err());
//!
//! let reopened = Database::open_with_backend(Box::new(memory), config, clock)?;
//! ```

use fitsync_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CrashState {
    budget: AtomicUsize,
    crashed: AtomicBool,
    fail_syncs: AtomicBool,
}

/// Remote control for a [`CrashableBackend`] that has been moved into a
/// store.
#[derive(Debug, Clone)]
pub struct CrashSwitch {
    state: Arc<CrashState>,
}

impl CrashSwitch {
    /// Crashes once `bytes` more bytes have been appended.
    pub fn crash_after(&self, bytes: usize) {
        self.state.budget.store(bytes, Ordering::SeqCst);
    }

    /// Crashes on the next write.
    pub fn crash_now(&self) {
        self.crash_after(0);
    }

    /// Makes `flush` and `sync` fail (and count as a crash).
    pub fn set_fail_syncs(&self, fail: bool) {
        self.state.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Disarms and "powers the device back on".
    pub fn reset(&self) {
        self.state.budget.store(usize::MAX, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
        self.state.fail_syncs.store(false, Ordering::SeqCst);
    }
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<CrashState>,
}

impl CrashableBackend {
    /// Wraps `inner`, disarmed.
    #[must_use]
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            state: Arc::new(CrashState {
                budget: AtomicUsize::new(usize::MAX),
                crashed: AtomicBool::new(false),
                fail_syncs: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a handle that controls this backend.
    #[must_use]
    pub fn switch(&self) -> CrashSwitch {
        CrashSwitch {
            state: Arc::clone(&self.state),
        }
    }

    fn crash(&self, what: &str) -> StorageError {
        self.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }

    fn check_alive(&self, what: &str) -> StorageResult<()> {
        if self.state.crashed.load(Ordering::SeqCst) {
            return Err(self.crash(what));
        }
        Ok(())
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.check_alive("write")?;
        let budget = self.state.budget.load(Ordering::SeqCst);
        if data.len() > budget {
            // Write partial data up to the crash point
            if budget > 0 {
                let _ = self.inner.append(&data[..budget]);
            }
            self.state.budget.store(0, Ordering::SeqCst);
            return Err(self.crash("partial write"));
        }
        if budget != usize::MAX {
            self.state.budget.store(budget - data.len(), Ordering::SeqCst);
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_alive("flush")?;
        if self.state.fail_syncs.load(Ordering::SeqCst) {
            return Err(self.crash("flush"));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_alive("sync")?;
        if self.state.fail_syncs.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_alive("truncate")?;
        self.inner.truncate(new_size)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.check_alive("replace")?;
        if data.len() > self.state.budget.load(Ordering::SeqCst) {
            // An atomic replace either happens or it does not.
            return Err(self.crash("replace"));
        }
        self.inner.replace(data)
    }
}
