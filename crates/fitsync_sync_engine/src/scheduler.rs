//! Background sync worker.
//!
//! A single tokio task runs cycles when the sync interval elapses, when
//! sync is requested, when connectivity comes back and when the earliest
//! backed-off mutation becomes eligible. Requests made while a cycle runs
//! collapse into one re-run after it. Failed cycles are retried with the
//! store's [`fitsync_core::RetryPolicy`].

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::remote::RemoteClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle for waking the worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
    reset_backoff: Arc<AtomicBool>,
}

impl SyncTrigger {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            reset_backoff: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks for a cycle as soon as possible.
    pub fn request_sync(&self) {
        self.notify.notify_one();
    }

    /// Reports that the network is back: forgets the failed-cycle backoff
    /// and asks for a cycle.
    pub fn connectivity_restored(&self) {
        self.reset_backoff.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// The running worker.
pub struct SyncWorker<R: RemoteClient + 'static> {
    engine: Arc<SyncEngine<R>>,
    trigger: SyncTrigger,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl<R: RemoteClient + 'static> SyncWorker<R> {
    /// A trigger for this worker.
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    /// Returns true once the worker task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the worker, abandoning a cycle in flight, and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.engine.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "sync worker ended abnormally");
        }
    }
}

/// Starts the worker on the current tokio runtime.
///
/// The first cycle runs immediately.
pub fn spawn<R: RemoteClient + 'static>(engine: Arc<SyncEngine<R>>) -> SyncWorker<R> {
    let trigger = SyncTrigger::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run(Arc::clone(&engine), trigger.clone(), shutdown_rx));
    SyncWorker {
        engine,
        trigger,
        shutdown,
        handle,
    }
}

async fn run<R: RemoteClient + 'static>(
    engine: Arc<SyncEngine<R>>,
    trigger: SyncTrigger,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = engine.config().sync_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut failures: u32 = 0;
    let mut run_now = true;
    info!("sync worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if run_now {
            run_now = false;
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = engine.run_cycle() => match result {
                    Ok(_) => failures = 0,
                    Err(SyncError::CycleInProgress) => {
                        debug!("cycle already running, skipping");
                    }
                    Err(_) => failures = failures.saturating_add(1),
                },
            }
        }

        if trigger.reset_backoff.swap(false, Ordering::SeqCst) {
            failures = 0;
        }

        let wake = next_wake(&engine, failures);
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = trigger.notify.notified() => run_now = true,
            _ = tick(&mut ticker) => run_now = true,
            _ = sleep(wake) => run_now = true,
        }
    }
    info!("sync worker stopped");
}

/// Time until the worker should retry on its own: after a failed cycle,
/// or when a backed-off mutation becomes eligible.
fn next_wake<R: RemoteClient>(engine: &SyncEngine<R>, failures: u32) -> Option<Duration> {
    let db = engine.database();
    let cycle_retry = (failures > 0).then(|| db.config().retry.delay_for_attempt(failures));
    let now = db.now();
    let mutation_retry = db
        .mutations()
        .next_eligible_at()
        .map(|at| at.duration_since(now));
    match (cycle_retry, mutation_retry) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
