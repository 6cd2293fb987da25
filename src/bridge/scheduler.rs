//! Scheduling substrate.
//!
//! The core never creates threads or timers itself; it asks a `Scheduler` for background work,
//! primary-context work and periodic work. `TokioScheduler` is the stock implementation: the
//! primary context is a single task draining a job channel, so primary jobs never overlap.

use crate::bridge::BridgeError;

use futures::future::BoxFuture;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Work that must run on the primary execution context.
pub type PrimaryJob = Box<dyn FnOnce() + Send + 'static>;

/// Factory for one run of a periodic job.
pub type PeriodicJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub trait Scheduler: Send + Sync {
    /// Run `job` on a background context without waiting for it.
    fn run_async(&self, job: BoxFuture<'static, ()>);

    /// Queue `job` on the primary context.
    fn run_on_primary(&self, job: PrimaryJob);

    /// Run `job` every `interval`, first after one full interval.
    fn run_periodic(&self, interval: Duration, job: PeriodicJob) -> PeriodicTask;
}

/// Handle to a periodic job; cancelling stops future runs.
#[derive(Debug)]
pub struct PeriodicTask {
    abort: AbortHandle,
}

impl PeriodicTask {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Run `f` on the primary context and wait for its result.
pub async fn on_primary<R, F>(scheduler: &dyn Scheduler, f: F) -> Result<R, BridgeError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    scheduler.run_on_primary(Box::new(move || {
        let _ = tx.send(f());
    }));
    rx.await.map_err(|_| BridgeError::PrimaryUnavailable)
}

/// Scheduler backed by the ambient tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    primary_tx: mpsc::UnboundedSender<PrimaryJob>,
    runtime: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Start the primary context on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start() -> Self {
        let runtime = tokio::runtime::Handle::current();
        let (primary_tx, mut primary_rx) = mpsc::unbounded_channel::<PrimaryJob>();

        runtime.spawn(async move {
            while let Some(job) = primary_rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Primary job panicked; primary context keeps running");
                }
            }
            debug!("Primary context stopped");
        });

        Self {
            primary_tx,
            runtime,
        }
    }
}

impl Scheduler for TokioScheduler {
    fn run_async(&self, job: BoxFuture<'static, ()>) {
        self.runtime.spawn(job);
    }

    fn run_on_primary(&self, job: PrimaryJob) {
        if self.primary_tx.send(job).is_err() {
            error!("Primary context is gone, dropping job");
        }
    }

    fn run_periodic(&self, interval: Duration, job: PeriodicJob) -> PeriodicTask {
        let handle = self.runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                job().await;
            }
        });
        PeriodicTask::new(handle.abort_handle())
    }
}
