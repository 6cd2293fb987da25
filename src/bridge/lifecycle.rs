//! Connect, disconnect and periodic-flush entry points.
//!
//! `LifecycleHooks` is what a host calls from its own events. Each hook is a thin sequence over the
//! orchestrator: wait for in-flight work with a bound, run the right protocol, and on disconnect
//! always drop the entity's bookkeeping.

use crate::bridge::scheduler::{PeriodicJob, PeriodicTask, on_primary};
use crate::bridge::sync::events::SyncEvent;
use crate::bridge::sync::orchestrator::{
    ApplyOutcome, PersistenceOrchestrator, SaveKind, SaveOutcome,
};
use crate::bridge::types::{BridgeError, EntityId};

use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Host policy that may keep first-time entities from being registered.
pub trait NewEntityGate: Send + Sync {
    fn allows(&self, id: EntityId) -> bool;
}

/// Gate that registers every new entity.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl NewEntityGate for AllowAll {
    fn allows(&self, _id: EntityId) -> bool {
        true
    }
}

/// What the connect sequence did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A stored record existed and was applied.
    Loaded(ApplyOutcome),
    /// A new entity was registered and given its initial save.
    Registered(SaveOutcome),
    /// A new entity was vetoed by the gate; nothing was stored.
    Suppressed,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entities whose stale lock was force-released.
    pub recovered: Vec<EntityId>,
    /// Background saves queued.
    pub scheduled: usize,
}

/// Runs `PersistenceOrchestrator::forget` when dropped.
struct ForgetOnDrop<'a> {
    orchestrator: &'a PersistenceOrchestrator,
    id: EntityId,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.orchestrator.forget(self.id);
    }
}

pub struct LifecycleHooks {
    orchestrator: Arc<PersistenceOrchestrator>,
    gate: Arc<dyn NewEntityGate>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl LifecycleHooks {
    pub fn new(orchestrator: Arc<PersistenceOrchestrator>) -> Self {
        Self::with_gate(orchestrator, Arc::new(AllowAll))
    }

    pub fn with_gate(orchestrator: Arc<PersistenceOrchestrator>, gate: Arc<dyn NewEntityGate>) -> Self {
        Self {
            orchestrator,
            gate,
            periodic: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<PersistenceOrchestrator> {
        &self.orchestrator
    }

    /// Run `connect` on a background context; failures are logged.
    pub fn on_connect(self: &Arc<Self>, id: EntityId) {
        let this = Arc::clone(self);
        self.orchestrator.scheduler().run_async(
            async move {
                match this.connect(id).await {
                    Ok(outcome) => debug!("Connect of {} finished: {:?}", id, outcome),
                    Err(e) => warn!("Connect of {} failed: {}", id, e),
                }
            }
            .boxed(),
        );
    }

    /// Load or register a connecting entity.
    ///
    /// Lifts any lockout left by an earlier disconnect, then waits (bounded) for earlier protocols
    /// on the entity to drain and proceeds regardless.
    pub async fn connect(&self, id: EntityId) -> Result<ConnectOutcome, BridgeError> {
        if self.orchestrator.locks().readmit(id) {
            debug!("Readmitted {} after an earlier disconnect", id);
        }
        let config = self.orchestrator.config();
        let drained = self
            .orchestrator
            .states()
            .wait_for_completion(id, config.connect_wait(), config.connect_poll())
            .await;
        if !drained {
            warn!(
                "Earlier operations of {} still running after {:?}, connecting anyway",
                id,
                config.connect_wait()
            );
        }

        if self.orchestrator.has_record(id).await? {
            let outcome = self.orchestrator.apply(id).await?;
            self.orchestrator
                .events()
                .dispatch(&SyncEvent::DataLoaded { entity: id })
                .await;
            return Ok(ConnectOutcome::Loaded(outcome));
        }

        if !self.gate.allows(id) {
            info!("New entity {} not registered: vetoed by gate", id);
            return Ok(ConnectOutcome::Suppressed);
        }

        self.orchestrator.register(id).await?;
        let saved = self.orchestrator.save(id, SaveKind::Foreground).await?;
        self.orchestrator
            .events()
            .dispatch(&SyncEvent::EntityRegistered { entity: id })
            .await;
        Ok(ConnectOutcome::Registered(saved))
    }

    /// Save a disconnecting entity and drop all of its bookkeeping.
    ///
    /// The bookkeeping is dropped whether or not the save succeeds.
    pub async fn disconnect(&self, id: EntityId) -> Result<SaveOutcome, BridgeError> {
        let _cleanup = ForgetOnDrop {
            orchestrator: &self.orchestrator,
            id,
        };

        let wait = self.orchestrator.config().disconnect_wait();
        if !self
            .orchestrator
            .states()
            .wait_for_save_confirmation(id, wait)
            .await
        {
            warn!("Disconnect of {} proceeding with background work pending", id);
        }

        self.orchestrator.save(id, SaveKind::Critical).await
    }

    /// Sweep stale locks, then queue a background save for every connected entity.
    pub async fn flush(&self) -> Result<FlushReport, BridgeError> {
        let recovered = self.orchestrator.locks().sweep_stale(
            tokio::time::Instant::now(),
            self.orchestrator.config().stale_lock_after(),
        );

        let live = Arc::clone(self.orchestrator.live());
        let connected = on_primary(self.orchestrator.scheduler().as_ref(), move || {
            live.connected()
        })
        .await?;

        for id in &connected {
            self.orchestrator.save_in_background(*id);
        }

        debug!(
            "Flush queued {} saves, recovered {} stale locks",
            connected.len(),
            recovered.len()
        );
        Ok(FlushReport {
            recovered,
            scheduled: connected.len(),
        })
    }

    /// Start flushing on the configured interval. Returns `false` if already running.
    pub fn start_periodic_flush(self: &Arc<Self>) -> bool {
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let job: PeriodicJob = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(hooks) = weak.upgrade() {
                    if let Err(e) = hooks.flush().await {
                        warn!("Periodic flush failed: {}", e);
                    }
                }
            }
            .boxed()
        });

        let interval = self.orchestrator.config().flush_interval();
        *periodic = Some(self.orchestrator.scheduler().run_periodic(interval, job));
        info!("Periodic flush every {:?}", interval);
        true
    }

    /// Stop the periodic flush. Returns `false` if it was not running.
    pub fn stop_periodic_flush(&self) -> bool {
        match self.periodic.lock().take() {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop the periodic flush and save every connected entity in the foreground.
    ///
    /// Returns how many saves were confirmed.
    pub async fn shutdown(&self) -> Result<usize, BridgeError> {
        self.stop_periodic_flush();

        let live = Arc::clone(self.orchestrator.live());
        let connected = on_primary(self.orchestrator.scheduler().as_ref(), move || {
            live.connected()
        })
        .await?;

        let mut confirmed = 0;
        for id in connected {
            match self.orchestrator.save(id, SaveKind::Foreground).await {
                Ok(SaveOutcome::Confirmed { .. }) => confirmed += 1,
                Ok(outcome) => debug!("Shutdown save of {}: {:?}", id, outcome),
                Err(e) => warn!("Shutdown save of {} failed: {}", id, e),
            }
        }

        info!("Shutdown flushed {} entities", confirmed);
        Ok(confirmed)
    }
}
