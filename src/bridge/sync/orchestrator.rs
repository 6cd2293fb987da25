//! Entity persistence orchestrator and integration point for all sync services.
//!
//! This module defines the `PersistenceOrchestrator`, which runs the two protocols that move an
//! entity's attributes between live memory and the backing store:
//!
//! - **save**: lock, registration and debounce checks, then write-with-verification under a
//!   bounded linear backoff, ending in `Confirmed` or a reported failure.
//! - **apply**: lock, then every module's stored payload is decoded onto the live entity on the
//!   primary context. One module failing never stops its siblings; a missing item codec stops
//!   the whole sequence.
//!
//! Both protocols hold the entity's lock for their full duration and release it from a drop
//! guard, so every exit path (errors and panics included) restores the lock and the async
//! counter.

use crate::bridge::codec::CodecSlot;
use crate::bridge::config::SyncConfig;
use crate::bridge::live_state::LiveStateSource;
use crate::bridge::scheduler::{Scheduler, on_primary};
use crate::bridge::sync::events::{ErrorKind, ErrorReporter, EventDispatcher, SyncEvent};
use crate::bridge::sync::lock_coordinator::{LockCoordinator, LockTicket};
use crate::bridge::sync::modules::{ModuleError, ModuleRegistry};
use crate::bridge::sync::repositories::BackingStore;
use crate::bridge::sync::state_persistence::StatePersistenceService;
use crate::bridge::sync::state_tracker::SyncStateTracker;
use crate::bridge::types::{BridgeError, EntityId, SyncState};

use backoff::backoff::Backoff;
use futures::FutureExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which trigger a save runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// Periodic flush; counted as pending async work and leaves `Confirmed` visible.
    Background,
    /// Synchronous save outside the disconnect path.
    Foreground,
    /// Disconnect save: longest lock wait, no debounce, failures raise an alarm.
    Critical,
}

impl SaveKind {
    pub fn is_async(self) -> bool {
        matches!(self, SaveKind::Background)
    }

    pub fn is_critical(self) -> bool {
        matches!(self, SaveKind::Critical)
    }
}

/// Result of a save that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Confirmed { attempts: u32, bytes: usize },
    /// The entity was never registered and empty entries are protected.
    Unregistered,
    /// A save was confirmed less than the debounce interval ago.
    Debounced,
}

/// Per-module tally of an apply run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    /// No stored payload, or a blank one.
    pub skipped: usize,
    pub failed: usize,
}

/// Backoff waiting `step × n` after the n-th failure, giving up after `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_attempts: u32,
    failures: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max_attempts,
            failures: 0,
        }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            None
        } else {
            Some(self.step * self.failures)
        }
    }
}

/// External services the orchestrator is wired to.
pub struct Collaborators {
    pub store: Arc<dyn BackingStore>,
    pub live: Arc<dyn LiveStateSource>,
    pub scheduler: Arc<dyn Scheduler>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub codec: CodecSlot,
}

/// Releases a held entity lock on drop, publishing `final_state` first when one is set.
struct HeldLock<'a> {
    locks: &'a LockCoordinator,
    id: EntityId,
    ticket: LockTicket,
    final_state: Option<SyncState>,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        match self.final_state {
            Some(state) => self.locks.release_with_state(self.id, self.ticket, state),
            None => self.locks.release(self.id, self.ticket),
        };
    }
}

/// Counts one pending async operation for as long as it lives.
struct PendingAsyncOp<'a> {
    states: &'a SyncStateTracker,
    id: EntityId,
}

impl<'a> PendingAsyncOp<'a> {
    fn begin(states: &'a SyncStateTracker, id: EntityId) -> Self {
        states.increment_async(id);
        Self { states, id }
    }
}

impl Drop for PendingAsyncOp<'_> {
    fn drop(&mut self) {
        self.states.decrement_async(self.id);
    }
}

/// Coordinates save and apply for every entity.
///
/// One orchestrator serves the whole process; the lock and state registries it owns are the only
/// shared mutable bookkeeping of the sync core.
pub struct PersistenceOrchestrator {
    config: SyncConfig,
    states: Arc<SyncStateTracker>,
    locks: Arc<LockCoordinator>,
    registry: Arc<ModuleRegistry>,
    persistence: StatePersistenceService,
    events: EventDispatcher,

    live: Arc<dyn LiveStateSource>,
    scheduler: Arc<dyn Scheduler>,
    reporter: Arc<dyn ErrorReporter>,
    codec: CodecSlot,
}

impl PersistenceOrchestrator {
    /// Create an orchestrator running the stock modules enabled in `config`.
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Result<Self, BridgeError> {
        let registry = ModuleRegistry::standard(&config);
        Self::with_registry(config, registry, collaborators)
    }

    pub fn with_registry(
        config: SyncConfig,
        registry: ModuleRegistry,
        collaborators: Collaborators,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let states = Arc::new(SyncStateTracker::new());
        let locks = Arc::new(LockCoordinator::new(states.clone()));
        let persistence = StatePersistenceService::new(collaborators.store, &config, &registry);
        if registry.is_empty() {
            warn!("No modules enabled; saves will only check registration");
        }

        info!(
            "Persistence orchestrator ready with {} modules (prefix '{}')",
            registry.len(),
            config.table_prefix
        );

        Ok(Self {
            config,
            states,
            locks,
            registry: Arc::new(registry),
            persistence,
            events: EventDispatcher::new(),
            live: collaborators.live,
            scheduler: collaborators.scheduler,
            reporter: collaborators.reporter,
            codec: collaborators.codec,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn states(&self) -> &Arc<SyncStateTracker> {
        &self.states
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn persistence(&self) -> &StatePersistenceService {
        &self.persistence
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn live(&self) -> &Arc<dyn LiveStateSource> {
        &self.live
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn codec(&self) -> &CodecSlot {
        &self.codec
    }

    pub async fn has_record(&self, id: EntityId) -> Result<bool, BridgeError> {
        self.persistence.has_record(id).await
    }

    pub async fn register(&self, id: EntityId) -> Result<(), BridgeError> {
        self.persistence.register(id).await.map(|_| ())
    }

    fn save_lock_timeout(&self, kind: SaveKind) -> Duration {
        match kind {
            SaveKind::Background => self.config.async_lock_timeout(),
            SaveKind::Foreground => self.config.lock_timeout(),
            SaveKind::Critical => self.config.critical_lock_timeout(),
        }
    }

    async fn lock(&self, id: EntityId, timeout: Duration) -> Result<LockTicket, BridgeError> {
        match self.locks.acquire(id, timeout).await {
            Some(ticket) => Ok(ticket),
            // Retirement removes the slot; a plain timeout leaves it registered
            None if !self.locks.contains(id) => Err(BridgeError::LockRetired(id)),
            None => Err(BridgeError::LockTimeout {
                entity: id,
                timeout,
            }),
        }
    }

    /// Run the save protocol for one entity.
    pub async fn save(&self, id: EntityId, kind: SaveKind) -> Result<SaveOutcome, BridgeError> {
        let outcome = self.run_save(id, kind).await?;
        if let SaveOutcome::Confirmed { .. } = outcome {
            self.events
                .dispatch(&SyncEvent::SaveConfirmed { entity: id })
                .await;
        }
        Ok(outcome)
    }

    async fn run_save(&self, id: EntityId, kind: SaveKind) -> Result<SaveOutcome, BridgeError> {
        let result = self.save_locked(id, kind).await;
        if let Err(e) = &result {
            self.report_save_failure(id, kind, e);
        }
        result
    }

    /// Every failed save ends here; critical ones always raise an alarm.
    fn report_save_failure(&self, id: EntityId, kind: SaveKind, error: &BridgeError) {
        let lock_failure = matches!(
            error,
            BridgeError::LockTimeout { .. } | BridgeError::LockRetired(_)
        );
        let report = match (kind.is_critical(), lock_failure) {
            (true, true) => ErrorKind::CriticalLockTimeout,
            (true, false) => ErrorKind::CriticalSaveFailed,
            (false, true) => {
                warn!("Skipping {:?} save of {}: {}", kind, id, error);
                return;
            }
            (false, false) => ErrorKind::SaveFailed,
        };
        self.reporter.report(report, id, &error.to_string());
    }

    async fn save_locked(&self, id: EntityId, kind: SaveKind) -> Result<SaveOutcome, BridgeError> {
        let ticket = self.lock(id, self.save_lock_timeout(kind)).await?;
        let mut lock = HeldLock {
            locks: &self.locks,
            id,
            ticket,
            final_state: None,
        };

        if self.config.protect_empty_entries {
            match self.persistence.has_record(id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Not saving {}: no registered record", id);
                    return Ok(SaveOutcome::Unregistered);
                }
                Err(e) => {
                    warn!("Could not check registration of {}: {}", id, e);
                    return Err(e);
                }
            }
        }

        if !kind.is_critical() && self.states.time_since_last_save(id) < self.config.debounce() {
            debug!("Debounced save of {}", id);
            return Ok(SaveOutcome::Debounced);
        }

        let _pending = kind.is_async().then(|| PendingAsyncOp::begin(&self.states, id));
        self.states.set_state(id, SyncState::Saving);
        lock.final_state = Some(SyncState::Idle);

        let (attempts, bytes) = self.write_with_verification(id).await?;
        self.states.set_state(id, SyncState::Saved);
        self.states.set_state(id, SyncState::Confirmed);
        if kind.is_async() {
            lock.final_state = None;
        }
        debug!(
            "{:?} save of {} confirmed after {} attempt(s), {} bytes",
            kind, id, attempts, bytes
        );
        Ok(SaveOutcome::Confirmed { attempts, bytes })
    }

    /// Write and verify the entity's records, retrying retryable failures with linear backoff.
    ///
    /// Returns the number of attempts made and the bytes written by the successful one.
    async fn write_with_verification(&self, id: EntityId) -> Result<(u32, usize), BridgeError> {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = LinearBackoff::new(self.config.retry_step(), self.config.max_write_attempts);

        let bytes = backoff::future::retry_notify(
            policy,
            move || async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Save attempt {} for {}", attempt, id);
                self.write_attempt(id).await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            },
            |e: BridgeError, wait: Duration| {
                warn!("Save of {} failed: {}; retrying in {:?}", id, e, wait);
            },
        )
        .await?;

        Ok((counter.load(Ordering::SeqCst), bytes))
    }

    async fn write_attempt(&self, id: EntityId) -> Result<usize, BridgeError> {
        let live = Arc::clone(&self.live);
        let snapshot = on_primary(self.scheduler.as_ref(), move || live.read_snapshot(id))
            .await?
            .ok_or(BridgeError::EntityUnavailable(id))?;

        let codec = self.codec.get();
        let records = self.registry.encode_all(&snapshot, codec.as_deref())?;
        self.persistence.write_verified(id, &records).await
    }

    /// Queue a background save on the scheduler without waiting for it.
    pub fn save_in_background(self: &Arc<Self>, id: EntityId) {
        let this = Arc::clone(self);
        self.scheduler.run_async(
            async move {
                if let Err(e) = this.save(id, SaveKind::Background).await {
                    debug!("Background save of {} ended with: {}", id, e);
                }
            }
            .boxed(),
        );
    }

    /// Run the apply protocol: load every module's stored payload onto the live entity.
    pub async fn apply(&self, id: EntityId) -> Result<ApplyOutcome, BridgeError> {
        let timeout = self.config.lock_timeout();
        let ticket = match self.lock(id, timeout).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("Not loading {}: {}", id, e);
                return Err(e);
            }
        };
        let _lock = HeldLock {
            locks: &self.locks,
            id,
            ticket,
            final_state: Some(SyncState::Idle),
        };
        let _pending = PendingAsyncOp::begin(&self.states, id);
        self.states.set_state(id, SyncState::Loading);

        let result = self.apply_modules(id).await;
        match &result {
            Ok(outcome) => {
                self.states.set_state(id, SyncState::Completed);
                info!(
                    "Loaded {}: {} applied, {} skipped, {} failed",
                    id, outcome.applied, outcome.skipped, outcome.failed
                );
            }
            Err(BridgeError::EntityUnavailable(_)) => {
                debug!("Stopped loading {}: entity is gone", id);
            }
            Err(e) => self.reporter.report(ErrorKind::LoadFailed, id, &e.to_string()),
        }
        result
    }

    async fn apply_modules(&self, id: EntityId) -> Result<ApplyOutcome, BridgeError> {
        let mut outcome = ApplyOutcome::default();

        for (index, registered) in self.registry.iter().enumerate() {
            let kind = registered.kind();
            let payload = match self.persistence.read_module(&registered.table, id).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!("No stored {} data for {}", kind, id);
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read {} data for {}: {}", kind, id, e);
                    outcome.failed += 1;
                    continue;
                }
            };

            let trimmed = payload.trim();
            if trimmed.is_empty() || trimmed == "null" {
                warn!("Stored {} data for {} is blank, skipping", kind, id);
                outcome.skipped += 1;
                continue;
            }

            let codec = self.codec.get();
            if kind.needs_codec() && codec.is_none() {
                return Err(BridgeError::DependencyUnavailable(format!(
                    "item codec not loaded while applying {}",
                    kind
                )));
            }

            let registry = Arc::clone(&self.registry);
            let live = Arc::clone(&self.live);
            let applied = on_primary(
                self.scheduler.as_ref(),
                move || -> Option<Result<(), ModuleError>> {
                    let mut snapshot = live.read_snapshot(id)?;
                    let result = registry.get(index).map_or(Ok(()), |registered| {
                        registered
                            .module
                            .apply(&payload, &mut snapshot, codec.as_deref())
                    });
                    if result.is_ok() {
                        live.write_snapshot(id, snapshot);
                    }
                    Some(result)
                },
            )
            .await?;

            match applied {
                None => return Err(BridgeError::EntityUnavailable(id)),
                Some(Ok(())) => outcome.applied += 1,
                Some(Err(ModuleError::CodecUnavailable)) => {
                    return Err(BridgeError::DependencyUnavailable(format!(
                        "item codec not loaded while applying {}",
                        kind
                    )));
                }
                Some(Err(source)) => {
                    let failure = BridgeError::ModuleFailure {
                        module: kind,
                        source,
                    };
                    warn!("Loading {}: {}", id, failure);
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Delete everything stored for the entity, under its lock.
    pub async fn clear(&self, id: EntityId) -> Result<usize, BridgeError> {
        let ticket = self.lock(id, self.config.lock_timeout()).await?;
        let _lock = HeldLock {
            locks: &self.locks,
            id,
            ticket,
            final_state: None,
        };
        self.persistence.clear(id).await
    }

    /// Drop every piece of in-memory bookkeeping for the entity.
    ///
    /// Protocols still queued on the entity's lock, and any started before the next connect, give
    /// up with `LockRetired`.
    pub fn forget(&self, id: EntityId) {
        self.locks.retire(id);
        self.states.remove(id);
        debug!("Forgot sync bookkeeping of {}", id);
    }
}
