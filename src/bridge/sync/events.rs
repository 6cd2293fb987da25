//! Event system for entity synchronization.
//!
//! This module defines the lifecycle events emitted once an entity's data has been loaded, created
//! or durably saved, the handler trait that consumes them, and the dispatcher fanning each event
//! out to every registered handler. It also holds the error-reporting sink the orchestrator uses
//! for failures an operator must see.

use crate::bridge::types::{BridgeError, EntityId};

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Classes of failure handed to an `ErrorReporter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A background or foreground save exhausted its attempts.
    SaveFailed,
    /// The disconnect save failed; the entity's latest changes may be lost.
    CriticalSaveFailed,
    /// The disconnect save could not get the entity's lock.
    CriticalLockTimeout,
    /// Loading stored data onto the live entity failed.
    LoadFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SaveFailed => "save-failed",
            ErrorKind::CriticalSaveFailed => "critical-save-failed",
            ErrorKind::CriticalLockTimeout => "critical-lock-timeout",
            ErrorKind::LoadFailed => "load-failed",
        };
        f.write_str(name)
    }
}

/// Sink for fatal protocol errors.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, kind: ErrorKind, entity: EntityId, details: &str);
}

/// Reporter that writes every failure to the `tracing` error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, kind: ErrorKind, entity: EntityId, details: &str) {
        match kind {
            ErrorKind::CriticalSaveFailed | ErrorKind::CriticalLockTimeout => {
                error!("[ALERT] {} for {}: {} (data loss risk)", kind, entity, details)
            }
            _ => error!("[{}] {}: {}", kind, entity, details),
        }
    }
}

/// Events emitted by the lifecycle hooks and the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// Stored data was applied to a connecting entity
    DataLoaded { entity: EntityId },
    /// A first-time entity was registered and received its initial save
    EntityRegistered { entity: EntityId },
    /// A save reached the confirmed state
    SaveConfirmed { entity: EntityId },
}

impl SyncEvent {
    pub fn entity(&self) -> EntityId {
        match self {
            SyncEvent::DataLoaded { entity }
            | SyncEvent::EntityRegistered { entity }
            | SyncEvent::SaveConfirmed { entity } => *entity,
        }
    }
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), BridgeError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers may be registered at any time; an event is delivered to the handlers registered when
/// its dispatch starts.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn SyncEventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&self, handler: Arc<dyn SyncEventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&self, event: &SyncEvent) {
        let handlers = self.handlers.read().clone();
        debug!("Dispatching {:?} to {} handlers", event, handlers.len());
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                error!("Handler {} failed to process event: {}", handler.name(), e);
                // Continue processing with other handlers
            }
        }
    }
}
