//! Per-entity synchronization state.
//!
//! This module provides the `SyncStateTracker`, the process-wide bookkeeping of which phase each
//! entity is in, when its last save was confirmed, and how many background operations are still
//! in flight for it. It performs no I/O and is safe to use from any execution context.
//!
//! The tracker is read by the lifecycle hooks to decide when a connect may proceed, and written
//! by the orchestrator while it holds the entity's lock. The async-operation counter is the one
//! field that is also touched after the lock has been released.

use crate::bridge::types::{EntityId, SyncState};

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Poll interval of `wait_for_save_confirmation`.
const SAVE_CONFIRMATION_POLL: Duration = Duration::from_millis(25);

/// Bookkeeping for one active or recently active entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntitySyncRecord {
    pub state: SyncState,
    /// Set only on transition into `Confirmed`; never moves backwards.
    pub last_confirmed_save_at: Option<Instant>,
    pub pending_async_ops: u32,
}

/// Service tracking the synchronization phase of every entity.
///
/// Records are created lazily on the first write and removed by `remove` during disconnect
/// cleanup. Reads of unseen entities never create a record.
#[derive(Debug, Default)]
pub struct SyncStateTracker {
    records: DashMap<EntityId, EntitySyncRecord>,
}

impl SyncStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the state, returning the previous one.
    ///
    /// Entering `Confirmed` stamps the last-confirmed-save time.
    pub fn set_state(&self, id: EntityId, state: SyncState) -> SyncState {
        let mut record = self.records.entry(id).or_default();
        let previous = record.state;
        record.state = state;
        if state == SyncState::Confirmed {
            let now = Instant::now();
            record.last_confirmed_save_at = Some(match record.last_confirmed_save_at {
                Some(last) => last.max(now),
                None => now,
            });
        }
        drop(record);

        debug!("Sync state of {}: {} -> {}", id, previous, state);
        previous
    }

    pub fn get_state(&self, id: EntityId) -> SyncState {
        self.records
            .get(&id)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    /// Copy of the full record, if the entity has one.
    pub fn record(&self, id: EntityId) -> Option<EntitySyncRecord> {
        self.records.get(&id).map(|record| *record)
    }

    pub fn increment_async(&self, id: EntityId) -> u32 {
        let mut record = self.records.entry(id).or_default();
        record.pending_async_ops = record.pending_async_ops.saturating_add(1);
        let count = record.pending_async_ops;
        drop(record);

        debug!("Async operations for {}: {}", id, count);
        count
    }

    /// Decrement the async counter, flooring at zero.
    ///
    /// A decrement for an entity that has already been cleaned up is ignored.
    pub fn decrement_async(&self, id: EntityId) -> u32 {
        let count = match self.records.get_mut(&id) {
            Some(mut record) => {
                record.pending_async_ops = record.pending_async_ops.saturating_sub(1);
                record.pending_async_ops
            }
            None => 0,
        };

        debug!("Async operations for {}: {}", id, count);
        count
    }

    pub fn pending_async_ops(&self, id: EntityId) -> u32 {
        self.records
            .get(&id)
            .map(|record| record.pending_async_ops)
            .unwrap_or(0)
    }

    pub fn has_pending_async(&self, id: EntityId) -> bool {
        self.pending_async_ops(id) > 0
    }

    /// Time since the last confirmed save; `Duration::MAX` if the entity was never saved.
    pub fn time_since_last_save(&self, id: EntityId) -> Duration {
        self.records
            .get(&id)
            .and_then(|record| record.last_confirmed_save_at)
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX)
    }

    /// Whether an action that mutates live attributes may run now.
    ///
    /// Returns `false` while a load or save is in progress for the entity. Honouring this is up
    /// to the caller.
    pub fn can_perform_action(&self, id: EntityId, action: &str) -> bool {
        let state = self.get_state(id);
        if state.is_busy() {
            debug!("Action '{}' blocked for {} (state: {})", action, id, state);
            return false;
        }
        true
    }

    /// A protocol is running or background work is still pending.
    pub fn is_in_flight(&self, id: EntityId) -> bool {
        self.record(id)
            .map(|record| record.state.is_busy() || record.pending_async_ops > 0)
            .unwrap_or(false)
    }

    /// Wait until the entity is neither loading nor saving and has no pending async work.
    ///
    /// Returns `false` if `timeout` elapsed first; the caller proceeds either way.
    pub async fn wait_for_completion(&self, id: EntityId, timeout: Duration, poll: Duration) -> bool {
        let started = Instant::now();
        while self.is_in_flight(id) {
            if started.elapsed() >= timeout {
                debug!(
                    "Timeout waiting for completion of {} (state: {}, pending ops: {})",
                    id,
                    self.get_state(id),
                    self.pending_async_ops(id)
                );
                return false;
            }
            tokio::time::sleep(poll).await;
        }
        true
    }

    /// Wait until no async operation is pending for the entity.
    pub async fn wait_for_save_confirmation(&self, id: EntityId, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.has_pending_async(id) {
            if started.elapsed() >= timeout {
                debug!(
                    "Save confirmation timeout for {} (pending: {})",
                    id,
                    self.pending_async_ops(id)
                );
                return false;
            }
            tokio::time::sleep(SAVE_CONFIRMATION_POLL).await;
        }
        true
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }

    /// Drop every record of the entity.
    pub fn remove(&self, id: EntityId) -> Option<EntitySyncRecord> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    pub fn tracked_entities(&self) -> usize {
        self.records.len()
    }
}
