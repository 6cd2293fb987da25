//! Live-state collaborator.
//!
//! The source of truth for attributes while an entity is connected. Implementations are only
//! ever called from the primary execution context (see `Scheduler::run_on_primary`).

use crate::bridge::types::{AttributeSnapshot, EntityId};

use parking_lot::Mutex;
use std::collections::HashMap;

/// Read/write access to the live attributes of connected entities.
pub trait LiveStateSource: Send + Sync {
    /// Current attributes, or `None` when the entity is not connected.
    fn read_snapshot(&self, id: EntityId) -> Option<AttributeSnapshot>;

    /// Overwrite the live attributes of a connected entity.
    fn write_snapshot(&self, id: EntityId, snapshot: AttributeSnapshot);

    /// Entities currently connected.
    fn connected(&self) -> Vec<EntityId>;
}

/// In-process live state, used by the demo binary and tests.
#[derive(Default)]
pub struct MemoryLiveState {
    entities: Mutex<HashMap<EntityId, AttributeSnapshot>>,
}

impl MemoryLiveState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, id: EntityId, snapshot: AttributeSnapshot) {
        self.entities.lock().insert(id, snapshot);
    }

    pub fn leave(&self, id: EntityId) -> Option<AttributeSnapshot> {
        self.entities.lock().remove(&id)
    }

    /// Mutate a connected entity in place, returning whether it was connected.
    pub fn update(&self, id: EntityId, f: impl FnOnce(&mut AttributeSnapshot)) -> bool {
        match self.entities.lock().get_mut(&id) {
            Some(snapshot) => {
                f(snapshot);
                true
            }
            None => false,
        }
    }
}

impl LiveStateSource for MemoryLiveState {
    fn read_snapshot(&self, id: EntityId) -> Option<AttributeSnapshot> {
        self.entities.lock().get(&id).cloned()
    }

    fn write_snapshot(&self, id: EntityId, snapshot: AttributeSnapshot) {
        if let Some(current) = self.entities.lock().get_mut(&id) {
            *current = snapshot;
        }
    }

    fn connected(&self) -> Vec<EntityId> {
        self.entities.lock().keys().copied().collect()
    }
}
