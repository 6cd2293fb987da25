//! Entity Synchronization Core
//!
//! This module provides the coordination logic that keeps an entity's live attributes and its
//! stored records in step. It is composed of several submodules, each responsible for one aspect:
//!
//! - `orchestrator`: Runs the save and apply protocols and wires the other services together.
//! - `lock_coordinator`: Per-entity FIFO locks with timeouts, ticket ownership and a stale sweep.
//! - `state_tracker`: Sync phase, last confirmed save and pending async work per entity.
//! - `modules`: The attribute modules and the ordered registry that drives them.
//! - `state_persistence`: Registration records, verified writes, reads and clearing.
//! - `repositories`: The backing store contract with in-memory and file-based drivers.
//! - `events`: Lifecycle events, their dispatcher, and the error-reporting sink.

/// Events, handlers and error reporting
pub mod events;
/// Per-entity locks
pub mod lock_coordinator;
/// Attribute modules and their registry
pub mod modules;
/// Save and apply protocols
pub mod orchestrator;
/// Backing store drivers
pub mod repositories;
/// Store access for registration and module records
pub mod state_persistence;
/// Per-entity sync state
pub mod state_tracker;

pub use orchestrator::*;
