//! Per-entity state synchronization between live memory and a durable backing store.
//!
//! The `bridge` module holds the whole coordinator: locks, sync state, the save and apply
//! protocols, the attribute modules, and the lifecycle hooks a host wires to its connect and
//! disconnect events.

pub mod bridge;

pub use bridge::*;
