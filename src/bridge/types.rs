use crate::bridge::sync::modules::{ModuleError, ModuleKind};
use crate::bridge::sync::repositories::StoreError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Identifier of a connected participant.
pub type EntityId = uuid::Uuid;

/// Synchronization phase of a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncState {
	#[default]
	Idle,
	Loading,
	Saving,
	Saved,
	Confirmed,
	Completed,
}

impl SyncState {
	/// Phases in which live attributes are being read or rewritten by a protocol.
	pub fn is_busy(self) -> bool {
		matches!(self, SyncState::Loading | SyncState::Saving)
	}
}

impl fmt::Display for SyncState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SyncState::Idle => "IDLE",
			SyncState::Loading => "LOADING",
			SyncState::Saving => "SAVING",
			SyncState::Saved => "SAVED",
			SyncState::Confirmed => "CONFIRMED",
			SyncState::Completed => "COMPLETED",
		};
		f.write_str(name)
	}
}

/// One occupied inventory-like slot. Contents beyond material and amount are opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStack {
	pub material: String,
	pub amount: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tag: Option<String>,
}

impl ItemStack {
	pub fn new(material: impl Into<String>, amount: u32) -> Self {
		Self {
			material: material.into(),
			amount,
			tag: None,
		}
	}
}

/// Fixed-size slot array; `None` marks an empty slot.
pub type ItemSlots = Vec<Option<ItemStack>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
	pub world: String,
	pub x: f64,
	pub y: f64,
	pub z: f64,
	pub yaw: f32,
	pub pitch: f32,
}

impl Default for Location {
	fn default() -> Self {
		Self {
			world: "world".to_string(),
			x: 0.0,
			y: 64.0,
			z: 0.0,
			yaw: 0.0,
			pitch: 0.0,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experience {
	pub level: i32,
	/// Progress towards the next level, in `0.0..1.0`.
	pub progress: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
	pub health: f64,
	pub max_health: f64,
	pub health_scaled: bool,
	pub health_scale: f64,
}

impl Default for Vitals {
	fn default() -> Self {
		Self {
			health: 20.0,
			max_health: 20.0,
			health_scaled: false,
			health_scale: 20.0,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMode {
	#[default]
	Survival,
	Creative,
	Adventure,
	Spectator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEffect {
	pub effect: String,
	pub amplifier: i32,
	pub duration_ticks: i32,
	#[serde(default)]
	pub ambient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saturation {
	pub saturation: f32,
	pub food_level: i32,
}

impl Default for Saturation {
	fn default() -> Self {
		Self {
			saturation: 5.0,
			food_level: 20,
		}
	}
}

/// Point-in-time copy of every attribute slice the bridge synchronizes.
///
/// Produced and consumed only on the primary execution context by the live-state source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSnapshot {
	pub inventory: ItemSlots,
	/// Boots, leggings, chestplate, helmet.
	pub armor: ItemSlots,
	pub ender_storage: ItemSlots,
	pub location: Location,
	pub experience: Experience,
	pub vitals: Vitals,
	pub mode: GameMode,
	pub currency: f64,
	pub effects: Vec<StatusEffect>,
	/// Advancement key to the criteria awarded so far.
	pub advancements: BTreeMap<String, Vec<String>>,
	pub statistics: BTreeMap<String, i64>,
	pub hotbar_slot: u8,
	pub saturation: Saturation,
}

/// Protocol-level errors of the synchronization core
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
	#[error("Lock for {entity} not acquired within {timeout:?}")]
	LockTimeout { entity: EntityId, timeout: Duration },

	#[error("Lock for {0} was retired by cleanup")]
	LockRetired(EntityId),

	#[error("Store write failure: {0}")]
	StoreWriteFailure(#[from] StoreError),

	#[error("Stored record unreadable: {0}")]
	StoreReadFailure(#[source] StoreError),

	#[error("Truncation detected in {table}: wrote {written} bytes, read back {read_back}")]
	TruncationDetected {
		table: String,
		written: usize,
		read_back: usize,
	},

	#[error("Dependency unavailable: {0}")]
	DependencyUnavailable(String),

	#[error("Module {module} failed: {source}")]
	ModuleFailure {
		module: ModuleKind,
		#[source]
		source: ModuleError,
	},

	#[error("Entity {0} has no live state")]
	EntityUnavailable(EntityId),

	#[error("Primary execution context is unavailable")]
	PrimaryUnavailable,

	#[error("Configuration error: {0}")]
	Config(String),
}

impl BridgeError {
	/// Whether another write attempt may succeed where this one failed.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			BridgeError::StoreWriteFailure(_) | BridgeError::TruncationDetected { .. }
		)
	}
}
