use crate::bridge::codec::{CodecError, ItemCodec};
use crate::bridge::config::SyncConfig;
use crate::bridge::types::{
	AttributeSnapshot, BridgeError, Experience, GameMode, ItemSlots, Location, Saturation,
	StatusEffect, Vitals,
};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, warn};

/// Number of hotbar slots a selection may point at.
const HOTBAR_SLOTS: u8 = 9;

/// The attribute slices the bridge synchronizes, in registry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
	Inventory,
	Armor,
	EnderStorage,
	Location,
	Experience,
	Vitals,
	Mode,
	Currency,
	Effects,
	Advancements,
	Statistics,
	HotbarSelection,
	Saturation,
}

impl ModuleKind {
	pub const ALL: [ModuleKind; 13] = [
		ModuleKind::Inventory,
		ModuleKind::Armor,
		ModuleKind::EnderStorage,
		ModuleKind::Location,
		ModuleKind::Experience,
		ModuleKind::Vitals,
		ModuleKind::Mode,
		ModuleKind::Currency,
		ModuleKind::Effects,
		ModuleKind::Advancements,
		ModuleKind::Statistics,
		ModuleKind::HotbarSelection,
		ModuleKind::Saturation,
	];

	/// Suffix of the module's table after the configured prefix
	pub fn table_suffix(self) -> &'static str {
		match self {
			ModuleKind::Inventory => "inventory",
			ModuleKind::Armor => "armor",
			ModuleKind::EnderStorage => "enderchest",
			ModuleKind::Location => "location",
			ModuleKind::Experience => "exp",
			ModuleKind::Vitals => "health",
			ModuleKind::Mode => "gamemode",
			ModuleKind::Currency => "money",
			ModuleKind::Effects => "potion_effects",
			ModuleKind::Advancements => "advancements",
			ModuleKind::Statistics => "stats",
			ModuleKind::HotbarSelection => "selected_hotbar_slot",
			ModuleKind::Saturation => "saturation",
		}
	}

	/// Modules whose payload goes through the shared item codec
	pub fn needs_codec(self) -> bool {
		matches!(
			self,
			ModuleKind::Inventory | ModuleKind::Armor | ModuleKind::EnderStorage
		)
	}
}

impl fmt::Display for ModuleKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.table_suffix())
	}
}

/// Failure inside a single module
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
	#[error("Item codec is not loaded")]
	CodecUnavailable,

	#[error("Codec error: {0}")]
	Codec(#[from] CodecError),

	#[error("Payload error: {0}")]
	Payload(#[from] serde_json::Error),

	#[error("Codec produced an empty payload")]
	EmptyPayload,

	#[error("Invalid value: {0}")]
	InvalidValue(String),
}

/// One independently persisted attribute slice.
///
/// Modules are pure translators between a live snapshot and an opaque payload; the orchestrator
/// decides when they run, where the payload is stored, and on which context the result lands.
pub trait SyncModule: Send + Sync {
	fn kind(&self) -> ModuleKind;

	/// Encode this module's slice of `snapshot`.
	fn save(
		&self,
		snapshot: &AttributeSnapshot,
		codec: Option<&dyn ItemCodec>,
	) -> Result<String, ModuleError>;

	/// Decode `payload` into `snapshot`.
	fn apply(
		&self,
		payload: &str,
		snapshot: &mut AttributeSnapshot,
		codec: Option<&dyn ItemCodec>,
	) -> Result<(), ModuleError>;
}

/// Slot-array module backed by the item codec
pub struct SlotModule {
	kind: ModuleKind,
}

impl SlotModule {
	pub fn new(kind: ModuleKind) -> Self {
		debug_assert!(kind.needs_codec());
		Self { kind }
	}

	fn slots<'a>(&self, snapshot: &'a AttributeSnapshot) -> &'a ItemSlots {
		match self.kind {
			ModuleKind::Armor => &snapshot.armor,
			ModuleKind::EnderStorage => &snapshot.ender_storage,
			_ => &snapshot.inventory,
		}
	}

	fn slots_mut<'a>(&self, snapshot: &'a mut AttributeSnapshot) -> &'a mut ItemSlots {
		match self.kind {
			ModuleKind::Armor => &mut snapshot.armor,
			ModuleKind::EnderStorage => &mut snapshot.ender_storage,
			_ => &mut snapshot.inventory,
		}
	}
}

impl SyncModule for SlotModule {
	fn kind(&self) -> ModuleKind {
		self.kind
	}

	fn save(
		&self,
		snapshot: &AttributeSnapshot,
		codec: Option<&dyn ItemCodec>,
	) -> Result<String, ModuleError> {
		let codec = codec.ok_or(ModuleError::CodecUnavailable)?;
		let payload = codec.encode(self.slots(snapshot))?;
		if payload.trim().is_empty() {
			return Err(ModuleError::EmptyPayload);
		}
		debug!("Serialized {} ({} bytes)", self.kind, payload.len());
		Ok(payload)
	}

	fn apply(
		&self,
		payload: &str,
		snapshot: &mut AttributeSnapshot,
		codec: Option<&dyn ItemCodec>,
	) -> Result<(), ModuleError> {
		let codec = codec.ok_or(ModuleError::CodecUnavailable)?;
		*self.slots_mut(snapshot) = codec.decode(payload)?;
		Ok(())
	}
}

/// JSON-encoded module over one snapshot field
pub struct FieldModule<T> {
	kind: ModuleKind,
	get: fn(&AttributeSnapshot) -> T,
	set: fn(&mut AttributeSnapshot, T),
}

impl<T> FieldModule<T> {
	pub fn new(
		kind: ModuleKind,
		get: fn(&AttributeSnapshot) -> T,
		set: fn(&mut AttributeSnapshot, T),
	) -> Self {
		Self { kind, get, set }
	}
}

impl<T> SyncModule for FieldModule<T>
where
	T: Serialize + DeserializeOwned + Send + Sync,
{
	fn kind(&self) -> ModuleKind {
		self.kind
	}

	fn save(
		&self,
		snapshot: &AttributeSnapshot,
		_codec: Option<&dyn ItemCodec>,
	) -> Result<String, ModuleError> {
		Ok(serde_json::to_string(&(self.get)(snapshot))?)
	}

	fn apply(
		&self,
		payload: &str,
		snapshot: &mut AttributeSnapshot,
		_codec: Option<&dyn ItemCodec>,
	) -> Result<(), ModuleError> {
		let value: T = serde_json::from_str(payload)?;
		(self.set)(snapshot, value);
		Ok(())
	}
}

/// Vitals module; restored health never exceeds the live maximum
pub struct VitalsModule;

impl SyncModule for VitalsModule {
	fn kind(&self) -> ModuleKind {
		ModuleKind::Vitals
	}

	fn save(
		&self,
		snapshot: &AttributeSnapshot,
		_codec: Option<&dyn ItemCodec>,
	) -> Result<String, ModuleError> {
		Ok(serde_json::to_string(&snapshot.vitals)?)
	}

	fn apply(
		&self,
		payload: &str,
		snapshot: &mut AttributeSnapshot,
		_codec: Option<&dyn ItemCodec>,
	) -> Result<(), ModuleError> {
		let stored: Vitals = serde_json::from_str(payload)?;
		let max_health = snapshot.vitals.max_health;
		let health = if stored.health > max_health {
			debug!(
				"Health clamped from {} to max health {}",
				stored.health, max_health
			);
			max_health
		} else {
			stored.health
		};
		snapshot.vitals = Vitals {
			health,
			max_health,
			health_scaled: stored.health_scaled,
			health_scale: stored.health_scale,
		};
		Ok(())
	}
}

/// Selected hotbar slot; out-of-range selections are rejected
pub struct HotbarModule;

impl SyncModule for HotbarModule {
	fn kind(&self) -> ModuleKind {
		ModuleKind::HotbarSelection
	}

	fn save(
		&self,
		snapshot: &AttributeSnapshot,
		_codec: Option<&dyn ItemCodec>,
	) -> Result<String, ModuleError> {
		Ok(snapshot.hotbar_slot.to_string())
	}

	fn apply(
		&self,
		payload: &str,
		snapshot: &mut AttributeSnapshot,
		_codec: Option<&dyn ItemCodec>,
	) -> Result<(), ModuleError> {
		let slot: u8 = serde_json::from_str(payload)?;
		if slot >= HOTBAR_SLOTS {
			return Err(ModuleError::InvalidValue(format!(
				"hotbar slot {} out of range",
				slot
			)));
		}
		snapshot.hotbar_slot = slot;
		Ok(())
	}
}

/// Build the stock module for `kind`
pub fn standard_module(kind: ModuleKind) -> Box<dyn SyncModule> {
	match kind {
		ModuleKind::Inventory | ModuleKind::Armor | ModuleKind::EnderStorage => {
			Box::new(SlotModule::new(kind))
		}
		ModuleKind::Location => Box::new(FieldModule::<Location>::new(
			kind,
			|s| s.location.clone(),
			|s, v| s.location = v,
		)),
		ModuleKind::Experience => Box::new(FieldModule::<Experience>::new(
			kind,
			|s| s.experience.clone(),
			|s, v| s.experience = v,
		)),
		ModuleKind::Vitals => Box::new(VitalsModule),
		ModuleKind::Mode => Box::new(FieldModule::<GameMode>::new(
			kind,
			|s| s.mode,
			|s, v| s.mode = v,
		)),
		ModuleKind::Currency => Box::new(FieldModule::<f64>::new(
			kind,
			|s| s.currency,
			|s, v| s.currency = v,
		)),
		ModuleKind::Effects => Box::new(FieldModule::<Vec<StatusEffect>>::new(
			kind,
			|s| s.effects.clone(),
			|s, v| s.effects = v,
		)),
		ModuleKind::Advancements => Box::new(FieldModule::<BTreeMap<String, Vec<String>>>::new(
			kind,
			|s| s.advancements.clone(),
			|s, v| s.advancements = v,
		)),
		ModuleKind::Statistics => Box::new(FieldModule::<BTreeMap<String, i64>>::new(
			kind,
			|s| s.statistics.clone(),
			|s, v| s.statistics = v,
		)),
		ModuleKind::HotbarSelection => Box::new(HotbarModule),
		ModuleKind::Saturation => Box::new(FieldModule::<Saturation>::new(
			kind,
			|s| s.saturation.clone(),
			|s, v| s.saturation = v,
		)),
	}
}

/// A module paired with the table it persists to
pub struct RegisteredModule {
	pub module: Box<dyn SyncModule>,
	pub table: String,
}

impl RegisteredModule {
	pub fn kind(&self) -> ModuleKind {
		self.module.kind()
	}
}

/// Payload produced by one module for one save attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
	pub kind: ModuleKind,
	pub table: String,
	pub payload: String,
}

/// Ordered, fixed list of enabled modules
pub struct ModuleRegistry {
	modules: Vec<RegisteredModule>,
}

impl ModuleRegistry {
	/// The stock modules enabled in `config`, in registry order
	pub fn standard(config: &SyncConfig) -> Self {
		let modules = ModuleKind::ALL
			.into_iter()
			.filter(|kind| config.modules.is_enabled(*kind))
			.map(standard_module)
			.collect();
		Self::from_modules(config, modules)
	}

	/// Custom modules, kept in the given order
	pub fn from_modules(config: &SyncConfig, modules: Vec<Box<dyn SyncModule>>) -> Self {
		let modules = modules
			.into_iter()
			.map(|module| RegisteredModule {
				table: config.table_name(module.kind().table_suffix()),
				module,
			})
			.collect();
		Self { modules }
	}

	pub fn iter(&self) -> impl Iterator<Item = &RegisteredModule> {
		self.modules.iter()
	}

	pub fn get(&self, index: usize) -> Option<&RegisteredModule> {
		self.modules.get(index)
	}

	pub fn len(&self) -> usize {
		self.modules.len()
	}

	pub fn is_empty(&self) -> bool {
		self.modules.is_empty()
	}

	pub fn kinds(&self) -> Vec<ModuleKind> {
		self.modules.iter().map(RegisteredModule::kind).collect()
	}

	pub fn tables(&self) -> Vec<&str> {
		self.modules.iter().map(|m| m.table.as_str()).collect()
	}

	/// Run every module's save over one snapshot.
	///
	/// A failing module is logged and left out of the result; its previous record stays in the
	/// store. A missing codec is fatal for the whole attempt.
	pub fn encode_all(
		&self,
		snapshot: &AttributeSnapshot,
		codec: Option<&dyn ItemCodec>,
	) -> Result<Vec<EncodedRecord>, BridgeError> {
		let mut records = Vec::with_capacity(self.modules.len());
		for registered in &self.modules {
			let kind = registered.kind();
			match registered.module.save(snapshot, codec) {
				Ok(payload) => records.push(EncodedRecord {
					kind,
					table: registered.table.clone(),
					payload,
				}),
				Err(ModuleError::CodecUnavailable) => {
					return Err(BridgeError::DependencyUnavailable(format!(
						"item codec not loaded while saving {}",
						kind
					)));
				}
				Err(ModuleError::EmptyPayload) => {
					error!("Empty serialization for module {}, keeping stored record", kind);
				}
				Err(e) => {
					warn!("Module {} failed to encode: {}", kind, e);
				}
			}
		}
		Ok(records)
	}
}
