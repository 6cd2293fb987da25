//! Configuration for the synchronization core.
//!
//! Every protocol constant lives here with its production default so hosts and tests can
//! tighten timings without touching the protocols themselves.

use crate::bridge::BridgeError;
use crate::bridge::sync::modules::ModuleKind;

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Protocol timings and policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix shared by every table the bridge writes.
    pub table_prefix: String,
    /// Refuse to save entities that were never registered.
    pub protect_empty_entries: bool,
    /// Lock wait for background (non-critical) saves.
    pub async_lock_timeout_ms: u64,
    /// Lock wait for foreground saves and applies.
    pub lock_timeout_ms: u64,
    /// Lock wait for the disconnect save.
    pub critical_lock_timeout_ms: u64,
    /// Minimum gap between two confirmed saves of one entity.
    pub debounce_ms: u64,
    pub max_write_attempts: u32,
    /// Linear backoff step between write attempts.
    pub retry_step_ms: u64,
    /// Age after which a held lock is presumed abandoned.
    pub stale_lock_ms: u64,
    pub connect_wait_ms: u64,
    pub connect_poll_ms: u64,
    /// Bounded wait for in-flight work before the disconnect save proceeds.
    pub disconnect_wait_ms: u64,
    pub flush_interval_ms: u64,
    pub modules: ModulesConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            table_prefix: "player_data".to_string(),
            protect_empty_entries: true,
            async_lock_timeout_ms: 3_000,
            lock_timeout_ms: 5_000,
            critical_lock_timeout_ms: 10_000,
            debounce_ms: 100,
            max_write_attempts: 3,
            retry_step_ms: 100,
            stale_lock_ms: 30_000,
            connect_wait_ms: 30_000,
            connect_poll_ms: 50,
            disconnect_wait_ms: 5_000,
            flush_interval_ms: 60_000,
            modules: ModulesConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config: SyncConfig = serde_json::from_str(&content).map_err(|e| {
            BridgeError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.max_write_attempts == 0 {
            return Err(BridgeError::Config(
                "max_write_attempts must be at least 1".to_string(),
            ));
        }
        if self.connect_poll_ms == 0 {
            return Err(BridgeError::Config(
                "connect_poll_ms must be positive".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(BridgeError::Config(
                "flush_interval_ms must be positive".to_string(),
            ));
        }
        if self.table_prefix.trim().is_empty() {
            return Err(BridgeError::Config("table_prefix is empty".to_string()));
        }
        Ok(())
    }

    pub fn table_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.table_prefix, suffix)
    }

    pub fn registration_table(&self) -> String {
        self.table_name("registered")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_millis(self.retry_step_ms)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }

    pub fn async_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.async_lock_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn critical_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_lock_timeout_ms)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_millis(self.disconnect_wait_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Per-module enable switches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub inventory: bool,
    pub armor: bool,
    pub ender_storage: bool,
    pub location: bool,
    pub experience: bool,
    pub vitals: bool,
    pub mode: bool,
    pub currency: bool,
    pub effects: bool,
    pub advancements: bool,
    pub statistics: bool,
    pub hotbar_selection: bool,
    pub saturation: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self::all(true)
    }
}

impl ModulesConfig {
    pub fn all(enabled: bool) -> Self {
        Self {
            inventory: enabled,
            armor: enabled,
            ender_storage: enabled,
            location: enabled,
            experience: enabled,
            vitals: enabled,
            mode: enabled,
            currency: enabled,
            effects: enabled,
            advancements: enabled,
            statistics: enabled,
            hotbar_selection: enabled,
            saturation: enabled,
        }
    }

    /// Only the given modules enabled.
    pub fn only(kinds: &[ModuleKind]) -> Self {
        let mut config = Self::all(false);
        for kind in kinds {
            config.set(*kind, true);
        }
        config
    }

    pub fn is_enabled(&self, kind: ModuleKind) -> bool {
        match kind {
            ModuleKind::Inventory => self.inventory,
            ModuleKind::Armor => self.armor,
            ModuleKind::EnderStorage => self.ender_storage,
            ModuleKind::Location => self.location,
            ModuleKind::Experience => self.experience,
            ModuleKind::Vitals => self.vitals,
            ModuleKind::Mode => self.mode,
            ModuleKind::Currency => self.currency,
            ModuleKind::Effects => self.effects,
            ModuleKind::Advancements => self.advancements,
            ModuleKind::Statistics => self.statistics,
            ModuleKind::HotbarSelection => self.hotbar_selection,
            ModuleKind::Saturation => self.saturation,
        }
    }

    pub fn set(&mut self, kind: ModuleKind, enabled: bool) {
        let flag = match kind {
            ModuleKind::Inventory => &mut self.inventory,
            ModuleKind::Armor => &mut self.armor,
            ModuleKind::EnderStorage => &mut self.ender_storage,
            ModuleKind::Location => &mut self.location,
            ModuleKind::Experience => &mut self.experience,
            ModuleKind::Vitals => &mut self.vitals,
            ModuleKind::Mode => &mut self.mode,
            ModuleKind::Currency => &mut self.currency,
            ModuleKind::Effects => &mut self.effects,
            ModuleKind::Advancements => &mut self.advancements,
            ModuleKind::Statistics => &mut self.statistics,
            ModuleKind::HotbarSelection => &mut self.hotbar_selection,
            ModuleKind::Saturation => &mut self.saturation,
        };
        *flag = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.async_lock_timeout_ms, 3_000);
        assert_eq!(config.lock_timeout_ms, 5_000);
        assert_eq!(config.critical_lock_timeout_ms, 10_000);
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.max_write_attempts, 3);
        assert_eq!(config.stale_lock_after(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{ "table_prefix": "bridge", "debounce_ms": 250, "modules": { "currency": false } }"#,
        )
        .unwrap();
        assert_eq!(config.table_prefix, "bridge");
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.lock_timeout_ms, 5_000);
        assert!(!config.modules.currency);
        assert!(config.modules.inventory);
        assert_eq!(config.table_name("inventory"), "bridge_inventory");
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = SyncConfig {
            max_write_attempts: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn only_enables_listed_modules() {
        let modules = ModulesConfig::only(&[ModuleKind::Inventory, ModuleKind::Vitals]);
        assert!(modules.is_enabled(ModuleKind::Inventory));
        assert!(modules.is_enabled(ModuleKind::Vitals));
        assert!(!modules.is_enabled(ModuleKind::Currency));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{ "protect_empty_entries": false }"#).unwrap();
        let config = SyncConfig::from_json_file(&path).unwrap();
        assert!(!config.protect_empty_entries);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            SyncConfig::from_json_file(&path),
            Err(BridgeError::Config(_))
        ));
    }
}
