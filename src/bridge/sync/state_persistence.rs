//! State persistence service for entity synchronization.
//!
//! This module provides the `StatePersistenceService`, which owns every interaction with the
//! backing store: the registration record that marks an entity as known, verified per-module
//! writes, per-module reads for the apply protocol, and removal of everything stored for an entity.
//!
//! The service performs a single write attempt per call; retry and backoff belong to the
//! orchestrator, which decides what is worth retrying.

use crate::bridge::config::SyncConfig;
use crate::bridge::sync::modules::{EncodedRecord, ModuleRegistry};
use crate::bridge::sync::repositories::{BackingStore, StoreError};
use crate::bridge::types::{BridgeError, EntityId};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Contents of the registration table for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub entity: EntityId,
    /// RFC 3339 time of first registration.
    pub registered_at: String,
}

/// Service for reading and writing an entity's persisted records.
pub struct StatePersistenceService {
    store: Arc<dyn BackingStore>,
    registration_table: String,
    module_tables: Vec<String>,
}

impl StatePersistenceService {
    pub fn new(store: Arc<dyn BackingStore>, config: &SyncConfig, registry: &ModuleRegistry) -> Self {
        Self {
            store,
            registration_table: config.registration_table(),
            module_tables: registry.tables().into_iter().map(str::to_string).collect(),
        }
    }

    /// Whether the entity has ever been registered.
    pub async fn has_record(&self, id: EntityId) -> Result<bool, BridgeError> {
        Ok(self
            .store
            .exists(&self.registration_table, &id.to_string())
            .await?)
    }

    /// Write the registration record for a new entity.
    pub async fn register(&self, id: EntityId) -> Result<RegistrationRecord, BridgeError> {
        let record = RegistrationRecord {
            entity: id,
            registered_at: chrono::Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| BridgeError::StoreWriteFailure(e.into()))?;
        self.store
            .write(&self.registration_table, &id.to_string(), &payload)
            .await?;

        info!("Registered new entity {}", id);
        Ok(record)
    }

    pub async fn registration(&self, id: EntityId) -> Result<Option<RegistrationRecord>, BridgeError> {
        let Some(payload) = self
            .store
            .read(&self.registration_table, &id.to_string())
            .await?
        else {
            return Ok(None);
        };
        let record = serde_json::from_str(&payload)
            .map_err(|e| BridgeError::StoreReadFailure(StoreError::Serialization(e)))?;
        Ok(Some(record))
    }

    /// Write every record once, reading each back to detect truncation.
    ///
    /// Returns the number of payload bytes written. Any failure aborts the attempt; records
    /// written before the failure stay in place.
    pub async fn write_verified(
        &self,
        id: EntityId,
        records: &[EncodedRecord],
    ) -> Result<usize, BridgeError> {
        let key = id.to_string();
        let mut written = 0;

        for record in records {
            if let Some(capacity) = self.store.field_capacity(&record.table) {
                if record.payload.len() > capacity {
                    warn!(
                        "Payload of {} for {} is {} bytes, above the {} byte field capacity",
                        record.kind,
                        id,
                        record.payload.len(),
                        capacity
                    );
                }
            }

            self.store.write(&record.table, &key, &record.payload).await?;

            let read_back = self
                .store
                .read(&record.table, &key)
                .await?
                .map(|payload| payload.len())
                .unwrap_or(0);
            if read_back < record.payload.len() {
                return Err(BridgeError::TruncationDetected {
                    table: record.table.clone(),
                    written: record.payload.len(),
                    read_back,
                });
            }

            written += record.payload.len();
        }

        debug!(
            "Wrote {} records ({} bytes) for {}",
            records.len(),
            written,
            id
        );
        Ok(written)
    }

    pub async fn read_module(&self, table: &str, id: EntityId) -> Result<Option<String>, BridgeError> {
        Ok(self.store.read(table, &id.to_string()).await?)
    }

    /// Delete every module record and the registration of the entity.
    ///
    /// Returns how many records existed.
    pub async fn clear(&self, id: EntityId) -> Result<usize, BridgeError> {
        let key = id.to_string();
        let mut removed = 0;
        for table in self
            .module_tables
            .iter()
            .chain(std::iter::once(&self.registration_table))
        {
            if self.store.delete(table, &key).await? {
                removed += 1;
            }
        }

        info!("Cleared {} stored records of {}", removed, id);
        Ok(removed)
    }
}
