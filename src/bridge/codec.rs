//! Item codec collaborator.
//!
//! Slot arrays (inventory, armor, ender storage) are persisted through an opaque codec that the
//! host may install late. Until it is installed, every module that needs it reports
//! `DependencyUnavailable`.

use crate::bridge::types::ItemSlots;

use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Opaque encoder/decoder for slot arrays.
pub trait ItemCodec: Send + Sync {
    fn encode(&self, slots: &ItemSlots) -> Result<String, CodecError>;
    fn decode(&self, payload: &str) -> Result<ItemSlots, CodecError>;
}

/// Codec storing slots as a JSON array.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonItemCodec;

impl ItemCodec for JsonItemCodec {
    fn encode(&self, slots: &ItemSlots) -> Result<String, CodecError> {
        serde_json::to_string(slots).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, payload: &str) -> Result<ItemSlots, CodecError> {
        serde_json::from_str(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Shared, late-bound handle to the installed codec.
#[derive(Clone, Default)]
pub struct CodecSlot {
    inner: Arc<RwLock<Option<Arc<dyn ItemCodec>>>>,
}

impl CodecSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: Arc<dyn ItemCodec>) -> Self {
        let slot = Self::default();
        slot.install(codec);
        slot
    }

    pub fn install(&self, codec: Arc<dyn ItemCodec>) {
        *self.inner.write() = Some(codec);
    }

    pub fn get(&self) -> Option<Arc<dyn ItemCodec>> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::types::ItemStack;

    #[test]
    fn json_codec_keeps_empty_slots() {
        let slots = vec![Some(ItemStack::new("stone", 64)), None, Some(ItemStack::new("torch", 3))];
        let codec = JsonItemCodec;
        let payload = codec.encode(&slots).unwrap();
        assert_eq!(codec.decode(&payload).unwrap(), slots);
    }

    #[test]
    fn slot_installs_late() {
        let slot = CodecSlot::empty();
        assert!(slot.get().is_none());
        slot.install(Arc::new(JsonItemCodec));
        assert!(slot.get().is_some());
    }

    #[test]
    fn garbage_payload_fails_decode() {
        assert!(matches!(
            JsonItemCodec.decode("{not an array"),
            Err(CodecError::Decode(_))
        ));
    }
}
