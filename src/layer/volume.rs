//! Per-volume provider records
//!
//! Every layer node owns one record per volume number. Sizes are persisted
//! and transactional; the device state reported by the satellite is volatile.

use super::graph::LayerId;
use super::kind::DeviceProviderKind;
use super::size::SizeState;
use crate::domain::{StorPool, VolumeNumber};
use crate::error::Result;
use crate::transaction::{DbKey, TransactionMgr, TransactionSimpleObject};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Device state as last reported by the satellite
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolatileVlmState {
    pub exists: bool,
    pub failed: bool,
    pub size_state: Option<SizeState>,
    pub device_path: Option<String>,
    pub identifier: Option<String>,
}

/// Volume record of one layer node
pub struct VlmProviderObject {
    layer_id: LayerId,
    vlm_nr: VolumeNumber,
    provider_kind: DeviceProviderKind,
    stor_pool: Option<Arc<StorPool>>,
    alloc_key: String,
    usable_size: TransactionSimpleObject<u64>,
    allocated_size: TransactionSimpleObject<u64>,
    expected_size: TransactionSimpleObject<u64>,
    state: Mutex<VolatileVlmState>,
}

impl VlmProviderObject {
    pub(crate) fn new(
        layer_id: LayerId,
        vlm_nr: VolumeNumber,
        provider_kind: DeviceProviderKind,
        stor_pool: Option<Arc<StorPool>>,
        alloc_key: String,
    ) -> Self {
        let key = |column: &str| {
            DbKey::new("LAYER_VOLUME_SIZES", format!("{}/{}/{}", layer_id, vlm_nr, column))
        };
        Self {
            layer_id,
            vlm_nr,
            provider_kind,
            stor_pool,
            alloc_key,
            usable_size: TransactionSimpleObject::persistent(key("usable"), 0),
            allocated_size: TransactionSimpleObject::persistent(key("allocated"), 0),
            expected_size: TransactionSimpleObject::volatile(0),
            state: Mutex::new(VolatileVlmState::default()),
        }
    }

    pub fn layer_id(&self) -> LayerId {
        self.layer_id
    }

    pub fn vlm_nr(&self) -> VolumeNumber {
        self.vlm_nr
    }

    pub fn provider_kind(&self) -> DeviceProviderKind {
        self.provider_kind
    }

    pub fn stor_pool(&self) -> Option<&Arc<StorPool>> {
        self.stor_pool.as_ref()
    }

    /// Key of this volume in its storage pool's allocation bookkeeping
    pub fn alloc_key(&self) -> &str {
        &self.alloc_key
    }

    // -------------------------------------------------------------------------
    // Sizes (KiB)
    // -------------------------------------------------------------------------

    pub fn usable_size(&self) -> u64 {
        self.usable_size.get()
    }

    pub fn set_usable_size(&self, tx: &TransactionMgr, kib: u64) -> Result<()> {
        self.usable_size.set(tx, kib)?;
        Ok(())
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size.get()
    }

    pub fn set_allocated_size(&self, tx: &TransactionMgr, kib: u64) -> Result<()> {
        self.allocated_size.set(tx, kib)?;
        Ok(())
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size.get()
    }

    pub fn set_expected_size(&self, tx: &TransactionMgr, kib: u64) -> Result<()> {
        self.expected_size.set(tx, kib)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Volatile state
    // -------------------------------------------------------------------------

    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    pub fn set_exists(&self, exists: bool) {
        self.state.lock().exists = exists;
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn set_failed(&self, failed: bool) {
        self.state.lock().failed = failed;
    }

    pub fn size_state(&self) -> Option<SizeState> {
        self.state.lock().size_state
    }

    pub fn set_size_state(&self, size_state: Option<SizeState>) {
        self.state.lock().size_state = size_state;
    }

    pub fn device_path(&self) -> Option<String> {
        self.state.lock().device_path.clone()
    }

    pub fn set_device_path(&self, path: Option<String>) {
        self.state.lock().device_path = path;
    }

    pub fn identifier(&self) -> Option<String> {
        self.state.lock().identifier.clone()
    }

    pub fn set_identifier(&self, identifier: Option<String>) {
        self.state.lock().identifier = identifier;
    }

    pub fn volatile_state(&self) -> VolatileVlmState {
        self.state.lock().clone()
    }

    /// Release persisted size rows when the record is removed
    pub(crate) fn delete_rows(&self, tx: &TransactionMgr) -> Result<()> {
        self.usable_size.remove_row(tx)?;
        self.allocated_size.remove_row(tx)
    }

    pub(crate) fn row(this: &Arc<VlmProviderObject>) -> Value {
        json!({
            "layer_id": this.layer_id,
            "vlm_nr": this.vlm_nr,
            "provider": this.provider_kind,
            "stor_pool": this.stor_pool.as_ref().map(|p| p.name().clone()),
        })
    }
}

impl std::fmt::Debug for VlmProviderObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlmProviderObject")
            .field("layer_id", &self.layer_id)
            .field("vlm_nr", &self.vlm_nr)
            .field("provider_kind", &self.provider_kind)
            .field("usable_size", &self.usable_size())
            .field("allocated_size", &self.allocated_size())
            .field("state", &*self.state.lock())
            .finish()
    }
}
