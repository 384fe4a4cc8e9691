//! Nodes and storage pools

use super::names::{NodeName, StorPoolName};
use crate::layer::DeviceProviderKind;
use crate::security::{AccessContext, ObjectProtection};
use crate::stateflags::{NodeFlags, StateFlags};
use crate::transaction::{DbKey, TransactionMap, TransactionMgr, TransactionSimpleObject};
use crate::error::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Storage Pool Definition
// =============================================================================

/// Cluster-wide definition of a storage pool name
#[derive(Debug)]
pub struct StorPoolDefinition {
    name: StorPoolName,
    protection: Arc<ObjectProtection>,
}

impl StorPoolDefinition {
    pub fn new(ctx: &AccessContext, name: StorPoolName) -> Self {
        let protection = Arc::new(ObjectProtection::new(
            ctx,
            format!("/storpooldefinitions/{}", name.upper()),
        ));
        Self { name, protection }
    }

    pub fn name(&self) -> &StorPoolName {
        &self.name
    }

    pub fn protection(&self) -> &Arc<ObjectProtection> {
        &self.protection
    }

    pub(crate) fn row(this: &Arc<StorPoolDefinition>) -> Value {
        json!({ "name": this.name })
    }
}

// =============================================================================
// Storage Pool
// =============================================================================

/// A storage pool on one node
///
/// Tracks which resource and snapshot volumes are allocated from it; keys are
/// built by the layer graph that owns the volume.
pub struct StorPool {
    name: StorPoolName,
    node: NodeName,
    provider_kind: DeviceProviderKind,
    capacity_kib: TransactionSimpleObject<u64>,
    extent_kib: u64,
    rsc_vlms: TransactionMap<String, u64>,
    snap_vlms: TransactionMap<String, u64>,
}

impl StorPool {
    pub fn new(
        name: StorPoolName,
        node: NodeName,
        provider_kind: DeviceProviderKind,
        capacity_kib: u64,
    ) -> Self {
        let key = DbKey::new(
            "STOR_POOL_CAPACITY",
            format!("{}/{}", node.upper(), name.upper()),
        );
        Self {
            extent_kib: provider_kind.default_extent_kib(),
            name,
            node,
            provider_kind,
            capacity_kib: TransactionSimpleObject::persistent(key, capacity_kib),
            rsc_vlms: TransactionMap::volatile(),
            snap_vlms: TransactionMap::volatile(),
        }
    }

    /// Override the allocation granularity reported by the provider
    pub fn with_extent_kib(mut self, extent_kib: u64) -> Self {
        self.extent_kib = extent_kib;
        self
    }

    pub fn name(&self) -> &StorPoolName {
        &self.name
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    pub fn provider_kind(&self) -> DeviceProviderKind {
        self.provider_kind
    }

    pub fn extent_kib(&self) -> u64 {
        self.extent_kib
    }

    /// Size difference still accepted as a match for a volume of this pool
    pub fn tolerance_kib(&self) -> u64 {
        4 * self.extent_kib
    }

    pub fn capacity_kib(&self) -> u64 {
        self.capacity_kib.get()
    }

    pub fn set_capacity_kib(&self, tx: &TransactionMgr, capacity_kib: u64) -> Result<()> {
        self.capacity_kib.set(tx, capacity_kib)?;
        Ok(())
    }

    /// Capacity not taken by resource or snapshot volumes
    pub fn free_capacity_kib(&self) -> u64 {
        let used: u64 = self
            .rsc_vlms
            .values()
            .into_iter()
            .chain(self.snap_vlms.values())
            .sum();
        self.capacity_kib().saturating_sub(used)
    }

    // -------------------------------------------------------------------------
    // Allocation bookkeeping
    // -------------------------------------------------------------------------

    pub fn put_rsc_volume(&self, tx: &TransactionMgr, key: String, size_kib: u64) -> Result<()> {
        self.rsc_vlms.insert(tx, key, size_kib)?;
        Ok(())
    }

    pub fn remove_rsc_volume(&self, tx: &TransactionMgr, key: &String) -> Result<Option<u64>> {
        self.rsc_vlms.remove(tx, key)
    }

    pub fn put_snap_volume(&self, tx: &TransactionMgr, key: String, size_kib: u64) -> Result<()> {
        self.snap_vlms.insert(tx, key, size_kib)?;
        Ok(())
    }

    pub fn remove_snap_volume(&self, tx: &TransactionMgr, key: &String) -> Result<Option<u64>> {
        self.snap_vlms.remove(tx, key)
    }

    pub fn rsc_volume_keys(&self) -> Vec<String> {
        self.rsc_vlms.keys()
    }

    pub fn snap_volume_keys(&self) -> Vec<String> {
        self.snap_vlms.keys()
    }

    pub(crate) fn row(this: &Arc<StorPool>) -> Value {
        json!({
            "node": this.node,
            "name": this.name,
            "provider": this.provider_kind,
            "extent_kib": this.extent_kib,
        })
    }
}

impl std::fmt::Debug for StorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorPool")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("provider_kind", &self.provider_kind)
            .field("capacity_kib", &self.capacity_kib())
            .finish()
    }
}

// =============================================================================
// Node
// =============================================================================

/// A satellite node
pub struct Node {
    name: NodeName,
    protection: Arc<ObjectProtection>,
    flags: StateFlags<NodeFlags>,
    stor_pools: TransactionMap<StorPoolName, Arc<StorPool>>,
    /// Volatile; a new node counts as connected until reported otherwise
    connected: AtomicBool,
}

impl Node {
    pub fn new(ctx: &AccessContext, name: NodeName) -> Self {
        let protection = Arc::new(ObjectProtection::new(
            ctx,
            format!("/nodes/{}", name.upper()),
        ));
        let flags = StateFlags::new(
            Arc::clone(&protection),
            DbKey::new("NODE_FLAGS", name.upper()),
            &[],
        );
        let stor_pools =
            TransactionMap::persistent("NODE_STOR_POOL", format!("{}/", name.upper()), StorPool::row);
        Self {
            name,
            protection,
            flags,
            stor_pools,
            connected: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn protection(&self) -> &Arc<ObjectProtection> {
        &self.protection
    }

    pub fn flags(&self) -> &StateFlags<NodeFlags> {
        &self.flags
    }

    /// Whether the satellite of this node is connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn stor_pool(&self, name: &StorPoolName) -> Option<Arc<StorPool>> {
        self.stor_pools.get(name)
    }

    pub fn stor_pools(&self) -> Vec<Arc<StorPool>> {
        self.stor_pools.values()
    }

    pub fn add_stor_pool(&self, tx: &TransactionMgr, pool: Arc<StorPool>) -> Result<()> {
        self.stor_pools.insert(tx, pool.name().clone(), pool)?;
        Ok(())
    }

    pub(crate) fn row(this: &Arc<Node>) -> Value {
        json!({ "name": this.name })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("connected", &self.is_connected())
            .field("stor_pools", &self.stor_pools.keys())
            .finish()
    }
}
