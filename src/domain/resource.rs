//! Resource definitions, resources and snapshots

use super::names::{NodeName, ResourceName, SnapshotName, VolumeNumber};
use crate::error::{Error, Result};
use crate::layer::{LayerKind, LayerNode, LayerOwner, RscLayerGraph};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{ResourceDefinitionFlags, ResourceFlags, StateFlags};
use crate::transaction::{DbKey, TransactionMap, TransactionMgr};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Property naming the snapshot a resource is being rolled back to
pub const PROP_ROLLBACK_TARGET: &str = "RollbackTarget";

/// Largest usable size of a volume, in KiB
pub const MAX_VOLUME_SIZE_KIB: u64 = 1 << 40;

fn prop_row(value: &String) -> Value {
    Value::String(value.clone())
}

// =============================================================================
// Resource
// =============================================================================

/// A resource definition's instance on one node
pub struct Resource {
    node: NodeName,
    name: ResourceName,
    protection: Arc<ObjectProtection>,
    flags: StateFlags<ResourceFlags>,
    props: TransactionMap<String, String>,
    layers: RscLayerGraph,
    /// Volatile, as last reported by the satellite
    in_use: AtomicBool,
}

impl Resource {
    /// New resource sharing the protection of its resource definition
    pub fn new(
        node: NodeName,
        name: ResourceName,
        protection: Arc<ObjectProtection>,
        flags: &[ResourceFlags],
    ) -> Self {
        let pk = format!("{}/{}", node.upper(), name.upper());
        Self {
            flags: StateFlags::new(
                Arc::clone(&protection),
                DbKey::new("RESOURCE_FLAGS", pk.clone()),
                flags,
            ),
            props: TransactionMap::persistent("RESOURCE_PROPS", format!("{}:", pk), prop_row),
            layers: RscLayerGraph::new(
                LayerOwner::Resource {
                    node: node.clone(),
                    rsc: name.clone(),
                },
                Arc::clone(&protection),
            ),
            node,
            name,
            protection,
            in_use: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn flags(&self) -> &StateFlags<ResourceFlags> {
        &self.flags
    }

    pub fn layers(&self) -> &RscLayerGraph {
        &self.layers
    }

    /// Whether the device of this resource is opened on its node
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::SeqCst);
    }

    /// Whether this resource keeps no local replica of the data
    pub fn is_diskless(&self, ctx: &AccessContext) -> Result<bool> {
        self.flags.is_set(ctx, &[ResourceFlags::Diskless])
    }

    /// Replicated-block layers of this resource's stack
    pub fn drbd_layers(&self) -> Vec<Arc<LayerNode>> {
        self.layers.find_by_kind(LayerKind::Drbd)
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    pub fn prop(&self, ctx: &AccessContext, key: &str) -> Result<Option<String>> {
        self.protection.require_access(ctx, AccessType::View)?;
        Ok(self.props.get(&key.to_string()))
    }

    pub fn set_prop(&self, ctx: &AccessContext, tx: &TransactionMgr, key: &str, value: &str) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        self.props.insert(tx, key.to_string(), value.to_string())?;
        Ok(())
    }

    pub fn remove_prop(&self, ctx: &AccessContext, tx: &TransactionMgr, key: &str) -> Result<Option<String>> {
        self.protection.require_access(ctx, AccessType::Change)?;
        self.props.remove(tx, &key.to_string())
    }

    /// Delete the layer stack, flags and properties
    pub(crate) fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        self.layers.delete_all(ctx, tx)?;
        for key in self.props.keys() {
            self.props.remove(tx, &key)?;
        }
        self.flags.delete(tx)
    }

    pub(crate) fn row(this: &Arc<Resource>) -> Value {
        json!({ "node": this.node, "name": this.name })
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("node", &self.node)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("layers", &self.layers)
            .finish()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// A snapshot's instance on one node
pub struct Snapshot {
    node: NodeName,
    name: SnapshotName,
    layers: RscLayerGraph,
}

impl Snapshot {
    pub fn new(
        node: NodeName,
        rsc: ResourceName,
        name: SnapshotName,
        protection: Arc<ObjectProtection>,
    ) -> Self {
        Self {
            layers: RscLayerGraph::new(
                LayerOwner::Snapshot {
                    node: node.clone(),
                    rsc,
                    snap: name.clone(),
                },
                protection,
            ),
            node,
            name,
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    pub fn name(&self) -> &SnapshotName {
        &self.name
    }

    pub fn layers(&self) -> &RscLayerGraph {
        &self.layers
    }

    fn row(this: &Arc<Snapshot>) -> Value {
        json!({ "node": this.node, "name": this.name })
    }
}

/// A snapshot taken across the nodes of a resource definition
pub struct SnapshotDefinition {
    name: SnapshotName,
    rsc: ResourceName,
    snapshots: TransactionMap<NodeName, Arc<Snapshot>>,
}

impl SnapshotDefinition {
    pub fn new(rsc: ResourceName, name: SnapshotName) -> Self {
        Self {
            snapshots: TransactionMap::persistent(
                "SNAPSHOTS",
                format!("{}/{}/", rsc.upper(), name.upper()),
                Snapshot::row,
            ),
            name,
            rsc,
        }
    }

    pub fn name(&self) -> &SnapshotName {
        &self.name
    }

    pub fn rsc(&self) -> &ResourceName {
        &self.rsc
    }

    pub fn snapshot(&self, node: &NodeName) -> Option<Arc<Snapshot>> {
        self.snapshots.get(node)
    }

    pub fn snapshots(&self) -> Vec<Arc<Snapshot>> {
        self.snapshots.values()
    }

    pub fn nodes(&self) -> Vec<NodeName> {
        self.snapshots.keys()
    }

    pub fn add_snapshot(&self, tx: &TransactionMgr, snapshot: Arc<Snapshot>) -> Result<()> {
        self.snapshots.insert(tx, snapshot.node().clone(), snapshot)?;
        Ok(())
    }

    pub(crate) fn row(this: &Arc<SnapshotDefinition>) -> Value {
        json!({ "rsc": this.rsc, "name": this.name })
    }
}

impl std::fmt::Debug for SnapshotDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotDefinition")
            .field("rsc", &self.rsc)
            .field("name", &self.name)
            .field("nodes", &self.nodes())
            .finish()
    }
}

// =============================================================================
// Resource Definition
// =============================================================================

/// Cluster-wide definition of a resource, with its per-node resources
pub struct ResourceDefinition {
    name: ResourceName,
    protection: Arc<ObjectProtection>,
    flags: StateFlags<ResourceDefinitionFlags>,
    volumes: TransactionMap<VolumeNumber, u64>,
    resources: TransactionMap<NodeName, Arc<Resource>>,
    snapshots: TransactionMap<SnapshotName, Arc<SnapshotDefinition>>,
}

impl ResourceDefinition {
    pub fn new(ctx: &AccessContext, name: ResourceName) -> Self {
        let protection = Arc::new(ObjectProtection::new(
            ctx,
            format!("/resourcedefinitions/{}", name.upper()),
        ));
        let prefix = format!("{}/", name.upper());
        Self {
            flags: StateFlags::new(
                Arc::clone(&protection),
                DbKey::new("RESOURCE_DEFINITION_FLAGS", name.upper()),
                &[],
            ),
            volumes: TransactionMap::persistent("VOLUME_DEFINITIONS", prefix.clone(), |size| json!(size)),
            resources: TransactionMap::persistent("RESOURCES", prefix.clone(), Resource::row),
            snapshots: TransactionMap::persistent(
                "SNAPSHOT_DEFINITIONS",
                prefix,
                SnapshotDefinition::row,
            ),
            name,
            protection,
        }
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn protection(&self) -> &Arc<ObjectProtection> {
        &self.protection
    }

    pub fn flags(&self) -> &StateFlags<ResourceDefinitionFlags> {
        &self.flags
    }

    // -------------------------------------------------------------------------
    // Volume definitions
    // -------------------------------------------------------------------------

    pub fn volume_size_kib(&self, vlm_nr: VolumeNumber) -> Option<u64> {
        self.volumes.get(&vlm_nr)
    }

    pub fn volumes(&self) -> Vec<(VolumeNumber, u64)> {
        self.volumes.entries()
    }

    pub fn set_volume(&self, ctx: &AccessContext, tx: &TransactionMgr, vlm_nr: VolumeNumber, size_kib: u64) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        if size_kib > MAX_VOLUME_SIZE_KIB {
            return Err(Error::InvalidRequest(format!(
                "volume {}/{} of {} KiB exceeds the maximum of {} KiB",
                self.name, vlm_nr, size_kib, MAX_VOLUME_SIZE_KIB
            )));
        }
        self.volumes.insert(tx, vlm_nr, size_kib)?;
        Ok(())
    }

    pub fn remove_volume(&self, ctx: &AccessContext, tx: &TransactionMgr, vlm_nr: VolumeNumber) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        self.volumes
            .remove(tx, &vlm_nr)?
            .ok_or_else(|| Error::not_found("volume definition", format!("{}/{}", self.name, vlm_nr)))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Resources
    // -------------------------------------------------------------------------

    pub fn resource(&self, node: &NodeName) -> Option<Arc<Resource>> {
        self.resources.get(node)
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.resources.values()
    }

    /// Resources holding a local replica
    pub fn diskful_resources(&self, ctx: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        let mut diskful = Vec::new();
        for rsc in self.resources.values() {
            if !rsc.is_diskless(ctx)? {
                diskful.push(rsc);
            }
        }
        Ok(diskful)
    }

    pub fn add_resource(&self, ctx: &AccessContext, tx: &TransactionMgr, rsc: Arc<Resource>) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        if self.resources.contains_key(rsc.node()) {
            return Err(Error::exists("resource", format!("{} on {}", self.name, rsc.node())));
        }
        self.resources.insert(tx, rsc.node().clone(), rsc)?;
        Ok(())
    }

    /// Delete the resource on `node` together with its layer stack
    pub fn delete_resource(&self, ctx: &AccessContext, tx: &TransactionMgr, node: &NodeName) -> Result<Arc<Resource>> {
        self.protection.require_access(ctx, AccessType::Change)?;
        let rsc = self
            .resources
            .get(node)
            .ok_or_else(|| Error::not_found("resource", format!("{} on {}", self.name, node)))?;
        rsc.delete(ctx, tx)?;
        self.resources.remove(tx, node)?;
        Ok(rsc)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn snapshot(&self, name: &SnapshotName) -> Option<Arc<SnapshotDefinition>> {
        self.snapshots.get(name)
    }

    pub fn snapshots(&self) -> Vec<Arc<SnapshotDefinition>> {
        self.snapshots.values()
    }

    pub fn add_snapshot(&self, ctx: &AccessContext, tx: &TransactionMgr, snap: Arc<SnapshotDefinition>) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        if self.snapshots.contains_key(snap.name()) {
            return Err(Error::exists("snapshot", format!("{}/{}", self.name, snap.name())));
        }
        self.snapshots.insert(tx, snap.name().clone(), snap)?;
        Ok(())
    }

    pub(crate) fn row(this: &Arc<ResourceDefinition>) -> Value {
        json!({ "name": this.name })
    }
}

impl std::fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("resources", &self.resources.keys())
            .field("snapshots", &self.snapshots.keys())
            .finish()
    }
}
