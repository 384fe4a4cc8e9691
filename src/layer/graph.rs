//! Resource Layer Graph
//!
//! Each resource (and each snapshot) owns an arena of layer nodes forming a
//! tree: the root is the top of the device stack, leaves are storage layers.
//! Parent and child links are [`LayerId`]s into the arena, so the tree never
//! holds reference cycles.
//!
//! Structural changes go through the graph and are transactional; the
//! satellite-reported device state on the volume records is volatile.

use super::kind::{DeviceProviderKind, IgnoreReason, LayerKind};
use super::volume::VlmProviderObject;
use crate::domain::{NodeName, ResourceName, SnapshotName, StorPool, VolumeNumber};
use crate::error::{Error, Result};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{DrbdLayerFlags, StateFlags};
use crate::transaction::{DbKey, TransactionMap, TransactionMgr, TransactionSimpleObject};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Identifiers
// =============================================================================

/// Cluster-unique id of a layer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(pub u32);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for layer ids
#[derive(Debug)]
pub struct LayerIdPool {
    next: AtomicU32,
}

impl LayerIdPool {
    pub fn new(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn allocate(&self) -> LayerId {
        LayerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for LayerIdPool {
    fn default() -> Self {
        Self::new(0)
    }
}

// =============================================================================
// Owner
// =============================================================================

/// The resource or snapshot a layer graph belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayerOwner {
    Resource {
        node: NodeName,
        rsc: ResourceName,
    },
    Snapshot {
        node: NodeName,
        rsc: ResourceName,
        snap: SnapshotName,
    },
}

impl LayerOwner {
    pub fn node(&self) -> &NodeName {
        match self {
            LayerOwner::Resource { node, .. } | LayerOwner::Snapshot { node, .. } => node,
        }
    }

    pub fn rsc(&self) -> &ResourceName {
        match self {
            LayerOwner::Resource { rsc, .. } | LayerOwner::Snapshot { rsc, .. } => rsc,
        }
    }

    pub fn snapshot(&self) -> Option<&SnapshotName> {
        match self {
            LayerOwner::Resource { .. } => None,
            LayerOwner::Snapshot { snap, .. } => Some(snap),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, LayerOwner::Snapshot { .. })
    }

    /// Storage pool bookkeeping key of a volume owned by this graph
    pub(crate) fn alloc_key(&self, suffix: &str, vlm_nr: VolumeNumber) -> String {
        match self {
            LayerOwner::Resource { rsc, .. } => format!("{}{}/{}", rsc.upper(), suffix, vlm_nr),
            LayerOwner::Snapshot { rsc, snap, .. } => {
                format!("{}/{}{}/{}", rsc.upper(), snap.upper(), suffix, vlm_nr)
            }
        }
    }
}

impl std::fmt::Display for LayerOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerOwner::Resource { node, rsc } => write!(f, "resource {} on {}", rsc, node),
            LayerOwner::Snapshot { node, rsc, snap } => {
                write!(f, "snapshot {}/{} on {}", rsc, snap, node)
            }
        }
    }
}

// =============================================================================
// Layer Node
// =============================================================================

/// One layer of a device stack
pub struct LayerNode {
    id: LayerId,
    kind: LayerKind,
    suffix: String,
    owner: LayerOwner,
    parent: Option<LayerId>,
    children: TransactionSimpleObject<Vec<LayerId>>,
    pub(super) vlms: TransactionMap<VolumeNumber, Arc<VlmProviderObject>>,
    suspend_io: TransactionSimpleObject<bool>,
    ignore_reasons: Mutex<BTreeSet<IgnoreReason>>,
    drbd_flags: Option<StateFlags<DrbdLayerFlags>>,
}

impl LayerNode {
    fn new(
        id: LayerId,
        kind: LayerKind,
        suffix: String,
        owner: LayerOwner,
        parent: Option<LayerId>,
        protection: &Arc<ObjectProtection>,
    ) -> Self {
        let drbd_flags = (kind == LayerKind::Drbd).then(|| {
            StateFlags::new(
                Arc::clone(protection),
                DbKey::new("LAYER_DRBD_RESOURCES", id.to_string()),
                &[],
            )
        });
        Self {
            id,
            kind,
            suffix,
            owner,
            parent,
            children: TransactionSimpleObject::volatile(Vec::new()),
            vlms: TransactionMap::persistent(
                "LAYER_VOLUMES",
                format!("{}/", id),
                VlmProviderObject::row,
            ),
            suspend_io: TransactionSimpleObject::persistent(
                DbKey::new("LAYER_RESOURCE_SUSPEND_IO", id.to_string()),
                false,
            ),
            ignore_reasons: Mutex::new(BTreeSet::new()),
            drbd_flags,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Full suffix: the parent's suffix followed by this node's own
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn owner(&self) -> &LayerOwner {
        &self.owner
    }

    pub fn parent_id(&self) -> Option<LayerId> {
        self.parent
    }

    pub fn child_ids(&self) -> Vec<LayerId> {
        self.children.get()
    }

    pub fn vlm(&self, vlm_nr: VolumeNumber) -> Option<Arc<VlmProviderObject>> {
        self.vlms.get(&vlm_nr)
    }

    pub fn vlm_numbers(&self) -> Vec<VolumeNumber> {
        self.vlms.keys()
    }

    pub fn suspend_io(&self) -> bool {
        self.suspend_io.get()
    }

    pub fn set_suspend_io(&self, tx: &TransactionMgr, suspend: bool) -> Result<()> {
        self.suspend_io.set(tx, suspend)?;
        Ok(())
    }

    pub fn ignore_reasons(&self) -> BTreeSet<IgnoreReason> {
        self.ignore_reasons.lock().clone()
    }

    pub fn add_ignore_reason(&self, reason: IgnoreReason) {
        self.ignore_reasons.lock().insert(reason);
    }

    pub fn clear_ignore_reasons(&self) {
        self.ignore_reasons.lock().clear();
    }

    pub fn is_ignored(&self) -> bool {
        !self.ignore_reasons.lock().is_empty()
    }

    /// Replicated-block flags; present only on `Drbd` layers
    pub fn drbd_flags(&self) -> Option<&StateFlags<DrbdLayerFlags>> {
        self.drbd_flags.as_ref()
    }

    fn row(this: &Arc<LayerNode>) -> Value {
        json!({
            "id": this.id,
            "kind": this.kind,
            "suffix": this.suffix,
            "parent": this.parent,
            "owner": this.owner,
        })
    }
}

impl std::fmt::Debug for LayerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("suffix", &self.suffix)
            .field("parent", &self.parent)
            .field("children", &self.child_ids())
            .field("vlms", &self.vlm_numbers())
            .finish()
    }
}

// =============================================================================
// Layer Graph
// =============================================================================

/// Arena of the layer nodes of one resource or snapshot
pub struct RscLayerGraph {
    owner: LayerOwner,
    protection: Arc<ObjectProtection>,
    nodes: TransactionMap<LayerId, Arc<LayerNode>>,
    root: TransactionSimpleObject<Option<LayerId>>,
}

impl RscLayerGraph {
    pub fn new(owner: LayerOwner, protection: Arc<ObjectProtection>) -> Self {
        Self {
            owner,
            protection,
            nodes: TransactionMap::persistent("LAYER_RESOURCE_IDS", "", LayerNode::row),
            root: TransactionSimpleObject::volatile(None),
        }
    }

    pub fn owner(&self) -> &LayerOwner {
        &self.owner
    }

    pub fn protection(&self) -> &Arc<ObjectProtection> {
        &self.protection
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Add a layer below `parent`, or as the root when `parent` is `None`
    ///
    /// `suffix` is appended to the parent's suffix; siblings of the same
    /// parent must differ in suffix.
    pub fn add_layer(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        ids: &LayerIdPool,
        parent: Option<LayerId>,
        kind: LayerKind,
        suffix: &str,
    ) -> Result<Arc<LayerNode>> {
        self.protection.require_access(ctx, AccessType::Change)?;

        let full_suffix = match parent {
            None => {
                if let Some(root) = self.root.get() {
                    return Err(Error::Implementation(format!(
                        "{} already has root layer {}",
                        self.owner, root
                    )));
                }
                suffix.to_string()
            }
            Some(parent_id) => {
                let parent = self.node(parent_id)?;
                let full = format!("{}{}", parent.suffix, suffix);
                if self.children(parent_id)?.iter().any(|c| c.suffix == full) {
                    return Err(Error::Implementation(format!(
                        "layer {} already has a child with suffix '{}'",
                        parent_id, full
                    )));
                }
                full
            }
        };

        let id = ids.allocate();
        let node = Arc::new(LayerNode::new(
            id,
            kind,
            full_suffix,
            self.owner.clone(),
            parent,
            &self.protection,
        ));
        self.nodes.insert(tx, id, Arc::clone(&node))?;

        match parent {
            Some(parent_id) => {
                self.node(parent_id)?.children.update(tx, |c| c.push(id))?;
            }
            None => {
                self.root.set(tx, Some(id))?;
            }
        }

        debug!(layer = %id, kind = %kind, owner = %self.owner, "Layer added");
        Ok(node)
    }

    /// Create the record of `vlm_nr` on layer `id`
    ///
    /// The parent layer must already carry the volume. Storage records with a
    /// pool are entered into the pool's resource or snapshot bookkeeping.
    pub fn add_volume(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        id: LayerId,
        vlm_nr: VolumeNumber,
        provider_kind: DeviceProviderKind,
        stor_pool: Option<Arc<StorPool>>,
    ) -> Result<Arc<VlmProviderObject>> {
        self.protection.require_access(ctx, AccessType::Change)?;

        let node = self.node(id)?;
        if node.vlms.contains_key(&vlm_nr) {
            return Err(Error::exists("volume", format!("{}/{}", id, vlm_nr)));
        }
        if let Some(parent) = self.parent(id)? {
            if !parent.vlms.contains_key(&vlm_nr) {
                return Err(Error::Implementation(format!(
                    "layer {} cannot carry volume {} its parent {} does not have",
                    id, vlm_nr, parent.id
                )));
            }
        }

        let alloc_key = self.owner.alloc_key(&node.suffix, vlm_nr);
        if let Some(pool) = &stor_pool {
            if self.owner.is_snapshot() {
                pool.put_snap_volume(tx, alloc_key.clone(), 0)?;
            } else {
                pool.put_rsc_volume(tx, alloc_key.clone(), 0)?;
            }
        }

        let vlm = Arc::new(VlmProviderObject::new(
            id,
            vlm_nr,
            provider_kind,
            stor_pool,
            alloc_key,
        ));
        node.vlms.insert(tx, vlm_nr, Arc::clone(&vlm))?;
        Ok(vlm)
    }

    /// Rebuild the layer stack of `src` in this (empty) graph
    ///
    /// Volumes keep their provider and pool; new layer ids are allocated.
    pub fn copy_from(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        ids: &LayerIdPool,
        src: &RscLayerGraph,
    ) -> Result<()> {
        if let Some(root) = self.root.get() {
            return Err(Error::Implementation(format!(
                "{} already has root layer {}",
                self.owner, root
            )));
        }
        match src.root.get() {
            Some(root) => self.copy_subtree(ctx, tx, ids, src, root, None),
            None => Ok(()),
        }
    }

    fn copy_subtree(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        ids: &LayerIdPool,
        src: &RscLayerGraph,
        src_id: LayerId,
        parent: Option<LayerId>,
    ) -> Result<()> {
        let layer = src.node(src_id)?;
        let parent_suffix = match src.parent(src_id)? {
            Some(p) => p.suffix.clone(),
            None => String::new(),
        };
        let own_suffix = layer
            .suffix
            .strip_prefix(parent_suffix.as_str())
            .unwrap_or(&layer.suffix);

        let copy = self.add_layer(ctx, tx, ids, parent, layer.kind, own_suffix)?;
        for (vlm_nr, vlm) in layer.vlms.entries() {
            self.add_volume(
                ctx,
                tx,
                copy.id,
                vlm_nr,
                vlm.provider_kind(),
                vlm.stor_pool().cloned(),
            )?;
        }
        for child in layer.child_ids() {
            self.copy_subtree(ctx, tx, ids, src, child, Some(copy.id))?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn node(&self, id: LayerId) -> Result<Arc<LayerNode>> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::not_found("layer", format!("{} of {}", id, self.owner)))
    }

    pub fn root(&self) -> Option<Arc<LayerNode>> {
        self.root.get().and_then(|id| self.nodes.get(&id))
    }

    pub fn layers(&self) -> Vec<Arc<LayerNode>> {
        self.nodes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children(&self, id: LayerId) -> Result<Vec<Arc<LayerNode>>> {
        self.node(id)?
            .child_ids()
            .into_iter()
            .map(|child| self.node(child))
            .collect()
    }

    pub fn parent(&self, id: LayerId) -> Result<Option<Arc<LayerNode>>> {
        match self.node(id)?.parent {
            Some(parent) => self.node(parent).map(Some),
            None => Ok(None),
        }
    }

    pub fn vlm_layer_objects(&self, id: LayerId) -> Result<BTreeMap<VolumeNumber, Arc<VlmProviderObject>>> {
        Ok(self.node(id)?.vlms.entries().into_iter().collect())
    }

    /// The only child of `id`; any other child count is a broken invariant
    pub fn single_child(&self, id: LayerId) -> Result<Arc<LayerNode>> {
        let mut children = self.children(id)?;
        if children.len() != 1 {
            return Err(Error::Implementation(format!(
                "layer {} of {} expected to have exactly one child, has {}",
                id,
                self.owner,
                children.len()
            )));
        }
        Ok(children.remove(0))
    }

    /// Child whose suffix is this node's suffix followed by `suffix`
    pub fn child_by_suffix(&self, id: LayerId, suffix: &str) -> Result<Option<Arc<LayerNode>>> {
        let node = self.node(id)?;
        let wanted = format!("{}{}", node.suffix, suffix);
        Ok(self
            .children(id)?
            .into_iter()
            .find(|child| child.suffix == wanted))
    }

    /// Child carrying the data of `id` (as opposed to e.g. its metadata)
    pub fn data_child(&self, id: LayerId) -> Result<Arc<LayerNode>> {
        match self.child_by_suffix(id, "")? {
            Some(child) => Ok(child),
            None => self.single_child(id),
        }
    }

    /// Whether every volume record of `id` and of the layers below it
    /// exists on the satellite
    pub fn exists(&self, id: LayerId) -> Result<bool> {
        let node = self.node(id)?;
        if !node.vlms.values().iter().all(|v| v.exists()) {
            return Ok(false);
        }
        for child in node.child_ids() {
            if !self.exists(child)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether any volume record of `id` or of a layer below it has failed
    pub fn has_failed(&self, id: LayerId) -> Result<bool> {
        let node = self.node(id)?;
        if node.vlms.values().iter().any(|v| v.has_failed()) {
            return Ok(true);
        }
        for child in node.child_ids() {
            if self.has_failed(child)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Layers of the given kind
    pub fn find_by_kind(&self, kind: LayerKind) -> Vec<Arc<LayerNode>> {
        self.nodes
            .values()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }

    /// Whether the satellite has reported every storage record of `vlm_nr`
    pub fn storage_reported(&self, vlm_nr: VolumeNumber) -> bool {
        self.find_by_kind(LayerKind::Storage)
            .iter()
            .filter_map(|layer| layer.vlm(vlm_nr))
            .all(|vlm| vlm.exists())
    }

    // -------------------------------------------------------------------------
    // Removal
    // -------------------------------------------------------------------------

    /// Remove volume `vlm_nr` from layer `id` and every layer below it
    ///
    /// Children go first so that no layer ever carries a volume its parent
    /// no longer has.
    pub fn remove_volume(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        id: LayerId,
        vlm_nr: VolumeNumber,
    ) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        self.remove_volume_subtree(tx, id, vlm_nr)
    }

    fn remove_volume_subtree(&self, tx: &TransactionMgr, id: LayerId, vlm_nr: VolumeNumber) -> Result<()> {
        let node = self.node(id)?;
        for child in node.child_ids() {
            self.remove_volume_subtree(tx, child, vlm_nr)?;
        }
        self.remove_local_volume(tx, &node, vlm_nr)
    }

    fn remove_local_volume(&self, tx: &TransactionMgr, node: &LayerNode, vlm_nr: VolumeNumber) -> Result<()> {
        let Some(vlm) = node.vlms.remove(tx, &vlm_nr)? else {
            return Ok(());
        };
        if let Some(pool) = vlm.stor_pool() {
            let key = vlm.alloc_key().to_string();
            if self.owner.is_snapshot() {
                pool.remove_snap_volume(tx, &key)?;
            } else {
                pool.remove_rsc_volume(tx, &key)?;
            }
            debug!(
                layer = %node.id,
                vlm = %vlm_nr,
                pool = %pool.name(),
                snapshot = self.owner.is_snapshot(),
                "Volume released from storage pool"
            );
        }
        vlm.delete_rows(tx)
    }

    /// Delete layer `id` and everything below it
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr, id: LayerId) -> Result<()> {
        self.protection.require_access(ctx, AccessType::Change)?;
        self.delete_subtree(tx, id)
    }

    /// Delete every layer of this graph
    pub fn delete_all(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        match self.root.get() {
            Some(root) => self.delete(ctx, tx, root),
            None => Ok(()),
        }
    }

    fn delete_subtree(&self, tx: &TransactionMgr, id: LayerId) -> Result<()> {
        let node = self.node(id)?;
        for child in node.child_ids() {
            self.delete_subtree(tx, child)?;
        }
        for vlm_nr in node.vlm_numbers() {
            self.remove_local_volume(tx, &node, vlm_nr)?;
        }

        node.suspend_io.remove_row(tx)?;
        if let Some(flags) = &node.drbd_flags {
            flags.delete(tx)?;
        }
        match node.parent {
            Some(parent) => {
                self.node(parent)?
                    .children
                    .update(tx, |c| c.retain(|child| *child != id))?;
            }
            None => {
                self.root.set(tx, None)?;
            }
        }
        self.nodes.remove(tx, &id)?;

        debug!(layer = %id, kind = %node.kind, owner = %self.owner, "Layer deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Consistency
    // -------------------------------------------------------------------------

    /// Verify the arena forms a single tree
    ///
    /// Checks: one root without parent, parent and child links agree, no
    /// layer is reachable twice, every layer is reachable from the root, and
    /// no layer carries a volume its parent lacks.
    pub fn check_tree(&self) -> Result<()> {
        let broken = |msg: String| Err(Error::Implementation(format!("{}: {}", self.owner, msg)));
        let nodes = self.nodes.entries();

        let Some(root_id) = self.root.get() else {
            return if nodes.is_empty() {
                Ok(())
            } else {
                broken(format!("{} layers but no root", nodes.len()))
            };
        };
        let root = self.node(root_id)?;
        if root.parent.is_some() {
            return broken(format!("root {} has a parent", root_id));
        }

        for (id, node) in &nodes {
            match node.parent {
                None if *id != root_id => return broken(format!("layer {} has no parent", id)),
                Some(parent) => {
                    let Some(parent) = self.nodes.get(&parent) else {
                        return broken(format!("parent of layer {} is missing", id));
                    };
                    if !parent.child_ids().contains(id) {
                        return broken(format!("layer {} not listed by its parent {}", id, parent.id));
                    }
                    if let Some(vlm) = node.vlm_numbers().into_iter().find(|v| !parent.vlms.contains_key(v)) {
                        return broken(format!("layer {} carries volume {} its parent lacks", id, vlm));
                    }
                }
                None => {}
            }
            for child in node.child_ids() {
                match self.nodes.get(&child) {
                    Some(c) if c.parent == Some(*id) => {}
                    Some(_) => return broken(format!("child {} of layer {} points elsewhere", child, id)),
                    None => return broken(format!("child {} of layer {} is missing", child, id)),
                }
            }
        }

        let mut seen = HashSet::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return broken(format!("layer {} reachable twice", id));
            }
            stack.extend(self.node(id)?.child_ids());
        }
        if seen.len() != nodes.len() {
            return broken(format!(
                "{} of {} layers unreachable from root",
                nodes.len() - seen.len(),
                nodes.len()
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RscLayerGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RscLayerGraph")
            .field("owner", &self.owner)
            .field("root", &self.root.get())
            .field("layers", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StorPoolName;
    use crate::transaction::MemoryDb;
    use assert_matches::assert_matches;

    struct Fixture {
        db: Arc<MemoryDb>,
        ctx: AccessContext,
        ids: LayerIdPool,
        pool: Arc<StorPool>,
        graph: RscLayerGraph,
    }

    fn fixture(owner_snapshot: bool) -> Fixture {
        let ctx = AccessContext::system();
        let node = NodeName::new("n1").unwrap();
        let rsc = ResourceName::new("rsc1").unwrap();
        let owner = if owner_snapshot {
            LayerOwner::Snapshot {
                node: node.clone(),
                rsc,
                snap: SnapshotName::new("snap1").unwrap(),
            }
        } else {
            LayerOwner::Resource {
                node: node.clone(),
                rsc,
            }
        };
        let protection = Arc::new(ObjectProtection::new(&ctx, "/rscdfns/RSC1"));
        Fixture {
            db: Arc::new(MemoryDb::new()),
            pool: Arc::new(StorPool::new(
                StorPoolName::new("pool1").unwrap(),
                node,
                DeviceProviderKind::Lvm,
                1 << 30,
            )),
            graph: RscLayerGraph::new(owner, protection),
            ids: LayerIdPool::new(1),
            ctx,
        }
    }

    /// DRBD over LUKS over storage, with an external metadata storage child
    fn drbd_luks_storage(f: &Fixture, tx: &TransactionMgr) -> (LayerId, LayerId, LayerId, LayerId) {
        let g = &f.graph;
        let drbd = g.add_layer(&f.ctx, tx, &f.ids, None, LayerKind::Drbd, "").unwrap().id();
        let luks = g.add_layer(&f.ctx, tx, &f.ids, Some(drbd), LayerKind::Luks, "").unwrap().id();
        let meta = g
            .add_layer(&f.ctx, tx, &f.ids, Some(drbd), LayerKind::Storage, ".meta")
            .unwrap()
            .id();
        let data = g.add_layer(&f.ctx, tx, &f.ids, Some(luks), LayerKind::Storage, "").unwrap().id();

        let nr = VolumeNumber(0);
        g.add_volume(&f.ctx, tx, drbd, nr, DeviceProviderKind::NotAProvider, None).unwrap();
        g.add_volume(&f.ctx, tx, luks, nr, DeviceProviderKind::NotAProvider, None).unwrap();
        g.add_volume(&f.ctx, tx, meta, nr, DeviceProviderKind::Lvm, Some(f.pool.clone())).unwrap();
        g.add_volume(&f.ctx, tx, data, nr, DeviceProviderKind::Lvm, Some(f.pool.clone())).unwrap();
        (drbd, luks, meta, data)
    }

    #[test]
    fn test_navigation() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, luks, meta, data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let g = &f.graph;
        assert_eq!(g.root().unwrap().id(), drbd);
        assert_eq!(g.children(drbd).unwrap().len(), 2);
        assert_eq!(g.parent(data).unwrap().unwrap().id(), luks);
        assert!(g.parent(drbd).unwrap().is_none());
        assert_eq!(g.child_by_suffix(drbd, ".meta").unwrap().unwrap().id(), meta);
        assert_eq!(g.child_by_suffix(drbd, "").unwrap().unwrap().id(), luks);
        assert_eq!(g.data_child(drbd).unwrap().id(), luks);
        assert_eq!(g.single_child(luks).unwrap().id(), data);
        assert_matches!(g.single_child(drbd), Err(Error::Implementation(_)));
        assert_eq!(g.vlm_layer_objects(data).unwrap().len(), 1);
        assert_eq!(g.find_by_kind(LayerKind::Storage).len(), 2);
        g.check_tree().unwrap();
    }

    #[test]
    fn test_exists_and_failed() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, _luks, _meta, data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let g = &f.graph;
        assert!(!g.exists(data).unwrap());
        g.node(data).unwrap().vlm(VolumeNumber(0)).unwrap().set_exists(true);
        assert!(g.exists(data).unwrap());

        assert!(!g.has_failed(drbd).unwrap());
        g.node(data).unwrap().vlm(VolumeNumber(0)).unwrap().set_failed(true);
        assert!(g.has_failed(drbd).unwrap());
        assert!(g.has_failed(data).unwrap());
    }

    #[test]
    fn test_exists_covers_layers_below() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, luks, meta, data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let g = &f.graph;
        let nr = VolumeNumber(0);
        for id in [drbd, luks, meta] {
            g.node(id).unwrap().vlm(nr).unwrap().set_exists(true);
        }
        assert!(!g.exists(drbd).unwrap());
        assert!(!g.exists(luks).unwrap());
        assert!(g.exists(meta).unwrap());

        g.node(data).unwrap().vlm(nr).unwrap().set_exists(true);
        assert!(g.exists(drbd).unwrap());
        assert!(g.exists(luks).unwrap());
    }

    #[test]
    fn test_second_root_rejected() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        f.graph.add_layer(&f.ctx, &tx, &f.ids, None, LayerKind::Storage, "").unwrap();
        assert_matches!(
            f.graph.add_layer(&f.ctx, &tx, &f.ids, None, LayerKind::Storage, ""),
            Err(Error::Implementation(_))
        );
    }

    #[test]
    fn test_child_volume_requires_parent_volume() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let g = &f.graph;
        let top = g.add_layer(&f.ctx, &tx, &f.ids, None, LayerKind::Luks, "").unwrap().id();
        let leaf = g.add_layer(&f.ctx, &tx, &f.ids, Some(top), LayerKind::Storage, "").unwrap().id();
        assert_matches!(
            g.add_volume(&f.ctx, &tx, leaf, VolumeNumber(3), DeviceProviderKind::Lvm, None),
            Err(Error::Implementation(_))
        );
    }

    #[test]
    fn test_remove_volume_children_first_releases_pool() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, _luks, _meta, data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();
        assert_eq!(f.pool.rsc_volume_keys().len(), 2);

        let tx = TransactionMgr::new(f.db.clone());
        f.graph.remove_volume(&f.ctx, &tx, drbd, VolumeNumber(0)).unwrap();
        tx.commit().unwrap();

        assert!(f.graph.vlm_layer_objects(drbd).unwrap().is_empty());
        assert!(f.graph.vlm_layer_objects(data).unwrap().is_empty());
        assert!(f.pool.rsc_volume_keys().is_empty());
        f.graph.check_tree().unwrap();
    }

    #[test]
    fn test_snapshot_owned_release() {
        let f = fixture(true);
        let tx = TransactionMgr::new(f.db.clone());
        let leaf = f
            .graph
            .add_layer(&f.ctx, &tx, &f.ids, None, LayerKind::Storage, "")
            .unwrap()
            .id();
        f.graph
            .add_volume(&f.ctx, &tx, leaf, VolumeNumber(0), DeviceProviderKind::Lvm, Some(f.pool.clone()))
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(f.pool.snap_volume_keys(), vec!["RSC1/SNAP1/0".to_string()]);
        assert!(f.pool.rsc_volume_keys().is_empty());

        let tx = TransactionMgr::new(f.db.clone());
        f.graph.remove_volume(&f.ctx, &tx, leaf, VolumeNumber(0)).unwrap();
        tx.commit().unwrap();
        assert!(f.pool.snap_volume_keys().is_empty());
    }

    #[test]
    fn test_delete_subtree() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, luks, meta, _data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();
        assert_eq!(f.db.rows("LAYER_RESOURCE_IDS").len(), 4);

        let tx = TransactionMgr::new(f.db.clone());
        f.graph.delete(&f.ctx, &tx, luks).unwrap();
        tx.commit().unwrap();

        assert_eq!(f.graph.children(drbd).unwrap().len(), 1);
        assert_eq!(f.graph.single_child(drbd).unwrap().id(), meta);
        assert_eq!(f.db.rows("LAYER_RESOURCE_IDS").len(), 2);
        assert_eq!(f.pool.rsc_volume_keys(), vec!["RSC1.meta/0".to_string()]);
        f.graph.check_tree().unwrap();

        let tx = TransactionMgr::new(f.db.clone());
        f.graph.delete_all(&f.ctx, &tx).unwrap();
        tx.commit().unwrap();
        assert!(f.graph.is_empty());
        assert!(f.db.rows("LAYER_RESOURCE_IDS").is_empty());
        assert!(f.db.rows("LAYER_VOLUMES").is_empty());
        assert!(f.db.rows("LAYER_DRBD_RESOURCES").is_empty());
        f.graph.check_tree().unwrap();
    }

    #[test]
    fn test_rollback_restores_structure() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, luks, _meta, _data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let tx = TransactionMgr::new(f.db.clone());
        f.graph.delete(&f.ctx, &tx, luks).unwrap();
        tx.rollback();

        assert_eq!(f.graph.children(drbd).unwrap().len(), 2);
        assert_eq!(f.pool.rsc_volume_keys().len(), 2);
        f.graph.check_tree().unwrap();
    }

    #[test]
    fn test_copy_into_snapshot_graph() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let snap = RscLayerGraph::new(
            LayerOwner::Snapshot {
                node: NodeName::new("n1").unwrap(),
                rsc: ResourceName::new("rsc1").unwrap(),
                snap: SnapshotName::new("snap1").unwrap(),
            },
            Arc::clone(f.graph.protection()),
        );
        let tx = TransactionMgr::new(f.db.clone());
        snap.copy_from(&f.ctx, &tx, &f.ids, &f.graph).unwrap();
        tx.commit().unwrap();

        snap.check_tree().unwrap();
        let root = snap.root().unwrap();
        assert_eq!(root.kind(), LayerKind::Drbd);
        assert_eq!(snap.child_by_suffix(root.id(), ".meta").unwrap().unwrap().kind(), LayerKind::Storage);
        assert_eq!(snap.data_child(root.id()).unwrap().kind(), LayerKind::Luks);
        assert_eq!(
            f.pool.snap_volume_keys(),
            vec!["RSC1/SNAP1.meta/0".to_string(), "RSC1/SNAP1/0".to_string()]
        );

        let tx = TransactionMgr::new(f.db.clone());
        assert_matches!(
            snap.copy_from(&f.ctx, &tx, &f.ids, &f.graph),
            Err(Error::Implementation(_))
        );
    }

    #[test]
    fn test_storage_reported() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (_, _, meta, data) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let nr = VolumeNumber(0);
        assert!(!f.graph.storage_reported(nr));
        f.graph.node(data).unwrap().vlm(nr).unwrap().set_exists(true);
        assert!(!f.graph.storage_reported(nr));
        f.graph.node(meta).unwrap().vlm(nr).unwrap().set_exists(true);
        assert!(f.graph.storage_reported(nr));
    }

    #[test]
    fn test_access_denied_leaves_graph_unchanged() {
        let f = fixture(false);
        let tx = TransactionMgr::new(f.db.clone());
        let (drbd, _, _, _) = drbd_luks_storage(&f, &tx);
        tx.commit().unwrap();

        let user = AccessContext::new("user", "users");
        let tx = TransactionMgr::new(f.db.clone());
        assert_matches!(
            f.graph.delete(&user, &tx, drbd),
            Err(Error::AccessDenied { .. })
        );
        assert_eq!(tx.registered(), 0);
        assert_eq!(f.graph.layers().len(), 4);
    }
}
