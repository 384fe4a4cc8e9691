//! Controller Facade
//!
//! Entry points for every cluster mutation. Each operation runs in a
//! transactional scope under the lock bundle it needs; multi-node operations
//! hand their asynchronous part to the rollback coordinator.

pub mod reconcile;
pub mod rollback;
pub mod scope;

#[cfg(test)]
pub(crate) mod testing;

pub use reconcile::{BrokenResource, ReconcileReport, SizeMismatch};
pub use scope::ScopeRunner;

use crate::config::ControllerConfig;
use crate::coordinator::{InflightSummary, RollbackCoordinator};
use crate::domain::{
    Node, NodeName, Resource, ResourceDefinition, ResourceName, SatelliteUpdaterRef, Snapshot,
    SnapshotDefinition, SnapshotName, StorPool, StorPoolDefinition, StorPoolName, VolumeNumber,
};
use crate::error::{Error, Result};
use crate::layer::{DeviceProviderKind, LayerId, LayerIdPool, LayerKind};
use crate::locks::{LockFacility, LockName, LockStatus};
use crate::metrics::ControllerMetrics;
use crate::security::{AccessContext, AccessType};
use crate::stateflags::{DrbdLayerFlags, ResourceFlags};
use crate::transaction::{DbEngine, TransactionMgr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Requests
// =============================================================================

/// Device stack and placement of a new resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLayout {
    /// Layers from the top of the device stack down
    pub layers: Vec<LayerKind>,
    /// Pool backing the storage layer; `None` makes the resource diskless
    #[serde(default)]
    pub stor_pool: Option<StorPoolName>,
    /// Pool holding external DRBD metadata
    #[serde(default)]
    pub meta_pool: Option<StorPoolName>,
}

impl ResourceLayout {
    /// DRBD over a storage volume from `pool`
    pub fn drbd(pool: StorPoolName) -> Self {
        Self {
            layers: vec![LayerKind::Drbd, LayerKind::Storage],
            stor_pool: Some(pool),
            meta_pool: None,
        }
    }

    /// DRBD client without local storage
    pub fn drbd_diskless() -> Self {
        Self {
            layers: vec![LayerKind::Drbd],
            stor_pool: None,
            meta_pool: None,
        }
    }

    pub fn is_diskless(&self) -> bool {
        self.stor_pool.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidRequest(msg.to_string()));

        let Some(last) = self.layers.last() else {
            return invalid("layer stack is empty");
        };
        for (idx, kind) in self.layers.iter().enumerate() {
            if self.layers[..idx].contains(kind) {
                return Err(Error::InvalidRequest(format!("layer {} appears twice", kind)));
            }
            if *kind == LayerKind::Storage && idx + 1 != self.layers.len() {
                return invalid("storage layer must be the bottom of the stack");
            }
        }

        let has_drbd = self.layers.contains(&LayerKind::Drbd);
        match &self.stor_pool {
            Some(_) if *last != LayerKind::Storage => {
                return invalid("a storage pool needs a storage layer at the bottom of the stack")
            }
            None if *last == LayerKind::Storage => {
                return invalid("storage layer without a storage pool")
            }
            None if !has_drbd => return invalid("diskless resources need a DRBD layer"),
            _ => {}
        }
        if self.meta_pool.is_some() && (!has_drbd || self.is_diskless()) {
            return invalid("external metadata needs a diskful DRBD layer");
        }
        Ok(())
    }
}

/// Satellite report on one storage volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReport {
    pub allocated_kib: u64,
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub failed: bool,
}

// =============================================================================
// Controller
// =============================================================================

/// The controller core: lock facility, transactions and coordination
pub struct Controller {
    config: ControllerConfig,
    scope: ScopeRunner,
    coordinator: RollbackCoordinator,
    updater: SatelliteUpdaterRef,
    metrics: ControllerMetrics,
    layer_ids: LayerIdPool,
    ctx: AccessContext,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        db: Arc<dyn DbEngine>,
        updater: SatelliteUpdaterRef,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = ControllerMetrics::new()?;
        let locks = LockFacility::new(config.lock_timeout()).with_metrics(metrics.clone());
        let scope = ScopeRunner::new(locks, db, metrics.clone());
        let coordinator = RollbackCoordinator::new(
            scope.clone(),
            Arc::clone(&updater),
            metrics.clone(),
            config.node_report_timeout(),
        );

        info!(
            lock_timeout_ms = config.locks.acquire_timeout_ms,
            node_report_timeout_secs = config.coordinator.node_report_timeout_secs,
            "Controller initialized"
        );

        Ok(Self {
            layer_ids: LayerIdPool::new(config.layer.first_layer_id),
            config,
            scope,
            coordinator,
            updater,
            metrics,
            ctx: AccessContext::system(),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    pub fn coordinator(&self) -> &RollbackCoordinator {
        &self.coordinator
    }

    /// Current state of every named lock
    pub fn lock_status(&self) -> Vec<LockStatus> {
        self.scope.locks().status()
    }

    /// Rollbacks waiting for node reports
    pub fn list_inflight(&self) -> Vec<InflightSummary> {
        self.coordinator.inflight()
    }

    fn ensure_idle(&self, rsc: &ResourceName) -> Result<()> {
        if self.coordinator.is_inflight(rsc) {
            return Err(Error::OperationInProgress {
                operation: "snapshot rollback".to_string(),
                resource: rsc.to_string(),
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Controller configuration
    // -------------------------------------------------------------------------

    pub fn set_ctrl_property(&self, ctx: &AccessContext, key: &str, value: &str) -> Result<()> {
        require_admin(ctx)?;
        self.scope.run(
            "Set controller property",
            |b| b.write(&[LockName::CtrlConfig]),
            |guard, tx| {
                guard.ctrl_config_mut()?.set(tx, key, value)?;
                Ok(())
            },
        )
    }

    pub fn ctrl_properties(&self) -> Result<Vec<(String, String)>> {
        self.scope.run(
            "List controller properties",
            |b| b.read(&[LockName::CtrlConfig]),
            |guard, _tx| Ok(guard.ctrl_config()?.entries()),
        )
    }

    // -------------------------------------------------------------------------
    // Nodes and storage pools
    // -------------------------------------------------------------------------

    pub fn create_node(&self, ctx: &AccessContext, name: &NodeName) -> Result<()> {
        self.scope.run(
            "Create node",
            |b| b.write(&[LockName::NodesMap]),
            |guard, tx| {
                let node = Arc::new(Node::new(ctx, name.clone()));
                guard.nodes_mut()?.insert(tx, name.clone(), node)?;
                info!(node = %name, "Node created");
                Ok(())
            },
        )
    }

    /// Record whether the satellite of `name` is connected
    pub fn set_node_connected(&self, name: &NodeName, connected: bool) -> Result<()> {
        self.scope.run(
            "Update node connection",
            |b| b.read(&[LockName::NodesMap]),
            |guard, _tx| {
                guard.nodes()?.require(name)?.set_connected(connected);
                info!(node = %name, connected, "Node connection changed");
                Ok(())
            },
        )
    }

    /// Record whether resource `rsc` is opened on `node`, as the satellite reports
    pub fn set_resource_in_use(&self, rsc: &ResourceName, node: &NodeName, in_use: bool) -> Result<()> {
        self.scope.run(
            "Update resource usage",
            |b| b.read(&[LockName::RscDfnMap]),
            |guard, _tx| {
                let resource = guard
                    .rsc_dfns()?
                    .require(rsc)?
                    .resource(node)
                    .ok_or_else(|| Error::not_found("resource", format!("{} on {}", rsc, node)))?;
                resource.set_in_use(in_use);
                debug!(rsc = %rsc, node = %node, in_use, "Resource usage reported");
                Ok(())
            },
        )
    }

    /// Create storage pool `pool` on `node`, defining the pool name if needed
    pub fn create_stor_pool(
        &self,
        ctx: &AccessContext,
        node_name: &NodeName,
        pool: &StorPoolName,
        provider: DeviceProviderKind,
        capacity_kib: u64,
    ) -> Result<()> {
        self.scope.run(
            "Create storage pool",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::StorPoolDfnMap]),
            |guard, tx| {
                let node = guard.nodes()?.require(node_name)?;
                node.protection().require_access(ctx, AccessType::Change)?;
                if node.stor_pool(pool).is_some() {
                    return Err(Error::exists("storage pool", format!("{} on {}", pool, node_name)));
                }

                let dfns = guard.stor_pool_dfns_mut()?;
                if !dfns.contains(pool) {
                    let dfn = Arc::new(StorPoolDefinition::new(ctx, pool.clone()));
                    dfns.insert(tx, pool.clone(), dfn)?;
                }
                let stor_pool = StorPool::new(pool.clone(), node_name.clone(), provider, capacity_kib);
                node.add_stor_pool(tx, Arc::new(stor_pool))?;
                info!(node = %node_name, pool = %pool, provider = ?provider, capacity_kib, "Storage pool created");
                Ok(())
            },
        )
    }

    // -------------------------------------------------------------------------
    // Resource definitions and resources
    // -------------------------------------------------------------------------

    pub fn create_resource_definition(
        &self,
        ctx: &AccessContext,
        name: &ResourceName,
        volumes: &[(VolumeNumber, u64)],
    ) -> Result<()> {
        self.scope.run(
            "Create resource definition",
            |b| b.write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let dfn = Arc::new(ResourceDefinition::new(ctx, name.clone()));
                for (vlm_nr, size_kib) in volumes {
                    dfn.set_volume(ctx, tx, *vlm_nr, *size_kib)?;
                }
                guard.rsc_dfns_mut()?.insert(tx, name.clone(), dfn)?;
                info!(rsc = %name, volumes = volumes.len(), "Resource definition created");
                Ok(())
            },
        )
    }

    /// Deploy resource `rsc` on `node_name` with the given device stack
    pub fn create_resource(
        &self,
        ctx: &AccessContext,
        rsc: &ResourceName,
        node_name: &NodeName,
        layout: &ResourceLayout,
    ) -> Result<()> {
        layout.validate()?;
        self.scope.run(
            "Create resource",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let node = guard.nodes()?.require(node_name)?;
                let dfn = guard.rsc_dfns()?.require(rsc)?;
                dfn.protection().require_access(ctx, AccessType::Change)?;
                self.ensure_idle(rsc)?;

                let pool = |name: &Option<StorPoolName>| -> Result<Option<Arc<StorPool>>> {
                    match name {
                        Some(name) => node
                            .stor_pool(name)
                            .map(Some)
                            .ok_or_else(|| Error::not_found("storage pool", format!("{} on {}", name, node_name))),
                        None => Ok(None),
                    }
                };
                let data_pool = pool(&layout.stor_pool)?;
                let meta_pool = pool(&layout.meta_pool)?;

                let flags: &[ResourceFlags] = if layout.is_diskless() {
                    &[ResourceFlags::DrbdDiskless]
                } else {
                    &[]
                };
                let resource = Arc::new(Resource::new(
                    node_name.clone(),
                    rsc.clone(),
                    Arc::clone(dfn.protection()),
                    flags,
                ));
                self.build_layers(ctx, tx, &resource, layout, data_pool, meta_pool, &dfn.volumes())?;
                dfn.add_resource(ctx, tx, resource)?;
                info!(rsc = %rsc, node = %node_name, layers = ?layout.layers, "Resource created");
                Ok(())
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_layers(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        resource: &Resource,
        layout: &ResourceLayout,
        data_pool: Option<Arc<StorPool>>,
        meta_pool: Option<Arc<StorPool>>,
        volumes: &[(VolumeNumber, u64)],
    ) -> Result<()> {
        let graph = resource.layers();
        let mut parent: Option<LayerId> = None;

        for kind in &layout.layers {
            let layer = graph.add_layer(ctx, tx, &self.layer_ids, parent, *kind, "")?;
            let (provider, pool) = match (kind, &data_pool) {
                (LayerKind::Storage, Some(pool)) => (pool.provider_kind(), Some(Arc::clone(pool))),
                _ => (DeviceProviderKind::NotAProvider, None),
            };
            for (vlm_nr, _) in volumes {
                graph.add_volume(ctx, tx, layer.id(), *vlm_nr, provider, pool.clone())?;
            }

            if *kind == LayerKind::Drbd {
                if let Some(flags) = layer.drbd_flags() {
                    if layout.is_diskless() {
                        flags.enable_flags(ctx, tx, &[DrbdLayerFlags::Diskless])?;
                    }
                }
                if let Some(meta) = &meta_pool {
                    let md = graph.add_layer(ctx, tx, &self.layer_ids, Some(layer.id()), LayerKind::Storage, ".meta")?;
                    for (vlm_nr, _) in volumes {
                        graph.add_volume(ctx, tx, md.id(), *vlm_nr, meta.provider_kind(), Some(Arc::clone(meta)))?;
                    }
                }
            }
            parent = Some(layer.id());
        }

        if let Some(root) = graph.root() {
            for (vlm_nr, size_kib) in volumes {
                graph.update_expected_size(tx, root.id(), *vlm_nr, *size_kib)?;
            }
        }
        Ok(())
    }

    /// Delete the resource of `rsc` on `node` with its device stack
    pub fn delete_resource(&self, ctx: &AccessContext, rsc: &ResourceName, node: &NodeName) -> Result<()> {
        self.scope.run(
            "Delete resource",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let dfn = guard.rsc_dfns()?.require(rsc)?;
                self.ensure_idle(rsc)?;
                dfn.delete_resource(ctx, tx, node)?;
                info!(rsc = %rsc, node = %node, "Resource deleted");
                Ok(())
            },
        )
    }

    /// Remove volume `vlm_nr` from the definition and every resource of `rsc`
    pub fn remove_volume(&self, ctx: &AccessContext, rsc: &ResourceName, vlm_nr: VolumeNumber) -> Result<()> {
        self.scope.run(
            "Remove volume",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let dfn = guard.rsc_dfns()?.require(rsc)?;
                self.ensure_idle(rsc)?;
                for resource in dfn.resources() {
                    if let Some(root) = resource.layers().root() {
                        resource.layers().remove_volume(ctx, tx, root.id(), vlm_nr)?;
                    }
                }
                dfn.remove_volume(ctx, tx, vlm_nr)?;
                info!(rsc = %rsc, vlm = %vlm_nr, "Volume removed");
                Ok(())
            },
        )
    }

    /// Take snapshot `snap` of every diskful resource of `rsc`
    pub fn create_snapshot(&self, ctx: &AccessContext, rsc: &ResourceName, snap: &SnapshotName) -> Result<()> {
        self.scope.run(
            "Create snapshot",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let dfn = guard.rsc_dfns()?.require(rsc)?;
                dfn.protection().require_access(ctx, AccessType::Change)?;
                self.ensure_idle(rsc)?;
                if dfn.snapshot(snap).is_some() {
                    return Err(Error::exists("snapshot", format!("{}/{}", rsc, snap)));
                }

                let snap_dfn = Arc::new(SnapshotDefinition::new(rsc.clone(), snap.clone()));
                for resource in dfn.diskful_resources(ctx)? {
                    let snapshot = Arc::new(Snapshot::new(
                        resource.node().clone(),
                        rsc.clone(),
                        snap.clone(),
                        Arc::clone(dfn.protection()),
                    ));
                    snapshot.layers().copy_from(ctx, tx, &self.layer_ids, resource.layers())?;
                    snap_dfn.add_snapshot(tx, snapshot)?;
                }
                let nodes = snap_dfn.nodes();
                dfn.add_snapshot(ctx, tx, snap_dfn)?;
                info!(rsc = %rsc, snapshot = %snap, nodes = ?nodes, "Snapshot created");
                Ok(())
            },
        )
    }

    /// Apply a satellite's report on the storage volume `vlm_nr` of the
    /// storage layer with `suffix`
    ///
    /// Sizes of the whole stack are derived once every storage record of the
    /// volume has been reported.
    pub fn update_volume_state(
        &self,
        rsc: &ResourceName,
        node: &NodeName,
        vlm_nr: VolumeNumber,
        suffix: &str,
        report: &VolumeReport,
    ) -> Result<()> {
        self.scope.run(
            "Update volume state",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let dfn = guard.rsc_dfns()?.require(rsc)?;
                let resource = dfn
                    .resource(node)
                    .ok_or_else(|| Error::not_found("resource", format!("{} on {}", rsc, node)))?;
                let graph = resource.layers();
                let layer = graph
                    .find_by_kind(LayerKind::Storage)
                    .into_iter()
                    .find(|l| l.suffix() == suffix)
                    .ok_or_else(|| Error::not_found("storage layer", format!("{}{} on {}", rsc, suffix, node)))?;
                let vlm = layer
                    .vlm(vlm_nr)
                    .ok_or_else(|| Error::not_found("volume", format!("{}/{} on {}", rsc, vlm_nr, node)))?;

                vlm.set_allocated_size(tx, report.allocated_kib)?;
                vlm.set_device_path(report.device_path.clone());
                vlm.set_failed(report.failed);
                vlm.set_exists(!report.failed);
                debug!(
                    rsc = %rsc,
                    node = %node,
                    vlm = %vlm_nr,
                    allocated_kib = report.allocated_kib,
                    failed = report.failed,
                    "Volume state reported"
                );

                if graph.storage_reported(vlm_nr) {
                    if let Some(root) = graph.root() {
                        graph.update_allocated_size(tx, root.id(), vlm_nr)?;
                    }
                }
                Ok(())
            },
        )
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("scope", &self.scope)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

fn require_admin(ctx: &AccessContext) -> Result<()> {
    if ctx.is_system() {
        return Ok(());
    }
    Err(Error::AccessDenied {
        identity: ctx.identity().to_string(),
        object: "/ctrlconfig".to_string(),
        required: AccessType::Change,
    })
}
