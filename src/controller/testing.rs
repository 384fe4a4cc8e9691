//! Test fixtures: a controller over an in-memory database and a scripted
//! satellite updater.

use super::{Controller, ResourceLayout};
use crate::config::ControllerConfig;
use crate::domain::{
    ApiCallRc, ApiCallRcEntry, NodeName, Resource, ResourceDefinition, ResourceName,
    SatelliteUpdater, SnapshotName, StorPool, StorPoolName, VolumeNumber,
};
use crate::error::{Error, Result};
use crate::layer::DeviceProviderKind;
use crate::locks::LockName;
use crate::security::AccessContext;
use crate::stateflags::DrbdLayerFlags;
use crate::transaction::MemoryDb;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const VOLUME_KIB: u64 = 1024 * 1024;

/// Records every propagation; fails on request
#[derive(Debug, Default)]
pub(crate) struct RecordingUpdater {
    calls: Mutex<Vec<(ResourceName, Vec<NodeName>)>>,
    fail: AtomicBool,
}

impl RecordingUpdater {
    pub(crate) fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(ResourceName, Vec<NodeName>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SatelliteUpdater for RecordingUpdater {
    async fn update_satellites(&self, rsc: &ResourceName, nodes: &[NodeName]) -> Result<ApiCallRc> {
        self.calls.lock().push((rsc.clone(), nodes.to_vec()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Propagation {
                resource: rsc.to_string(),
                reason: "satellites unreachable".to_string(),
            });
        }
        Ok(ApiCallRc::single(ApiCallRcEntry::info(format!(
            "Updated '{}' on {} node(s)",
            rsc,
            nodes.len()
        ))))
    }
}

pub(crate) fn controller(node_timeout_secs: u64) -> (Controller, Arc<MemoryDb>, Arc<RecordingUpdater>) {
    let mut config = ControllerConfig::default();
    config.locks.acquire_timeout_ms = 2_000;
    config.coordinator.node_report_timeout_secs = node_timeout_secs;
    let db = Arc::new(MemoryDb::new());
    let updater = Arc::new(RecordingUpdater::default());
    let ctrl = Controller::new(config, db.clone(), updater.clone()).unwrap();
    (ctrl, db, updater)
}

pub(crate) fn node(name: &str) -> NodeName {
    NodeName::new(name).unwrap()
}

pub(crate) fn rsc1() -> ResourceName {
    ResourceName::new("rsc1").unwrap()
}

pub(crate) fn snap1() -> SnapshotName {
    SnapshotName::new("snap1").unwrap()
}

pub(crate) fn pool1() -> StorPoolName {
    StorPoolName::new("pool1").unwrap()
}

pub(crate) fn node_with_pool(ctrl: &Controller, name: &str) {
    let ctx = AccessContext::system();
    ctrl.create_node(&ctx, &node(name)).unwrap();
    ctrl.create_stor_pool(&ctx, &node(name), &pool1(), DeviceProviderKind::Lvm, 100 * VOLUME_KIB)
        .unwrap();
}

/// `rsc1` with one volume: diskful on alpha, bravo and charlie, diskless on delta
pub(crate) fn cluster(ctrl: &Controller) {
    let ctx = AccessContext::system();
    for name in ["alpha", "bravo", "charlie"] {
        node_with_pool(ctrl, name);
    }
    ctrl.create_node(&ctx, &node("delta")).unwrap();
    ctrl.create_resource_definition(&ctx, &rsc1(), &[(VolumeNumber(0), VOLUME_KIB)])
        .unwrap();
    for name in ["alpha", "bravo", "charlie"] {
        ctrl.create_resource(&ctx, &rsc1(), &node(name), &ResourceLayout::drbd(pool1()))
            .unwrap();
    }
    ctrl.create_resource(&ctx, &rsc1(), &node("delta"), &ResourceLayout::drbd_diskless())
        .unwrap();
}

/// `cluster` plus snapshot `snap1` and initialized DRBD metadata everywhere
pub(crate) fn cluster_with_snapshot(ctrl: &Controller) {
    cluster(ctrl);
    let ctx = AccessContext::system();
    ctrl.create_snapshot(&ctx, &rsc1(), &snap1()).unwrap();
    ctrl.scope
        .run("initialize", |b| b.write(&[LockName::RscDfnMap]), |guard, tx| {
            for resource in guard.rsc_dfns()?.require(&rsc1())?.resources() {
                for layer in resource.drbd_layers() {
                    if let Some(flags) = layer.drbd_flags() {
                        flags.enable_flags(&ctx, tx, &[DrbdLayerFlags::Initialized])?;
                    }
                }
            }
            Ok(())
        })
        .unwrap();
}

pub(crate) fn rsc_dfn(ctrl: &Controller) -> Arc<ResourceDefinition> {
    ctrl.scope
        .run("inspect", |b| b.read(&[LockName::RscDfnMap]), |guard, _tx| {
            guard.rsc_dfns()?.require(&rsc1())
        })
        .unwrap()
}

pub(crate) fn resource(ctrl: &Controller, name: &str) -> Arc<Resource> {
    rsc_dfn(ctrl).resource(&node(name)).unwrap()
}

pub(crate) fn node_pool(ctrl: &Controller, name: &str) -> Arc<StorPool> {
    ctrl.scope
        .run("inspect", |b| b.read(&[LockName::NodesMap]), |guard, _tx| {
            guard.nodes()?.require(&node(name))
        })
        .unwrap()
        .stor_pool(&pool1())
        .unwrap()
}

/// Whether the DRBD layer of `name` carries every flag in `flags`
pub(crate) fn drbd_flags_set(ctrl: &Controller, name: &str, flags: &[DrbdLayerFlags]) -> bool {
    let ctx = AccessContext::system();
    resource(ctrl, name).drbd_layers()[0]
        .drbd_flags()
        .unwrap()
        .is_set(&ctx, flags)
        .unwrap()
}

pub(crate) fn rollback_marker(ctrl: &Controller, name: &str) -> Option<String> {
    resource(ctrl, name)
        .prop(&AccessContext::system(), crate::domain::PROP_ROLLBACK_TARGET)
        .unwrap()
}
