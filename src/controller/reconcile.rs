//! On-demand reconciliation
//!
//! Re-derives expected sizes from the volume definitions, derives allocated
//! sizes wherever the satellites have reported, and verifies every layer tree.

use super::Controller;
use crate::domain::{Resource, VolumeNumber};
use crate::error::Result;
use crate::layer::{LayerId, LayerKind, SizeState};
use crate::locks::LockName;
use crate::security::{AccessContext, AccessType};
use crate::transaction::TransactionMgr;
use serde::Serialize;
use tracing::{info, warn};

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub resources: usize,
    pub volumes: usize,
    /// Volumes still waiting for a satellite report
    pub pending: usize,
    pub broken: Vec<BrokenResource>,
    pub mismatches: Vec<SizeMismatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokenResource {
    pub rsc: String,
    pub node: String,
    pub error: String,
}

/// Storage volume whose provided size is not acceptable
#[derive(Debug, Clone, Serialize)]
pub struct SizeMismatch {
    pub rsc: String,
    pub node: String,
    pub layer: LayerId,
    pub vlm: VolumeNumber,
    pub expected_kib: u64,
    pub allocated_kib: u64,
    pub state: SizeState,
}

impl Controller {
    /// Reconcile every resource the caller may view
    ///
    /// A resource that fails to reconcile is listed as broken and does not
    /// stop the pass.
    pub fn reconcile_now(&self, ctx: &AccessContext) -> Result<ReconcileReport> {
        let report = self.scope.run(
            "Reconcile",
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            |guard, tx| {
                let mut report = ReconcileReport::default();
                for dfn in guard.rsc_dfns()?.values() {
                    if dfn.protection().require_access(ctx, AccessType::View).is_err() {
                        continue;
                    }
                    let volumes = dfn.volumes();
                    for resource in dfn.resources() {
                        report.resources += 1;
                        if let Err(e) = reconcile_resource(tx, &resource, &volumes, &mut report) {
                            warn!(rsc = %resource.name(), node = %resource.node(), error = %e, "Resource failed to reconcile");
                            report.broken.push(BrokenResource {
                                rsc: resource.name().to_string(),
                                node: resource.node().to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
                Ok(report)
            },
        )?;

        info!(
            resources = report.resources,
            volumes = report.volumes,
            pending = report.pending,
            broken = report.broken.len(),
            mismatches = report.mismatches.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }
}

fn reconcile_resource(
    tx: &TransactionMgr,
    resource: &Resource,
    volumes: &[(VolumeNumber, u64)],
    report: &mut ReconcileReport,
) -> Result<()> {
    let graph = resource.layers();
    graph.check_tree()?;
    let Some(root) = graph.root() else {
        return Ok(());
    };

    for (vlm_nr, size_kib) in volumes {
        graph.update_expected_size(tx, root.id(), *vlm_nr, *size_kib)?;
        report.volumes += 1;
        if !graph.storage_reported(*vlm_nr) {
            report.pending += 1;
            continue;
        }
        graph.update_allocated_size(tx, root.id(), *vlm_nr)?;

        for layer in graph.find_by_kind(LayerKind::Storage) {
            let Some(vlm) = layer.vlm(*vlm_nr) else {
                continue;
            };
            if let Some(state) = vlm.size_state().filter(|s| !s.is_acceptable()) {
                report.mismatches.push(SizeMismatch {
                    rsc: resource.name().to_string(),
                    node: resource.node().to_string(),
                    layer: layer.id(),
                    vlm: *vlm_nr,
                    expected_kib: vlm.expected_size(),
                    allocated_kib: vlm.allocated_size(),
                    state,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::VolumeReport;
    use super::*;

    fn report_storage(ctrl: &Controller, name: &str, allocated_kib: u64) {
        let report = VolumeReport {
            allocated_kib,
            device_path: None,
            failed: false,
        };
        ctrl.update_volume_state(&rsc1(), &node(name), VolumeNumber(0), "", &report)
            .unwrap();
    }

    fn storage_expected(ctrl: &Controller, name: &str) -> u64 {
        let resource = resource(ctrl, name);
        let root = resource.layers().root().unwrap();
        let storage = resource.layers().data_child(root.id()).unwrap();
        storage.vlm(VolumeNumber(0)).unwrap().expected_size()
    }

    #[test]
    fn test_unreported_volumes_are_pending() {
        let (ctrl, _db, _updater) = controller(0);
        cluster(&ctrl);

        let report = ctrl.reconcile_now(&AccessContext::system()).unwrap();
        assert_eq!(report.resources, 4);
        assert_eq!(report.volumes, 4);
        // alpha, bravo and charlie wait for their storage; delta has none
        assert_eq!(report.pending, 3);
        assert!(report.broken.is_empty());
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn test_size_mismatch_reported() {
        let (ctrl, _db, _updater) = controller(0);
        cluster(&ctrl);

        let expected = storage_expected(&ctrl, "alpha");
        report_storage(&ctrl, "alpha", expected);
        report_storage(&ctrl, "bravo", expected + 4096);
        report_storage(&ctrl, "charlie", expected + 10 * 4096);

        let report = ctrl.reconcile_now(&AccessContext::system()).unwrap();
        assert_eq!(report.pending, 0);
        assert_eq!(report.mismatches.len(), 1);
        let mismatch = &report.mismatches[0];
        assert_eq!(mismatch.node, "charlie");
        assert_eq!(mismatch.state, SizeState::TooLarge);
        assert_eq!(mismatch.expected_kib, expected);
    }

    #[test]
    fn test_changed_volume_size_updates_expected() {
        let (ctrl, _db, _updater) = controller(0);
        cluster(&ctrl);
        let before = storage_expected(&ctrl, "alpha");

        let ctx = AccessContext::system();
        ctrl.scope
            .run("resize", |b| b.write(&[LockName::RscDfnMap]), |guard, tx| {
                guard
                    .rsc_dfns()?
                    .require(&rsc1())?
                    .set_volume(&ctx, tx, VolumeNumber(0), 2 * VOLUME_KIB)
            })
            .unwrap();
        ctrl.reconcile_now(&ctx).unwrap();

        assert!(storage_expected(&ctrl, "alpha") >= before + VOLUME_KIB);
    }

    #[test]
    fn test_foreign_role_sees_nothing() {
        let (ctrl, _db, _updater) = controller(0);
        cluster(&ctrl);

        let report = ctrl
            .reconcile_now(&AccessContext::new("mallory", "tenants"))
            .unwrap();
        assert_eq!(report.resources, 0);
    }
}
