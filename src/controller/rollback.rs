//! Snapshot rollback entry points
//!
//! Marks the diskful resources, registers the rollback with the coordinator
//! and fans the change out to the satellites. The returned stream yields the
//! acknowledgement of the request, the result of the fan-out and finally the
//! outcome decided by the coordinator.

use super::Controller;
use crate::coordinator::{ApiCallStream, RollbackHandle};
use crate::domain::{
    ApiCallRc, ApiCallRcEntry, NodeName, ResourceName, SnapshotName, PROP_ROLLBACK_TARGET,
};
use crate::error::{Error, Result};
use crate::locks::{LockGuardBuilder, LockName};
use crate::security::{AccessContext, AccessType};
use futures::future;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn rollback_locks(builder: LockGuardBuilder) -> LockGuardBuilder {
    builder
        .read(&[LockName::NodesMap])
        .write(&[LockName::RscDfnMap])
}

/// Nodes a registered rollback expects reports from, and nodes to update
struct Registered {
    snapshot: SnapshotName,
    expected: BTreeSet<NodeName>,
    targets: Vec<NodeName>,
}

impl Controller {
    /// Roll every diskful resource of `rsc` back to `snapshot`
    ///
    /// Fails without side effects when the snapshot is unknown, the caller
    /// lacks `CHANGE` access or another rollback of `rsc` is in flight. A
    /// node of `rsc` without a connected satellite, or a resource opened on
    /// its node, fails the request with `InvalidRequest` just the same.
    pub async fn rollback_snapshot(
        &self,
        ctx: &AccessContext,
        rsc: &ResourceName,
        snapshot: &SnapshotName,
    ) -> Result<ApiCallStream> {
        let mut handle: Option<RollbackHandle> = None;
        let result = self.scope.run("Rollback snapshot", rollback_locks, |guard, tx| {
            let dfn = guard.rsc_dfns()?.require(rsc)?;
            dfn.protection().require_access(ctx, AccessType::Change)?;
            let snap_dfn = dfn
                .snapshot(snapshot)
                .ok_or_else(|| Error::not_found("snapshot", format!("{}/{}", rsc, snapshot)))?;
            self.ensure_idle(rsc)?;

            let nodes = guard.nodes()?;
            for resource in dfn.resources() {
                if !nodes.require(resource.node())?.is_connected() {
                    return Err(Error::InvalidRequest(format!(
                        "Node '{}' of resource '{}' is not connected",
                        resource.node(),
                        rsc
                    )));
                }
                if resource.is_in_use() {
                    return Err(Error::InvalidRequest(format!(
                        "Resource '{}' is in use on node '{}'",
                        rsc,
                        resource.node()
                    )));
                }
            }

            let diskful = dfn.diskful_resources(ctx)?;
            for resource in &diskful {
                if snap_dfn.snapshot(resource.node()).is_none() {
                    return Err(Error::InvalidRequest(format!(
                        "Snapshot '{}' of resource '{}' does not exist on node '{}'",
                        snapshot,
                        rsc,
                        resource.node()
                    )));
                }
                resource.set_prop(ctx, tx, PROP_ROLLBACK_TARGET, snapshot.as_str())?;
            }

            let expected: BTreeSet<NodeName> = diskful.iter().map(|r| r.node().clone()).collect();
            handle = Some(self.coordinator.initiate(rsc, snapshot, expected.clone())?);
            Ok(Registered {
                snapshot: snapshot.clone(),
                expected,
                targets: dfn.resources().iter().map(|r| r.node().clone()).collect(),
            })
        });

        let registered = match result {
            Ok(registered) => registered,
            Err(e) => {
                if handle.is_some() {
                    self.coordinator.discard(rsc, &e);
                }
                return Err(e);
            }
        };
        let handle = handle.ok_or_else(|| {
            Error::Implementation(format!("rollback of {} registered without a handle", rsc))
        })?;

        info!(rsc = %rsc, snapshot = %snapshot, nodes = ?registered.expected, "Rollback started");
        let started = ApiCallRc::single(
            ApiCallRcEntry::info(format!(
                "Rollback of resource '{}' to snapshot '{}' started",
                rsc, snapshot
            ))
            .with_ref("RscDfn", rsc)
            .with_ref("Snapshot", snapshot),
        );
        Ok(self.fan_out(rsc, registered, handle, started))
    }

    /// Resume a rollback interrupted before its outcome was decided
    ///
    /// Called when the satellites of `rsc` (re)connect. Resources still
    /// carrying the rollback marker without a registered rollback get the
    /// rollback initiated again; returns `None` when there is nothing to do.
    pub async fn resource_definition_connected(&self, rsc: &ResourceName) -> Result<Option<ApiCallStream>> {
        let ctx = &self.ctx;
        let mut handle: Option<RollbackHandle> = None;
        let result = self.scope.run("Resume rollback", rollback_locks, |guard, _tx| {
            if self.coordinator.is_inflight(rsc) {
                return Ok(None);
            }
            let dfn = guard.rsc_dfns()?.require(rsc)?;

            let mut target: Option<String> = None;
            let mut expected = BTreeSet::new();
            for resource in dfn.diskful_resources(ctx)? {
                let Some(marker) = resource.prop(ctx, PROP_ROLLBACK_TARGET)? else {
                    continue;
                };
                match &target {
                    Some(t) if *t != marker => warn!(
                        rsc = %rsc,
                        node = %resource.node(),
                        marker = %marker,
                        target = %t,
                        "Conflicting rollback targets, keeping the first"
                    ),
                    Some(_) => {}
                    None => target = Some(marker),
                }
                expected.insert(resource.node().clone());
            }
            let Some(target) = target else {
                return Ok(None);
            };

            let snapshot = SnapshotName::new(target)?;
            handle = Some(self.coordinator.initiate(rsc, &snapshot, expected.clone())?);
            Ok(Some(Registered {
                snapshot,
                expected,
                targets: dfn.resources().iter().map(|r| r.node().clone()).collect(),
            }))
        });

        let registered = match result {
            Ok(Some(registered)) => registered,
            Ok(None) => {
                debug!(rsc = %rsc, "No interrupted rollback to resume");
                return Ok(None);
            }
            Err(e) => {
                if handle.is_some() {
                    self.coordinator.discard(rsc, &e);
                }
                return Err(e);
            }
        };
        let handle = handle.ok_or_else(|| {
            Error::Implementation(format!("rollback of {} registered without a handle", rsc))
        })?;

        info!(
            rsc = %rsc,
            snapshot = %registered.snapshot,
            nodes = ?registered.expected,
            "Interrupted rollback resumed"
        );
        let resumed = ApiCallRc::single(
            ApiCallRcEntry::info(format!(
                "Rollback of resource '{}' to snapshot '{}' resumed",
                rsc, registered.snapshot
            ))
            .with_ref("RscDfn", rsc)
            .with_ref("Snapshot", &registered.snapshot),
        );
        Ok(Some(self.fan_out(rsc, registered, handle, resumed)))
    }

    /// Apply a satellite's rollback result
    ///
    /// Returns true when this report completed the rollback.
    pub async fn handle_rollback_result(&self, rsc: &ResourceName, node: &NodeName, success: bool) -> Result<bool> {
        self.coordinator.report_outcome(rsc, node, success).await
    }

    /// Push the marked resources to the satellites and chain the results
    ///
    /// The update starts right away, independent of the stream being polled.
    /// When it fails every expected node is reported as failed.
    fn fan_out(
        &self,
        rsc: &ResourceName,
        registered: Registered,
        handle: RollbackHandle,
        first: ApiCallRc,
    ) -> ApiCallStream {
        let first = stream::once(future::ready(Ok(first)));
        if registered.expected.is_empty() {
            return first.chain(handle.into_stream()).boxed();
        }

        let updater = Arc::clone(&self.updater);
        let coordinator = self.coordinator.clone();
        let rsc = rsc.clone();
        let Registered {
            expected, targets, ..
        } = registered;

        let update = tokio::spawn(async move {
            match updater.update_satellites(&rsc, &targets).await {
                Ok(rc) => rc,
                Err(e) => {
                    warn!(rsc = %rsc, error = %e, "Rollback propagation failed, treating every node as failed");
                    for node in &expected {
                        if let Err(report_err) = coordinator.report_outcome(&rsc, node, false).await {
                            debug!(rsc = %rsc, node = %node, error = %report_err, "Failure report not applied");
                        }
                    }
                    ApiCallRc::from(e)
                }
            }
        });
        let update = stream::once(async move {
            update
                .await
                .map_err(|e| Error::Internal(format!("satellite update task failed: {}", e)))
        });

        first.chain(update).chain(handle.into_stream()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::coordinator::RollbackPhase;
    use crate::domain::RcKind;
    use crate::stateflags::DrbdLayerFlags;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const ABC: [&str; 3] = ["alpha", "bravo", "charlie"];

    async fn next(stream: &mut ApiCallStream) -> ApiCallRc {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended")
            .expect("stream item failed")
    }

    /// Start a rollback and consume the start and fan-out items
    async fn start(ctrl: &Controller) -> ApiCallStream {
        let ctx = AccessContext::system();
        let mut stream = ctrl.rollback_snapshot(&ctx, &rsc1(), &snap1()).await.unwrap();
        let started = next(&mut stream).await;
        assert!(started.entries[0].message.contains("started"));
        let update = next(&mut stream).await;
        assert!(!update.has_errors());
        stream
    }

    #[tokio::test]
    async fn test_partial_failure_recovers_failed_node() {
        let (ctrl, _db, updater) = controller(0);
        cluster_with_snapshot(&ctrl);

        let mut stream = start(&ctrl).await;
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name).as_deref(), Some("snap1"));
        }
        assert_eq!(rollback_marker(&ctrl, "delta"), None);

        assert!(!ctrl.handle_rollback_result(&rsc1(), &node("alpha"), true).await.unwrap());
        assert!(!ctrl.handle_rollback_result(&rsc1(), &node("bravo"), true).await.unwrap());
        assert!(ctrl.handle_rollback_result(&rsc1(), &node("charlie"), false).await.unwrap());

        let outcome = next(&mut stream).await;
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome.entries[0].kind, RcKind::Info);
        assert_eq!(
            outcome.entries[0].message,
            "Resource 'rsc1' on 'charlie' recovering from 'alpha', 'bravo'"
        );
        assert!(stream.next().await.is_none());

        assert!(!drbd_flags_set(&ctrl, "charlie", &[DrbdLayerFlags::Initialized]));
        assert!(drbd_flags_set(&ctrl, "charlie", &[DrbdLayerFlags::ForceNewMetadata]));
        for name in ["alpha", "bravo"] {
            assert!(drbd_flags_set(&ctrl, name, &[DrbdLayerFlags::Initialized]));
            assert!(!drbd_flags_set(&ctrl, name, &[DrbdLayerFlags::ForceNewMetadata]));
        }
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }
        assert!(ctrl.list_inflight().is_empty());

        // initial fan-out plus the propagation of the recovery
        let calls = updater.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.len(), 4);
        assert_eq!(
            ctrl.metrics().rollbacks_total.with_label_values(&["recovering"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_all_failed_leaves_data_unchanged() {
        let (ctrl, _db, _updater) = controller(0);
        cluster_with_snapshot(&ctrl);

        let mut stream = start(&ctrl).await;
        for name in ABC {
            ctrl.handle_rollback_result(&rsc1(), &node(name), false).await.unwrap();
        }

        let outcome = next(&mut stream).await;
        assert_eq!(outcome.len(), 1);
        assert!(outcome.entries[0].message.contains("failed on all nodes"));
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
            assert!(drbd_flags_set(&ctrl, name, &[DrbdLayerFlags::Initialized]));
            assert!(!drbd_flags_set(&ctrl, name, &[DrbdLayerFlags::ForceNewMetadata]));
        }
    }

    #[tokio::test]
    async fn test_clean_rollback_ignores_diskless_reports() {
        let (ctrl, _db, _updater) = controller(0);
        cluster_with_snapshot(&ctrl);

        let mut stream = start(&ctrl).await;
        assert!(!ctrl.handle_rollback_result(&rsc1(), &node("delta"), true).await.unwrap());
        for name in ABC {
            ctrl.handle_rollback_result(&rsc1(), &node(name), true).await.unwrap();
        }

        let outcome = next(&mut stream).await;
        assert_eq!(
            outcome.entries[0].message,
            "Resource 'rsc1' rolled back to snapshot 'snap1' on 'alpha', 'bravo', 'charlie'"
        );
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }

        let late = ctrl.handle_rollback_result(&rsc1(), &node("alpha"), true).await;
        assert_matches!(late, Err(Error::NoOperationInFlight { .. }));
    }

    #[tokio::test]
    async fn test_second_rollback_rejected() {
        let (ctrl, _db, _updater) = controller(0);
        cluster_with_snapshot(&ctrl);
        let ctx = AccessContext::system();

        let _stream = start(&ctrl).await;
        ctrl.handle_rollback_result(&rsc1(), &node("alpha"), true).await.unwrap();

        let second = ctrl.rollback_snapshot(&ctx, &rsc1(), &snap1()).await;
        assert_matches!(second.err(), Some(Error::OperationInProgress { .. }));
        let inflight = ctrl.list_inflight();
        assert_eq!(inflight.len(), 1);
        assert_eq!(inflight[0].succeeded, vec!["alpha".to_string()]);
        assert_eq!(inflight[0].phase, RollbackPhase::Collecting);

        let delete = ctrl.delete_resource(&ctx, &rsc1(), &node("bravo"));
        assert_matches!(delete.err(), Some(Error::OperationInProgress { .. }));
        assert_eq!(rollback_marker(&ctrl, "bravo").as_deref(), Some("snap1"));
    }

    #[tokio::test]
    async fn test_disconnected_node_rejects_rollback() {
        let (ctrl, _db, updater) = controller(0);
        cluster_with_snapshot(&ctrl);
        ctrl.set_node_connected(&node("delta"), false).unwrap();

        let result = ctrl.rollback_snapshot(&AccessContext::system(), &rsc1(), &snap1()).await;
        assert_matches!(result.err(), Some(Error::InvalidRequest(msg)) if msg.contains("delta"));
        assert!(ctrl.list_inflight().is_empty());
        assert!(updater.calls().is_empty());
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }

        ctrl.set_node_connected(&node("delta"), true).unwrap();
        let result = ctrl.rollback_snapshot(&AccessContext::system(), &rsc1(), &snap1()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_resource_in_use_rejects_rollback() {
        let (ctrl, _db, updater) = controller(0);
        cluster_with_snapshot(&ctrl);
        ctrl.set_resource_in_use(&rsc1(), &node("bravo"), true).unwrap();

        let result = ctrl.rollback_snapshot(&AccessContext::system(), &rsc1(), &snap1()).await;
        assert_matches!(result.err(), Some(Error::InvalidRequest(msg)) if msg.contains("bravo"));
        assert!(ctrl.list_inflight().is_empty());
        assert!(updater.calls().is_empty());
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }

        let unknown = ctrl.set_resource_in_use(&rsc1(), &node("echo"), true);
        assert_matches!(unknown, Err(Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejected_requests_have_no_side_effects() {
        let (ctrl, _db, updater) = controller(0);
        cluster_with_snapshot(&ctrl);

        let unknown = SnapshotName::new("absent").unwrap();
        let result = ctrl.rollback_snapshot(&AccessContext::system(), &rsc1(), &unknown).await;
        assert_matches!(result.err(), Some(Error::ResourceNotFound { .. }));

        let user = AccessContext::new("mallory", "tenants");
        let result = ctrl.rollback_snapshot(&user, &rsc1(), &snap1()).await;
        assert_matches!(result.err(), Some(Error::AccessDenied { .. }));

        assert!(ctrl.list_inflight().is_empty());
        assert!(updater.calls().is_empty());
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }
    }

    #[tokio::test]
    async fn test_commit_failure_discards_registration() {
        let (ctrl, db, updater) = controller(0);
        cluster_with_snapshot(&ctrl);

        db.fail_next_commit();
        let result = ctrl.rollback_snapshot(&AccessContext::system(), &rsc1(), &snap1()).await;
        assert_matches!(result.err(), Some(Error::Database(_)));
        assert!(ctrl.list_inflight().is_empty());
        assert!(updater.calls().is_empty());
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }
        assert_eq!(ctrl.metrics().rollbacks_inflight.get(), 0);
    }

    #[tokio::test]
    async fn test_propagation_failure_fails_every_node() {
        let (ctrl, _db, updater) = controller(0);
        cluster_with_snapshot(&ctrl);
        updater.fail();

        let mut stream = ctrl
            .rollback_snapshot(&AccessContext::system(), &rsc1(), &snap1())
            .await
            .unwrap();
        next(&mut stream).await;
        let update = next(&mut stream).await;
        assert!(update.has_errors());

        let outcome = next(&mut stream).await;
        assert!(outcome.entries[0].message.contains("failed on all nodes"));
        for name in ABC {
            assert_eq!(rollback_marker(&ctrl, name), None);
        }
        assert!(ctrl.list_inflight().is_empty());
    }

    #[tokio::test]
    async fn test_silent_nodes_time_out() {
        let (ctrl, _db, _updater) = controller(1);
        cluster_with_snapshot(&ctrl);

        let mut stream = start(&ctrl).await;
        ctrl.handle_rollback_result(&rsc1(), &node("alpha"), true).await.unwrap();

        let outcome = next(&mut stream).await;
        assert!(outcome.entries[0].message.contains("recovering from 'alpha'"));
        assert!(!drbd_flags_set(&ctrl, "bravo", &[DrbdLayerFlags::Initialized]));
        assert!(!drbd_flags_set(&ctrl, "charlie", &[DrbdLayerFlags::Initialized]));
        assert!(ctrl.list_inflight().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_resumes_marked_rollback() {
        let (ctrl, _db, _updater) = controller(0);
        cluster_with_snapshot(&ctrl);

        // markers left behind by a rollback the controller no longer tracks
        let ctx = AccessContext::system();
        ctrl.scope
            .run("mark", rollback_locks, |guard, tx| {
                let dfn = guard.rsc_dfns()?.require(&rsc1())?;
                for name in ["alpha", "bravo"] {
                    dfn.resource(&node(name))
                        .unwrap()
                        .set_prop(&ctx, tx, PROP_ROLLBACK_TARGET, "snap1")?;
                }
                Ok(())
            })
            .unwrap();

        let mut stream = ctrl.resource_definition_connected(&rsc1()).await.unwrap().unwrap();
        assert!(next(&mut stream).await.entries[0].message.contains("resumed"));
        next(&mut stream).await;

        let inflight = ctrl.list_inflight();
        assert_eq!(inflight.len(), 1);
        assert_eq!(inflight[0].snapshot, "snap1");
        assert_eq!(inflight[0].waiting, vec!["alpha".to_string(), "bravo".to_string()]);

        assert!(ctrl.resource_definition_connected(&rsc1()).await.unwrap().is_none());

        ctrl.handle_rollback_result(&rsc1(), &node("alpha"), true).await.unwrap();
        ctrl.handle_rollback_result(&rsc1(), &node("bravo"), true).await.unwrap();
        let outcome = next(&mut stream).await;
        assert!(outcome.entries[0].message.contains("rolled back"));
        assert!(ctrl.resource_definition_connected(&rsc1()).await.unwrap().is_none());
    }
}
