//! Snapshot rollback coordinator
//!
//! Registry of in-flight rollbacks keyed by resource. Node reports are
//! applied per record; the report that empties the waiting set removes the
//! record from the registry and runs the terminal actions: marker cleanup,
//! resynchronization of failed replicas, and propagation to the satellites.

use super::record::{InflightRollback, InflightSummary, RollbackOutcome};
use crate::controller::scope::ScopeRunner;
use crate::domain::{
    ApiCallRc, ApiCallRcEntry, NodeName, ResourceName, SatelliteUpdaterRef, SnapshotName,
    PROP_ROLLBACK_TARGET,
};
use crate::error::{Error, Result};
use crate::locks::{LockGuard, LockName};
use crate::metrics::ControllerMetrics;
use crate::security::AccessContext;
use crate::stateflags::DrbdLayerFlags;
use crate::transaction::TransactionMgr;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Asynchronous sequence of results of one request
pub type ApiCallStream = BoxStream<'static, Result<ApiCallRc>>;

// =============================================================================
// Result handle
// =============================================================================

/// Final result of a rollback, resolved once when the rollback completes
#[derive(Debug)]
pub struct RollbackHandle {
    rsc: ResourceName,
    rx: oneshot::Receiver<ApiCallRc>,
}

impl RollbackHandle {
    pub fn rsc(&self) -> &ResourceName {
        &self.rsc
    }

    pub fn into_stream(self) -> ApiCallStream {
        stream::once(self).boxed()
    }

    /// Block the calling thread until the rollback completes
    ///
    /// Must not be called from within an async context.
    pub fn blocking_wait(self) -> Result<ApiCallRc> {
        let rsc = self.rsc;
        self.rx.blocking_recv().map_err(|_| abandoned(&rsc))
    }
}

impl Future for RollbackHandle {
    type Output = Result<ApiCallRc>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| abandoned(&this.rsc)))
    }
}

fn abandoned(rsc: &ResourceName) -> Error {
    Error::Internal(format!("rollback of {} ended without a result", rsc))
}

// =============================================================================
// Coordinator
// =============================================================================

struct Inner {
    registry: DashMap<ResourceName, Arc<InflightRollback>>,
    scope: ScopeRunner,
    updater: SatelliteUpdaterRef,
    metrics: ControllerMetrics,
    node_timeout: Option<Duration>,
    ctx: AccessContext,
}

/// Tracks at most one rollback per resource
#[derive(Clone)]
pub struct RollbackCoordinator {
    inner: Arc<Inner>,
}

impl RollbackCoordinator {
    /// `node_timeout` bounds how long a rollback waits for node reports
    pub fn new(
        scope: ScopeRunner,
        updater: SatelliteUpdaterRef,
        metrics: ControllerMetrics,
        node_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: DashMap::new(),
                scope,
                updater,
                metrics,
                node_timeout,
                ctx: AccessContext::system(),
            }),
        }
    }

    /// Register a rollback of `rsc` expecting reports from `nodes`
    ///
    /// Fails with `OperationInProgress` while another rollback of `rsc` is
    /// registered. Without expected nodes the rollback completes at once.
    /// With a node timeout configured, registering requires a running tokio
    /// runtime to arm the timer; outside of one this fails with `Internal`
    /// and nothing is registered.
    pub fn initiate(
        &self,
        rsc: &ResourceName,
        snapshot: &SnapshotName,
        nodes: BTreeSet<NodeName>,
    ) -> Result<RollbackHandle> {
        let (tx, rx) = oneshot::channel();
        let handle = RollbackHandle {
            rsc: rsc.clone(),
            rx,
        };

        let runtime;
        let record = match self.inner.registry.entry(rsc.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::OperationInProgress {
                    operation: "snapshot rollback".to_string(),
                    resource: rsc.to_string(),
                })
            }
            Entry::Vacant(_) if nodes.is_empty() => {
                debug!(rsc = %rsc, "Rollback without diskful nodes completes immediately");
                let rc = ApiCallRc::single(
                    ApiCallRcEntry::info(format!(
                        "Resource '{}' has no diskful nodes, nothing to roll back",
                        rsc
                    ))
                    .with_ref("RscDfn", rsc),
                );
                let _ = tx.send(rc);
                return Ok(handle);
            }
            Entry::Vacant(vacant) => {
                runtime = self.timer_runtime(rsc)?;
                let record = Arc::new(InflightRollback::new(
                    rsc.clone(),
                    snapshot.clone(),
                    nodes,
                    tx,
                ));
                vacant.insert(Arc::clone(&record));
                record
            }
        };

        self.inner.metrics.rollbacks_inflight.inc();
        record.start_collecting();
        info!(rsc = %rsc, snapshot = %snapshot, nodes = ?record.waiting(), "Rollback registered");
        if let Some((runtime, timeout)) = runtime {
            self.arm_timeout(&record, runtime, timeout);
        }
        Ok(handle)
    }

    /// Apply the report of `node` for the rollback of `rsc`
    ///
    /// Returns true when this report completed the rollback; the terminal
    /// actions have run by the time it returns.
    pub async fn report_outcome(&self, rsc: &ResourceName, node: &NodeName, success: bool) -> Result<bool> {
        let record = self
            .get(rsc)
            .ok_or_else(|| Error::NoOperationInFlight {
                resource: rsc.to_string(),
            })?;

        debug!(rsc = %rsc, node = %node, success, "Rollback report received");
        match record.report(node, success, || self.unregister(&record)) {
            Some(outcome) => {
                self.finish(record, outcome).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the record of `rsc` without running terminal actions
    pub(crate) fn discard(&self, rsc: &ResourceName, reason: &Error) {
        if let Some((_, record)) = self.inner.registry.remove(rsc) {
            self.inner.metrics.rollbacks_inflight.dec();
            warn!(rsc = %rsc, error = %reason, "Rollback discarded");
            record.complete(ApiCallRc::single(ApiCallRcEntry::from(reason)));
        }
    }

    pub fn get(&self, rsc: &ResourceName) -> Option<Arc<InflightRollback>> {
        self.inner.registry.get(rsc).map(|r| Arc::clone(r.value()))
    }

    pub fn is_inflight(&self, rsc: &ResourceName) -> bool {
        self.inner.registry.contains_key(rsc)
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Summaries of every registered rollback
    pub fn inflight(&self) -> Vec<InflightSummary> {
        // Collect first: record locks are taken before registry locks elsewhere.
        let records: Vec<Arc<InflightRollback>> = self
            .inner
            .registry
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        let mut summaries: Vec<InflightSummary> = records.iter().map(|r| r.summary()).collect();
        summaries.sort_by(|a, b| a.rsc.cmp(&b.rsc));
        summaries
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn unregister(&self, record: &Arc<InflightRollback>) {
        let removed = self
            .inner
            .registry
            .remove_if(record.rsc(), |_, r| Arc::ptr_eq(r, record));
        if removed.is_some() {
            self.inner.metrics.rollbacks_inflight.dec();
        }
    }

    /// Runtime to arm the node timeout on, if one is configured
    fn timer_runtime(&self, rsc: &ResourceName) -> Result<Option<(Handle, Duration)>> {
        let Some(timeout) = self.inner.node_timeout else {
            return Ok(None);
        };
        let runtime = Handle::try_current().map_err(|e| {
            Error::Internal(format!("cannot arm the rollback timeout of {}: {}", rsc, e))
        })?;
        Ok(Some((runtime, timeout)))
    }

    fn arm_timeout(&self, record: &Arc<InflightRollback>, runtime: Handle, timeout: Duration) {
        let coordinator = self.clone();
        let record = Arc::clone(record);
        let cancel = record.cancel_token().clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(outcome) = record.expire(|| coordinator.unregister(&record)) {
                        coordinator.finish(Arc::clone(&record), outcome).await;
                    }
                }
            }
        });
    }

    async fn finish(&self, record: Arc<InflightRollback>, outcome: RollbackOutcome) {
        let rc = match self.conclude(&record, &outcome).await {
            Ok(rc) => rc,
            Err(e) => {
                error!(rsc = %record.rsc(), error = %e, "Rollback completion failed");
                ApiCallRc::from(e)
            }
        };
        self.inner
            .metrics
            .rollbacks_total
            .with_label_values(&[outcome.label()])
            .inc();
        info!(rsc = %record.rsc(), outcome = outcome.label(), "Rollback finished");
        record.complete(rc);
    }

    async fn conclude(&self, record: &InflightRollback, outcome: &RollbackOutcome) -> Result<ApiCallRc> {
        let rsc = record.rsc();
        match outcome {
            RollbackOutcome::Clean { succeeded } => {
                self.in_scope("Finish rollback", |guard, tx| {
                    self.remove_markers(guard, tx, rsc, Some(succeeded))
                })?;
                Ok(ApiCallRc::single(
                    ApiCallRcEntry::info(format!(
                        "Resource '{}' rolled back to snapshot '{}' on {}",
                        rsc,
                        record.snapshot(),
                        join(succeeded)
                    ))
                    .with_ref("RscDfn", rsc)
                    .with_ref("Snapshot", record.snapshot()),
                ))
            }
            RollbackOutcome::AllFailed { .. } => {
                self.in_scope("Abort rollback", |guard, tx| {
                    self.remove_markers(guard, tx, rsc, None)
                })?;
                Ok(ApiCallRc::single(
                    ApiCallRcEntry::info(format!(
                        "Rollback of resource '{}' failed on all nodes, data unchanged",
                        rsc
                    ))
                    .with_ref("RscDfn", rsc)
                    .with_ref("Snapshot", record.snapshot()),
                ))
            }
            RollbackOutcome::Partial { succeeded, failed } => {
                let resync = self.in_scope("Recover rollback", |guard, tx| {
                    self.remove_markers(guard, tx, rsc, Some(succeeded))?;
                    self.force_resync(guard, tx, rsc, failed)
                })?;

                let mut rc = ApiCallRc::new();
                if !resync.recovering.is_empty() {
                    rc.push(
                        ApiCallRcEntry::info(format!(
                            "Resource '{}' on {} recovering from {}",
                            rsc,
                            join(&resync.recovering),
                            join(succeeded)
                        ))
                        .with_ref("RscDfn", rsc),
                    );
                }
                if !resync.vanished.is_empty() {
                    rc.push(
                        ApiCallRcEntry::warning(format!(
                            "Rollback of resource '{}' failed on {}, which no longer hold the resource",
                            rsc,
                            join(&resync.vanished)
                        ))
                        .with_ref("RscDfn", rsc),
                    );
                }
                for node in &resync.stuck {
                    rc.push(
                        ApiCallRcEntry::warning(format!(
                            "Rollback of resource '{}' failed on '{}'",
                            rsc, node
                        ))
                        .with_cause("The resource has no resynchronizable layer")
                        .with_correction("Recreate the resource on this node")
                        .with_ref("Node", node),
                    );
                }

                let nodes: Vec<NodeName> = succeeded.union(failed).cloned().collect();
                match self.inner.updater.update_satellites(rsc, &nodes).await {
                    Ok(update) if update.has_errors() => rc.extend(update),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(rsc = %rsc, error = %e, "Propagation after rollback recovery failed");
                        rc.push(ApiCallRcEntry::from(&e));
                    }
                }
                Ok(rc)
            }
        }
    }

    fn in_scope<T>(
        &self,
        operation: &str,
        body: impl FnOnce(&mut LockGuard, &TransactionMgr) -> Result<T>,
    ) -> Result<T> {
        self.inner.scope.run(
            operation,
            |b| b.read(&[LockName::NodesMap]).write(&[LockName::RscDfnMap]),
            body,
        )
    }

    /// Remove the rollback marker from the resources on `nodes`, or from all
    fn remove_markers(
        &self,
        guard: &mut LockGuard,
        tx: &TransactionMgr,
        rsc: &ResourceName,
        nodes: Option<&BTreeSet<NodeName>>,
    ) -> Result<()> {
        let dfn = guard.rsc_dfns()?.require(rsc)?;
        for resource in dfn.resources() {
            if nodes.map_or(true, |n| n.contains(resource.node())) {
                resource.remove_prop(&self.inner.ctx, tx, PROP_ROLLBACK_TARGET)?;
            }
        }
        Ok(())
    }

    /// Force failed replicas to resynchronize from a peer
    ///
    /// Returns the nodes set to resynchronize and the nodes that cannot.
    fn force_resync(
        &self,
        guard: &mut LockGuard,
        tx: &TransactionMgr,
        rsc: &ResourceName,
        failed: &BTreeSet<NodeName>,
    ) -> Result<Resync> {
        let ctx = &self.inner.ctx;
        let dfn = guard.rsc_dfns()?.require(rsc)?;
        let mut resync = Resync::default();

        for node in failed {
            let Some(resource) = dfn.resource(node) else {
                warn!(rsc = %rsc, node = %node, "Failed node no longer has the resource");
                resync.vanished.insert(node.clone());
                continue;
            };
            let drbd: Vec<_> = resource
                .drbd_layers()
                .into_iter()
                .filter(|l| l.drbd_flags().is_some())
                .collect();
            if drbd.is_empty() {
                resync.stuck.insert(node.clone());
                continue;
            }
            for layer in &drbd {
                if let Some(flags) = layer.drbd_flags() {
                    flags.disable_flags(ctx, tx, &[DrbdLayerFlags::Initialized])?;
                    flags.enable_flags(ctx, tx, &[DrbdLayerFlags::ForceNewMetadata])?;
                }
            }
            resource.remove_prop(ctx, tx, PROP_ROLLBACK_TARGET)?;
            info!(rsc = %rsc, node = %node, "Replica forced to resynchronize");
            resync.recovering.insert(node.clone());
        }
        Ok(resync)
    }
}

/// Failed nodes sorted by how they were recovered
#[derive(Debug, Default)]
struct Resync {
    /// Forced to resynchronize from the succeeded nodes
    recovering: BTreeSet<NodeName>,
    /// Without a resynchronizable layer
    stuck: BTreeSet<NodeName>,
    /// No longer holding the resource
    vanished: BTreeSet<NodeName>,
}

impl std::fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("inflight", &self.inner.registry.len())
            .field("node_timeout", &self.inner.node_timeout)
            .finish()
    }
}

fn join(nodes: &BTreeSet<NodeName>) -> String {
    nodes
        .iter()
        .map(|n| format!("'{}'", n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RollbackPhase;
    use crate::domain::{LoggingSatelliteUpdater, RcKind, ResourceDefinition};
    use crate::locks::LockFacility;
    use crate::transaction::MemoryDb;
    use assert_matches::assert_matches;

    fn coordinator(node_timeout: Option<Duration>) -> RollbackCoordinator {
        let metrics = ControllerMetrics::new().unwrap();
        let scope = ScopeRunner::new(
            LockFacility::new(Duration::from_secs(1)),
            Arc::new(MemoryDb::new()),
            metrics.clone(),
        );
        let coordinator = RollbackCoordinator::new(
            scope,
            Arc::new(LoggingSatelliteUpdater),
            metrics,
            node_timeout,
        );
        coordinator
            .inner
            .scope
            .run("define", |b| b.write(&[LockName::RscDfnMap]), |guard, tx| {
                let name = rsc();
                let dfn = ResourceDefinition::new(&AccessContext::system(), name.clone());
                guard.rsc_dfns_mut()?.insert(tx, name, Arc::new(dfn))
            })
            .unwrap();
        coordinator
    }

    fn rsc() -> ResourceName {
        ResourceName::new("rsc1").unwrap()
    }

    fn snap() -> SnapshotName {
        SnapshotName::new("snap1").unwrap()
    }

    fn nodes(list: &[&str]) -> BTreeSet<NodeName> {
        list.iter().map(|n| node(n)).collect()
    }

    /// `node("a")` is node `node-a`
    fn node(name: &str) -> NodeName {
        NodeName::new(format!("node-{}", name)).unwrap()
    }

    #[tokio::test]
    async fn test_second_initiate_conflicts() {
        let coordinator = coordinator(None);
        let _handle = coordinator.initiate(&rsc(), &snap(), nodes(&["a", "b"])).unwrap();
        coordinator.report_outcome(&rsc(), &node("a"), true).await.unwrap();

        let second = coordinator.initiate(&rsc(), &snap(), nodes(&["c"]));
        assert_matches!(second, Err(Error::OperationInProgress { .. }));

        let record = coordinator.get(&rsc()).unwrap();
        assert_eq!(record.waiting(), nodes(&["b"]));
        assert_eq!(record.succeeded(), nodes(&["a"]));
        assert_eq!(record.phase(), RollbackPhase::Collecting);
    }

    #[tokio::test]
    async fn test_handle_pending_until_decided() {
        let coordinator = coordinator(None);
        let handle = coordinator.initiate(&rsc(), &snap(), nodes(&["a", "b"])).unwrap();
        let mut handle = tokio_test::task::spawn(handle);
        tokio_test::assert_pending!(handle.poll());

        coordinator.report_outcome(&rsc(), &node("a"), true).await.unwrap();
        tokio_test::assert_pending!(handle.poll());

        coordinator.report_outcome(&rsc(), &node("b"), false).await.unwrap();
        assert!(handle.is_woken());
        let rc = tokio_test::assert_ready_ok!(handle.poll());
        assert!(!rc.has_errors());
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_report_without_rollback() {
        let coordinator = coordinator(None);
        let result = coordinator.report_outcome(&rsc(), &node("a"), true).await;
        assert_matches!(result, Err(Error::NoOperationInFlight { .. }));
    }

    #[tokio::test]
    async fn test_no_nodes_completes_immediately() {
        let coordinator = coordinator(None);
        let handle = coordinator.initiate(&rsc(), &snap(), BTreeSet::new()).unwrap();
        assert!(!coordinator.is_inflight(&rsc()));

        let rc = handle.await.unwrap();
        assert_eq!(rc.entries[0].kind, RcKind::Info);
    }

    #[tokio::test]
    async fn test_registry_cleared_when_decided() {
        let coordinator = coordinator(None);
        let handle = coordinator.initiate(&rsc(), &snap(), nodes(&["a", "b"])).unwrap();
        assert_eq!(coordinator.inner.metrics.rollbacks_inflight.get(), 1);

        assert!(!coordinator.report_outcome(&rsc(), &node("a"), true).await.unwrap());
        assert!(coordinator.report_outcome(&rsc(), &node("b"), true).await.unwrap());
        assert!(coordinator.is_empty());
        assert_eq!(coordinator.inner.metrics.rollbacks_inflight.get(), 0);

        let rc = handle.await.unwrap();
        assert!(!rc.has_errors());
        assert_eq!(rc.len(), 1);

        // a new rollback may start right away
        let again = coordinator.initiate(&rsc(), &snap(), nodes(&["a"]));
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_treats_silent_nodes_as_failed() {
        let coordinator = coordinator(Some(Duration::from_millis(50)));
        let handle = coordinator.initiate(&rsc(), &snap(), nodes(&["a", "b"])).unwrap();

        let rc = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rc.entries[0].message.contains("failed on all nodes"));
        assert!(coordinator.is_empty());
        assert_eq!(
            coordinator
                .inner
                .metrics
                .rollbacks_total
                .with_label_values(&["aborted"])
                .get(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_complete_once() {
        let coordinator = coordinator(None);
        let names: Vec<String> = (0..16).map(|i| format!("n{}", i)).collect();
        let expected: BTreeSet<NodeName> = names.iter().map(|n| node(n)).collect();
        let handle = coordinator.initiate(&rsc(), &snap(), expected).unwrap();

        let mut tasks = Vec::new();
        for name in names {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                let node = node(&name);
                let first = coordinator.report_outcome(&rsc(), &node, true).await;
                let second = coordinator.report_outcome(&rsc(), &node, false).await;
                matches!(first, Ok(true)) as usize + matches!(second, Ok(true)) as usize
            }));
        }

        let mut completions = 0;
        for task in tasks {
            completions += task.await.unwrap();
        }
        assert_eq!(completions, 1);

        let rc = handle.await.unwrap();
        assert!(rc.entries[0].message.contains("rolled back"));
    }

    #[test]
    fn test_timeout_requires_runtime() {
        let coordinator = coordinator(Some(Duration::from_secs(1)));
        let result = coordinator.initiate(&rsc(), &snap(), nodes(&["a"]));
        assert_matches!(result, Err(Error::Internal(_)));
        assert!(coordinator.is_empty());
        assert_eq!(coordinator.inner.metrics.rollbacks_inflight.get(), 0);

        let handle = coordinator.initiate(&rsc(), &snap(), BTreeSet::new()).unwrap();
        assert!(handle.blocking_wait().is_ok());
    }

    #[tokio::test]
    async fn test_partial_names_nodes_without_resource() {
        let coordinator = coordinator(None);
        let handle = coordinator.initiate(&rsc(), &snap(), nodes(&["a", "b", "c"])).unwrap();
        coordinator.report_outcome(&rsc(), &node("a"), true).await.unwrap();
        coordinator.report_outcome(&rsc(), &node("b"), false).await.unwrap();
        coordinator.report_outcome(&rsc(), &node("c"), false).await.unwrap();

        let rc = handle.await.unwrap();
        assert_eq!(rc.len(), 1);
        assert_eq!(rc.entries[0].kind, RcKind::Warning);
        assert_eq!(
            rc.entries[0].message,
            "Rollback of resource 'rsc1' failed on 'node-b', 'node-c', which no longer hold the resource"
        );
    }

    #[test]
    fn test_blocking_wait() {
        let coordinator = coordinator(None);
        let handle = coordinator.initiate(&rsc(), &snap(), BTreeSet::new()).unwrap();
        assert!(handle.blocking_wait().is_ok());
    }

    #[tokio::test]
    async fn test_discard_resolves_handle() {
        let coordinator = coordinator(None);
        let handle = coordinator.initiate(&rsc(), &snap(), nodes(&["a"])).unwrap();
        coordinator.discard(&rsc(), &Error::Database("commit failed".to_string()));

        let rc = handle.await.unwrap();
        assert!(rc.has_errors());
        assert!(coordinator.is_empty());
    }
}
