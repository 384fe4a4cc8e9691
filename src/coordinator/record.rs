//! In-flight rollback records
//!
//! One record per resource tracks which nodes still owe a report and how the
//! others fared. All outcome bookkeeping happens under the record's own lock.

use crate::domain::{ApiCallRc, NodeName, ResourceName, SnapshotName};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a rollback record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPhase {
    /// Created, result handle not yet handed out
    Registered,
    /// Waiting for node reports
    Collecting,
    /// All reports in, some nodes failed
    Recovering,
    /// All reports in, every node succeeded
    FinishedClean,
    /// All reports in, every node failed
    Aborted,
    /// Result delivered
    Closed,
}

impl RollbackPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RollbackPhase::Registered | RollbackPhase::Collecting)
    }
}

/// How a rollback ended, decided when the last expected node reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Clean {
        succeeded: BTreeSet<NodeName>,
    },
    AllFailed {
        failed: BTreeSet<NodeName>,
    },
    Partial {
        succeeded: BTreeSet<NodeName>,
        failed: BTreeSet<NodeName>,
    },
}

impl RollbackOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RollbackOutcome::Clean { .. } => "clean",
            RollbackOutcome::AllFailed { .. } => "aborted",
            RollbackOutcome::Partial { .. } => "recovering",
        }
    }

    fn phase(&self) -> RollbackPhase {
        match self {
            RollbackOutcome::Clean { .. } => RollbackPhase::FinishedClean,
            RollbackOutcome::AllFailed { .. } => RollbackPhase::Aborted,
            RollbackOutcome::Partial { .. } => RollbackPhase::Recovering,
        }
    }
}

struct RecordState {
    phase: RollbackPhase,
    waiting: BTreeSet<NodeName>,
    succeeded: BTreeSet<NodeName>,
    failed: BTreeSet<NodeName>,
    completion: Option<oneshot::Sender<ApiCallRc>>,
}

impl RecordState {
    fn decide(&mut self) -> Option<RollbackOutcome> {
        if !self.waiting.is_empty() || self.phase.is_terminal() {
            return None;
        }
        let outcome = if self.failed.is_empty() {
            RollbackOutcome::Clean {
                succeeded: self.succeeded.clone(),
            }
        } else if self.succeeded.is_empty() {
            RollbackOutcome::AllFailed {
                failed: self.failed.clone(),
            }
        } else {
            RollbackOutcome::Partial {
                succeeded: self.succeeded.clone(),
                failed: self.failed.clone(),
            }
        };
        self.phase = outcome.phase();
        Some(outcome)
    }
}

/// Bookkeeping of one rollback waiting for node reports
pub struct InflightRollback {
    rsc: ResourceName,
    snapshot: SnapshotName,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<RecordState>,
}

impl InflightRollback {
    pub(crate) fn new(
        rsc: ResourceName,
        snapshot: SnapshotName,
        nodes: BTreeSet<NodeName>,
        completion: oneshot::Sender<ApiCallRc>,
    ) -> Self {
        Self {
            rsc,
            snapshot,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(RecordState {
                phase: RollbackPhase::Registered,
                waiting: nodes,
                succeeded: BTreeSet::new(),
                failed: BTreeSet::new(),
                completion: Some(completion),
            }),
        }
    }

    pub fn rsc(&self) -> &ResourceName {
        &self.rsc
    }

    pub fn snapshot(&self) -> &SnapshotName {
        &self.snapshot
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> RollbackPhase {
        self.state.lock().phase
    }

    pub fn waiting(&self) -> BTreeSet<NodeName> {
        self.state.lock().waiting.clone()
    }

    pub fn succeeded(&self) -> BTreeSet<NodeName> {
        self.state.lock().succeeded.clone()
    }

    pub fn failed(&self) -> BTreeSet<NodeName> {
        self.state.lock().failed.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The result handle has been handed out
    pub(crate) fn start_collecting(&self) {
        let mut state = self.state.lock();
        if state.phase == RollbackPhase::Registered {
            state.phase = RollbackPhase::Collecting;
        }
    }

    /// Apply one node report
    ///
    /// Returns the outcome exactly once, to the caller whose report emptied
    /// the waiting set. `on_decided` runs while the record is still locked.
    pub(crate) fn report(
        &self,
        node: &NodeName,
        success: bool,
        on_decided: impl FnOnce(),
    ) -> Option<RollbackOutcome> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            debug!(rsc = %self.rsc, node = %node, success, "Report after completion ignored");
            return None;
        }

        if state.waiting.remove(node) {
            if success {
                state.succeeded.insert(node.clone());
            } else {
                state.failed.insert(node.clone());
            }
        } else if state.succeeded.contains(node) {
            if !success {
                warn!(rsc = %self.rsc, node = %node, "Node reported failure after success, keeping success");
            }
            return None;
        } else if state.failed.contains(node) {
            if success {
                debug!(rsc = %self.rsc, node = %node, "Node recovered after reporting failure");
                state.failed.remove(node);
                state.succeeded.insert(node.clone());
            }
            return None;
        } else {
            warn!(rsc = %self.rsc, node = %node, "Report from node not part of the rollback ignored");
            return None;
        }

        let outcome = state.decide();
        if outcome.is_some() {
            on_decided();
        }
        outcome
    }

    /// Treat every node still waiting as failed
    pub(crate) fn expire(&self, on_decided: impl FnOnce()) -> Option<RollbackOutcome> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return None;
        }
        let waiting = std::mem::take(&mut state.waiting);
        warn!(rsc = %self.rsc, nodes = ?waiting, "Rollback timed out waiting for nodes");
        state.failed.extend(waiting);

        let outcome = state.decide();
        if outcome.is_some() {
            on_decided();
        }
        outcome
    }

    /// Resolve the result handle; later calls do nothing
    pub(crate) fn complete(&self, rc: ApiCallRc) {
        let sender = {
            let mut state = self.state.lock();
            state.phase = RollbackPhase::Closed;
            state.completion.take()
        };
        self.cancel.cancel();
        if let Some(sender) = sender {
            if sender.send(rc).is_err() {
                debug!(rsc = %self.rsc, "Rollback result dropped by caller");
            }
        }
    }

    pub fn summary(&self) -> InflightSummary {
        let state = self.state.lock();
        InflightSummary {
            rsc: self.rsc.to_string(),
            snapshot: self.snapshot.to_string(),
            phase: state.phase,
            created_at: self.created_at,
            waiting: state.waiting.iter().map(|n| n.to_string()).collect(),
            succeeded: state.succeeded.iter().map(|n| n.to_string()).collect(),
            failed: state.failed.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl std::fmt::Debug for InflightRollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRollback")
            .field("rsc", &self.rsc)
            .field("snapshot", &self.snapshot)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Serializable view of an in-flight rollback
#[derive(Debug, Clone, Serialize)]
pub struct InflightSummary {
    pub rsc: String,
    pub snapshot: String,
    pub phase: RollbackPhase,
    pub created_at: DateTime<Utc>,
    pub waiting: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}
