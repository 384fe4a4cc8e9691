//! Transactional scopes
//!
//! Runs a piece of controller logic under a lock bundle and inside one
//! transaction: commit when the body succeeds, roll back when it fails.
//! Scopes are synchronous; nothing may await while a guard is held.

use crate::error::Result;
use crate::locks::{LockFacility, LockGuard, LockGuardBuilder};
use crate::metrics::ControllerMetrics;
use crate::transaction::{DbEngine, TransactionMgr};
use std::sync::Arc;
use tracing::{debug, info_span, warn};

#[derive(Clone)]
pub struct ScopeRunner {
    locks: LockFacility,
    db: Arc<dyn DbEngine>,
    metrics: ControllerMetrics,
}

impl ScopeRunner {
    pub fn new(locks: LockFacility, db: Arc<dyn DbEngine>, metrics: ControllerMetrics) -> Self {
        Self { locks, db, metrics }
    }

    pub fn locks(&self) -> &LockFacility {
        &self.locks
    }

    pub fn db(&self) -> &Arc<dyn DbEngine> {
        &self.db
    }

    /// Run `body` in a transactional scope named `operation`
    ///
    /// The transaction commits before the lock bundle is released.
    pub fn run<T>(
        &self,
        operation: &str,
        locks: impl FnOnce(LockGuardBuilder) -> LockGuardBuilder,
        body: impl FnOnce(&mut LockGuard, &TransactionMgr) -> Result<T>,
    ) -> Result<T> {
        let mut guard = locks(self.locks.builder()).build()?;
        let tx = TransactionMgr::new(Arc::clone(&self.db));
        let span = info_span!("scope", operation, tx = tx.id());
        let _entered = span.enter();

        match body(&mut guard, &tx) {
            Ok(value) => {
                if let Err(e) = tx.commit() {
                    warn!(error = %e, "Commit failed, transaction rolled back");
                    self.metrics.tx_rollbacks_total.inc();
                    return Err(e);
                }
                self.metrics.tx_commits_total.inc();
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Scope failed, rolling back");
                tx.rollback();
                self.metrics.tx_rollbacks_total.inc();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ScopeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRunner").field("locks", &self.locks).finish()
    }
}
