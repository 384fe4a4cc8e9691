//! Transaction Manager
//!
//! Collects every object mutated within one unit of work and commits or
//! rolls them back together.

use super::{DbEngine, TransactionObject};
use crate::error::Result;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Unit of work over a set of transaction objects
pub struct TransactionMgr {
    id: u64,
    db: Arc<dyn DbEngine>,
    objects: Mutex<IndexMap<u64, Arc<dyn TransactionObject>>>,
}

impl TransactionMgr {
    pub fn new(db: Arc<dyn DbEngine>) -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            db,
            objects: Mutex::new(IndexMap::new()),
        }
    }

    /// Transaction id, also used as the database transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn register(&self, object_id: u64, object: Arc<dyn TransactionObject>) {
        self.objects.lock().entry(object_id).or_insert(object);
    }

    /// Whether any registered object holds uncommitted changes
    pub fn is_dirty(&self) -> bool {
        let objects: Vec<_> = self.objects.lock().values().cloned().collect();
        objects.iter().any(|o| o.is_dirty())
    }

    /// Number of objects registered with this manager
    pub fn registered(&self) -> usize {
        self.objects.lock().len()
    }

    /// Persist and commit every registered object
    ///
    /// On any persistence or database failure, the database transaction and
    /// every registered object are rolled back and the error is returned.
    pub fn commit(&self) -> Result<()> {
        let objects: Vec<_> = self.objects.lock().drain(..).map(|(_, o)| o).collect();

        let staged = objects
            .iter()
            .filter(|o| o.is_dirty())
            .try_for_each(|o| o.persist(self.db.as_ref(), self.id))
            .and_then(|_| self.db.commit(self.id));

        match staged {
            Ok(()) => {
                for object in &objects {
                    object.commit();
                }
                debug!(tx = self.id, objects = objects.len(), "Transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(tx = self.id, error = %e, "Commit failed, rolling back");
                self.db.rollback(self.id);
                for object in &objects {
                    object.rollback();
                }
                Err(e)
            }
        }
    }

    /// Discard the pending state of every registered object
    pub fn rollback(&self) {
        let objects: Vec<_> = self.objects.lock().drain(..).map(|(_, o)| o).collect();
        self.db.rollback(self.id);
        for object in &objects {
            object.rollback();
        }
        debug!(tx = self.id, objects = objects.len(), "Transaction rolled back");
    }
}

impl Drop for TransactionMgr {
    fn drop(&mut self) {
        if self.is_dirty() {
            error!(
                tx = self.id,
                "Transaction manager dropped with uncommitted changes, rolling back"
            );
            self.rollback();
        } else if !self.objects.get_mut().is_empty() {
            self.rollback();
        }
    }
}

impl std::fmt::Debug for TransactionMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMgr")
            .field("id", &self.id)
            .field("registered", &self.registered())
            .finish()
    }
}
