//! Transactional Object Model
//!
//! Every piece of mutable cluster state lives in a transaction object. A
//! mutation is visible to subsequent reads right away but only becomes durable
//! when the owning [`TransactionMgr`] commits; a rollback restores the last
//! committed value.
//!
//! Objects register themselves with the manager on their first mutation, so
//! the manager always knows the full set of objects it has to commit or roll
//! back together.

pub mod db;
pub mod manager;
pub mod map;
pub mod object;

pub use db::{DbEngine, DbKey, DbTxId, MemoryDb};
pub use manager::TransactionMgr;
pub use map::TransactionMap;
pub use object::TransactionSimpleObject;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Transaction Object Trait
// =============================================================================

/// Buffered state with an all-or-nothing commit
pub trait TransactionObject: Send + Sync {
    /// Whether uncommitted changes exist
    fn is_dirty(&self) -> bool;

    /// Stage the pending value into the database transaction `tx`
    fn persist(&self, db: &dyn DbEngine, tx: DbTxId) -> Result<()>;

    /// Promote pending to committed and clear dirty
    fn commit(&self);

    /// Discard pending and clear dirty
    fn rollback(&self);
}

// =============================================================================
// Registration
// =============================================================================

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique transaction object id
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Bind an object to `tx` before its first mutation
///
/// `owner` is the object's current transaction binding. Mutating an object
/// that is already dirty under another manager is a broken invariant.
pub(crate) fn claim(
    owner: &mut Option<u64>,
    tx: &TransactionMgr,
    object_id: u64,
    object: impl FnOnce() -> Arc<dyn TransactionObject>,
) -> Result<()> {
    match *owner {
        Some(id) if id == tx.id() => Ok(()),
        Some(id) => Err(Error::Implementation(format!(
            "object {} is dirty under transaction {} but was mutated in transaction {}",
            object_id,
            id,
            tx.id()
        ))),
        None => {
            *owner = Some(tx.id());
            tx.register(object_id, object());
            Ok(())
        }
    }
}
