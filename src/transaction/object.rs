//! Single-value transaction object

use super::{claim, next_object_id, DbEngine, DbKey, DbTxId, TransactionMgr, TransactionObject};
use crate::error::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Transactional holder of one value
///
/// Clones share the same underlying state.
pub struct TransactionSimpleObject<T> {
    inner: Arc<SimpleInner<T>>,
}

struct SimpleInner<T> {
    id: u64,
    key: Option<DbKey>,
    state: Mutex<SimpleState<T>>,
}

struct SimpleState<T> {
    current: T,
    pending: Option<T>,
    delete_row: bool,
    tx: Option<u64>,
}

impl<T> Clone for TransactionSimpleObject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TransactionSimpleObject<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    /// Value that is never written to the database
    pub fn volatile(value: T) -> Self {
        Self::with_key(None, value)
    }

    /// Value persisted as the row at `key`
    pub fn persistent(key: DbKey, value: T) -> Self {
        Self::with_key(Some(key), value)
    }

    fn with_key(key: Option<DbKey>, value: T) -> Self {
        Self {
            inner: Arc::new(SimpleInner {
                id: next_object_id(),
                key,
                state: Mutex::new(SimpleState {
                    current: value,
                    pending: None,
                    delete_row: false,
                    tx: None,
                }),
            }),
        }
    }

    /// Current value, including uncommitted changes
    pub fn get(&self) -> T {
        let state = self.inner.state.lock();
        state.pending.as_ref().unwrap_or(&state.current).clone()
    }

    /// Last committed value
    pub fn committed(&self) -> T {
        self.inner.state.lock().current.clone()
    }

    /// Set a new value under `tx`, returning the previous one
    pub fn set(&self, tx: &TransactionMgr, value: T) -> Result<T> {
        let mut state = self.inner.state.lock();
        let previous = state.pending.as_ref().unwrap_or(&state.current).clone();
        if previous == value {
            return Ok(previous);
        }
        let inner = Arc::clone(&self.inner);
        claim(&mut state.tx, tx, self.inner.id, move || {
            inner as Arc<dyn TransactionObject>
        })?;
        if value == state.current {
            state.pending = None;
        } else {
            state.pending = Some(value);
        }
        Ok(previous)
    }

    /// Apply `f` to a copy of the current value and store the result under `tx`
    pub fn update(&self, tx: &TransactionMgr, f: impl FnOnce(&mut T)) -> Result<T> {
        let mut value = self.get();
        f(&mut value);
        self.set(tx, value.clone())?;
        Ok(value)
    }

    /// Delete the persisted row under `tx`; the in-memory value is kept
    pub fn remove_row(&self, tx: &TransactionMgr) -> Result<()> {
        if self.inner.key.is_none() {
            return Ok(());
        }
        let mut state = self.inner.state.lock();
        let inner = Arc::clone(&self.inner);
        claim(&mut state.tx, tx, self.inner.id, move || {
            inner as Arc<dyn TransactionObject>
        })?;
        state.delete_row = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    /// Row address this value persists to, if any
    pub fn key(&self) -> Option<&DbKey> {
        self.inner.key.as_ref()
    }
}

impl<T> TransactionObject for SimpleInner<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_some() || state.delete_row
    }

    fn persist(&self, db: &dyn DbEngine, tx: DbTxId) -> Result<()> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let state = self.state.lock();
        if state.delete_row {
            db.write(tx, key, None)?;
        } else if let Some(pending) = &state.pending {
            let row = serde_json::to_value(pending)?;
            db.write(tx, key, Some(&row))?;
        }
        Ok(())
    }

    fn commit(&self) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.take() {
            state.current = pending;
        }
        state.delete_row = false;
        state.tx = None;
    }

    fn rollback(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        state.delete_row = false;
        state.tx = None;
    }
}

impl<T> Drop for SimpleInner<T> {
    fn drop(&mut self) {
        if self.state.get_mut().pending.is_some() {
            error!(
                object = self.id,
                "Transaction object dropped while dirty without a transaction manager"
            );
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for TransactionSimpleObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransactionSimpleObject")
            .field("current", &state.current)
            .field("pending", &state.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::MemoryDb;

    #[test]
    fn test_mutation_visible_before_commit() {
        let db = Arc::new(MemoryDb::new());
        let obj = TransactionSimpleObject::volatile(String::from("a"));

        let tx = TransactionMgr::new(db);
        let previous = obj.set(&tx, "b".to_string()).unwrap();
        assert_eq!(previous, "a");
        assert_eq!(obj.get(), "b");
        assert_eq!(obj.committed(), "a");
        assert!(obj.is_dirty());

        tx.rollback();
        assert_eq!(obj.get(), "a");
        assert!(!obj.is_dirty());
    }

    #[test]
    fn test_setting_back_to_committed_clears_dirty() {
        let db = Arc::new(MemoryDb::new());
        let obj = TransactionSimpleObject::volatile(1u32);

        let tx = TransactionMgr::new(db);
        obj.set(&tx, 2).unwrap();
        obj.set(&tx, 1).unwrap();
        assert!(!obj.is_dirty());
        assert!(!tx.is_dirty());
    }

    #[test]
    fn test_unchanged_value_does_not_register() {
        let db = Arc::new(MemoryDb::new());
        let obj = TransactionSimpleObject::volatile(1u32);

        let tx = TransactionMgr::new(db);
        obj.set(&tx, 1).unwrap();
        assert_eq!(tx.registered(), 0);
    }

    #[test]
    fn test_remove_row() {
        let db = Arc::new(MemoryDb::new());
        let key = DbKey::new("LAYER_SUSPEND_IO", "7");
        let obj = TransactionSimpleObject::persistent(key.clone(), false);

        let tx = TransactionMgr::new(db.clone());
        obj.set(&tx, true).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.read(&key), Some(serde_json::json!(true)));

        let tx = TransactionMgr::new(db.clone());
        obj.remove_row(&tx).unwrap();
        assert!(obj.is_dirty());
        tx.commit().unwrap();
        assert!(db.read(&key).is_none());
        assert!(!obj.is_dirty());
    }
}
