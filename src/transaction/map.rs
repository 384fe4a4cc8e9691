//! Keyed transaction object
//!
//! The first mutation under a transaction copies the committed entries into a
//! pending map; commit swaps it in, rollback drops it. Persistent maps stage
//! one row per changed entry.

use super::{claim, next_object_id, DbEngine, DbKey, DbTxId, TransactionMgr, TransactionObject};
use crate::error::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::error;

/// Row projection of a map value
pub type RowFn<V> = fn(&V) -> Value;

/// Transactional ordered map
pub struct TransactionMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

struct MapInner<K, V> {
    id: u64,
    table: Option<MapTable<V>>,
    state: Mutex<MapState<K, V>>,
}

struct MapTable<V> {
    name: &'static str,
    prefix: String,
    row: RowFn<V>,
}

struct MapState<K, V> {
    current: BTreeMap<K, V>,
    pending: Option<BTreeMap<K, V>>,
    tx: Option<u64>,
}

impl<K, V> MapState<K, V> {
    fn view(&self) -> &BTreeMap<K, V> {
        self.pending.as_ref().unwrap_or(&self.current)
    }
}

impl<K, V> Clone for TransactionMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TransactionMap<K, V>
where
    K: Ord + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Map whose entries are never written to the database
    pub fn volatile() -> Self {
        Self::with_table(None)
    }

    /// Map persisted to `table`, one row per entry keyed `prefix + key`
    pub fn persistent(table: &'static str, prefix: impl Into<String>, row: RowFn<V>) -> Self {
        Self::with_table(Some(MapTable {
            name: table,
            prefix: prefix.into(),
            row,
        }))
    }

    fn with_table(table: Option<MapTable<V>>) -> Self {
        Self {
            inner: Arc::new(MapInner {
                id: next_object_id(),
                table,
                state: Mutex::new(MapState {
                    current: BTreeMap::new(),
                    pending: None,
                    tx: None,
                }),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.state.lock().view().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state.lock().view().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().view().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.state.lock().view().values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .state
            .lock()
            .view()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert under `tx`, returning the replaced value
    pub fn insert(&self, tx: &TransactionMgr, key: K, value: V) -> Result<Option<V>> {
        let mut state = self.begin(tx)?;
        Ok(state.pending_mut().insert(key, value))
    }

    /// Remove under `tx`, returning the removed value
    pub fn remove(&self, tx: &TransactionMgr, key: &K) -> Result<Option<V>> {
        let state = self.inner.state.lock();
        if !state.view().contains_key(key) {
            return Ok(None);
        }
        drop(state);
        let mut state = self.begin(tx)?;
        Ok(state.pending_mut().remove(key))
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    fn begin(&self, tx: &TransactionMgr) -> Result<parking_lot::MutexGuard<'_, MapState<K, V>>> {
        let mut state = self.inner.state.lock();
        let inner = Arc::clone(&self.inner);
        claim(&mut state.tx, tx, self.inner.id, move || {
            inner as Arc<dyn TransactionObject>
        })?;
        Ok(state)
    }
}

impl<K: Clone + Ord, V: Clone> MapState<K, V> {
    fn pending_mut(&mut self) -> &mut BTreeMap<K, V> {
        if self.pending.is_none() {
            self.pending = Some(self.current.clone());
        }
        self.pending.get_or_insert_with(BTreeMap::new)
    }
}

impl<K, V> TransactionObject for MapInner<K, V>
where
    K: Ord + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn is_dirty(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    fn persist(&self, db: &dyn DbEngine, tx: DbTxId) -> Result<()> {
        let Some(table) = &self.table else {
            return Ok(());
        };
        let state = self.state.lock();
        let Some(pending) = &state.pending else {
            return Ok(());
        };

        for (key, value) in pending {
            let row = (table.row)(value);
            let unchanged = state
                .current
                .get(key)
                .map(|old| (table.row)(old) == row)
                .unwrap_or(false);
            if !unchanged {
                let db_key = DbKey::new(table.name, format!("{}{}", table.prefix, key));
                db.write(tx, &db_key, Some(&row))?;
            }
        }
        for key in state.current.keys().filter(|k| !pending.contains_key(*k)) {
            let db_key = DbKey::new(table.name, format!("{}{}", table.prefix, key));
            db.write(tx, &db_key, None)?;
        }
        Ok(())
    }

    fn commit(&self) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.take() {
            state.current = pending;
        }
        state.tx = None;
    }

    fn rollback(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        state.tx = None;
    }
}

impl<K, V> Drop for MapInner<K, V> {
    fn drop(&mut self) {
        if self.state.get_mut().pending.is_some() {
            error!(
                object = self.id,
                "Transaction map dropped while dirty without a transaction manager"
            );
        }
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for TransactionMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_map().entries(state.view().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::MemoryDb;
    use serde_json::json;

    fn row(v: &u64) -> Value {
        json!({ "size": v })
    }

    #[test]
    fn test_insert_remove_commit() {
        let db = Arc::new(MemoryDb::new());
        let map: TransactionMap<String, u64> = TransactionMap::persistent("VOLUMES", "rsc/", row);

        let tx = TransactionMgr::new(db.clone());
        map.insert(&tx, "0".into(), 100).unwrap();
        map.insert(&tx, "1".into(), 200).unwrap();
        assert_eq!(map.len(), 2);
        tx.commit().unwrap();
        assert_eq!(db.rows("VOLUMES").len(), 2);
        assert_eq!(db.read(&DbKey::new("VOLUMES", "rsc/0")), Some(json!({"size": 100})));

        let tx = TransactionMgr::new(db.clone());
        map.remove(&tx, &"0".to_string()).unwrap();
        tx.commit().unwrap();
        assert_eq!(map.keys(), vec!["1".to_string()]);
        assert!(db.read(&DbKey::new("VOLUMES", "rsc/0")).is_none());
    }

    #[test]
    fn test_unchanged_entries_not_rewritten() {
        let db = Arc::new(MemoryDb::new());
        let map: TransactionMap<String, u64> = TransactionMap::persistent("VOLUMES", "", row);

        let tx = TransactionMgr::new(db.clone());
        map.insert(&tx, "a".into(), 1).unwrap();
        tx.commit().unwrap();
        let writes = db.write_count();

        let tx = TransactionMgr::new(db.clone());
        map.insert(&tx, "b".into(), 2).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.write_count(), writes + 1);
    }

    #[test]
    fn test_rollback_restores_entries() {
        let db = Arc::new(MemoryDb::new());
        let map: TransactionMap<String, u64> = TransactionMap::volatile();

        let tx = TransactionMgr::new(db.clone());
        map.insert(&tx, "a".into(), 1).unwrap();
        tx.commit().unwrap();

        let tx = TransactionMgr::new(db.clone());
        map.insert(&tx, "a".into(), 5).unwrap();
        map.remove(&tx, &"a".to_string()).unwrap();
        assert!(map.is_empty());
        tx.rollback();

        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert!(!map.is_dirty());
    }

    #[test]
    fn test_remove_missing_key_does_not_register() {
        let db = Arc::new(MemoryDb::new());
        let map: TransactionMap<String, u64> = TransactionMap::volatile();
        let tx = TransactionMgr::new(db);
        assert_eq!(map.remove(&tx, &"x".to_string()).unwrap(), None);
        assert_eq!(tx.registered(), 0);
    }
}
