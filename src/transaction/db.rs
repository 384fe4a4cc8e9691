//! Persistence Driver
//!
//! The database engine receives row writes staged under a database
//! transaction id and makes them durable atomically on commit.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Database transaction id (the id of the owning transaction manager)
pub type DbTxId = u64;

/// Row address: table plus primary key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbKey {
    pub table: &'static str,
    pub pk: String,
}

impl DbKey {
    pub fn new(table: &'static str, pk: impl Into<String>) -> Self {
        Self {
            table,
            pk: pk.into(),
        }
    }
}

impl std::fmt::Display for DbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.table, self.pk)
    }
}

// =============================================================================
// Engine Trait
// =============================================================================

/// Storage backend for transaction objects
pub trait DbEngine: Send + Sync {
    /// Stage a row write (`Some`) or delete (`None`). Idempotent per key.
    fn write(&self, tx: DbTxId, key: &DbKey, row: Option<&Value>) -> Result<()>;

    /// Atomically make every staged write of `tx` durable
    fn commit(&self, tx: DbTxId) -> Result<()>;

    /// Drop every staged write of `tx`
    fn rollback(&self, tx: DbTxId);

    /// Read the durable value of a row
    fn read(&self, key: &DbKey) -> Option<Value>;
}

// =============================================================================
// In-Memory Engine
// =============================================================================

/// In-memory [`DbEngine`] with fault injection
#[derive(Debug, Default)]
pub struct MemoryDb {
    durable: RwLock<BTreeMap<DbKey, Value>>,
    staged: Mutex<HashMap<DbTxId, BTreeMap<DbKey, Option<Value>>>>,
    fail_table: Mutex<Option<&'static str>>,
    fail_next_commit: AtomicBool,
    writes: AtomicU64,
    commits: AtomicU64,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent write into `table`
    pub fn fail_writes_to(&self, table: &'static str) {
        *self.fail_table.lock() = Some(table);
    }

    /// Fail the next commit
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Clear all injected faults
    pub fn clear_faults(&self) {
        *self.fail_table.lock() = None;
        self.fail_next_commit.store(false, Ordering::SeqCst);
    }

    /// Number of staged writes accepted so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Durable rows of `table`, keyed by primary key
    pub fn rows(&self, table: &str) -> BTreeMap<String, Value> {
        self.durable
            .read()
            .iter()
            .filter(|(k, _)| k.table == table)
            .map(|(k, v)| (k.pk.clone(), v.clone()))
            .collect()
    }
}

impl DbEngine for MemoryDb {
    fn write(&self, tx: DbTxId, key: &DbKey, row: Option<&Value>) -> Result<()> {
        if *self.fail_table.lock() == Some(key.table) {
            return Err(Error::Database(format!("injected write failure for {}", key)));
        }
        self.staged
            .lock()
            .entry(tx)
            .or_default()
            .insert(key.clone(), row.cloned());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn commit(&self, tx: DbTxId) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::Database(format!("injected commit failure for tx {}", tx)));
        }
        let staged = self.staged.lock().remove(&tx).unwrap_or_default();
        let mut durable = self.durable.write();
        for (key, row) in staged {
            match row {
                Some(row) => {
                    durable.insert(key, row);
                }
                None => {
                    durable.remove(&key);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self, tx: DbTxId) {
        self.staged.lock().remove(&tx);
    }

    fn read(&self, key: &DbKey) -> Option<Value> {
        self.durable.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_commit_makes_writes_durable() {
        let db = MemoryDb::new();
        let key = DbKey::new("NODES", "N1");

        db.write(1, &key, Some(&json!({"name": "n1"}))).unwrap();
        assert!(db.read(&key).is_none());

        db.commit(1).unwrap();
        assert_eq!(db.read(&key), Some(json!({"name": "n1"})));

        db.write(2, &key, None).unwrap();
        db.commit(2).unwrap();
        assert!(db.read(&key).is_none());
        assert_eq!(db.commit_count(), 2);
    }

    #[test]
    fn test_rollback_discards_staged() {
        let db = MemoryDb::new();
        let key = DbKey::new("NODES", "N1");

        db.write(7, &key, Some(&json!(1))).unwrap();
        db.rollback(7);
        db.commit(7).unwrap();
        assert!(db.read(&key).is_none());
    }

    #[test]
    fn test_fault_injection() {
        let db = MemoryDb::new();
        db.fail_writes_to("RESOURCES");
        assert!(db
            .write(1, &DbKey::new("RESOURCES", "x"), Some(&json!(1)))
            .is_err());
        assert!(db.write(1, &DbKey::new("NODES", "x"), Some(&json!(1))).is_ok());

        db.fail_next_commit();
        assert!(db.commit(1).is_err());
        // the fault is consumed
        assert!(db.commit(1).is_ok());
    }
}
