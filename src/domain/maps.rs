//! Core object maps
//!
//! The top-level registries of the controller. Each map sits behind its own
//! lock in the lock facility; mutation needs `&mut self`, which only a
//! write-held guard hands out.

use super::names::{NodeName, ResourceName, StorPoolName};
use super::node::{Node, StorPoolDefinition};
use super::resource::ResourceDefinition;
use crate::error::{Error, Result};
use crate::transaction::{TransactionMap, TransactionMgr};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;

/// Named registry of shared domain objects
pub struct CoreMap<K, V> {
    kind: &'static str,
    map: TransactionMap<K, Arc<V>>,
}

impl<K, V> CoreMap<K, V>
where
    K: Ord + Clone + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn persistent(kind: &'static str, table: &'static str, row: fn(&Arc<V>) -> Value) -> Self {
        Self {
            kind,
            map: TransactionMap::persistent(table, "", row),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.map.get(key)
    }

    /// Like `get`, but a missing entry is an error
    pub fn require(&self, key: &K) -> Result<Arc<V>> {
        self.map.get(key).ok_or_else(|| Error::not_found(self.kind, key))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.keys()
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, tx: &TransactionMgr, key: K, value: Arc<V>) -> Result<()> {
        if self.map.contains_key(&key) {
            return Err(Error::exists(self.kind, key));
        }
        self.map.insert(tx, key, value)?;
        Ok(())
    }

    pub fn remove(&mut self, tx: &TransactionMgr, key: &K) -> Result<Arc<V>> {
        self.map
            .remove(tx, key)?
            .ok_or_else(|| Error::not_found(self.kind, key))
    }
}

impl<K: std::fmt::Debug, V> std::fmt::Debug for CoreMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreMap").field("kind", &self.kind).finish()
    }
}

pub type NodesMap = CoreMap<NodeName, Node>;
pub type ResourceDefinitionMap = CoreMap<ResourceName, ResourceDefinition>;
pub type StorPoolDefinitionMap = CoreMap<StorPoolName, StorPoolDefinition>;

impl NodesMap {
    pub fn new() -> Self {
        Self::persistent("node", "NODES", Node::row)
    }
}

impl Default for NodesMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceDefinitionMap {
    pub fn new() -> Self {
        Self::persistent("resource definition", "RESOURCE_DEFINITIONS", ResourceDefinition::row)
    }
}

impl Default for ResourceDefinitionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl StorPoolDefinitionMap {
    pub fn new() -> Self {
        Self::persistent("storage pool definition", "STOR_POOL_DEFINITIONS", StorPoolDefinition::row)
    }
}

impl Default for StorPoolDefinitionMap {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Controller configuration properties
// =============================================================================

/// Controller-wide key/value configuration
#[derive(Debug)]
pub struct CtrlConfig {
    props: TransactionMap<String, String>,
}

impl CtrlConfig {
    pub fn new() -> Self {
        Self {
            props: TransactionMap::persistent("CTRL_CONFIG", "", |v: &String| Value::String(v.clone())),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.props.get(&key.to_string())
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.props.entries()
    }

    pub fn set(&mut self, tx: &TransactionMgr, key: &str, value: &str) -> Result<Option<String>> {
        self.props.insert(tx, key.to_string(), value.to_string())
    }

    pub fn remove(&mut self, tx: &TransactionMgr, key: &str) -> Result<Option<String>> {
        self.props.remove(tx, &key.to_string())
    }
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self::new()
    }
}
