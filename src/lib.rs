//! Cluster Storage Controller - Transactional Control Core
//!
//! Control core of a replicated block storage orchestrator: desired state
//! lives in transactional objects, is guarded by an ordered set of global
//! locks and is pushed to satellite nodes. Snapshot rollbacks span several
//! nodes and are tracked until every node has reported.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     REST API (debug / admin)                   │
//! ├───────────────────────────────────────────────────────────────┤
//! │                          Controller                            │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌────────────────┐  │
//! │  │  Lock Facility │  │  Scope Runner   │  │   Rollback     │  │
//! │  │  (ordered)     │  │  (locks + tx)   │  │   Coordinator  │  │
//! │  └────────────────┘  └─────────────────┘  └────────────────┘  │
//! ├───────────────────────────────────────────────────────────────┤
//! │   Domain objects  │  Layer graph  │  State flags  │  Security │
//! ├───────────────────────────────────────────────────────────────┤
//! │              Transaction manager  /  Database engine           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`transaction`]: Transactional objects, maps and the transaction manager
//! - [`stateflags`]: Access-checked transactional bit sets
//! - [`locks`]: Global locks acquired in a fixed order
//! - [`layer`]: Resource and volume layer graphs and size arithmetic
//! - [`domain`]: Nodes, pools, resources, snapshots and result lists
//! - [`coordinator`]: Multi-node snapshot rollback tracking
//! - [`controller`]: Operations combining all of the above
//! - [`api`]: HTTP surface

pub mod api;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod layer;
pub mod locks;
pub mod metrics;
pub mod security;
pub mod stateflags;
pub mod transaction;

// Re-export commonly used types
pub use api::{ApiServer, RestRouter, ShutdownHandle};

pub use config::ControllerConfig;

pub use controller::{Controller, ReconcileReport, ResourceLayout, VolumeReport};

pub use coordinator::{ApiCallStream, InflightSummary, RollbackCoordinator, RollbackOutcome};

pub use domain::{
    ApiCallRc, ApiCallRcEntry, LoggingSatelliteUpdater, NodeName, RcKind, ResourceName,
    SatelliteUpdater, SnapshotName, StorPoolName, VolumeNumber,
};

pub use error::{Error, ErrorCategory, Result};

pub use locks::{LockFacility, LockMode, LockName, LockStatus};

pub use metrics::ControllerMetrics;

pub use security::{AccessContext, AccessType};

pub use transaction::{DbEngine, MemoryDb, TransactionMgr};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
