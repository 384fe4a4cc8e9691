//! Domain layer - Cluster entities and port definitions
//!
//! Nodes, storage pools, resource definitions, resources and snapshots, the
//! core maps holding them, and the traits towards the satellites.

pub mod apicall;
pub mod maps;
pub mod names;
pub mod node;
pub mod ports;
pub mod resource;

pub use apicall::{ApiCallRc, ApiCallRcEntry, RcKind};
pub use maps::{CoreMap, CtrlConfig, NodesMap, ResourceDefinitionMap, StorPoolDefinitionMap};
pub use names::{NodeName, ResourceName, SnapshotName, StorPoolName, VolumeNumber};
pub use node::{Node, StorPool, StorPoolDefinition};
pub use ports::{LoggingSatelliteUpdater, SatelliteUpdater, SatelliteUpdaterRef};
pub use resource::{
    Resource, ResourceDefinition, Snapshot, SnapshotDefinition, MAX_VOLUME_SIZE_KIB,
    PROP_ROLLBACK_TARGET,
};
