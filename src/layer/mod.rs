//! Resource/Volume Layer Graph
//!
//! Device stacks of resources and snapshots: layer kinds, the per-resource
//! layer arena, per-volume provider records, and size reconciliation.

pub mod graph;
pub mod kind;
pub mod size;
pub mod volume;

pub use graph::{LayerId, LayerIdPool, LayerNode, LayerOwner, RscLayerGraph};
pub use kind::{DeviceProviderKind, IgnoreReason, LayerKind};
pub use size::{
    drbd_external_md_size_kib, drbd_gross_size_kib, drbd_net_size_kib, SizeState,
    LUKS_HEADER_KIB,
};
pub use volume::{VlmProviderObject, VolatileVlmState};
