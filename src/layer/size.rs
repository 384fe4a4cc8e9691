//! Size Reconciliation
//!
//! Expected sizes flow top-down: every layer derives what its data child must
//! provide from what it has to provide itself. Allocated sizes flow
//! bottom-up from what the satellites report for the storage layers.
//! All sizes are in KiB.

use super::graph::{LayerId, RscLayerGraph};
use super::kind::LayerKind;
use crate::domain::VolumeNumber;
use crate::error::{Error, Result};
use crate::transaction::TransactionMgr;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Space reserved for the LUKS header
pub const LUKS_HEADER_KIB: u64 = 16 * 1024;

/// Peer slots reserved in DRBD metadata unless configured otherwise
pub const DRBD_DEFAULT_PEER_SLOTS: u16 = 7;

pub const DRBD_DEFAULT_AL_KIB: u64 = 32;

const DRBD_MD_ALIGN_KIB: u64 = 4;
const DRBD_BM_ALIGN_KIB: u64 = 4;
const DRBD_BM_PEER_ALIGN: u64 = 8;
const DRBD_BM_BIT_COVER_KIB: u64 = 4;
const DRBD_BM_BYTE_COVER_KIB: u64 = 32;
const DRBD_MD_SUPERBLK_KIB: u64 = 4;
const DRBD_MAX_KIB: u64 = 1 << 40;
const DRBD_MIN_GROSS_KIB: u64 = 68;
const DRBD_MIN_NET_KIB: u64 = 4;
const DRBD_MAX_PEERS: u16 = 31;
const DRBD_MIN_EXT_META_KIB: u64 = 1024;

// =============================================================================
// Size State
// =============================================================================

/// Outcome of comparing a provided size with the expected one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizeState {
    TooSmall,
    TooLarge,
    TooLargeWithinTolerance,
    AsExpected,
}

impl SizeState {
    pub fn evaluate(expected_kib: u64, actual_kib: u64, tolerance_kib: u64) -> Self {
        if actual_kib < expected_kib {
            SizeState::TooSmall
        } else if actual_kib == expected_kib {
            SizeState::AsExpected
        } else if actual_kib - expected_kib <= tolerance_kib {
            SizeState::TooLargeWithinTolerance
        } else {
            SizeState::TooLarge
        }
    }

    pub fn is_acceptable(self) -> bool {
        matches!(self, SizeState::AsExpected | SizeState::TooLargeWithinTolerance)
    }
}

// =============================================================================
// DRBD Metadata
// =============================================================================

fn align_up(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Ok(value);
    }
    value
        .div_ceil(alignment)
        .checked_mul(alignment)
        .ok_or_else(|| overflow(value, alignment))
}

fn add(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b).ok_or_else(|| overflow(a, b))
}

fn overflow(a: u64, b: u64) -> Error {
    Error::InvalidRequest(format!("volume size overflows: {} KiB + {} KiB", a, b))
}

fn align_down(value: u64, alignment: u64) -> u64 {
    (value / alignment) * alignment
}

fn check(size_kib: u64, peers: u16, min_kib: u64) -> Result<()> {
    if peers == 0 || peers > DRBD_MAX_PEERS {
        return Err(Error::InvalidRequest(format!(
            "DRBD peer count {} out of range 1..={}",
            peers, DRBD_MAX_PEERS
        )));
    }
    if size_kib < min_kib {
        return Err(Error::InvalidRequest(format!(
            "DRBD volume of {} KiB is below the minimum of {} KiB",
            size_kib, min_kib
        )));
    }
    if size_kib > DRBD_MAX_KIB {
        return Err(Error::InvalidRequest(format!(
            "DRBD volume of {} KiB exceeds the maximum of {} KiB",
            size_kib, DRBD_MAX_KIB
        )));
    }
    Ok(())
}

/// Bitmap size for `covered_kib` of data on every peer
///
/// Callers bound `covered_kib` by the DRBD maximum first.
fn bitmap_kib(covered_kib: u64, peers: u16) -> Result<(u64, u64)> {
    let peer_bytes = align_up(covered_kib.div_ceil(DRBD_BM_BYTE_COVER_KIB), DRBD_BM_PEER_ALIGN)?;
    let bytes = peer_bytes * peers as u64;
    let size = align_up(align_up(bytes, 1024)? / 1024, DRBD_BM_ALIGN_KIB)?;
    Ok((size, peer_bytes * DRBD_BM_BYTE_COVER_KIB))
}

fn metadata_kib(bitmap_kib: u64) -> Result<u64> {
    align_up(
        bitmap_kib + DRBD_DEFAULT_AL_KIB + DRBD_MD_SUPERBLK_KIB,
        DRBD_MD_ALIGN_KIB,
    )
}

/// Backing device size needed for `net_kib` of usable space with internal metadata
///
/// The bitmap must also cover itself, so its size is iterated until the
/// covered size reaches the resulting gross size.
pub fn drbd_gross_size_kib(net_kib: u64, peers: u16) -> Result<u64> {
    check(net_kib, peers, DRBD_MIN_NET_KIB)?;

    let net_eff = align_up(net_kib, DRBD_BM_BIT_COVER_KIB)?;
    let base = net_eff + DRBD_DEFAULT_AL_KIB + DRBD_MD_SUPERBLK_KIB;
    let (mut bitmap, mut covered) = bitmap_kib(base, peers)?;
    let mut gross = base + bitmap;
    while covered < gross {
        (bitmap, covered) = bitmap_kib(gross, peers)?;
        gross = base + bitmap;
    }

    let gross = (net_eff + metadata_kib(bitmap)?).max(DRBD_MIN_GROSS_KIB);
    check(gross, peers, DRBD_MIN_GROSS_KIB)?;
    Ok(gross)
}

/// Usable size of a backing device of `gross_kib` with internal metadata
pub fn drbd_net_size_kib(gross_kib: u64, peers: u16) -> Result<u64> {
    check(gross_kib, peers, DRBD_MIN_GROSS_KIB)?;

    let (bitmap, _) = bitmap_kib(align_up(gross_kib, DRBD_BM_BIT_COVER_KIB)?, peers)?;
    let md = metadata_kib(bitmap)?;
    let gross_eff = align_down(gross_kib, DRBD_BM_BIT_COVER_KIB);
    if md >= gross_eff {
        return Err(Error::InvalidRequest(format!(
            "DRBD backing device of {} KiB cannot hold {} KiB of metadata",
            gross_kib, md
        )));
    }
    Ok(gross_eff - md)
}

/// Size of an external metadata device for `size_kib` of data
pub fn drbd_external_md_size_kib(size_kib: u64, peers: u16) -> Result<u64> {
    check(size_kib, peers, DRBD_MIN_NET_KIB)?;
    let (bitmap, _) = bitmap_kib(align_up(size_kib, DRBD_BM_BIT_COVER_KIB)?, peers)?;
    Ok(metadata_kib(bitmap)?.max(DRBD_MIN_EXT_META_KIB))
}

// =============================================================================
// Graph Reconciliation
// =============================================================================

impl RscLayerGraph {
    /// Propagate the usable size layer `id` must provide down to the storage layers
    pub fn update_expected_size(
        &self,
        tx: &TransactionMgr,
        id: LayerId,
        vlm_nr: VolumeNumber,
        usable_kib: u64,
    ) -> Result<()> {
        let node = self.node(id)?;
        let vlm = node
            .vlm(vlm_nr)
            .ok_or_else(|| Error::not_found("volume", format!("{}/{}", id, vlm_nr)))?;

        match node.kind() {
            LayerKind::Storage => {
                let extent = vlm.stor_pool().map(|p| p.extent_kib()).unwrap_or(0);
                vlm.set_expected_size(tx, align_up(usable_kib, extent)?)?;
            }
            LayerKind::Drbd => {
                vlm.set_expected_size(tx, usable_kib)?;
                if node.child_ids().is_empty() {
                    return Ok(());
                }
                let data = self.data_child(id)?;
                match self.child_by_suffix(id, ".meta")? {
                    Some(meta) => {
                        let md = drbd_external_md_size_kib(usable_kib, DRBD_DEFAULT_PEER_SLOTS)?;
                        self.update_expected_size(tx, meta.id(), vlm_nr, md)?;
                        let data_kib = align_up(usable_kib, DRBD_BM_BIT_COVER_KIB)?;
                        self.update_expected_size(tx, data.id(), vlm_nr, data_kib)?;
                    }
                    None => {
                        let gross = drbd_gross_size_kib(usable_kib, DRBD_DEFAULT_PEER_SLOTS)?;
                        self.update_expected_size(tx, data.id(), vlm_nr, gross)?;
                    }
                }
            }
            LayerKind::Luks => {
                vlm.set_expected_size(tx, usable_kib)?;
                let data = self.data_child(id)?;
                self.update_expected_size(tx, data.id(), vlm_nr, add(usable_kib, LUKS_HEADER_KIB)?)?;
            }
            _ => {
                vlm.set_expected_size(tx, usable_kib)?;
                let data = self.data_child(id)?;
                self.update_expected_size(tx, data.id(), vlm_nr, usable_kib)?;
            }
        }
        Ok(())
    }

    /// Derive allocated and usable sizes from the storage layers upwards
    ///
    /// Storage records must already carry the allocated size reported by the
    /// satellite; their size state is evaluated against the expected size
    /// with the pool's tolerance.
    pub fn update_allocated_size(
        &self,
        tx: &TransactionMgr,
        id: LayerId,
        vlm_nr: VolumeNumber,
    ) -> Result<()> {
        let node = self.node(id)?;
        for child in node.child_ids() {
            self.update_allocated_size(tx, child, vlm_nr)?;
        }
        let vlm = node
            .vlm(vlm_nr)
            .ok_or_else(|| Error::not_found("volume", format!("{}/{}", id, vlm_nr)))?;

        let (allocated, usable) = match node.kind() {
            LayerKind::Storage => {
                let allocated = vlm.allocated_size();
                if !vlm.provider_kind().is_diskless() {
                    let tolerance = vlm.stor_pool().map(|p| p.tolerance_kib()).unwrap_or(0);
                    let state = SizeState::evaluate(vlm.expected_size(), allocated, tolerance);
                    if !state.is_acceptable() {
                        warn!(
                            layer = %id,
                            vlm = %vlm_nr,
                            expected_kib = vlm.expected_size(),
                            allocated_kib = allocated,
                            state = ?state,
                            "Storage volume size mismatch"
                        );
                    }
                    vlm.set_size_state(Some(state));
                }
                if let Some(pool) = vlm.stor_pool() {
                    if self.owner().is_snapshot() {
                        pool.put_snap_volume(tx, vlm.alloc_key().to_string(), allocated)?;
                    } else {
                        pool.put_rsc_volume(tx, vlm.alloc_key().to_string(), allocated)?;
                    }
                }
                (allocated, allocated)
            }
            LayerKind::Drbd => {
                if node.child_ids().is_empty() {
                    (0, vlm.expected_size())
                } else {
                    let allocated = self.child_usable(id, vlm_nr)?;
                    let usable = if self.child_by_suffix(id, ".meta")?.is_some() {
                        align_down(allocated, DRBD_BM_BIT_COVER_KIB)
                    } else {
                        // A backing device that cannot hold the metadata still
                        // records what was reported; the storage state flags it.
                        match drbd_net_size_kib(allocated, DRBD_DEFAULT_PEER_SLOTS) {
                            Ok(net) => net,
                            Err(Error::InvalidRequest(reason)) => {
                                warn!(layer = %id, vlm = %vlm_nr, allocated_kib = allocated, reason = %reason, "DRBD volume unusable");
                                0
                            }
                            Err(e) => return Err(e),
                        }
                    };
                    (allocated, usable)
                }
            }
            LayerKind::Luks => {
                let allocated = self.child_usable(id, vlm_nr)?;
                (allocated, allocated.saturating_sub(LUKS_HEADER_KIB))
            }
            _ => {
                let allocated = self.child_usable(id, vlm_nr)?;
                (allocated, allocated)
            }
        };

        vlm.set_allocated_size(tx, allocated)?;
        vlm.set_usable_size(tx, usable)?;
        debug!(layer = %id, vlm = %vlm_nr, allocated_kib = allocated, usable_kib = usable, "Sizes updated");
        Ok(())
    }

    fn child_usable(&self, id: LayerId, vlm_nr: VolumeNumber) -> Result<u64> {
        let data = self.data_child(id)?;
        data.vlm(vlm_nr)
            .map(|v| v.usable_size())
            .ok_or_else(|| Error::not_found("volume", format!("{}/{}", data.id(), vlm_nr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeName, ResourceName, StorPool, StorPoolName};
    use crate::layer::{DeviceProviderKind, LayerIdPool, LayerOwner};
    use crate::security::{AccessContext, ObjectProtection};
    use crate::transaction::MemoryDb;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn test_size_state() {
        assert_eq!(SizeState::evaluate(100, 99, 10), SizeState::TooSmall);
        assert_eq!(SizeState::evaluate(100, 100, 10), SizeState::AsExpected);
        assert_eq!(SizeState::evaluate(100, 110, 10), SizeState::TooLargeWithinTolerance);
        assert_eq!(SizeState::evaluate(100, 111, 10), SizeState::TooLarge);
    }

    #[test]
    fn test_drbd_metadata() {
        assert_eq!(drbd_gross_size_kib(1 << 20, 7).unwrap(), 1_048_840);
        assert_eq!(drbd_net_size_kib(1_048_840, 7).unwrap(), 1 << 20);
        assert_eq!(drbd_external_md_size_kib(1 << 20, 7).unwrap(), 1024);
        assert_eq!(drbd_gross_size_kib(4, 1).unwrap(), DRBD_MIN_GROSS_KIB);
        assert!(drbd_gross_size_kib(2, 7).is_err());
        assert!(drbd_gross_size_kib(1024, 32).is_err());
    }

    #[test]
    fn test_extreme_sizes_rejected() {
        assert_matches!(align_up(u64::MAX - 10, 4096), Err(Error::InvalidRequest(_)));
        assert_eq!(align_up(u64::MAX, 0).unwrap(), u64::MAX);
        assert_matches!(drbd_gross_size_kib(u64::MAX, 7), Err(Error::InvalidRequest(_)));
        assert_matches!(drbd_net_size_kib(u64::MAX - 3, 7), Err(Error::InvalidRequest(_)));
        assert_matches!(drbd_external_md_size_kib(u64::MAX, 7), Err(Error::InvalidRequest(_)));
        assert_matches!(drbd_net_size_kib(16, 7), Err(Error::InvalidRequest(_)));
    }

    fn storage_pool(node: &NodeName) -> Arc<StorPool> {
        Arc::new(
            StorPool::new(
                StorPoolName::new("pool1").unwrap(),
                node.clone(),
                DeviceProviderKind::Lvm,
                1 << 30,
            )
            .with_extent_kib(4),
        )
    }

    fn resource_graph(ctx: &AccessContext, node: &NodeName) -> RscLayerGraph {
        RscLayerGraph::new(
            LayerOwner::Resource {
                node: node.clone(),
                rsc: ResourceName::new("rsc1").unwrap(),
            },
            Arc::new(ObjectProtection::new(ctx, "/rscdfns/RSC1")),
        )
    }

    #[test]
    fn test_luks_overflow_is_invalid_request() {
        let ctx = AccessContext::system();
        let ids = LayerIdPool::new(1);
        let node = NodeName::new("n1").unwrap();
        let graph = resource_graph(&ctx, &node);
        let nr = VolumeNumber(0);

        let tx = TransactionMgr::new(Arc::new(MemoryDb::new()));
        let luks = graph.add_layer(&ctx, &tx, &ids, None, LayerKind::Luks, "").unwrap().id();
        let storage = graph.add_layer(&ctx, &tx, &ids, Some(luks), LayerKind::Storage, "").unwrap().id();
        graph.add_volume(&ctx, &tx, luks, nr, DeviceProviderKind::NotAProvider, None).unwrap();
        graph
            .add_volume(&ctx, &tx, storage, nr, DeviceProviderKind::Lvm, Some(storage_pool(&node)))
            .unwrap();

        let result = graph.update_expected_size(&tx, luks, nr, u64::MAX - 10);
        assert_matches!(result, Err(Error::InvalidRequest(_)));
        let result = graph.update_expected_size(&tx, storage, nr, u64::MAX - 2);
        assert_matches!(result, Err(Error::InvalidRequest(_)));
    }

    #[test]
    fn test_drbd_backing_below_minimum_is_recorded() {
        let ctx = AccessContext::system();
        let db = Arc::new(MemoryDb::new());
        let ids = LayerIdPool::new(1);
        let node = NodeName::new("n1").unwrap();
        let graph = resource_graph(&ctx, &node);
        let nr = VolumeNumber(0);

        let tx = TransactionMgr::new(db.clone());
        let drbd = graph.add_layer(&ctx, &tx, &ids, None, LayerKind::Drbd, "").unwrap().id();
        let storage = graph.add_layer(&ctx, &tx, &ids, Some(drbd), LayerKind::Storage, "").unwrap().id();
        graph.add_volume(&ctx, &tx, drbd, nr, DeviceProviderKind::NotAProvider, None).unwrap();
        graph
            .add_volume(&ctx, &tx, storage, nr, DeviceProviderKind::Lvm, Some(storage_pool(&node)))
            .unwrap();
        graph.update_expected_size(&tx, drbd, nr, 1 << 20).unwrap();

        let storage_vlm = graph.node(storage).unwrap().vlm(nr).unwrap();
        storage_vlm.set_allocated_size(&tx, 16).unwrap();
        graph.update_allocated_size(&tx, drbd, nr).unwrap();
        tx.commit().unwrap();

        assert_eq!(storage_vlm.size_state(), Some(SizeState::TooSmall));
        assert_eq!(storage_vlm.allocated_size(), 16);
        let drbd_vlm = graph.node(drbd).unwrap().vlm(nr).unwrap();
        assert_eq!(drbd_vlm.allocated_size(), 16);
        assert_eq!(drbd_vlm.usable_size(), 0);
    }

    #[test]
    fn test_reconcile_drbd_luks_storage() {
        let ctx = AccessContext::system();
        let db = Arc::new(MemoryDb::new());
        let ids = LayerIdPool::new(1);
        let node = NodeName::new("n1").unwrap();
        let pool = Arc::new(
            StorPool::new(
                StorPoolName::new("pool1").unwrap(),
                node.clone(),
                DeviceProviderKind::Lvm,
                1 << 30,
            )
            .with_extent_kib(4),
        );
        let graph = RscLayerGraph::new(
            LayerOwner::Resource {
                node,
                rsc: ResourceName::new("rsc1").unwrap(),
            },
            Arc::new(ObjectProtection::new(&ctx, "/rscdfns/RSC1")),
        );
        let nr = VolumeNumber(0);

        let tx = TransactionMgr::new(db.clone());
        let drbd = graph.add_layer(&ctx, &tx, &ids, None, LayerKind::Drbd, "").unwrap().id();
        let luks = graph.add_layer(&ctx, &tx, &ids, Some(drbd), LayerKind::Luks, "").unwrap().id();
        let cache = graph.add_layer(&ctx, &tx, &ids, Some(luks), LayerKind::Cache, "").unwrap().id();
        let storage = graph.add_layer(&ctx, &tx, &ids, Some(cache), LayerKind::Storage, "").unwrap().id();
        for id in [drbd, luks, cache] {
            graph.add_volume(&ctx, &tx, id, nr, DeviceProviderKind::NotAProvider, None).unwrap();
        }
        graph
            .add_volume(&ctx, &tx, storage, nr, DeviceProviderKind::Lvm, Some(pool.clone()))
            .unwrap();

        graph.update_expected_size(&tx, drbd, nr, 1 << 20).unwrap();
        let storage_vlm = graph.node(storage).unwrap().vlm(nr).unwrap();
        let expected = 1_048_840 + LUKS_HEADER_KIB;
        assert_eq!(graph.node(cache).unwrap().vlm(nr).unwrap().expected_size(), expected);
        assert_eq!(storage_vlm.expected_size(), expected);

        // satellite reports a slightly larger volume
        storage_vlm.set_allocated_size(&tx, expected + 8).unwrap();
        graph.update_allocated_size(&tx, drbd, nr).unwrap();
        tx.commit().unwrap();

        assert_eq!(storage_vlm.size_state(), Some(SizeState::TooLargeWithinTolerance));
        let luks_vlm = graph.node(luks).unwrap().vlm(nr).unwrap();
        assert_eq!(luks_vlm.allocated_size(), expected + 8);
        assert_eq!(luks_vlm.usable_size(), 1_048_848);
        let drbd_vlm = graph.node(drbd).unwrap().vlm(nr).unwrap();
        assert_eq!(drbd_vlm.allocated_size(), 1_048_848);
        assert!(drbd_vlm.usable_size() >= 1 << 20);
        assert_eq!(pool.free_capacity_kib(), (1 << 30) - (expected + 8));
    }
}
