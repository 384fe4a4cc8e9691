//! Layer and provider kinds

use serde::{Deserialize, Serialize};

/// Kind of a layer in a resource's device stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayerKind {
    /// Replicated block device; resynchronizable
    Drbd,
    /// Encryption
    Luks,
    /// NVMe-oF target / initiator
    Nvme,
    Writecache,
    Cache,
    Bcache,
    /// Raw storage from a storage pool
    Storage,
}

impl LayerKind {
    /// Layers with no physical storage of their own; sizes forward to the data child
    pub fn is_pass_through(self) -> bool {
        matches!(
            self,
            LayerKind::Nvme | LayerKind::Writecache | LayerKind::Cache | LayerKind::Bcache
        )
    }

    /// Whether resynchronization from peers can rebuild this layer's data
    pub fn is_resynchronizable(self) -> bool {
        matches!(self, LayerKind::Drbd)
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Drbd => write!(f, "DRBD"),
            LayerKind::Luks => write!(f, "LUKS"),
            LayerKind::Nvme => write!(f, "NVME"),
            LayerKind::Writecache => write!(f, "WRITECACHE"),
            LayerKind::Cache => write!(f, "CACHE"),
            LayerKind::Bcache => write!(f, "BCACHE"),
            LayerKind::Storage => write!(f, "STORAGE"),
        }
    }
}

/// Backend that provides the volume of a storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
    FileThin,
    Spdk,
    RemoteSpdk,
    StorageSpaces,
    EbsInit,
    EbsTarget,
    Exos,
    /// Record of a layer that is not backed by a storage provider
    NotAProvider,
}

impl DeviceProviderKind {
    /// Whether volumes of this provider occupy no local storage
    pub fn is_diskless(self) -> bool {
        matches!(
            self,
            DeviceProviderKind::Diskless | DeviceProviderKind::NotAProvider
        )
    }

    pub fn is_thin(self) -> bool {
        matches!(
            self,
            DeviceProviderKind::LvmThin | DeviceProviderKind::ZfsThin | DeviceProviderKind::FileThin
        )
    }

    /// Allocation granularity used when a pool does not report its own
    pub fn default_extent_kib(self) -> u64 {
        match self {
            DeviceProviderKind::Lvm
            | DeviceProviderKind::LvmThin
            | DeviceProviderKind::Spdk
            | DeviceProviderKind::RemoteSpdk
            | DeviceProviderKind::Exos => 4096,
            DeviceProviderKind::Zfs | DeviceProviderKind::ZfsThin => 8,
            DeviceProviderKind::StorageSpaces | DeviceProviderKind::EbsInit | DeviceProviderKind::EbsTarget => 1024,
            DeviceProviderKind::File | DeviceProviderKind::FileThin => 4,
            DeviceProviderKind::Diskless | DeviceProviderKind::NotAProvider => 0,
        }
    }
}

/// Why the satellite skips processing a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IgnoreReason {
    RscInactive,
    DrbdDiskless,
    DrbdSkipDisk,
    LuksMissingKey,
    RscCloning,
    SpdkTarget,
    EbsTarget,
}
