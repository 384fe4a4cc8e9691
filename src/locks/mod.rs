//! Lock Ordering Facility
//!
//! Guards the cluster-wide maps behind a closed set of named locks. Every
//! bundle of locks is acquired in one global order, so two requests with
//! overlapping lock sets can never deadlock each other.

pub mod facility;

pub use facility::{reconfiguration_holds, LockFacility, LockGuard, LockGuardBuilder};

use serde::Serialize;

/// Named cluster-wide locks, declared in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockName {
    Reconfiguration,
    CtrlConfig,
    NodesMap,
    StorPoolDfnMap,
    RscDfnMap,
}

impl LockName {
    /// Global acquisition order
    pub const ORDER: [LockName; 5] = [
        LockName::Reconfiguration,
        LockName::CtrlConfig,
        LockName::NodesMap,
        LockName::StorPoolDfnMap,
        LockName::RscDfnMap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LockName::Reconfiguration => "RECONFIGURATION",
            LockName::CtrlConfig => "CTRL_CONFIG",
            LockName::NodesMap => "NODES_MAP",
            LockName::StorPoolDfnMap => "STOR_POOL_DFN_MAP",
            LockName::RscDfnMap => "RSC_DFN_MAP",
        }
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested access; `Write` is exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Point-in-time state of one lock, for the debug surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub name: LockName,
    pub locked: bool,
    pub exclusive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_ord() {
        let mut sorted = LockName::ORDER;
        sorted.sort();
        assert_eq!(sorted, LockName::ORDER);
        assert!(LockMode::Write > LockMode::Read);
    }

    #[test]
    fn test_names() {
        assert_eq!(LockName::StorPoolDfnMap.to_string(), "STOR_POOL_DFN_MAP");
        assert_eq!(
            serde_json::to_value(LockName::RscDfnMap).unwrap(),
            serde_json::json!("RSC_DFN_MAP")
        );
    }
}
