//! Domain Ports - Boundaries towards the satellites
//!
//! The controller never talks to satellites directly; propagation of changed
//! configuration goes through these traits so the transport can be swapped.

use super::apicall::{ApiCallRc, ApiCallRcEntry};
use super::names::{NodeName, ResourceName};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Satellite propagation
// =============================================================================

/// Fans a changed resource out to the satellites hosting it
#[async_trait]
pub trait SatelliteUpdater: Send + Sync {
    /// Push the current configuration of `rsc` to `nodes`
    ///
    /// Resolves once every node has acknowledged; per-node problems are
    /// reported as entries of the returned `ApiCallRc`.
    async fn update_satellites(&self, rsc: &ResourceName, nodes: &[NodeName]) -> Result<ApiCallRc>;
}

pub type SatelliteUpdaterRef = Arc<dyn SatelliteUpdater>;

/// Updater for a standalone controller without connected satellites
#[derive(Debug, Default)]
pub struct LoggingSatelliteUpdater;

#[async_trait]
impl SatelliteUpdater for LoggingSatelliteUpdater {
    async fn update_satellites(&self, rsc: &ResourceName, nodes: &[NodeName]) -> Result<ApiCallRc> {
        let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        info!(rsc = %rsc, nodes = ?nodes, "Propagating resource to satellites");
        Ok(ApiCallRc::single(
            ApiCallRcEntry::info(format!("Resource '{}' updated on {} node(s)", rsc, nodes.len()))
                .with_ref("RscDfn", rsc.to_string()),
        ))
    }
}
