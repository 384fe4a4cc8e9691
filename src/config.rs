//! Controller Configuration
//!
//! Loaded from an optional YAML file; every field has a default so a partial
//! file is enough. Command line arguments override individual values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level controller configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub locks: LockConfig,
    pub coordinator: CoordinatorConfig,
    pub api: ApiConfig,
    pub layer: LayerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum wait for each lock of a bundle
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a rollback waits for node reports; 0 waits forever
    pub node_report_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_report_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address of the debug/administrative API
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:3370".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// First id handed out to layer nodes
    pub first_layer_id: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { first_layer_id: 1 }
    }
}

impl ControllerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.locks.acquire_timeout_ms == 0 {
            return Err(Error::Configuration(
                "locks.acquire_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.api_addr()?;
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.acquire_timeout_ms)
    }

    pub fn node_report_timeout(&self) -> Option<Duration> {
        match self.coordinator.node_report_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        self.api
            .addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid api.addr '{}': {}", self.api.addr, e)))
    }
}
