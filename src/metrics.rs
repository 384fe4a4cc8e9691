//! Controller Metrics
//!
//! Prometheus collectors for rollbacks, lock contention and transactions,
//! registered in a registry owned by the controller instance.

use crate::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "cluster_storage_controller";

/// Metrics of one controller instance
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Finished rollbacks by outcome (`clean`, `recovering`, `aborted`)
    pub rollbacks_total: IntCounterVec,
    /// Rollbacks waiting for node reports
    pub rollbacks_inflight: IntGauge,
    /// Time spent acquiring lock bundles
    pub lock_wait_seconds: Histogram,
    pub lock_timeouts_total: IntCounter,
    pub tx_commits_total: IntCounter,
    pub tx_rollbacks_total: IntCounter,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let rollbacks_total = IntCounterVec::new(
            Opts::new("rollbacks_total", "Finished snapshot rollbacks by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let rollbacks_inflight = IntGauge::with_opts(
            Opts::new("rollbacks_inflight", "Snapshot rollbacks waiting for node reports")
                .namespace(NAMESPACE),
        )?;
        let lock_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("lock_wait_seconds", "Time spent acquiring lock bundles")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]),
        )?;
        let lock_timeouts_total = IntCounter::with_opts(
            Opts::new("lock_timeouts_total", "Lock bundles that timed out").namespace(NAMESPACE),
        )?;
        let tx_commits_total = IntCounter::with_opts(
            Opts::new("transaction_commits_total", "Committed transactions").namespace(NAMESPACE),
        )?;
        let tx_rollbacks_total = IntCounter::with_opts(
            Opts::new("transaction_rollbacks_total", "Rolled back transactions").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(rollbacks_total.clone()))?;
        registry.register(Box::new(rollbacks_inflight.clone()))?;
        registry.register(Box::new(lock_wait_seconds.clone()))?;
        registry.register(Box::new(lock_timeouts_total.clone()))?;
        registry.register(Box::new(tx_commits_total.clone()))?;
        registry.register(Box::new(tx_rollbacks_total.clone()))?;

        Ok(Self {
            registry,
            rollbacks_total,
            rollbacks_inflight,
            lock_wait_seconds,
            lock_timeouts_total,
            tx_commits_total,
            tx_rollbacks_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every collector in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics")
            .field("rollbacks_inflight", &self.rollbacks_inflight.get())
            .finish()
    }
}
