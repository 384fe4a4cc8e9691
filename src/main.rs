//! Cluster Storage Controller
//!
//! Standalone controller process: loads the configuration, builds the
//! controller over an in-memory database and serves the REST API until
//! interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_storage_controller::{
    ApiServer, Controller, ControllerConfig, Error, LoggingSatelliteUpdater, MemoryDb, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cluster Storage Controller - transactional control core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address (overrides `api.addr`)
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Lock acquisition timeout in milliseconds (overrides `locks.acquire_timeout_ms`)
    #[arg(long, env = "LOCK_TIMEOUT_MS")]
    lock_timeout_ms: Option<u64>,

    /// Seconds to wait for rollback reports, 0 waits forever
    /// (overrides `coordinator.node_report_timeout_secs`)
    #[arg(long, env = "NODE_REPORT_TIMEOUT")]
    node_report_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Configuration file contents with the command line applied on top
    fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::load(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(addr) = &self.api_addr {
            config.api.addr = addr.clone();
        }
        if let Some(ms) = self.lock_timeout_ms {
            config.locks.acquire_timeout_ms = ms;
        }
        if let Some(secs) = self.node_report_timeout_secs {
            config.coordinator.node_report_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = args.controller_config()?;
    let addr = config.api_addr()?;

    info!("Starting Cluster Storage Controller");
    info!("  Version: {}", cluster_storage_controller::VERSION);
    info!("  REST API: {}", addr);
    info!("  Config file: {:?}", args.config);

    let controller = Controller::new(
        config,
        Arc::new(MemoryDb::new()),
        Arc::new(LoggingSatelliteUpdater),
    )?;

    let server = ApiServer::new(addr, Arc::new(controller));
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        shutdown.shutdown();
    });

    server.run().await?;

    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |d: &str| {
        d.parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive '{}': {}", d, e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("tower=warn")?)
        .add_directive(directive("axum=info")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
