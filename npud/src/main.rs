//! npud - Ascend NPU device plugin daemon.
//!
//! Loads configuration and the fault code table, then runs the polling
//! engine until SIGINT/SIGTERM. SIGHUP reloads the fault code table.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use npu_common::PolicyRegistry;
use npu_common::config::{ConfigSource, PluginConfig};
use npu_common::logging::{LoggingOptions, init_logging};
use npud::{
    CommandResetExecutor, DeviceInfoStore, EngineSettings, FileBackend, JsonInventory, PluginEngine,
    StoreSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "npud")]
#[command(author, version, about = "Ascend NPU device plugin - health reconciliation and hot reset")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "NPU_CONFIG")]
    config: Option<PathBuf>,

    /// Inventory snapshot written by the driver side
    #[arg(long, default_value = "/var/run/npud/inventory.json")]
    inventory: PathBuf,

    /// Directory for persisted records and labels (overrides store.data_dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Also write daily-rotated logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Run a single polling cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) =
        PluginConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.store.data_dir = dir.clone();
    }
    config.validate().context("invalid configuration")?;

    let _log_guard = init_logging(&LoggingOptions {
        level: config.general.log_level.clone(),
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir: cli.log_dir.clone(),
    })
    .context("failed to initialise logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), node = %config.general.node_name, "starting npud");
    for source in &sources {
        debug!(key = %source.key, source = %source.source, env_var = ?source.env_var, "config override");
    }
    if cli.data_dir.is_some() {
        debug!(key = "store.data_dir", source = %ConfigSource::Cli, "config override");
    }

    let registry = Arc::new(PolicyRegistry::new());
    // Failure is logged by the registry; classification stays conservative until a reload succeeds.
    let _ = registry.load(&config.fault_policy.fault_code_file);

    let backend = Arc::new(
        FileBackend::new(&config.store.data_dir)
            .with_context(|| format!("failed to open data dir {}", config.store.data_dir.display()))?,
    );
    let store = Arc::new(DeviceInfoStore::new(
        backend.clone(),
        config.general.node_name.clone(),
        StoreSettings::from(&config.store),
    ));
    let engine = Arc::new(
        PluginEngine::new(
            EngineSettings::from(&config),
            Arc::new(JsonInventory::new(&cli.inventory)),
            backend,
            store,
            registry.clone(),
            Arc::new(CommandResetExecutor::from_config(&config.hot_reset)),
        )
        .context("failed to set up hot reset")?,
    );

    if cli.once {
        let report = engine.run_cycle().await.context("polling cycle failed")?;
        engine.wait_for_remediations().await;
        info!(
            free = report.published.free_count(),
            unhealthy = report.published.unhealthy.len(),
            network_unhealthy = report.published.network_unhealthy.len(),
            staged = report.staged.withheld().len(),
            write = ?report.write_outcome,
            resets = ?report.resets_started,
            "cycle complete"
        );
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_policy_reload(registry, config.fault_policy.fault_code_file.clone());

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(stop_rx).await })
    };

    wait_for_shutdown().await;
    info!("shutdown requested");
    let _ = stop_tx.send(true);
    runner.await.context("polling engine panicked")?;
    Ok(())
}

#[cfg(unix)]
fn spawn_policy_reload(registry: Arc<PolicyRegistry>, path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGHUP handler, fault code reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "SIGHUP received, reloading fault codes");
            let _ = registry.load(&path);
        }
    });
}

#[cfg(not(unix))]
fn spawn_policy_reload(_registry: Arc<PolicyRegistry>, _path: PathBuf) {}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
