//! HubSpoke Daemon
//!
//! Keeps the hub's live peer list converged with the registry and sweeps
//! expired installation tokens.

use clap::Parser;
use hubspoke_common::{Database, Error, HubService, PeerReconciler, Settings, SystemCommandRunner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod reconciler;

#[derive(Parser)]
#[command(name = "hubspoked")]
#[command(about = "HubSpoke daemon - WireGuard hub reconciliation")]
#[command(version)]
struct Cli {
    /// Settings file path
    #[arg(short, long, env = "HUBSPOKE_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory (overrides the settings file)
    #[arg(short, long, env = "HUBSPOKE_STORE")]
    store: Option<PathBuf>,

    /// WireGuard interface name (overrides the settings file)
    #[arg(short, long)]
    interface: Option<String>,

    /// Reconcile interval in seconds (overrides the settings file)
    #[arg(long)]
    interval: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Run a single reconciliation pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("HubSpoke daemon v{}", hubspoke_common::VERSION);

    // Load settings, then apply command-line overrides
    let config_path = cli.config.unwrap_or_else(hubspoke_common::default_config_path);
    let mut settings = Settings::load(&config_path)?;
    if let Some(store) = cli.store {
        settings.store_path = store;
    }
    if let Some(interface) = cli.interface {
        settings.interface.name = interface;
    }
    if let Some(interval) = cli.interval {
        settings.reconcile.interval_secs = interval;
    }
    settings.validate()?;

    tokio::fs::create_dir_all(&settings.store_path).await?;

    let db = Database::open(settings.db_path())?;
    let runner = Arc::new(SystemCommandRunner::new(settings.command_timeout()));
    let peers = PeerReconciler::open(settings.reconciler_config(), runner)?;
    let service = HubService::new(db, settings.credential_policy(), Arc::new(peers));

    let probe = service.probe().await;
    if !probe.installed {
        warn!("WireGuard tools not found; interface operations will fail");
    } else if !probe.interface_exists {
        warn!("Interface {} is not up", settings.interface.name);
    }
    match service.hub() {
        Ok(hub) => info!("Serving {} at {}", hub.network_cidr, hub.interface_address),
        Err(Error::HubNotInitialized) => info!("Hub not initialized; passes are no-ops until it is"),
        Err(e) => return Err(e.into()),
    }

    let reconciler = reconciler::Reconciler::new(
        service,
        Duration::from_secs(settings.reconcile.interval_secs),
        settings.reconcile.sweep_expired,
    );

    if cli.once {
        let report = reconciler.reconcile_once().await?;
        info!(
            "Pass complete: {} swept, {} added, {} removed, {} failed",
            report.swept, report.converge.added, report.converge.removed, report.converge.failed
        );
        return Ok(());
    }

    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    info!(
        "Daemon started for {} (store {:?})",
        settings.interface.name, settings.store_path
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                tracing::error!("Reconciler error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
