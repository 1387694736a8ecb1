use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use mcsm_management::{
    ConfigFile, InMemoryStatusStore, LifecycleManager, ManagerConfig, ServerRecord,
};

/// Minecraft server manager daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Manager configuration file (YAML); environment variables and
    /// defaults fill in anything missing
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server manifest file (YAML list of server records)
    #[arg(short, long, value_name = "FILE")]
    manifest: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run duration in seconds (for testing)
    #[arg(long)]
    run_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    initialize_logging(args.debug)?;

    info!("Starting MCSM server manager");

    let file = match args.config {
        Some(ref path) => Some(ConfigFile::load(path)?),
        None => None,
    };
    let config = ManagerConfig::resolve(file.as_ref());

    let violations = config.validate();
    if !violations.is_empty() {
        for violation in &violations {
            error!("Configuration violation: {}", violation);
        }
        anyhow::bail!("{} configuration violation(s), refusing to start", violations.len());
    }

    let manifest = load_manifest(&args.manifest)?;
    info!("Loaded manifest with {} server(s)", manifest.len());

    let store = Arc::new(InMemoryStatusStore::new());
    let manager = LifecycleManager::new(config, store);

    let mut autostart = Vec::new();
    for record in manifest {
        let id = record.id.clone();
        let enabled = record.enabled;
        if let Err(e) = manager.register_server(record) {
            error!("Failed to register {}: {}", id, e);
            continue;
        }
        if enabled {
            autostart.push(id);
        }
    }

    for id in autostart {
        match manager.start(&id).await {
            Ok(()) => info!("Auto-started server {}", id),
            Err(e) => warn!("Auto-start of {} failed: {}", id, e),
        }
    }

    if let Some(duration) = args.run_duration {
        info!("Running for {} seconds (test mode)", duration);
        tokio::time::sleep(tokio::time::Duration::from_secs(duration)).await;
    } else {
        wait_for_shutdown_signal().await;
    }

    info!("Shutting down: stopping all running servers");
    manager.shutdown_all().await;
    info!("Server manager shut down");

    Ok(())
}

fn load_manifest(path: &PathBuf) -> Result<Vec<ServerRecord>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read manifest {}: {}", path.display(), e))?;
    let records: Vec<ServerRecord> = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse manifest {}: {}", path.display(), e))?;
    Ok(records)
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C signal");
    }
}
