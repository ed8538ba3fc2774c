//! PXE Autoscaler - Kubernetes node autoscaler on Proxmox
//!
//! Watches a labeled node group and clones, joins, drains and deletes
//! Proxmox VMs to keep it sized to the workload.

use anyhow::{Context, Result};
use autoscaler_lib::{
    cluster::KubeClusterApi,
    hypervisor::{ProxmoxClient, ProxmoxCredentials},
    join::ShellJoinCommand,
    Autoscaler, Backends,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(name = "pxe-autoscaler", version, about = "Kubernetes node autoscaler on Proxmox")]
struct Args {
    /// TOML settings file layered under AUTOSCALER_* environment variables
    #[arg(long, env = "AUTOSCALER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting pxe-autoscaler");

    let settings = config::load(args.config.as_deref())?;
    info!(
        group = %settings.group.label,
        min_size = settings.group.min_size,
        max_size = settings.group.max_size,
        proxmox_host = %settings.proxmox.host,
        network_mode = %settings.network.mode,
        "Autoscaler configured"
    );

    let cluster = KubeClusterApi::try_default()
        .await
        .context("failed to connect to the Kubernetes API")?;
    let credentials = ProxmoxCredentials::from_settings(&settings.proxmox)
        .context("invalid Proxmox connection settings")?;
    let hypervisor =
        ProxmoxClient::new(credentials).context("failed to build the Proxmox client")?;

    let backends = Backends {
        cluster: Arc::new(cluster),
        hypervisor: Arc::new(hypervisor),
        join: Arc::new(ShellJoinCommand::new(settings.join_command.clone())),
    };
    let autoscaler = Autoscaler::new(&settings, backends)
        .await
        .context("failed to initialize the autoscaler")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut control = tokio::spawn(autoscaler.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
            if let Err(e) = control.await {
                error!(error = %e, "Control loop terminated abnormally");
            }
        }
        result = &mut control => {
            result.context("control loop panicked")?;
        }
    }

    info!("Shutting down");
    Ok(())
}
