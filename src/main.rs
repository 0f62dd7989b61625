//! Director Backup Operator
//!
//! This operator saves and restores namespaces of director-managed resources.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! director-backup-operator
//!
//! # Watch one namespace with debug logging
//! RUST_LOG=debug director-backup-operator --namespace openstack
//! ```

use clap::Parser;
use director_backup_operator::{BackupConfig, BackupRequestController, Controller};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Director Backup Operator
#[derive(Parser, Debug)]
#[command(name = "director-backup-operator")]
#[command(version, about = "Kubernetes Operator for director namespace backup and restore")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Seconds between passes while a request is in progress
    #[arg(long)]
    requeue_seconds: Option<u64>,

    /// Label selector of the administrative pod HA commands run in
    #[arg(long)]
    admin_pod_selector: Option<String>,

    /// Container of the administrative pod
    #[arg(long)]
    admin_container: Option<String>,

    /// User for ssh into VMs
    #[arg(long)]
    admin_user: Option<String>,

    /// Network whose address reaches a VM for HA commands
    #[arg(long)]
    ha_network: Option<String>,

    /// Label selector of config maps and secrets to save
    #[arg(long)]
    managed_selector: Option<String>,
}

impl Args {
    fn backup_config(&self) -> BackupConfig {
        let mut config = BackupConfig::default();
        if let Some(secs) = self.requeue_seconds {
            config.requeue_seconds = secs;
        }
        if let Some(selector) = &self.admin_pod_selector {
            config.admin_pod_selector = selector.clone();
        }
        if let Some(container) = &self.admin_container {
            config.admin_container = container.clone();
        }
        if let Some(user) = &self.admin_user {
            config.admin_user = user.clone();
        }
        if let Some(network) = &self.ha_network {
            config.ha_network = network.clone();
        }
        if let Some(selector) = &self.managed_selector {
            config.managed_selector = selector.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = args.backup_config();

    info!("Starting Director Backup Operator");
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let namespace = (!args.namespace.is_empty()).then(|| args.namespace.clone());
    let controller = Arc::new(BackupRequestController::new(client, config, namespace));

    let handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("{} controller error: {}", controller.name(), e);
            }
        })
    };

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = handle => {
            if let Err(e) = result {
                error!("BackupRequest controller task failed: {}", e);
            }
        }
    }

    info!("Director Backup Operator shutting down");
    Ok(())
}
