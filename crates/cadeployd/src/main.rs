//! cadeployd — the cadeploy daemon.
//!
//! Assembles the deployer:
//! - Kubernetes client (kubeconfig or in-cluster)
//! - Deployment manager + periodic status refresh
//! - Checkpoint store (redb), replayed on start
//! - Reply dispatcher
//! - REST API
//!
//! # Usage
//!
//! ```text
//! cadeployd serve --config /etc/cadeploy/deployer.toml --port 8080 --data-dir /var/lib/cadeploy
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cadeploy_cluster::KubeClusterApi;
use cadeploy_core::DeployerConfig;
use cadeploy_manager::DeploymentManager;
use cadeploy_queue::{CheckpointStore, Mailboxes, Outbox, recover_all, spawn_dispatcher};
use cadeployd::{ApiState, build_router};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cadeployd", about = "cadeploy daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and keep the status cache fresh.
    Serve {
        /// Deployer configuration (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for checkpoints.
        #[arg(long, default_value = "/var/lib/cadeploy")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cadeploy=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => serve(config, port, data_dir).await,
    }
}

async fn serve(config_path: PathBuf, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    let config = Arc::new(DeployerConfig::from_file(&config_path)?);
    info!(
        path = ?config_path,
        app_namespace = %config.app.namespace,
        redis_namespace = %config.redis.namespace,
        "cadeploy daemon starting"
    );

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("checkpoints.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let cluster = KubeClusterApi::connect(config.use_kube_config).await?;
    let manager = DeploymentManager::new(Arc::new(cluster), config.clone());

    let store = CheckpointStore::open(&db_path)?;
    info!(path = ?db_path, "checkpoint store opened");

    let mailboxes = Mailboxes::new();
    let (outbox, replies) = Outbox::channel();
    let dispatcher = spawn_dispatcher(replies, Arc::new(mailboxes.clone()));

    recover_all(&store, &manager, &outbox).await?;

    if let Err(e) = manager.refresh().await {
        warn!(error = %e, "initial refresh failed");
    }

    // ── Background refresh ─────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_handle = tokio::spawn({
        let manager = manager.clone();
        let interval = config.refresh_interval;
        async move { manager.run(interval, shutdown_rx).await }
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::new(manager, store, outbox, mailboxes));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = refresh_handle.await;
    // The router held the last outbox; the dispatcher drains and exits.
    let _ = dispatcher.await;

    info!("cadeploy daemon stopped");
    Ok(())
}
