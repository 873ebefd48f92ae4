use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::persistence::{FileStore, PersistenceGateway};
use crate::context::AppContext;
use crate::rpc::RpcServer;

/// Runs the daemon: restores saved state, serves RPC, snapshots state and
/// shuts everything down on SIGINT or SIGTERM.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn start(&self) -> Result<()> {
        let config = &self.ctx.config;
        info!(
            service_url = %config.service_url,
            simulation = config.simulation,
            auto_poll = config.auto_poll,
            "runwatch daemon starting"
        );

        let bind_addr: SocketAddr = config
            .rpc_bind
            .parse()
            .with_context(|| format!("Invalid rpc_bind address: {}", config.rpc_bind))?;

        let gateway = PersistenceGateway::new(Box::new(FileStore::new(config.data_directory.clone())));
        let restored = gateway.restore(&self.ctx.tracker).await;
        if restored.restored > 0 {
            info!(jobs = restored.restored, resumed = restored.resumed.len(), "Resumed tracking");
        }

        let shutdown = install_shutdown_handler()?;

        let snapshots = {
            let tracker = self.ctx.tracker.clone();
            let interval = Duration::from_secs(config.snapshot_interval_secs);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { gateway.run(tracker, interval, shutdown).await })
        };

        let server = RpcServer::bind(self.ctx.clone(), bind_addr).await?;
        let mut server_task = tokio::spawn(server.run(shutdown.clone()));

        let server_exited = tokio::select! {
            _ = shutdown.cancelled() => false,
            result = &mut server_task => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "RPC server stopped"),
                    Err(e) => warn!(error = %e, "RPC server task panicked"),
                }
                true
            }
        };
        if server_exited {
            shutdown.cancel();
        } else if let Err(e) = server_task.await {
            warn!(error = %e, "RPC server task panicked");
        }

        self.ctx.tracker.shutdown();
        if let Err(e) = snapshots.await {
            warn!(error = %e, "Snapshot task ended abnormally");
        }
        info!("runwatch daemon stopped");
        Ok(())
    }
}

/// Returns a token that is cancelled on SIGTERM or SIGINT.
fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();
    });

    Ok(token)
}
