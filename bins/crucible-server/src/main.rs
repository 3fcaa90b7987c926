mod auth;
mod handlers;
mod routes;

use anyhow::Context;
use crucible_common::config::Config;
use crucible_common::store::JobStore;
use crucible_engine::{DockerRuntime, Supervisor, SupervisorConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct AppState {
    pub store: JobStore,
    pub supervisor: Arc<Supervisor>,
    pub project_label: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Crucible booting...");

    let config = Config::from_env().context("invalid configuration")?;

    let store = JobStore::open(&config.db_path)
        .await
        .context("failed to open job store")?;
    info!(db_path = %config.db_path, "job store ready");

    let runtime = DockerRuntime::connect(config.runtime_socket.as_deref())
        .context("failed to connect to the container runtime")?;
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        Arc::new(runtime),
        SupervisorConfig::from(&config),
    ));

    // Reclaim whatever a previous process left behind before accepting work.
    let removed = supervisor
        .sweep_orphans()
        .await
        .context("startup sweep failed")?;
    if removed > 0 {
        info!(removed, "startup sweep removed stale sandboxes");
    }

    let state = Arc::new(AppState {
        store,
        supervisor,
        project_label: config.project_label.clone(),
    });

    let app = routes::routes().with_state(state);

    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP server listening on {}", addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Received SIGTERM/CTRL+C - initiating graceful shutdown"),
        Err(e) => warn!(error = %e, "failed to install shutdown signal handler"),
    }
}
