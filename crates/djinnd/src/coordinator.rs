//! Coordinator mode — a standalone coordination server.
//!
//! Serves a redb-backed tree over HTTP and expires sessions whose
//! holders stopped sending keepalives.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use djinn_coord::{CoordinationTree, coordination_router, run_reaper};
use djinn_core::DjinnConfig;

pub async fn run(config: DjinnConfig) -> anyhow::Result<()> {
    let coord = &config.coordination;
    info!("Djinn coordination server starting");

    std::fs::create_dir_all(&coord.data_dir)
        .with_context(|| format!("creating {}", coord.data_dir.display()))?;
    let path = coord.data_dir.join("coordination.redb");
    let tree = CoordinationTree::open(&path, coord.session_timeout())?;
    info!(path = ?path, "coordination store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(run_reaper(
        tree.clone(),
        coord.session_timeout() / 2,
        shutdown_rx,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], coord.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "coordination server listening");

    axum::serve(listener, coordination_router(tree))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = reaper.await;
    info!("Djinn coordination server stopped");
    Ok(())
}
