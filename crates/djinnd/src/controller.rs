//! Controller mode — one Djinn controller per node.
//!
//! In this mode, the daemon:
//! 1. Validates the configuration and loads the deployment secret
//! 2. Binds the control-plane port
//! 3. Connects to the coordination store, embedding one when no
//!    endpoints are configured
//! 4. Builds the supervisor and proxy adapters and the controller context
//! 5. Serves the control plane over HTTP
//! 6. Runs the reconciliation loop until shutdown or a fatal error
//!
//! Failures before the loop starts leave a crash record behind, as do
//! fatal failures inside it.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use djinn_api::{ControlPlane, PeerClient, control_router};
use djinn_controller::{CrashRecord, Djinn, Phase};
use djinn_core::{DjinnConfig, Secret};
use djinn_coord::{ClientConfig, ClusterStore, CoordinationClient, CoordinationTree};
use djinn_coord::{coordination_router, run_reaper};
use djinn_proxy::{ProxyGenerator, ProxySync};

pub async fn run(config: DjinnConfig) -> anyhow::Result<()> {
    let crash_path = config.reconcile.crash_record_path.clone();
    let node = config.node.private_ip.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let parts = match assemble(config, shutdown_rx.clone()).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "controller failed to start");
            leave_crash_record(&crash_path, &node, &e);
            return Err(e);
        }
    };
    let djinn = parts.djinn.clone();

    // ── Control plane ──────────────────────────────────────────────
    let listener = parts.listener;
    let router = control_router(ControlPlane::new(djinn.clone()));
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // ── Reconciliation loop ────────────────────────────────────────
    let loop_djinn = djinn.clone();
    let loop_shutdown = shutdown_rx.clone();
    let mut reconcile = tokio::spawn(async move { loop_djinn.run(loop_shutdown).await });

    let outcome = tokio::select! {
        result = &mut reconcile => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            reconcile.await
        }
    };
    let _ = shutdown_tx.send(true);

    let _ = server.await;
    for task in parts.background {
        let _ = task.await;
    }
    if let Err(e) = djinn.store().client().close().await {
        error!(error = %e, "closing the coordination session failed");
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Djinn controller stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow::anyhow!("controller gave up: {e}")),
        Err(e) => Err(anyhow::anyhow!("reconciliation task panicked: {e}")),
    }
}

/// Record a startup failure where operators and the next start look.
pub fn leave_crash_record(path: &Path, node: &str, failure: &anyhow::Error) {
    let record = CrashRecord::new(node, &format!("{failure:#}"), Phase::Initializing);
    if let Err(e) = record.write(path) {
        error!(error = %e, path = %path.display(), "could not leave a crash record");
    }
}

struct Parts {
    djinn: Arc<Djinn>,
    listener: TcpListener,
    background: Vec<tokio::task::JoinHandle<()>>,
}

async fn assemble(config: DjinnConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<Parts> {
    if config.node.private_ip.is_empty() || config.node.public_ip.is_empty() {
        anyhow::bail!("node private_ip and public_ip must be set");
    }
    config.validate()?;
    let secret = match &config.node.secret {
        Some(raw) => Secret::new(raw.clone()),
        None => Secret::load(&config.node.secret_path)
            .with_context(|| format!("reading secret {}", config.node.secret_path.display()))?,
    };
    info!(fingerprint = %secret.fingerprint(), "deployment secret loaded");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.control.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control plane on {addr}"))?;
    info!(%addr, node = %config.node.private_ip, "control plane listening");

    let mut background = Vec::new();
    let client_config = ClientConfig::from_config(&config.coordination);
    let identity = config.node.private_ip.as_str();
    let client = if config.coordination.endpoints.is_empty() {
        let tree = open_embedded(&config)?;
        background.extend(serve_embedded(&config, tree.clone(), shutdown.clone()).await?);
        CoordinationClient::new(Arc::new(tree), identity, client_config)
    } else {
        CoordinationClient::connect_remote(config.coordination_endpoints(), identity, client_config)
            .await
            .context("connecting to the coordination service")?
    };
    let store = Arc::new(ClusterStore::new(Arc::new(client)));

    let supervisor = djinn_supervisor::from_config(&config.supervisor);
    let generator = Arc::new(ProxyGenerator::new(
        &config.proxy,
        djinn_proxy::controller_from_config(&config.proxy),
    ));
    let proxy = Arc::new(
        ProxySync::new(generator, &config.node.private_ip).with_ssl(
            config.proxy.ssl_certificate.clone(),
            config.proxy.ssl_certificate_key.clone(),
        ),
    );
    let peers = Arc::new(PeerClient::from_config(&config, secret.clone()));

    let djinn = Djinn::new(config, secret, store, supervisor, proxy).with_peers(peers);
    Ok(Parts {
        djinn: Arc::new(djinn),
        listener,
        background,
    })
}

fn open_embedded(config: &DjinnConfig) -> anyhow::Result<CoordinationTree> {
    let dir = &config.coordination.data_dir;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("coordination.redb");
    let tree = CoordinationTree::open(&path, config.coordination.session_timeout())?;
    info!(path = ?path, "embedded coordination store opened");
    Ok(tree)
}

/// Serve the embedded tree so peers configured with this node as their
/// coordination endpoint can reach it.
async fn serve_embedded(
    config: &DjinnConfig,
    tree: CoordinationTree,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.coordination.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding coordination server on {addr}"))?;
    info!(%addr, "embedded coordination server listening");

    let reaper_every = config.coordination.session_timeout() / 2;
    let reaper = tokio::spawn(run_reaper(tree.clone(), reaper_every, shutdown.clone()));

    let mut stop = shutdown;
    let server = tokio::spawn(async move {
        let served = axum::serve(listener, coordination_router(tree))
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|s| *s).await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "embedded coordination server failed");
        }
    });
    Ok(vec![reaper, server])
}
