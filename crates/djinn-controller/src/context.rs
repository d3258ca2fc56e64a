//! `Djinn` — the controller's process context.
//!
//! One per process. It owns the coordination session (through the
//! `ClusterStore`), the supervisor and proxy adapters, and the cluster
//! snapshot. All mutable cluster state sits behind one coarse mutex:
//! every "apply an update and persist it" sequence holds it from the
//! first read to the last write.
//!
//! Lock order: `runtime`, then `state`, then `routes`. Nothing that
//! holds `state` waits for `runtime`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{info, warn};

use djinn_core::{DjinnConfig, Secret, SupervisorKind};
use djinn_coord::{ClusterStore, WriteOutcome};
use djinn_proxy::{BuiltinService, ProxySync};
use djinn_state::{AppRecord, DeploymentParams, Node, NodeSet, Role};
use djinn_supervisor::ServiceSupervisor;

use crate::error::{ControllerError, ControllerResult};
use crate::phase::Phase;
use crate::provider::{InstanceProvider, NoPeers, PeerNotifier, StaticProvider};
use crate::roles::{RoleEnv, ServiceCatalog};

/// The cluster as this controller last saw it.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub nodes: NodeSet,
    pub params: Option<DeploymentParams>,
    pub apps: BTreeMap<String, AppRecord>,
    /// Stamp of the membership record the node set was built from.
    pub(crate) ips_stamp: Option<u64>,
    pub(crate) last_full_pass: Option<Instant>,
    /// Nodes whose live marker has been seen at least once.
    pub(crate) seen_live: BTreeSet<String>,
    pub(crate) last_scale: HashMap<String, Instant>,
}

/// What this node is actually running. Owned by the reconciliation loop.
#[derive(Debug, Default)]
pub(crate) struct RoleRuntime {
    pub running: BTreeSet<Role>,
    /// Application-server processes started here, as `(app_id, port)`.
    pub instances: BTreeSet<(String, u16)>,
    pub failures: u32,
    pub converged: bool,
}

/// What the proxies were last told, so unchanged routing is not
/// regenerated.
#[derive(Debug, Default)]
pub(crate) struct RouteCache {
    pub apps: BTreeMap<String, AppRecord>,
    pub services: BTreeMap<BuiltinService, Vec<String>>,
}

pub struct Djinn {
    config: DjinnConfig,
    secret: Secret,
    store: Arc<ClusterStore>,
    proxy: Arc<ProxySync>,
    provider: Arc<dyn InstanceProvider>,
    peers: Arc<dyn PeerNotifier>,
    catalog: ServiceCatalog,
    env: RoleEnv,
    state: Mutex<ClusterState>,
    runtime: Mutex<RoleRuntime>,
    routes: Mutex<RouteCache>,
    phase: watch::Sender<Phase>,
    done_loading: AtomicBool,
}

impl Djinn {
    pub fn new(
        config: DjinnConfig,
        secret: Secret,
        store: Arc<ClusterStore>,
        supervisor: Arc<dyn ServiceSupervisor>,
        proxy: Arc<ProxySync>,
    ) -> Self {
        let env = RoleEnv {
            supervisor,
            proxy: proxy.clone(),
            host: config.node.private_ip.clone(),
            probe_ports: config.supervisor.kind == SupervisorKind::Monit,
            port_wait: config.supervisor.port_wait(),
        };
        let (phase, _) = watch::channel(Phase::Initializing);
        Self {
            catalog: ServiceCatalog::new(&config),
            config,
            secret,
            store,
            proxy,
            provider: Arc::new(StaticProvider),
            peers: Arc::new(NoPeers),
            env,
            state: Mutex::new(ClusterState::default()),
            runtime: Mutex::new(RoleRuntime::default()),
            routes: Mutex::new(RouteCache::default()),
            phase,
            done_loading: AtomicBool::new(false),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn InstanceProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerNotifier>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_probe_ports(mut self, probe: bool) -> Self {
        self.env.probe_ports = probe;
        self
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn config(&self) -> &DjinnConfig {
        &self.config
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn proxy(&self) -> &Arc<ProxySync> {
        &self.proxy
    }

    pub fn local_ip(&self) -> &str {
        &self.config.node.private_ip
    }

    pub(crate) fn provider(&self) -> &Arc<dyn InstanceProvider> {
        &self.provider
    }

    pub(crate) fn peers(&self) -> &Arc<dyn PeerNotifier> {
        &self.peers
    }

    pub(crate) fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub(crate) fn env(&self) -> &RoleEnv {
        &self.env
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().await
    }

    pub(crate) async fn lock_runtime(&self) -> MutexGuard<'_, RoleRuntime> {
        self.runtime.lock().await
    }

    pub(crate) async fn lock_routes(&self) -> MutexGuard<'_, RouteCache> {
        self.routes.lock().await
    }

    // ── Phase ──────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            info!(from = %previous, to = %phase, "phase changed");
        }
    }

    pub(crate) fn set_done_loading_flag(&self, done: bool) {
        self.done_loading.store(done, Ordering::SeqCst);
    }

    /// Deployment parameters have been accepted or recovered.
    pub fn is_done_initializing(&self) -> bool {
        self.phase() != Phase::Initializing
    }

    /// Every role assigned to this node has started.
    pub fn is_done_loading(&self) -> bool {
        self.done_loading.load(Ordering::SeqCst)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn role_info(&self) -> Vec<Node> {
        self.state.lock().await.nodes.as_slice().to_vec()
    }

    pub async fn public_ips(&self) -> Vec<String> {
        self.state.lock().await.nodes.public_ips()
    }

    pub async fn running_roles(&self) -> BTreeSet<Role> {
        self.runtime.lock().await.running.clone()
    }

    pub async fn local_node(&self) -> Option<Node> {
        self.state.lock().await.nodes.find_by_ip(self.local_ip()).cloned()
    }

    pub async fn apps(&self) -> BTreeMap<String, AppRecord> {
        self.state.lock().await.apps.clone()
    }

    /// Whether this node is the first node of the layout.
    pub async fn is_head(&self) -> bool {
        is_head_of(&self.state.lock().await.nodes, self.local_ip())
    }

    /// Human-readable summary.
    pub async fn status(&self) -> String {
        let state = self.state.lock().await;
        let roles = state
            .nodes
            .find_by_ip(self.local_ip())
            .map(|n| n.jobs.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", "))
            .unwrap_or_else(|| "none".to_string());
        let mut out = format!("Djinn on {}\n", self.local_ip());
        out.push_str(&format!("  phase: {}\n", self.phase()));
        out.push_str(&format!("  done loading: {}\n", self.is_done_loading()));
        out.push_str(&format!("  roles: {roles}\n"));
        out.push_str(&format!("  nodes: {}\n", state.nodes.len()));
        for app in state.apps.values() {
            out.push_str(&format!(
                "  app {}: {} instance(s), http {} https {}\n",
                app.app_id,
                app.instances.len(),
                app.http_port,
                app.https_port
            ));
        }
        out
    }

    pub async fn database_info(&self) -> ControllerResult<BTreeMap<String, String>> {
        let state = self.state.lock().await;
        let params = state.params.as_ref().ok_or(ControllerError::NotInitialized)?;
        let mut info = BTreeMap::new();
        info.insert("table".to_string(), params.table.clone());
        info.insert("replication".to_string(), params.replication.to_string());
        if let Some(master) = state.nodes.db_master() {
            info.insert("master".to_string(), master.private_ip.clone());
        }
        Ok(info)
    }

    pub async fn properties(&self) -> ControllerResult<BTreeMap<String, String>> {
        let state = self.state.lock().await;
        let params = state.params.as_ref().ok_or(ControllerError::NotInitialized)?;
        Ok(params.properties())
    }

    /// Change one allow-listed parameter and persist the result.
    pub async fn set_property(&self, key: &str, value: &str) -> ControllerResult<()> {
        let mut state = self.state.lock().await;
        let params = state.params.as_mut().ok_or(ControllerError::NotInitialized)?;
        params.set_property(key, value)?;
        if let WriteOutcome::Abandoned = self.store.write_params(params).await? {
            warn!(%key, "parameter change not persisted; kept locally");
        }
        info!(%key, %value, "property changed");
        Ok(())
    }

    pub async fn deployment_id(&self) -> ControllerResult<Option<String>> {
        Ok(self.store.deployment_id().await?)
    }
}

pub(crate) fn is_head_of(nodes: &NodeSet, ip: &str) -> bool {
    nodes
        .head()
        .is_some_and(|h| h.private_ip == ip || h.public_ip == ip)
}
