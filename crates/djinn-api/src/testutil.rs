//! A controller with in-memory collaborators behind a control plane.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use djinn_core::config::ProxyConfig;
use djinn_core::{DjinnConfig, Secret, SupervisorKind};
use djinn_controller::Djinn;
use djinn_coord::{ClientConfig, ClusterStore, CoordinationClient, CoordinationTree};
use djinn_proxy::{DryRunController, ProxyGenerator, ProxySync};
use djinn_supervisor::DryRunSupervisor;

use crate::plane::ControlPlane;

pub const SECRET: &str = "test-secret";

pub fn node(ip: &str) -> (TempDir, ControlPlane) {
    let tree = CoordinationTree::open_in_memory(Duration::from_secs(30)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let public = ip.replacen("10.0.0.", "203.0.113.", 1);
    let mut config = DjinnConfig::for_node(ip, &public);
    config.supervisor.kind = SupervisorKind::DryRun;
    config.reconcile.crash_record_path = dir.path().join("crash.json");
    config.proxy = ProxyConfig {
        haproxy_dir: dir.path().join("haproxy"),
        nginx_dir: dir.path().join("nginx"),
        reload_cooldown_ms: 1,
        dry_run: true,
        ..ProxyConfig::default()
    };

    let client = CoordinationClient::new(Arc::new(tree), ip, ClientConfig::for_tests());
    let store = Arc::new(ClusterStore::new(Arc::new(client)));
    let generator = Arc::new(ProxyGenerator::new(&config.proxy, Arc::new(DryRunController::new())));
    let proxy = Arc::new(ProxySync::new(generator, ip));
    let djinn = Djinn::new(
        config,
        Secret::new(SECRET),
        store,
        Arc::new(DryRunSupervisor::new()),
        proxy,
    )
    .with_probe_ports(false);
    (dir, ControlPlane::new(Arc::new(djinn)))
}

pub fn layout_one() -> Value {
    json!([{
        "public_ip": "203.0.113.1",
        "private_ip": "10.0.0.1",
        "jobs": ["database-master", "load-balancer", "application-host"],
    }])
}

pub fn options() -> Value {
    json!({
        "keyname": "appscale",
        "table": "cassandra",
        "replication": "1",
        "min_machines": "1",
        "max_machines": "3",
    })
}
