//! Shared fixtures: controllers wired to an in-memory coordination tree,
//! a dry-run supervisor and a dry-run proxy controller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

use djinn_core::config::ProxyConfig;
use djinn_core::{DjinnConfig, Secret, SupervisorKind};
use djinn_coord::{ClientConfig, ClusterStore, CoordinationClient, CoordinationTree};
use djinn_proxy::{DryRunController, ProxyGenerator, ProxySync};
use djinn_supervisor::DryRunSupervisor;

use crate::context::Djinn;

pub const SECRET: &str = "test-secret";

pub struct Harness {
    pub dir: TempDir,
    pub tree: CoordinationTree,
    pub djinn: Arc<Djinn>,
    pub sup: Arc<DryRunSupervisor>,
    pub proxy_ctl: Arc<DryRunController>,
    ip: String,
    tweak: Arc<dyn Fn(&mut DjinnConfig) + Send + Sync>,
}

impl Harness {
    pub fn new(ip: &str) -> Self {
        Self::configured(ip, |_| {})
    }

    /// Like [`Self::new`], with `tweak` applied to the node's configuration.
    pub fn configured(ip: &str, tweak: impl Fn(&mut DjinnConfig) + Send + Sync + 'static) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tree = CoordinationTree::open_in_memory(Duration::from_secs(30)).unwrap();
        let sup = Arc::new(DryRunSupervisor::new());
        let proxy_ctl = Arc::new(DryRunController::new());
        let tweak: Arc<dyn Fn(&mut DjinnConfig) + Send + Sync> = Arc::new(tweak);
        let djinn = Arc::new(build(&dir, &tree, ip, sup.clone(), proxy_ctl.clone(), &*tweak));
        Self {
            dir,
            tree,
            djinn,
            sup,
            proxy_ctl,
            ip: ip.to_string(),
            tweak,
        }
    }

    /// A fresh controller process for the same node: same store, same
    /// running services, nothing in memory.
    pub fn restart(&self) -> Djinn {
        build(
            &self.dir,
            &self.tree,
            &self.ip,
            self.sup.clone(),
            self.proxy_ctl.clone(),
            &*self.tweak,
        )
    }

    /// Another node sharing the coordination tree.
    pub fn peer(&self, ip: &str) -> (Arc<Djinn>, Arc<DryRunSupervisor>) {
        let sup = Arc::new(DryRunSupervisor::new());
        let djinn = build(
            &self.dir,
            &self.tree,
            ip,
            sup.clone(),
            Arc::new(DryRunController::new()),
            &*self.tweak,
        );
        (Arc::new(djinn), sup)
    }
}

pub fn config(dir: &TempDir, ip: &str) -> DjinnConfig {
    let public = ip.replacen("10.0.0.", "203.0.113.", 1);
    let mut config = DjinnConfig::for_node(ip, &public);
    config.supervisor.kind = SupervisorKind::DryRun;
    config.reconcile.max_consecutive_failures = 3;
    config.reconcile.crash_record_path = dir.path().join(ip).join("crash.json");
    config.proxy = ProxyConfig {
        haproxy_dir: dir.path().join(ip).join("haproxy"),
        nginx_dir: dir.path().join(ip).join("nginx"),
        reload_cooldown_ms: 1,
        dry_run: true,
        ..ProxyConfig::default()
    };
    config
}

fn build(
    dir: &TempDir,
    tree: &CoordinationTree,
    ip: &str,
    sup: Arc<DryRunSupervisor>,
    proxy_ctl: Arc<DryRunController>,
    tweak: &(dyn Fn(&mut DjinnConfig) + Send + Sync),
) -> Djinn {
    let mut config = config(dir, ip);
    tweak(&mut config);
    let client = CoordinationClient::new(Arc::new(tree.clone()), ip, ClientConfig::for_tests());
    let store = Arc::new(ClusterStore::new(Arc::new(client)));
    let generator = Arc::new(ProxyGenerator::new(&config.proxy, proxy_ctl));
    let proxy = Arc::new(ProxySync::new(generator, ip));
    Djinn::new(config, Secret::new(SECRET), store, sup, proxy).with_probe_ports(false)
}

/// One node holding the database master, the load balancer and the
/// application host.
pub fn layout_one() -> Value {
    json!([{
        "public_ip": "203.0.113.1",
        "private_ip": "10.0.0.1",
        "jobs": ["database-master", "load-balancer", "application-host"],
    }])
}

/// Head with the database and load balancer, two application hosts.
pub fn layout_three() -> Value {
    json!([
        {
            "public_ip": "203.0.113.1",
            "private_ip": "10.0.0.1",
            "jobs": ["database-master", "load-balancer", "shadow"],
        },
        {
            "public_ip": "203.0.113.2",
            "private_ip": "10.0.0.2",
            "jobs": ["application-host"],
        },
        {
            "public_ip": "203.0.113.3",
            "private_ip": "10.0.0.3",
            "jobs": ["application-host"],
        },
    ])
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
