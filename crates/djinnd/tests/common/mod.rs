//! In-process cluster: controllers sharing one in-memory coordination
//! tree, each with a dry-run supervisor and proxy, reached through the
//! control-plane router.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use djinn_api::{ControlPlane, Operation, control_router};
use djinn_controller::{Djinn, PeerNotifier};
use djinn_core::config::ProxyConfig;
use djinn_core::{DjinnConfig, Secret, SupervisorKind};
use djinn_coord::{ClientConfig, ClusterStore, CoordinationClient, CoordinationTree};
use djinn_proxy::{DryRunController, ProxyGenerator, ProxySync};
use djinn_supervisor::DryRunSupervisor;

pub const SECRET: &str = "integration-secret";

pub struct Cluster {
    pub tree: CoordinationTree,
}

pub struct Member {
    pub djinn: Arc<Djinn>,
    pub router: Router,
    pub supervisor: Arc<DryRunSupervisor>,
    pub proxy_ctl: Arc<DryRunController>,
    _dir: TempDir,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            tree: CoordinationTree::open_in_memory(Duration::from_secs(30)).unwrap(),
        }
    }

    pub fn join(&self, ip: &str) -> Member {
        self.join_with(ip, None)
    }

    pub fn join_with(&self, ip: &str, peers: Option<Arc<dyn PeerNotifier>>) -> Member {
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

        let client = CoordinationClient::new(Arc::new(self.tree.clone()), ip, ClientConfig::for_tests());
        let store = Arc::new(ClusterStore::new(Arc::new(client)));
        let proxy_ctl = Arc::new(DryRunController::new());
        let generator = Arc::new(ProxyGenerator::new(&config.proxy, proxy_ctl.clone()));
        let proxy = Arc::new(ProxySync::new(generator, ip));
        let supervisor = Arc::new(DryRunSupervisor::new());

        let mut djinn = Djinn::new(config, Secret::new(SECRET), store, supervisor.clone(), proxy)
            .with_probe_ports(false);
        if let Some(peers) = peers {
            djinn = djinn.with_peers(peers);
        }
        let djinn = Arc::new(djinn);
        Member {
            router: control_router(ControlPlane::new(djinn.clone())),
            djinn,
            supervisor,
            proxy_ctl,
            _dir: dir,
        }
    }
}

impl Member {
    /// Call `op` with the deployment secret added to `args`.
    pub async fn rpc(&self, op: Operation, mut args: Value) -> String {
        args["secret"] = json!(SECRET);
        self.raw_rpc(op, args).await
    }

    /// Call `op` with exactly `args`.
    pub async fn raw_rpc(&self, op: Operation, args: Value) -> String {
        let req = Request::builder()
            .method("POST")
            .uri(format!("/rpc/{op}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&args).unwrap()))
            .unwrap();
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}

pub fn options() -> Value {
    json!({
        "keyname": "appscale",
        "table": "cassandra",
        "replication": "1",
        "min_machines": "1",
        "max_machines": "3",
        "scaling_cooldown_secs": "0",
    })
}

pub fn single_node_layout() -> Value {
    json!([{
        "public_ip": "203.0.113.1",
        "private_ip": "10.0.0.1",
        "jobs": ["database-master", "load-balancer", "application-host"],
    }])
}

/// Head with everything, one application host, one idle node.
pub fn layout_with_open_node() -> Value {
    json!([
        {
            "public_ip": "203.0.113.1",
            "private_ip": "10.0.0.1",
            "jobs": ["database-master", "load-balancer", "application-host"],
        },
        {
            "public_ip": "203.0.113.2",
            "private_ip": "10.0.0.2",
            "jobs": ["application-host"],
        },
        {
            "public_ip": "203.0.113.3",
            "private_ip": "10.0.0.3",
            "jobs": ["open"],
        },
    ])
}
