//! End-to-end deployment scenarios driven through the control plane.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use djinn_api::{Operation, PeerClient};
use djinn_controller::{PassOutcome, PeerNotifier, ScaleAction};
use djinn_core::Secret;
use djinn_state::Role;

use common::{Cluster, SECRET, layout_with_open_node, options, single_node_layout};

#[tokio::test]
async fn single_node_deployment_comes_up() {
    let cluster = Cluster::new();
    let node = cluster.join("10.0.0.1");

    let reply = node
        .rpc(
            Operation::SetParameters,
            json!({"layout": single_node_layout(), "options": options()}),
        )
        .await;
    assert_eq!(reply, "OK");

    let info: Value = serde_json::from_str(&node.rpc(Operation::GetRoleInfo, json!({})).await).unwrap();
    let nodes = info.as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(
        nodes[0]["jobs"],
        json!(["database-master", "load-balancer", "application-host"])
    );

    assert_eq!(node.rpc(Operation::IsDoneInitializing, json!({})).await, "true");
    assert_eq!(node.rpc(Operation::IsDoneLoading, json!({})).await, "false");

    let outcome = node.djinn.reconcile_once().await.unwrap();
    assert!(matches!(outcome, PassOutcome::Converged { .. }));
    assert_eq!(node.rpc(Operation::IsDoneLoading, json!({})).await, "true");
    assert!(node.rpc(Operation::Status, json!({})).await.contains("database-master"));
}

#[tokio::test]
async fn relocating_onto_a_taken_port_fails_without_changes() {
    let cluster = Cluster::new();
    let node = cluster.join("10.0.0.1");
    node.rpc(
        Operation::SetParameters,
        json!({"layout": single_node_layout(), "options": options()}),
    )
    .await;

    let start = |app: &str| json!({"app_id": app, "language": "python27", "threadsafe": true});
    node.rpc(Operation::StartApp, start("other")).await;
    let moved = node
        .rpc(
            Operation::RelocateApp,
            json!({"app_id": "other", "http_port": 80, "https_port": 443}),
        )
        .await;
    assert_eq!(moved, "OK");

    node.rpc(Operation::StartApp, start("myapp")).await;
    let before = node.djinn.store().read_app("myapp").await.unwrap().unwrap();

    let reply = node
        .rpc(
            Operation::RelocateApp,
            json!({"app_id": "myapp", "http_port": 80, "https_port": 4380}),
        )
        .await;
    assert!(reply.contains("port is already in use"), "got {reply}");

    let after = node.djinn.store().read_app("myapp").await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(node.djinn.apps().await["myapp"], before);
}

#[tokio::test]
async fn two_scale_up_requests_claim_one_open_node() {
    let cluster = Cluster::new();
    let head = cluster.join("10.0.0.1");
    head.rpc(
        Operation::SetParameters,
        json!({"layout": layout_with_open_node(), "options": options()}),
    )
    .await;
    head.rpc(
        Operation::StartApp,
        json!({"app_id": "guestbook", "language": "python27"}),
    )
    .await;

    for _ in 0..2 {
        let id = head
            .rpc(
                Operation::RequestScaling,
                json!({"app_id": "guestbook", "direction": "up"}),
            )
            .await;
        assert!(!id.starts_with("Error"), "got {id}");
    }

    let generator = head.djinn.proxy().generator().clone();
    let before = generator.regeneration_count();
    let actions = head.djinn.scaling_pass().await.unwrap();
    assert_eq!(actions.len(), 1);
    let ScaleAction::Added { host, new_role, .. } = &actions[0] else {
        panic!("expected an instance to be added, got {actions:?}");
    };
    assert_eq!(host, "10.0.0.3");
    assert!(new_role);
    assert_eq!(generator.regeneration_count() - before, 1);

    let info: Value = serde_json::from_str(&head.rpc(Operation::GetRoleInfo, json!({})).await).unwrap();
    let spare = info
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["private_ip"] == "10.0.0.3")
        .unwrap();
    assert!(
        spare["jobs"]
            .as_array()
            .unwrap()
            .contains(&json!("application-host"))
    );

    // The requests were consumed.
    assert!(head.djinn.scaling_pass().await.unwrap().is_empty());
}

#[tokio::test]
async fn peer_adopts_the_layout_from_the_store() {
    let cluster = Cluster::new();
    let head = cluster.join("10.0.0.1");
    let peer = cluster.join("10.0.0.2");
    head.rpc(
        Operation::SetParameters,
        json!({"layout": layout_with_open_node(), "options": options()}),
    )
    .await;

    assert_eq!(peer.rpc(Operation::IsDoneInitializing, json!({})).await, "false");
    let outcome = peer.djinn.reconcile_once().await.unwrap();
    assert!(matches!(outcome, PassOutcome::Converged { .. }));
    assert_eq!(peer.rpc(Operation::IsDoneInitializing, json!({})).await, "true");
    assert!(peer.djinn.running_roles().await.contains(&Role::ApplicationHost));

    let ips: Vec<String> =
        serde_json::from_str(&peer.rpc(Operation::GetAllPublicIps, json!({})).await).unwrap();
    assert_eq!(ips.len(), 3);
}

#[tokio::test]
async fn head_pushes_parameters_to_peers_over_http() {
    let listener = tokio::net::TcpListener::bind("127.0.0.2:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let cluster = Cluster::new();
    let peer = cluster.join("127.0.0.2");
    let router = peer.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client: Arc<dyn PeerNotifier> =
        Arc::new(PeerClient::new(Secret::new(SECRET), port, Duration::from_secs(2)));
    let head = cluster.join_with("127.0.0.1", Some(client));
    let layout = json!([
        {
            "public_ip": "192.0.2.1",
            "private_ip": "127.0.0.1",
            "jobs": ["database-master", "load-balancer", "shadow"],
        },
        {
            "public_ip": "192.0.2.2",
            "private_ip": "127.0.0.2",
            "jobs": ["application-host"],
        },
    ]);
    let reply = head
        .rpc(Operation::SetParameters, json!({"layout": layout, "options": options()}))
        .await;
    assert_eq!(reply, "OK");

    let mut initialized = false;
    for _ in 0..100 {
        if peer.djinn.is_done_initializing() {
            initialized = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(initialized, "peer never received the parameters");
    assert_eq!(peer.djinn.role_info().await.len(), 2);
}
