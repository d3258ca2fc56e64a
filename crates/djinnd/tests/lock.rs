//! The deployment lock between controllers sharing a coordination store.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;

use djinn_api::Operation;
use djinn_coord::LockAcquisition;
use djinn_coord::lock::DEFAULT_LOCK_PATH;

use common::{Cluster, layout_with_open_node, options};

#[tokio::test]
async fn scaling_waits_for_another_controllers_lock() {
    let cluster = Cluster::new();
    let head = cluster.join("10.0.0.1");
    let other = cluster.join("10.0.0.2");
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
    head.rpc(
        Operation::RequestScaling,
        json!({"app_id": "guestbook", "direction": "up"}),
    )
    .await;

    let other_client = other.djinn.store().client().clone();
    assert_eq!(
        other_client.acquire_lock().await.unwrap(),
        LockAcquisition::Acquired
    );

    let (done_tx, mut done_rx) = oneshot::channel();
    let djinn = head.djinn.clone();
    let pass = tokio::spawn(async move {
        let actions = djinn.scaling_pass().await;
        let _ = done_tx.send(());
        actions
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(done_rx.try_recv().is_err(), "scaling ran while the lock was held elsewhere");

    other_client.release_lock().await.unwrap();
    let actions = pass.await.unwrap().unwrap();
    assert_eq!(actions.len(), 1);

    // Released again once the pass is over.
    assert!(!other_client.exists(DEFAULT_LOCK_PATH).await.unwrap());
}

#[tokio::test]
async fn lock_is_released_when_the_holders_session_ends() {
    let cluster = Cluster::new();
    let a = cluster.join("10.0.0.1");
    let b = cluster.join("10.0.0.2");

    let a_client = a.djinn.store().client().clone();
    let b_client = b.djinn.store().client().clone();
    assert_eq!(a_client.acquire_lock().await.unwrap(), LockAcquisition::Acquired);

    let waiter = tokio::spawn(async move { b_client.acquire_lock().await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    a_client.close().await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), LockAcquisition::Acquired);
}
