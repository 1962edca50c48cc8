mod common;

use cloudhub::message::operation;
use cloudhub::objectsync::{MemorySnapshot, ObjectState};
use cloudhub::{CloudHub, MemorySyncStore, Telemetry};
use common::test_helpers::{config, confirmed_version, connect, eventually, pod_key, seed};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn web(rv: &str) -> ObjectState {
    ObjectState::new("u1", rv, json!({"metadata": {"uid": "u1", "name": "web", "namespace": "default"}}))
}

fn hub_with(store: &MemorySyncStore, snapshot: &MemorySnapshot) -> CloudHub {
    let hub = CloudHub::builder(config())
        .store(Arc::new(store.clone()))
        .snapshot(Arc::new(snapshot.clone()))
        .telemetry(Telemetry::null())
        .build()
        .unwrap();
    hub.start();
    hub
}

#[tokio::test(start_paused = true)]
async fn drifted_object_is_resent() {
    let store = MemorySyncStore::new();
    seed(&store, "n1", "1").await;
    let snapshot = MemorySnapshot::new();
    snapshot.add_node("n1");
    snapshot.put_object("pod", "default", "web", web("4"));
    let hub = hub_with(&store, &snapshot);
    let mut node = connect(&hub, "n1").await;

    let seen = node.edge.recv().await.unwrap();
    assert_eq!(seen.operation(), operation::UPDATE);
    assert_eq!(seen.resource_version(), "4");
    assert_eq!(seen.resource(), "default/pod/web");
    node.edge.ack(&seen).unwrap();
    eventually(|| confirmed_version(&store, "n1").as_deref() == Some("4")).await;

    // in sync: later passes send nothing
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(node.edge.try_recv().is_none());
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn vanished_object_is_deleted_on_the_node() {
    let store = MemorySyncStore::new();
    seed(&store, "n1", "3").await;
    let snapshot = MemorySnapshot::new();
    snapshot.add_node("n1");
    let hub = hub_with(&store, &snapshot);
    let mut node = connect(&hub, "n1").await;

    let seen = node.edge.recv().await.unwrap();
    assert_eq!(seen.operation(), operation::DELETE);
    assert_eq!(seen.resource(), "default/pod/web");
    node.edge.ack(&seen).unwrap();
    eventually(|| store.peek(&pod_key("n1")).is_none()).await;
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn records_of_removed_nodes_are_collected() {
    let store = MemorySyncStore::new();
    seed(&store, "gone", "3").await;
    seed(&store, "n1", "3").await;
    let snapshot = MemorySnapshot::new();
    snapshot.add_node("n1");
    snapshot.put_object("pod", "default", "web", web("3"));
    let hub = hub_with(&store, &snapshot);

    eventually(|| store.peek(&pod_key("gone")).is_none()).await;
    assert_eq!(confirmed_version(&store, "n1").as_deref(), Some("3"));
    assert!(hub.dispatcher().pools().get("gone").is_none());
    hub.shutdown().await;
}
