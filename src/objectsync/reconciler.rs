//! Periodic comparison of sync points against the control plane's view of the objects.
//!
//! For every record:
//!
//! - node gone from the snapshot: the record is garbage and is deleted;
//! - object gone, or replaced by one with another UID: a delete is sent to the node, or the
//!   record is dropped directly when no delete can be built for it;
//! - object newer than the recorded version: an update carrying the current object is sent.
//!
//! Synthesized messages enter the hub through its inbox like any controller message, so they go
//! through the same dedup and version checks.

use super::store::{StoreError, SyncPointStore};
use super::types::SyncPoint;
use super::version::is_newer;
use crate::bus::ControlPlaneBus;
use crate::message::{build_node_resource, group, operation, source, Message};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default pause between passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Current state of one object on the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    pub uid: String,
    pub resource_version: String,
    /// Full object, sent as the content of synthesized updates.
    pub content: Value,
}

impl ObjectState {
    pub fn new(uid: impl Into<String>, resource_version: impl Into<String>, content: Value) -> Self {
        Self { uid: uid.into(), resource_version: resource_version.into(), content }
    }
}

/// Read-only view of the control plane the reconciler compares against.
pub trait ObjectSnapshot: Send + Sync + fmt::Debug {
    fn node_exists(&self, node_id: &str) -> bool;

    /// Object of `resource_type` named `name` in `namespace` (empty for cluster-scoped).
    fn object(&self, resource_type: &str, namespace: &str, name: &str) -> Option<ObjectState>;
}

type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct SnapshotState {
    nodes: HashSet<String>,
    objects: HashMap<ObjectKey, ObjectState>,
}

/// Snapshot kept in memory and fed by the embedding application. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    state: Arc<RwLock<SnapshotState>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node_id: impl Into<String>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).nodes.insert(node_id.into());
    }

    pub fn remove_node(&self, node_id: &str) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).nodes.remove(node_id);
    }

    pub fn put_object(&self, resource_type: &str, namespace: &str, name: &str, object: ObjectState) {
        let key = (resource_type.to_string(), namespace.to_string(), name.to_string());
        self.state.write().unwrap_or_else(PoisonError::into_inner).objects.insert(key, object);
    }

    pub fn remove_object(&self, resource_type: &str, namespace: &str, name: &str) {
        let key = (resource_type.to_string(), namespace.to_string(), name.to_string());
        self.state.write().unwrap_or_else(PoisonError::into_inner).objects.remove(&key);
    }
}

impl ObjectSnapshot for MemorySnapshot {
    fn node_exists(&self, node_id: &str) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).nodes.contains(node_id)
    }

    fn object(&self, resource_type: &str, namespace: &str, name: &str) -> Option<ObjectState> {
        let key = (resource_type.to_string(), namespace.to_string(), name.to_string());
        self.state.read().unwrap_or_else(PoisonError::into_inner).objects.get(&key).cloned()
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub deletes_sent: usize,
    pub updates_sent: usize,
    pub records_removed: usize,
}

/// Periodic sync-point reconciler.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Arc<dyn SyncPointStore>,
    snapshot: Arc<dyn ObjectSnapshot>,
    bus: ControlPlaneBus,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SyncPointStore>,
        snapshot: Arc<dyn ObjectSnapshot>,
        bus: ControlPlaneBus,
    ) -> Self {
        Self { store, snapshot, bus, interval: DEFAULT_RECONCILE_INTERVAL }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run passes every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.reconcile_once().await {
                Ok(report) => {
                    tracing::debug!(target: "cloudhub::objectsync", ?report, "reconcile pass finished");
                }
                Err(err) => {
                    tracing::error!(target: "cloudhub::objectsync", error = %err, "failed to list sync points");
                }
            }
        }
        tracing::debug!(target: "cloudhub::objectsync", "reconciler stopped");
    }

    /// One pass over every record. Only listing failures abort the pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        for point in self.store.list().await? {
            report.checked += 1;
            self.reconcile_point(&point, &mut report).await;
        }
        Ok(report)
    }

    async fn reconcile_point(&self, point: &SyncPoint, report: &mut ReconcileReport) {
        let node_id = point.node_id();
        if !self.snapshot.node_exists(node_id) {
            tracing::info!(
                target: "cloudhub::objectsync",
                name = %point.name,
                node_id = %node_id,
                "removing sync point of deleted node"
            );
            self.remove(point, report).await;
            return;
        }

        let spec = &point.spec;
        let current = self.snapshot.object(&spec.object_kind, &point.namespace, &spec.object_name);
        match current {
            Some(object) if object.uid == point.object_uid() => {
                if is_newer(&object.resource_version, point.object_resource_version()) {
                    let msg = Self::update_message(point, &object);
                    if self.send(msg).await {
                        report.updates_sent += 1;
                    }
                }
            }
            _ => match Self::delete_message(point) {
                Some(msg) => {
                    if self.send(msg).await {
                        report.deletes_sent += 1;
                    }
                }
                None => self.remove(point, report).await,
            },
        }
    }

    async fn send(&self, msg: Message) -> bool {
        let id = msg.id().to_string();
        match self.bus.send_to_hub(msg).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target: "cloudhub::objectsync", message_id = %id, error = %err, "failed to queue reconcile message");
                false
            }
        }
    }

    async fn remove(&self, point: &SyncPoint, report: &mut ReconcileReport) {
        match self.store.delete(&point.key()).await {
            Ok(()) => report.records_removed += 1,
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                tracing::warn!(target: "cloudhub::objectsync", name = %point.name, error = %err, "failed to delete sync point");
            }
        }
    }

    fn resource(point: &SyncPoint) -> Option<String> {
        let spec = &point.spec;
        if spec.object_kind.is_empty() || spec.object_name.is_empty() || point.object_uid().is_empty() {
            return None;
        }
        Some(build_node_resource(point.node_id(), &point.namespace, &spec.object_kind, &spec.object_name))
    }

    /// Delete for the object `point` tracks, or `None` when the record lacks what a delete needs.
    fn delete_message(point: &SyncPoint) -> Option<Message> {
        let resource = Self::resource(point)?;
        let content = json!({
            "metadata": {
                "uid": point.object_uid(),
                "name": point.spec.object_name,
                "namespace": point.namespace,
            }
        });
        Some(
            Message::new()
                .with_route(source::EDGE_CONTROLLER, group::RESOURCE, resource, operation::DELETE)
                .with_content(content),
        )
    }

    fn update_message(point: &SyncPoint, object: &ObjectState) -> Message {
        let resource = Self::resource(point).unwrap_or_default();
        Message::new()
            .with_route(source::EDGE_CONTROLLER, group::RESOURCE, resource, operation::UPDATE)
            .with_resource_version(object.resource_version.clone())
            .with_content(object.content.clone())
    }
}
