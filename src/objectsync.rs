//! Sync points: the per-(node, object) record of the last resource version a node confirmed.
//!
//! [`SyncPoints`] is what the rest of the hub talks to. The dispatcher asks it whether a
//! message moves a node forward ([`SyncPoints::admit`]); the ack sender tells it what a node
//! confirmed ([`SyncPoints::save_delivered`]). The [`reconciler`] walks every record
//! periodically and resends what drifted.
//!
//! Records live behind the [`SyncPointStore`] trait. [`MemorySyncStore`] ships with the crate;
//! an etcd-backed store is available with the `etcd` feature.

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod version;

pub use memory::MemorySyncStore;
pub use reconciler::{MemorySnapshot, ObjectSnapshot, ObjectState, ReconcileReport, Reconciler};
pub use store::{StoreError, SyncPointStore};
pub use types::{
    node_from_sync_point_name, sync_point_name, uid_from_sync_point_name, SyncPoint, SyncPointKey,
    SyncPointKind, SyncPointSpec, SyncPointStatus, API_VERSION,
};
pub use version::{compare_resource_version, is_newer};

use crate::message::{group, operation, Message};
use crate::telemetry::{HubEvent, Telemetry};
use std::sync::Arc;

/// Version a freshly seeded record starts from.
pub const INITIAL_RESOURCE_VERSION: &str = "0";

/// Record key for the object `msg` carries, as seen by `node_id`.
pub fn key_for(node_id: &str, msg: &Message) -> Option<SyncPointKey> {
    let uid = msg.object_uid()?;
    let namespace = msg.node_resource().map(|r| r.namespace).unwrap_or_default();
    Some(SyncPointKey::new(namespace, sync_point_name(node_id, uid)))
}

/// Spec naming the object `msg` carries. The kind is the resource type segment.
pub fn spec_for(msg: &Message) -> SyncPointSpec {
    let resource = msg.node_resource();
    SyncPointSpec {
        object_api_version: msg.object_api_version().unwrap_or_default().to_string(),
        object_kind: resource.map(|r| r.resource_type).unwrap_or_default().to_string(),
        object_name: resource.map(|r| r.name).unwrap_or_default().to_string(),
    }
}

/// Sync-point operations used on the delivery path.
#[derive(Debug, Clone)]
pub struct SyncPoints {
    store: Arc<dyn SyncPointStore>,
    telemetry: Telemetry,
}

impl SyncPoints {
    pub fn new(store: Arc<dyn SyncPointStore>) -> Self {
        Self { store, telemetry: Telemetry::null() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncPointStore> {
        &self.store
    }

    /// Whether `msg` carries a version `node_id` has not confirmed yet. A record without a
    /// confirmed version counts as version `"0"`.
    ///
    /// With no record, one is seeded at version `"0"` and the message is admitted. A failure to
    /// set the seed's status is logged and does not block the message.
    pub async fn admit(&self, node_id: &str, msg: &Message) -> Result<bool, StoreError> {
        let Some(key) = key_for(node_id, msg) else {
            return Ok(true);
        };
        match self.store.get(&key).await {
            Ok(point) => Ok(is_newer(msg.resource_version(), point.object_resource_version())),
            Err(err) if err.is_not_found() => {
                let mut point = self.store.create(SyncPoint::new(key, spec_for(msg))).await?;
                point.status.object_resource_version = INITIAL_RESOURCE_VERSION.to_string();
                if let Err(err) = self.store.update_status(&point).await {
                    tracing::warn!(
                        target: "cloudhub::objectsync",
                        node_id = %node_id,
                        name = %point.name,
                        error = %err,
                        "failed to seed sync point status"
                    );
                }
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Record that `node_id` confirmed `msg`.
    ///
    /// Deletes remove the record, tolerating its absence. Anything else moves the record's
    /// status to the message's version, creating the record first if needed. Only messages of
    /// the resource group carrying an object UID are tracked.
    pub async fn save_delivered(&self, node_id: &str, msg: &Message) -> Result<(), StoreError> {
        if msg.group() != group::RESOURCE {
            return Ok(());
        }
        let Some(key) = key_for(node_id, msg) else {
            return Ok(());
        };

        if msg.operation() == operation::DELETE {
            match self.store.delete(&key).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            self.telemetry
                .emit(HubEvent::SyncPointDeleted { node_id: node_id.to_string(), name: key.name })
                .await;
            return Ok(());
        }

        let mut point = match self.store.get(&key).await {
            Ok(point) => point,
            Err(err) if err.is_not_found() => {
                let spec = spec_for(msg);
                if spec.object_kind.is_empty() {
                    return Err(StoreError::Invalid(format!(
                        "cannot derive object kind from {:?}",
                        msg.resource()
                    )));
                }
                self.store.create(SyncPoint::new(key, spec)).await?
            }
            Err(err) => return Err(err),
        };
        point.status.object_resource_version = msg.resource_version().to_string();
        let saved = self.store.update_status(&point).await?;
        tracing::debug!(
            target: "cloudhub::objectsync",
            node_id = %node_id,
            name = %saved.name,
            resource_version = %msg.resource_version(),
            "sync point saved"
        );
        self.telemetry
            .emit(HubEvent::SyncPointSaved {
                node_id: node_id.to_string(),
                name: saved.name,
                resource_version: msg.resource_version().to_string(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::source;
    use crate::telemetry::MemorySink;
    use serde_json::json;

    fn pod(rv: &str) -> Message {
        Message::new()
            .with_route(source::EDGE_CONTROLLER, group::RESOURCE, "node/n1/default/pod/web", operation::UPDATE)
            .with_resource_version(rv)
            .with_content(json!({"apiVersion": "v1", "metadata": {"uid": "u1", "name": "web"}}))
    }

    fn key() -> SyncPointKey {
        SyncPointKey::new("default", "n1.u1")
    }

    #[test]
    fn key_and_spec_follow_resource_path() {
        let msg = pod("3");
        assert_eq!(key_for("n1", &msg), Some(key()));
        let spec = spec_for(&msg);
        assert_eq!(spec.object_kind, "pod");
        assert_eq!(spec.object_name, "web");
        assert_eq!(spec.object_api_version, "v1");

        let pv = Message::new()
            .with_route("", group::RESOURCE, "node/n1//persistentvolume/pv1", operation::UPDATE)
            .with_content(json!({"metadata": {"uid": "u9"}}));
        assert_eq!(key_for("n1", &pv).map(|k| k.kind()), Some(SyncPointKind::ClusterObjectSync));
    }

    #[tokio::test]
    async fn admit_seeds_missing_record_at_zero() {
        let store = MemorySyncStore::new();
        let points = SyncPoints::new(Arc::new(store.clone()));
        assert!(points.admit("n1", &pod("1")).await.unwrap());
        assert_eq!(store.peek(&key()).unwrap().object_resource_version(), "0");
    }

    #[tokio::test]
    async fn admit_compares_numerically() {
        let store = MemorySyncStore::new();
        let points = SyncPoints::new(Arc::new(store.clone()));
        points.save_delivered("n1", &pod("5")).await.unwrap();
        assert!(!points.admit("n1", &pod("3")).await.unwrap());
        assert!(!points.admit("n1", &pod("5")).await.unwrap());
        assert!(points.admit("n1", &pod("10")).await.unwrap());
    }

    #[tokio::test]
    async fn admit_propagates_backend_errors() {
        let store = MemorySyncStore::new();
        store.set_failure(Some("unavailable"));
        let points = SyncPoints::new(Arc::new(store));
        assert!(matches!(points.admit("n1", &pod("1")).await, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn save_then_delete() {
        let store = MemorySyncStore::new();
        let sink = MemorySink::new();
        let points =
            SyncPoints::new(Arc::new(store.clone())).with_telemetry(Telemetry::new(sink.clone()));
        points.save_delivered("n1", &pod("4")).await.unwrap();
        assert_eq!(store.peek(&key()).unwrap().object_resource_version(), "4");

        let mut delete = pod("");
        delete.route.operation = operation::DELETE.into();
        points.save_delivered("n1", &delete).await.unwrap();
        assert!(store.peek(&key()).is_none());
        // absent record on delete is fine
        points.save_delivered("n1", &delete).await.unwrap();

        let events = sink.events();
        assert!(matches!(&events[0], HubEvent::SyncPointSaved { resource_version, .. } if resource_version == "4"));
        assert!(matches!(&events[1], HubEvent::SyncPointDeleted { name, .. } if name == "n1.u1"));
    }

    #[tokio::test]
    async fn save_skips_other_groups() {
        let store = MemorySyncStore::new();
        let points = SyncPoints::new(Arc::new(store.clone()));
        let mut twin = pod("2");
        twin.route.group = group::TWIN.into();
        points.save_delivered("n1", &twin).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_without_kind_fails() {
        let store = MemorySyncStore::new();
        let points = SyncPoints::new(Arc::new(store.clone()));
        let msg = Message::new()
            .with_route("", group::RESOURCE, "node/n1", operation::UPDATE)
            .with_resource_version("2")
            .with_content(json!({"metadata": {"uid": "u1"}}));
        assert!(matches!(points.save_delivered("n1", &msg).await, Err(StoreError::Invalid(_))));
        assert!(store.is_empty());
    }
}
