//! Sync-point records.

use serde::{Deserialize, Serialize};

/// API group/version of both record kinds.
pub const API_VERSION: &str = "reliablesyncs.kubeedge.io/v1alpha1";

/// Namespaced or cluster-scoped record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPointKind {
    ObjectSync,
    ClusterObjectSync,
}

impl SyncPointKind {
    /// Kind used for an object living in `namespace`.
    pub fn for_namespace(namespace: &str) -> Self {
        if namespace.is_empty() {
            Self::ClusterObjectSync
        } else {
            Self::ObjectSync
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectSync => "ObjectSync",
            Self::ClusterObjectSync => "ClusterObjectSync",
        }
    }
}

/// Identifies one record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncPointKey {
    pub namespace: String,
    pub name: String,
}

impl SyncPointKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn kind(&self) -> SyncPointKind {
        SyncPointKind::for_namespace(&self.namespace)
    }
}

/// Which object the record tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPointSpec {
    #[serde(rename = "objectAPIVersion")]
    pub object_api_version: String,
    pub object_kind: String,
    pub object_name: String,
}

/// Highest version confirmed delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPointStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_resource_version: String,
}

/// An `ObjectSync` or `ClusterObjectSync` record named `<node_id>.<object_uid>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Store revision of the record itself, used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: String,
    pub spec: SyncPointSpec,
    #[serde(default)]
    pub status: SyncPointStatus,
}

impl SyncPoint {
    pub fn new(key: SyncPointKey, spec: SyncPointSpec) -> Self {
        Self {
            name: key.name,
            namespace: key.namespace,
            resource_version: String::new(),
            spec,
            status: SyncPointStatus::default(),
        }
    }

    pub fn key(&self) -> SyncPointKey {
        SyncPointKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn kind(&self) -> SyncPointKind {
        SyncPointKind::for_namespace(&self.namespace)
    }

    pub fn object_resource_version(&self) -> &str {
        &self.status.object_resource_version
    }

    /// Node id encoded in the record name.
    pub fn node_id(&self) -> &str {
        node_from_sync_point_name(&self.name)
    }

    /// Object uid encoded in the record name.
    pub fn object_uid(&self) -> &str {
        uid_from_sync_point_name(&self.name)
    }
}

/// `<node_id>.<object_uid>`.
pub fn sync_point_name(node_id: &str, uid: &str) -> String {
    format!("{node_id}.{uid}")
}

/// Text before the last `.`; the whole name when there is none.
pub fn node_from_sync_point_name(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(node, _)| node)
}

/// Text after the last `.`; empty when there is none.
pub fn uid_from_sync_point_name(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(_, uid)| uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_split_on_last_dot() {
        let name = sync_point_name("edge.node-1", "1c2d");
        assert_eq!(name, "edge.node-1.1c2d");
        assert_eq!(node_from_sync_point_name(&name), "edge.node-1");
        assert_eq!(uid_from_sync_point_name(&name), "1c2d");
        assert_eq!(uid_from_sync_point_name("nodot"), "");
    }

    #[test]
    fn empty_namespace_is_cluster_scoped() {
        assert_eq!(SyncPointKey::new("", "n.u").kind(), SyncPointKind::ClusterObjectSync);
        assert_eq!(SyncPointKey::new("default", "n.u").kind(), SyncPointKind::ObjectSync);
    }

    #[test]
    fn serializes_like_the_crd() {
        let mut point = SyncPoint::new(
            SyncPointKey::new("default", "n1.u1"),
            SyncPointSpec { object_api_version: "v1".into(), object_kind: "Pod".into(), object_name: "web".into() },
        );
        point.status.object_resource_version = "7".into();
        let v = serde_json::to_value(&point).unwrap();
        assert_eq!(v["spec"]["objectAPIVersion"], "v1");
        assert_eq!(v["spec"]["objectKind"], "Pod");
        assert_eq!(v["status"]["objectResourceVersion"], "7");
    }
}
