//! The message record exchanged with edge nodes and the control plane.
//!
//! A [`Message`] serializes to the JSON shape edge agents already speak:
//!
//! ```json
//! {
//!   "header": { "msg_id": "…", "parent_msg_id": "…", "timestamp": 0, "resourceversion": "7" },
//!   "route":  { "source": "edgecontroller", "group": "resource",
//!               "operation": "update", "resource": "node/n1/default/pod/web" },
//!   "content": { "metadata": { "uid": "…" } }
//! }
//! ```
//!
//! Node-addressed resources have the layout `node/<node_id>/<namespace>/<type>/<name>`.
//! The `node/<node_id>/` prefix is stripped before a message goes on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Separator between resource path segments.
pub const RESOURCE_SEP: char = '/';

/// First segment of every node-addressed resource.
pub const RESOURCE_NODE: &str = "node";

/// Content of a successful plain response.
pub const MESSAGE_OK: &str = "OK";

/// Route operations.
pub mod operation {
    pub const INSERT: &str = "insert";
    pub const DELETE: &str = "delete";
    pub const QUERY: &str = "query";
    pub const UPDATE: &str = "update";
    pub const PATCH: &str = "patch";
    pub const UPLOAD: &str = "upload";
    pub const RESPONSE: &str = "response";
    pub const RESPONSE_ERROR: &str = "error";
    pub const KEEPALIVE: &str = "keepalive";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const GET: &str = "get";
    pub const TWIN_DELTA: &str = "delta";
    pub const TWIN_DOCUMENT: &str = "document";
    pub const APPLICATION_RESPONSE: &str = "applicationResponse";
    pub const TASK_PREPULL: &str = "prepull";
    pub const TASK_UPGRADE: &str = "upgrade";
    pub const CREATE_VOLUME: &str = "createvolume";
    pub const DELETE_VOLUME: &str = "deletevolume";
    pub const CONTROLLER_PUBLISH_VOLUME: &str = "controllerpublishvolume";
    pub const CONTROLLER_UNPUBLISH_VOLUME: &str = "controllerunpublishvolume";

    /// CSI verbs relayed to the node's volume plugin.
    pub fn is_volume(op: &str) -> bool {
        matches!(
            op,
            CREATE_VOLUME | DELETE_VOLUME | CONTROLLER_PUBLISH_VOLUME | CONTROLLER_UNPUBLISH_VOLUME
        )
    }
}

/// Route sources (the module that produced the message).
pub mod source {
    pub const CLOUD_HUB: &str = "cloudhub";
    pub const EDGE_CONTROLLER: &str = "edgecontroller";
    pub const DEVICE_CONTROLLER: &str = "devicecontroller";
    pub const NODE_UPGRADE_CONTROLLER: &str = "nodeupgradejobcontroller";
    pub const EDGE_MANAGER: &str = "edgemgr";
    pub const META_SERVER: &str = "metaserver";
    pub const TWIN: &str = "twin";
    pub const SYNC_CONTROLLER: &str = "synccontroller";
}

/// Route groups carried inside messages.
pub mod group {
    pub const RESOURCE: &str = "resource";
    pub const USER: &str = "user";
    pub const TWIN: &str = "twin";
}

/// Resource type segments.
pub mod resource_type {
    pub const POD: &str = "pod";
    pub const POD_LIST: &str = "podlist";
    pub const POD_STATUS: &str = "podstatus";
    pub const POD_PATCH: &str = "podpatch";
    pub const CONFIGMAP: &str = "configmap";
    pub const SECRET: &str = "secret";
    pub const SERVICE_ACCOUNT_TOKEN: &str = "serviceaccounttoken";
    pub const NODE: &str = "node";
    pub const NODE_STATUS: &str = "nodestatus";
    pub const NODE_PATCH: &str = "nodepatch";
    pub const LEASE: &str = "lease";
    pub const RULE_STATUS: &str = "rulestatus";
    pub const PERSISTENT_VOLUME: &str = "persistentvolume";
    pub const PERSISTENT_VOLUME_CLAIM: &str = "persistentvolumeclaim";
    pub const VOLUME_ATTACHMENT: &str = "volumeattachment";
    pub const CSR: &str = "csr";
    pub const VOLUME: &str = "volume";
    pub const MEMBERSHIP: &str = "membership";
    pub const TWIN: &str = "twin";
    pub const TWIN_CLOUD_UPDATED: &str = "twin/cloud_updated";
    pub const AUTH_INFO: &str = "auth_info";
    /// Well-known CA bundle path a node may fetch.
    pub const K8S_CA: &str = "k8s/ca.crt";
}

/// Message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "msg_id")]
    pub id: String,
    #[serde(rename = "parent_msg_id", default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "resourceversion", default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,
}

/// Where a message comes from and what it operates on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRoute {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
}

/// Unit of transfer in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(default)]
    pub route: MessageRoute,
    #[serde(default)]
    pub content: Value,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// A fresh message with a random id and the current timestamp.
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            header: MessageHeader {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp,
                ..MessageHeader::default()
            },
            route: MessageRoute::default(),
            content: Value::Null,
        }
    }

    /// Set source, group, resource and operation.
    pub fn with_route(
        mut self,
        source: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        self.route = MessageRoute {
            source: source.into(),
            group: group.into(),
            resource: resource.into(),
            operation: operation.into(),
        };
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.header.resource_version = rv.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.header.parent_id = parent_id.into();
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.header.sync = sync;
        self
    }

    /// Build the response to this message, keeping its route and replacing the operation.
    pub fn response(&self, content: impl Into<Value>) -> Message {
        Message::new()
            .with_route(
                self.route.source.clone(),
                self.route.group.clone(),
                self.route.resource.clone(),
                operation::RESPONSE,
            )
            .with_parent_id(self.header.id.clone())
            .with_content(content)
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn parent_id(&self) -> &str {
        &self.header.parent_id
    }

    pub fn resource_version(&self) -> &str {
        &self.header.resource_version
    }

    pub fn source(&self) -> &str {
        &self.route.source
    }

    pub fn group(&self) -> &str {
        &self.route.group
    }

    pub fn operation(&self) -> &str {
        &self.route.operation
    }

    pub fn resource(&self) -> &str {
        &self.route.resource
    }

    /// Replace resource and operation.
    pub fn set_resource_operation(&mut self, resource: impl Into<String>, op: impl Into<String>) {
        self.route.resource = resource.into();
        self.route.operation = op.into();
    }

    /// One-line summary for logs. Content is deliberately left out.
    pub fn describe(&self) -> String {
        format!(
            "id: {}, parent_id: {}, group: {}, source: {}, resource: {}, operation: {}",
            self.header.id,
            self.header.parent_id,
            self.route.group,
            self.route.source,
            self.route.resource,
            self.route.operation
        )
    }

    /// Node id from the first `node/<id>` pair in the resource path.
    pub fn node_id(&self) -> Option<&str> {
        let tokens: Vec<&str> = self.route.resource.split(RESOURCE_SEP).collect();
        tokens
            .windows(2)
            .find(|w| w[0] == RESOURCE_NODE && !w[1].is_empty())
            .map(|w| w[1])
    }

    /// Parsed `node/<id>/<namespace>/<type>/<name>` view of the resource.
    pub fn node_resource(&self) -> Option<NodeResource<'_>> {
        NodeResource::parse(&self.route.resource)
    }

    /// Resource type segment of a node-addressed resource, empty when absent.
    pub fn resource_type(&self) -> &str {
        self.node_resource().map(|r| r.resource_type).unwrap_or_default()
    }

    /// Copy of this message with the `node/<id>/` prefix removed from its resource.
    pub fn trimmed(&self) -> Message {
        let mut copy = self.clone();
        copy.trim_node_prefix();
        copy
    }

    /// Remove the `node/<id>/` prefix in place. Resources shorter than three segments stay as-is.
    pub fn trim_node_prefix(&mut self) {
        let resource = &self.route.resource;
        if !resource.starts_with(RESOURCE_NODE) {
            return;
        }
        let tokens: Vec<&str> = resource.split(RESOURCE_SEP).collect();
        if tokens.len() < 3 {
            tracing::warn!(
                target: "cloudhub::message",
                resource = %resource,
                "resource starts with node but has fewer than 3 segments"
            );
            return;
        }
        self.route.resource = tokens[2..].join("/");
    }

    /// Whether this message tells the hub that the node is being removed.
    pub fn is_node_stopped(&self) -> bool {
        let tokens: Vec<&str> = self.route.resource.split(RESOURCE_SEP).collect();
        let addresses_node = match tokens.as_slice() {
            [RESOURCE_NODE, id] => !id.is_empty(),
            _ => self.resource_type() == resource_type::NODE,
        };
        if !addresses_node {
            return false;
        }
        match self.operation() {
            operation::DELETE => true,
            operation::UPDATE => {
                self.content_object().and_then(|c| c.get("action")).and_then(Value::as_str)
                    == Some("stop")
            }
            _ => false,
        }
    }

    /// `false` for requests from the edge manager that the cloud answers itself.
    pub fn is_to_edge(&self) -> bool {
        if self.source() != source::EDGE_MANAGER {
            return true;
        }
        let mut resource = self.resource().to_string();
        if resource.starts_with(RESOURCE_NODE) {
            let tokens: Vec<&str> = resource.split(RESOURCE_SEP).collect();
            if tokens.len() >= 3 {
                resource = tokens[2..].join("/");
            }
        }
        let handled_locally = match resource.as_str() {
            resource_type::MEMBERSHIP => matches!(self.operation(), operation::GET),
            resource_type::TWIN => matches!(
                self.operation(),
                operation::TWIN_DELTA | operation::TWIN_DOCUMENT | operation::GET
            ),
            resource_type::AUTH_INFO => matches!(self.operation(), operation::GET),
            RESOURCE_NODE => matches!(self.operation(), operation::DELETE),
            _ => false,
        };
        !handled_locally
    }

    /// A delete operation, or an object carrying a deletion timestamp.
    pub fn is_delete(&self) -> bool {
        self.operation() == operation::DELETE || self.deletion_timestamp().is_some()
    }

    /// Content as a JSON object. String content holding a JSON object is decoded lazily by callers.
    pub fn content_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.content.as_object()
    }

    fn object_meta(&self) -> Option<&serde_json::Map<String, Value>> {
        self.content_object()?.get("metadata")?.as_object()
    }

    /// `metadata.uid` of the carried object.
    pub fn object_uid(&self) -> Option<&str> {
        self.object_meta()?.get("uid")?.as_str().filter(|s| !s.is_empty())
    }

    /// `metadata.deletionTimestamp` when present and not null.
    pub fn deletion_timestamp(&self) -> Option<&Value> {
        self.object_meta()?.get("deletionTimestamp").filter(|v| !v.is_null())
    }

    /// `apiVersion` of the carried object.
    pub fn object_api_version(&self) -> Option<&str> {
        self.content_object()?.get("apiVersion")?.as_str()
    }
}

/// Prefix an edge-relative resource with `node/<node_id>/`.
pub fn node_prefixed(node_id: &str, resource: &str) -> String {
    format!("{RESOURCE_NODE}/{node_id}/{resource}")
}

/// Build `node/<node_id>/<namespace>/<type>/<name>`.
pub fn build_node_resource(node_id: &str, namespace: &str, resource_type: &str, name: &str) -> String {
    format!("{RESOURCE_NODE}/{node_id}/{namespace}/{resource_type}/{name}")
}

/// Borrowed view over `node/<node_id>/<namespace>/<type>/<name>[/suffix]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeResource<'a> {
    pub node_id: &'a str,
    pub namespace: &'a str,
    pub resource_type: &'a str,
    pub name: &'a str,
}

impl<'a> NodeResource<'a> {
    pub fn parse(resource: &'a str) -> Option<Self> {
        let mut tokens = resource.split(RESOURCE_SEP);
        if tokens.next()? != RESOURCE_NODE {
            return None;
        }
        let node_id = tokens.next().filter(|t| !t.is_empty())?;
        Some(Self {
            node_id,
            namespace: tokens.next().unwrap_or_default(),
            resource_type: tokens.next().unwrap_or_default(),
            name: tokens.next().unwrap_or_default(),
        })
    }
}
