//! Mapping from a message route to an access-review request.
//!
//! Messages that only make sense to the hub itself (responses, keepalives, twin and
//! meta-server traffic, volume relays, rule status, bulk pod status) become non-resource
//! requests. Everything else is read as `<namespace>/<type>/<name>` and translated into a
//! Kubernetes-style resource request.

use super::AuthError;
use crate::message::{operation, resource_type, source, MessageRoute};
use regex::Regex;
use std::sync::LazyLock;

/// Prefix of the user every node authenticates as.
pub const NODE_USER_PREFIX: &str = "system:node:";

/// Group every node belongs to.
pub const NODES_GROUP: &str = "system:nodes";

static VOLUME_RESOURCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[\w][-\w.+]*/volume/[\w][-\w.+]*$").ok());

/// `<namespace>/volume/<name>` resources relayed to the volume plugin.
pub fn is_volume_resource(resource: &str) -> bool {
    VOLUME_RESOURCE.as_ref().is_some_and(|re| re.is_match(resource))
}

/// `system:node:<node_id>`.
pub fn node_user(node_id: &str) -> String {
    format!("{NODE_USER_PREFIX}{node_id}")
}

/// Whether a route addresses hub-internal state rather than a cluster object.
pub fn is_hub_custom(route: &MessageRoute) -> bool {
    match route.operation.as_str() {
        operation::RESPONSE
        | operation::RESPONSE_ERROR
        | operation::UPLOAD
        | operation::TASK_PREPULL
        | operation::TASK_UPGRADE
        | operation::KEEPALIVE => return true,
        _ => {}
    }
    if matches!(route.source.as_str(), source::META_SERVER | source::TWIN) {
        return true;
    }
    if route.resource == resource_type::K8S_CA || is_volume_resource(&route.resource) {
        return true;
    }
    let (_, kind, name) = split_resource(&route.resource);
    kind == resource_type::RULE_STATUS || (kind == resource_type::POD_STATUS && name.is_empty())
}

/// Split `namespace/type/name`, padding missing segments with empty strings.
pub fn split_resource(resource: &str) -> (&str, &str, &str) {
    let mut parts = resource.split('/');
    let namespace = parts.next().unwrap_or_default();
    let kind = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    (namespace, kind, name)
}

/// Kubernetes resource a resource-type segment refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KubeResource {
    pub resource: &'static str,
    pub subresource: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub namespaced: bool,
}

const fn core(resource: &'static str, subresource: &'static str, namespaced: bool) -> KubeResource {
    KubeResource { resource, subresource, group: "", version: "v1", namespaced }
}

/// Table of resource-type segments nodes may address.
pub fn kube_resource(kind: &str) -> Option<KubeResource> {
    let res = match kind {
        resource_type::NODE_STATUS | resource_type::NODE_PATCH => core("nodes", "status", false),
        resource_type::POD_STATUS | resource_type::POD_PATCH => core("pods", "status", true),
        resource_type::CONFIGMAP => core("configmaps", "", true),
        resource_type::SECRET => core("secrets", "", true),
        resource_type::SERVICE_ACCOUNT_TOKEN => core("serviceaccounts", "token", true),
        resource_type::PERSISTENT_VOLUME => core("persistentvolumes", "", false),
        resource_type::PERSISTENT_VOLUME_CLAIM => core("persistentvolumeclaims", "", true),
        resource_type::NODE => core("nodes", "", false),
        resource_type::POD => core("pods", "", true),
        resource_type::VOLUME_ATTACHMENT => KubeResource {
            resource: "volumeattachments",
            subresource: "",
            group: "storage.k8s.io",
            version: "v1",
            namespaced: false,
        },
        resource_type::LEASE => KubeResource {
            resource: "leases",
            subresource: "",
            group: "coordination.k8s.io",
            version: "v1",
            namespaced: true,
        },
        resource_type::CSR => KubeResource {
            resource: "certificatesigningrequests",
            subresource: "",
            group: "certificates.k8s.io",
            version: "v1",
            namespaced: false,
        },
        _ => return None,
    };
    Some(res)
}

/// A request against a cluster object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAttributes {
    pub namespace: String,
    pub verb: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub resource: &'static str,
    pub subresource: &'static str,
    pub name: String,
}

/// A request against a hub-internal path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonResourceAttributes {
    pub path: String,
    pub verb: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Resource(ResourceAttributes),
    NonResource(NonResourceAttributes),
}

/// Who is asking for what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub user: String,
    pub groups: Vec<String>,
    pub request: Request,
}

impl Attributes {
    /// Derive the request a node makes by sending a message with `route`.
    pub fn for_route(route: &MessageRoute, node_id: &str) -> Result<Self, AuthError> {
        let request = if is_hub_custom(route) {
            Request::NonResource(NonResourceAttributes {
                path: route.resource.clone(),
                verb: route.operation.clone(),
            })
        } else {
            Request::Resource(resource_attributes(route)?)
        };
        Ok(Self { user: node_user(node_id), groups: vec![NODES_GROUP.to_string()], request })
    }

    pub fn is_hub_custom(&self) -> bool {
        matches!(self.request, Request::NonResource(_))
    }

    pub fn resource(&self) -> Option<&ResourceAttributes> {
        match &self.request {
            Request::Resource(res) => Some(res),
            Request::NonResource(_) => None,
        }
    }

    /// Node name when the user is a node identity in the nodes group.
    pub fn node_name(&self) -> Option<&str> {
        if !self.groups.iter().any(|g| g == NODES_GROUP) {
            return None;
        }
        self.user.strip_prefix(NODE_USER_PREFIX).filter(|n| !n.is_empty())
    }
}

fn resource_attributes(route: &MessageRoute) -> Result<ResourceAttributes, AuthError> {
    let (namespace, mut kind, name) = split_resource(&route.resource);
    if route.operation == operation::INSERT {
        kind = match kind {
            resource_type::POD_STATUS => resource_type::POD,
            resource_type::NODE_STATUS => resource_type::NODE,
            other => other,
        };
    }
    let kube = kube_resource(kind).ok_or_else(|| AuthError::UnknownResource(kind.to_string()))?;
    let verb = match route.operation.as_str() {
        operation::INSERT => "create",
        operation::DELETE => "delete",
        operation::UPDATE => "update",
        operation::PATCH => "patch",
        operation::QUERY if kind == resource_type::SERVICE_ACCOUNT_TOKEN => "create",
        operation::QUERY => "get",
        other => return Err(AuthError::UnknownOperation(other.to_string())),
    };
    Ok(ResourceAttributes {
        namespace: if kube.namespaced { namespace.to_string() } else { String::new() },
        verb,
        group: kube.group,
        version: kube.version,
        resource: kube.resource,
        subresource: kube.subresource,
        name: name.to_string(),
    })
}
