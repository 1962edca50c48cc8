//! Connection authentication and per-message authorization.
//!
//! Connections are authenticated once, at handshake, by their client certificate
//! ([`CertificateAuthenticator`]). Every message a node sends afterwards is turned into
//! [`Attributes`] and run through an [`AuthorizerChain`]. The chain always ends with
//! [`HubCustomAuthorizer`], so hub-internal traffic such as keepalives and acks is admitted
//! whatever policy precedes it.
//!
//! ```rust
//! use cloudhub::auth::{AuthMode, MessageAuthorizer};
//! use cloudhub::message::{operation, Message};
//! use cloudhub::session::HubInfo;
//!
//! let authz = MessageAuthorizer::from_modes(&[AuthMode::AlwaysDeny], true, false);
//! let info = HubInfo::new("n1", "p");
//! let keepalive = Message::new().with_route("edged", "", "", operation::KEEPALIVE);
//! assert!(authz.admit(&info, &keepalive).is_ok());
//! let query = Message::new().with_route("edged", "resource", "default/configmap/c", operation::QUERY);
//! assert!(authz.admit(&info, &query).is_err());
//! ```

pub mod attributes;
pub mod cert;
pub mod layer;

pub use attributes::{is_hub_custom, is_volume_resource, node_user, Attributes, NODES_GROUP, NODE_USER_PREFIX};
pub use cert::CertificateAuthenticator;
pub use layer::{AuthorizationLayer, AuthorizationService, InboundMessage};

use crate::message::Message;
use crate::session::HubInfo;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Authentication and authorization failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Identity could not be established.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// Identity established, request refused.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unknown resource type {0:?}")]
    UnknownResource(String),
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
    /// Certificate material could not be parsed or verified.
    #[error("certificate: {0}")]
    Certificate(String),
}

/// Verdict of one authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    /// Defer to the next authorizer in the chain.
    NoOpinion,
}

/// One link in the authorization chain.
pub trait Authorizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn authorize(&self, attrs: &Attributes) -> Decision;
}

/// Policy modes selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Node,
    AlwaysAllow,
    AlwaysDeny,
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

impl Authorizer for AlwaysAllow {
    fn name(&self) -> &'static str {
        "always_allow"
    }

    fn authorize(&self, _attrs: &Attributes) -> Decision {
        Decision::Allow
    }
}

/// Never allows anything; leaves hub-internal traffic to the tail of the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDeny;

impl Authorizer for AlwaysDeny {
    fn name(&self) -> &'static str {
        "always_deny"
    }

    fn authorize(&self, _attrs: &Attributes) -> Decision {
        Decision::NoOpinion
    }
}

/// Tail of every chain: admits hub-custom requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubCustomAuthorizer;

impl Authorizer for HubCustomAuthorizer {
    fn name(&self) -> &'static str {
        "hub_custom"
    }

    fn authorize(&self, attrs: &Attributes) -> Decision {
        if attrs.is_hub_custom() {
            Decision::Allow
        } else {
            Decision::NoOpinion
        }
    }
}

/// An object a node may be related to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(resource: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { resource: resource.into(), namespace: namespace.into(), name: name.into() }
    }
}

/// Which objects each node may read.
pub trait ObjectGraph: Send + Sync + fmt::Debug {
    fn is_related(&self, node: &str, object: &ObjectRef) -> bool;
}

/// Object graph kept in memory; fed by whoever watches pod bindings.
#[derive(Debug, Default)]
pub struct MemoryObjectGraph {
    edges: RwLock<HashSet<(String, ObjectRef)>>,
}

impl MemoryObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relate(&self, node: &str, object: ObjectRef) {
        self.edges.write().unwrap_or_else(PoisonError::into_inner).insert((node.to_string(), object));
    }

    pub fn unrelate(&self, node: &str, object: &ObjectRef) {
        self.edges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(node.to_string(), object.clone()));
    }

    /// Drop every edge of `node`.
    pub fn remove_node(&self, node: &str) {
        self.edges.write().unwrap_or_else(PoisonError::into_inner).retain(|(n, _)| n != node);
    }
}

impl ObjectGraph for MemoryObjectGraph {
    fn is_related(&self, node: &str, object: &ObjectRef) -> bool {
        self.edges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(node.to_string(), object.clone()))
    }
}

/// Restricts a node to its own objects and the objects its pods reference.
#[derive(Debug, Clone)]
pub struct NodeAuthorizer {
    graph: Arc<dyn ObjectGraph>,
}

impl NodeAuthorizer {
    pub fn new(graph: Arc<dyn ObjectGraph>) -> Self {
        Self { graph }
    }
}

impl Authorizer for NodeAuthorizer {
    fn name(&self) -> &'static str {
        "node"
    }

    fn authorize(&self, attrs: &Attributes) -> Decision {
        let Some(node) = attrs.node_name() else {
            return Decision::NoOpinion;
        };
        let Some(res) = attrs.resource() else {
            return Decision::NoOpinion;
        };
        match res.resource {
            "nodes" if res.name == node => Decision::Allow,
            "leases" if res.name == node => Decision::Allow,
            "certificatesigningrequests" if matches!(res.verb, "create" | "get") => Decision::Allow,
            "pods" if res.verb == "create" && res.subresource.is_empty() => Decision::Allow,
            "pods" | "configmaps" | "secrets" | "serviceaccounts" | "persistentvolumeclaims"
            | "persistentvolumes" | "volumeattachments" => {
                let object = ObjectRef::new(res.resource, res.namespace.clone(), res.name.clone());
                if self.graph.is_related(node, &object) {
                    Decision::Allow
                } else {
                    Decision::NoOpinion
                }
            }
            _ => Decision::NoOpinion,
        }
    }
}

/// Ordered authorizers. The first `Allow` or `Deny` decides.
#[derive(Debug, Clone)]
pub struct AuthorizerChain {
    authorizers: Vec<Arc<dyn Authorizer>>,
}

impl AuthorizerChain {
    /// Chain of `authorizers` followed by [`HubCustomAuthorizer`].
    pub fn new(authorizers: Vec<Arc<dyn Authorizer>>) -> Self {
        let mut authorizers = authorizers;
        authorizers.push(Arc::new(HubCustomAuthorizer));
        Self { authorizers }
    }

    /// Chain built from configured modes; `node` uses `graph`.
    pub fn from_modes(modes: &[AuthMode], graph: Arc<dyn ObjectGraph>) -> Self {
        let authorizers = modes
            .iter()
            .map(|mode| -> Arc<dyn Authorizer> {
                match mode {
                    AuthMode::Node => Arc::new(NodeAuthorizer::new(Arc::clone(&graph))),
                    AuthMode::AlwaysAllow => Arc::new(AlwaysAllow),
                    AuthMode::AlwaysDeny => Arc::new(AlwaysDeny),
                }
            })
            .collect();
        Self::new(authorizers)
    }

    pub fn authorize(&self, attrs: &Attributes) -> Decision {
        for authz in &self.authorizers {
            match authz.authorize(attrs) {
                Decision::NoOpinion => continue,
                decided => return decided,
            }
        }
        Decision::NoOpinion
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.authorizers.iter().map(|a| a.name()).collect()
    }
}

/// Admission check applied to every inbound message.
#[derive(Debug, Clone)]
pub struct MessageAuthorizer {
    chain: AuthorizerChain,
    enabled: bool,
    debug: bool,
}

impl MessageAuthorizer {
    pub fn new(chain: AuthorizerChain, enabled: bool, debug: bool) -> Self {
        Self { chain, enabled, debug }
    }

    /// Chain from `modes` with an empty object graph.
    pub fn from_modes(modes: &[AuthMode], enabled: bool, debug: bool) -> Self {
        Self::new(AuthorizerChain::from_modes(modes, Arc::new(MemoryObjectGraph::new())), enabled, debug)
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Decide whether `msg` from `info` may enter the upstream pipeline.
    ///
    /// In debug mode refusals are logged and the message is admitted anyway.
    pub fn admit(&self, info: &HubInfo, msg: &Message) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }
        let verdict = Attributes::for_route(&msg.route, &info.node_id).and_then(|attrs| {
            match self.chain.authorize(&attrs) {
                Decision::Allow => Ok(()),
                Decision::Deny(reason) => Err(AuthError::Forbidden(reason)),
                Decision::NoOpinion => Err(AuthError::Forbidden(format!(
                    "no authorizer allowed {} on {:?}",
                    msg.operation(),
                    msg.resource()
                ))),
            }
        });
        match verdict {
            Err(err) if self.debug => {
                tracing::warn!(
                    target: "cloudhub::auth",
                    node_id = %info.node_id,
                    error = %err,
                    "authorization failed, admitting in debug mode"
                );
                Ok(())
            }
            other => other,
        }
    }
}
