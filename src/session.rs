//! Node sessions and their registry.
//!
//! A [`NodeSession`] owns everything tied to one live edge connection: the connection itself,
//! the node's message pool, the keepalive watchdog and both send loops. The
//! [`SessionManager`] admits sessions under the node limit, replaces a node's old session when
//! it reconnects, and routes keepalives and acks to the right session.

pub mod manager;
pub mod node_session;

pub use manager::SessionManager;
pub use node_session::{NodeSession, SessionSettings};

/// Identity of one connected edge node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HubInfo {
    pub node_id: String,
    pub project_id: String,
}

impl HubInfo {
    pub fn new(node_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), project_id: project_id.into() }
    }
}
