//! Error taxonomy for the hub.
//!
//! Each subsystem owns a narrow error enum; [`HubError`] aggregates them so session and
//! dispatcher code can use `?` freely and still tell fatal from recoverable failures.
//!
//! | Kind | Effect |
//! |---|---|
//! | transport | terminal for the session |
//! | node stop | terminal for the session, pool torn down |
//! | queue shutdown | task exits cleanly |
//! | auth | offending operation aborted |
//! | version conflict | logged, next ack reconciles |
//! | not found | success on delete paths |
//! | timeout | key re-queued with backoff |

use crate::auth::AuthError;
use crate::bus::BusError;
use crate::config::ConfigError;
use crate::objectsync::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

/// Unified error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("node {node_id} is being removed")]
    NodeStopped { node_id: String },
    #[error("message queue has shut down")]
    QueueShutdown,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no ack for message {message_id} after {attempts} writes")]
    Timeout { message_id: String, attempts: usize },
    #[error("node limit {limit} reached, refusing node {node_id}")]
    NodeLimit { node_id: String, limit: usize },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl HubError {
    /// Wire failure; terminal for the session.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_node_stop(&self) -> bool {
        matches!(self, Self::NodeStopped { .. })
    }

    pub fn is_queue_shutdown(&self) -> bool {
        matches!(self, Self::QueueShutdown)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Optimistic-concurrency miss in the sync-point store.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }

    /// Retry budget exhausted waiting for an ack.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error ends the session that hit it.
    pub fn is_fatal(&self) -> bool {
        self.is_transport() || self.is_node_stop() || self.is_queue_shutdown()
    }
}

/// Why a node session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TerminateReason {
    /// Read, write or keepalive failure on the wire.
    Transport = 1,
    /// The node is being removed from the cluster.
    NodeStop = 2,
    /// A newer connection for the same node took over.
    Replaced = 3,
    /// The hub is shutting down.
    Shutdown = 4,
}

impl TerminateReason {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Transport),
            2 => Some(Self::NodeStop),
            3 => Some(Self::Replaced),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::NodeStop => "node_stop",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
