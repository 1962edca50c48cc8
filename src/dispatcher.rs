//! Routes messages between the control plane and node sessions.
//!
//! Downstream, [`MessageDispatcher::dispatch_downstream`] classifies each controller message
//! and files it in the target node's pool: fire-and-forget messages by id, ack-required ones
//! by object UID with latest-wins dedup and a sync-point version check.
//!
//! Upstream, [`MessageDispatcher::dispatch_upstream`] handles what a node sends after it passed
//! authorization: keepalives and acks go to the node's session, everything else is prefixed
//! with the node's address and published to the controller group that owns it.

pub mod classify;
pub mod downstream;
pub mod upstream;

pub use classify::no_ack_required;
pub use downstream::{DispatchOutcome, DropReason};
pub use upstream::{UpstreamRoute, UpstreamService};

use crate::bus::ControlPlaneBus;
use crate::objectsync::SyncPoints;
use crate::pool::MessagePools;
use crate::session::SessionManager;
use std::sync::Arc;

/// Shared routing state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    pools: Arc<MessagePools>,
    sessions: Arc<SessionManager>,
    sync_points: SyncPoints,
    bus: ControlPlaneBus,
}

impl MessageDispatcher {
    /// Pools are taken from `sessions` so both sides agree on which pool a node owns.
    pub fn new(sessions: Arc<SessionManager>, sync_points: SyncPoints, bus: ControlPlaneBus) -> Self {
        Self {
            pools: Arc::clone(sessions.pools()),
            sessions,
            sync_points,
            bus,
        }
    }

    pub fn pools(&self) -> &Arc<MessagePools> {
        &self.pools
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn bus(&self) -> &ControlPlaneBus {
        &self.bus
    }
}
