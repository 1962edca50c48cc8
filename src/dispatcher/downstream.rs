//! Control plane to node.

use super::classify::no_ack_required;
use super::MessageDispatcher;
use crate::message::{operation, Message};
use crate::objectsync::is_newer;
use crate::pool::ack_key;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why a downstream message was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The resource names no node.
    NoNode,
    /// The cloud answers this request itself.
    NotToEdge,
    /// Ack-required, not a delete, and no resource version.
    MissingResourceVersion,
    /// No object UID to key it by.
    NoAckKey,
    /// The node already has this version or a newer one.
    Stale,
    /// A delete for the same object is still pending.
    PendingDelete,
    /// The sync-point store could not be consulted.
    Store,
}

/// What became of one downstream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    NoAck,
    Ack,
    Dropped(DropReason),
}

impl MessageDispatcher {
    /// Drain `inbox` until it closes or `cancel` fires.
    pub async fn run_downstream(self, mut inbox: mpsc::Receiver<Message>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let id = msg.id().to_string();
            let outcome = self.dispatch_downstream(msg).await;
            tracing::trace!(target: "cloudhub::dispatcher", message_id = %id, ?outcome, "dispatched downstream");
        }
        tracing::warn!(target: "cloudhub::dispatcher", "downstream dispatch loop stopped");
    }

    /// File `msg` in its node's pool.
    pub async fn dispatch_downstream(&self, msg: Message) -> DispatchOutcome {
        let Some(node_id) = msg.node_id().map(str::to_string) else {
            tracing::warn!(target: "cloudhub::dispatcher", message = %msg.describe(), "node id not found in message");
            return DispatchOutcome::Dropped(DropReason::NoNode);
        };
        if !msg.is_to_edge() {
            tracing::warn!(target: "cloudhub::dispatcher", %node_id, message = %msg.describe(), "skip message not meant for the edge");
            return DispatchOutcome::Dropped(DropReason::NotToEdge);
        }
        if no_ack_required(&msg) {
            self.pools.get_or_create(&node_id).put_noack(msg);
            return DispatchOutcome::NoAck;
        }
        self.enqueue_ack(&node_id, msg).await
    }

    async fn enqueue_ack(&self, node_id: &str, msg: Message) -> DispatchOutcome {
        let is_delete = msg.is_delete();
        if msg.resource_version().is_empty() && !is_delete {
            tracing::debug!(target: "cloudhub::dispatcher", %node_id, message_id = %msg.id(), "ack message without resource version");
            return DispatchOutcome::Dropped(DropReason::MissingResourceVersion);
        }
        let Some(key) = ack_key(&msg) else {
            tracing::error!(target: "cloudhub::dispatcher", %node_id, message = %msg.describe(), "no key for message");
            return DispatchOutcome::Dropped(DropReason::NoAckKey);
        };
        let pool = self.pools.get_or_create(node_id);

        if is_delete || msg.operation() == operation::RESPONSE {
            pool.put_ack(key, msg);
            return DispatchOutcome::Ack;
        }

        if let Some(stored) = pool.get_ack(&key) {
            if stored.is_delete() {
                return DispatchOutcome::Dropped(DropReason::PendingDelete);
            }
            if !is_newer(msg.resource_version(), stored.resource_version()) {
                return DispatchOutcome::Dropped(DropReason::Stale);
            }
            pool.put_ack(key, msg);
            return DispatchOutcome::Ack;
        }

        match self.sync_points.admit(node_id, &msg).await {
            Ok(true) => {
                pool.put_ack(key, msg);
                DispatchOutcome::Ack
            }
            Ok(false) => DispatchOutcome::Dropped(DropReason::Stale),
            Err(err) => {
                tracing::error!(
                    target: "cloudhub::dispatcher",
                    %node_id,
                    message_id = %msg.id(),
                    error = %err,
                    "failed to read sync point"
                );
                DispatchOutcome::Dropped(DropReason::Store)
            }
        }
    }
}
