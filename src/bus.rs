//! In-process control-plane bus.
//!
//! Controllers hand messages for nodes to the hub's `cloudhub` inbox. The hub publishes what
//! nodes send to named groups. A controller that needs an answer uses [`ControlPlaneBus::send_sync`],
//! which waits for the response whose `parent_id` matches its request.

use crate::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Name of the hub's inbox.
pub const CLOUDHUB_CHANNEL: &str = "cloudhub";

/// Groups the hub publishes to.
pub mod groups {
    pub const EDGE_CONTROLLER: &str = "edge-controller";
    pub const DEVICE_CONTROLLER: &str = "device-controller";
    pub const DYNAMIC_CONTROLLER: &str = "dynamic-controller";
    pub const USER_ROUTER: &str = "user-router";
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscriber for group {group:?}")]
    NoSubscriber { group: String },
    #[error("cloudhub inbox is closed")]
    Closed,
    #[error("no response to {message_id} in time")]
    Timeout { message_id: String },
    #[error("no pending request for response to {parent_id}")]
    NoPendingRequest { parent_id: String },
}

struct Inner {
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    groups: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct ControlPlaneBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ControlPlaneBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = self.inner.groups.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ControlPlaneBus")
            .field("groups", &groups.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for ControlPlaneBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ControlPlaneBus {
    /// Bus whose inbox holds up to `capacity` undelivered messages.
    pub fn new(capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                groups: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue `msg` for the hub. Waits while the inbox is full.
    pub async fn send_to_hub(&self, msg: Message) -> Result<(), BusError> {
        self.inner.inbox_tx.send(msg).await.map_err(|_| BusError::Closed)
    }

    /// The inbox receiver. Only the first caller gets it.
    pub fn take_inbox(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.inbox_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Receive everything published to `group`.
    pub fn subscribe(&self, group: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver `msg` to every live subscriber of `group`.
    pub fn publish(&self, group: &str, msg: Message) -> Result<(), BusError> {
        let mut groups = self.inner.groups.write().unwrap_or_else(PoisonError::into_inner);
        let subscribers = groups.entry(group.to_string()).or_default();
        subscribers.retain(|tx| !tx.is_closed());
        if subscribers.is_empty() {
            return Err(BusError::NoSubscriber { group: group.to_string() });
        }
        for tx in subscribers.iter() {
            let _ = tx.send(msg.clone());
        }
        Ok(())
    }

    /// Send `msg` to the hub and wait up to `timeout` for its response.
    pub async fn send_sync(&self, msg: Message, timeout: Duration) -> Result<Message, BusError> {
        let id = msg.id().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);
        if let Err(err) = self.send_to_hub(msg).await {
            self.pending().remove(&id);
            return Err(err);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            _ => {
                self.pending().remove(&id);
                Err(BusError::Timeout { message_id: id })
            }
        }
    }

    /// Complete the `send_sync` call waiting on `msg.parent_id`.
    pub fn send_response(&self, msg: Message) -> Result<(), BusError> {
        let parent_id = msg.parent_id().to_string();
        let waiter = self.pending().remove(&parent_id);
        match waiter {
            Some(tx) => tx.send(msg).map_err(|_| BusError::NoPendingRequest { parent_id }),
            None => Err(BusError::NoPendingRequest { parent_id }),
        }
    }

    /// Whether a `send_sync` call is waiting on `message_id`.
    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending().contains_key(message_id)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
