//! Per-node message pools.
//!
//! A [`NodeMessagePool`] buffers everything destined for one node in two halves:
//!
//! - **ack**: `object_uid -> latest message`, drained by the session's ack sender;
//! - **no-ack**: `message_id -> message`, drained by the no-ack sender.
//!
//! Inserting into a store and pushing the key onto its queue happen under one lock, so a
//! consumer never observes a queued key whose message is missing.

use crate::backoff::Backoff;
use crate::message::{group, operation, Message};
use crate::workqueue::rate_limiter::node_queue_limiter;
use crate::workqueue::WorkQueue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Key of a message on the ack side.
///
/// Resource messages are keyed by the UID of the object they carry so that newer versions
/// replace older ones. Deletes and responses without a UID fall back to their message id.
pub fn ack_key(msg: &Message) -> Option<String> {
    if msg.group() == group::RESOURCE {
        if let Some(uid) = msg.object_uid() {
            return Some(uid.to_string());
        }
    }
    if msg.is_delete() || msg.operation() == operation::RESPONSE {
        return Some(msg.id().to_string());
    }
    None
}

/// Key of a message on the no-ack side.
pub fn noack_key(msg: &Message) -> String {
    msg.id().to_string()
}

/// Queue pacing shared by every pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub backoff: Backoff,
    pub qps: f64,
    pub burst: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::exponential(Duration::from_millis(5))
                .with_max(Duration::from_secs(1000))
                .unwrap_or_else(|_| Backoff::exponential(Duration::from_millis(5))),
            qps: 10.0,
            burst: 100,
        }
    }
}

#[derive(Debug, Default)]
struct Stores {
    ack: HashMap<String, Message>,
    noack: HashMap<String, Message>,
}

/// Buffers for one node.
#[derive(Debug)]
pub struct NodeMessagePool {
    node_id: String,
    stores: Mutex<Stores>,
    ack_queue: WorkQueue,
    noack_queue: WorkQueue,
}

impl NodeMessagePool {
    pub fn new(node_id: impl Into<String>, settings: PoolSettings) -> Self {
        let node_id = node_id.into();
        let limiter = || Arc::new(node_queue_limiter(settings.backoff, settings.qps, settings.burst));
        Self {
            ack_queue: WorkQueue::new(format!("{node_id}/ack"), limiter()),
            noack_queue: WorkQueue::new(format!("{node_id}/noack"), limiter()),
            stores: Mutex::new(Stores::default()),
            node_id,
        }
    }

    fn stores(&self) -> MutexGuard<'_, Stores> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ack_queue(&self) -> &WorkQueue {
        &self.ack_queue
    }

    pub fn noack_queue(&self) -> &WorkQueue {
        &self.noack_queue
    }

    /// Store `msg` under `key` (replacing any older message) and queue the key.
    pub fn put_ack(&self, key: impl Into<String>, msg: Message) {
        let key = key.into();
        let mut stores = self.stores();
        stores.ack.insert(key.clone(), msg);
        self.ack_queue.add(key);
    }

    /// Store `msg` under its id and queue it.
    pub fn put_noack(&self, msg: Message) {
        let key = noack_key(&msg);
        let mut stores = self.stores();
        stores.noack.insert(key.clone(), msg);
        self.noack_queue.add(key);
    }

    pub fn get_ack(&self, key: &str) -> Option<Message> {
        self.stores().ack.get(key).cloned()
    }

    pub fn get_noack(&self, key: &str) -> Option<Message> {
        self.stores().noack.get(key).cloned()
    }

    pub fn delete_ack(&self, key: &str) -> Option<Message> {
        self.stores().ack.remove(key)
    }

    pub fn delete_noack(&self, key: &str) -> Option<Message> {
        self.stores().noack.remove(key)
    }

    /// Remove `msg` from whichever store holds it. An ack entry is only removed while it is
    /// still this exact message, so a newer version stored meanwhile survives.
    pub fn delete(&self, msg: &Message) {
        let mut stores = self.stores();
        stores.noack.remove(msg.id());
        if let Some(key) = ack_key(msg) {
            if stores.ack.get(&key).is_some_and(|stored| stored.id() == msg.id()) {
                stores.ack.remove(&key);
            }
        }
    }

    pub fn ack_len(&self) -> usize {
        self.stores().ack.len()
    }

    pub fn noack_len(&self) -> usize {
        self.stores().noack.len()
    }

    /// Shut both queues down, waking every waiter, and clear the stores.
    pub fn shutdown(&self) {
        self.ack_queue.shut_down();
        self.noack_queue.shut_down();
        let mut stores = self.stores();
        stores.ack.clear();
        stores.noack.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.ack_queue.is_shutting_down()
    }
}

/// Registry of live pools keyed by node id.
#[derive(Debug, Default)]
pub struct MessagePools {
    pools: RwLock<HashMap<String, Arc<NodeMessagePool>>>,
    settings: PoolSettings,
}

impl MessagePools {
    pub fn new(settings: PoolSettings) -> Self {
        Self { pools: RwLock::new(HashMap::new()), settings }
    }

    /// Pool for `node_id`, creating one if none is registered or the registered one has shut down.
    pub fn get_or_create(&self, node_id: &str) -> Arc<NodeMessagePool> {
        if let Some(pool) = self.get(node_id) {
            return pool;
        }
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        match pools.get(node_id) {
            Some(pool) if !pool.is_shut_down() => Arc::clone(pool),
            _ => {
                let pool = Arc::new(NodeMessagePool::new(node_id, self.settings));
                pools.insert(node_id.to_string(), Arc::clone(&pool));
                pool
            }
        }
    }

    /// Live pool for `node_id`, if any.
    pub fn get(&self, node_id: &str) -> Option<Arc<NodeMessagePool>> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools.get(node_id).filter(|p| !p.is_shut_down()).cloned()
    }

    /// Unregister `pool` if it is still the one registered for `node_id`.
    pub fn remove_if_same(&self, node_id: &str, pool: &Arc<NodeMessagePool>) -> bool {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        match pools.get(node_id) {
            Some(current) if Arc::ptr_eq(current, pool) => {
                pools.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::source;
    use serde_json::json;

    fn pod_update(uid: &str, rv: &str) -> Message {
        Message::new()
            .with_route(source::EDGE_CONTROLLER, group::RESOURCE, "node/n1/default/pod/web", operation::UPDATE)
            .with_resource_version(rv)
            .with_content(json!({"metadata": {"uid": uid}}))
    }

    #[test]
    fn ack_key_prefers_object_uid() {
        assert_eq!(ack_key(&pod_update("u1", "1")).as_deref(), Some("u1"));

        let delete = Message::new().with_route("", "", "node/n1/default/pod/web", operation::DELETE);
        assert_eq!(ack_key(&delete).as_deref(), Some(delete.id()));

        let no_uid = Message::new().with_route("", group::RESOURCE, "node/n1/default/pod/web", operation::UPDATE);
        assert_eq!(ack_key(&no_uid), None);
        let other_group = pod_update("u1", "1").with_route("", group::USER, "x", operation::UPDATE);
        assert_eq!(ack_key(&other_group), None);
    }

    #[tokio::test]
    async fn latest_message_wins_and_key_queued_once() {
        let pool = NodeMessagePool::new("n1", PoolSettings::default());
        pool.put_ack("u1", pod_update("u1", "1"));
        pool.put_ack("u1", pod_update("u1", "2"));
        assert_eq!(pool.ack_queue().len(), 1);
        assert_eq!(pool.ack_len(), 1);

        let key = pool.ack_queue().get().await.unwrap();
        assert_eq!(pool.get_ack(&key).unwrap().resource_version(), "2");
    }

    #[test]
    fn delete_keeps_newer_ack_entry() {
        let pool = NodeMessagePool::new("n1", PoolSettings::default());
        let old = pod_update("u1", "1");
        pool.put_ack("u1", old.clone());
        pool.put_ack("u1", pod_update("u1", "2"));
        pool.delete(&old);
        assert_eq!(pool.get_ack("u1").unwrap().resource_version(), "2");

        let noack = Message::new();
        pool.put_noack(noack.clone());
        pool.delete(&noack);
        assert!(pool.get_noack(noack.id()).is_none());
    }

    #[tokio::test]
    async fn shutdown_clears_and_wakes() {
        let pool = Arc::new(NodeMessagePool::new("n1", PoolSettings::default()));
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.noack_queue().get().await })
        };
        pool.put_ack("u1", pod_update("u1", "1"));
        tokio::task::yield_now().await;
        pool.shutdown();
        assert!(waiter.await.unwrap().is_none());
        assert!(pool.is_shut_down());
        assert_eq!(pool.ack_len(), 0);
        assert!(pool.ack_queue().get().await.is_none());
        assert!(pool.noack_queue().get().await.is_none());
    }

    #[test]
    fn registry_replaces_shut_down_pools() {
        let pools = MessagePools::new(PoolSettings::default());
        let first = pools.get_or_create("n1");
        assert!(Arc::ptr_eq(&first, &pools.get_or_create("n1")));

        first.shutdown();
        assert!(pools.get("n1").is_none());
        let second = pools.get_or_create("n1");
        assert!(!Arc::ptr_eq(&first, &second));

        assert!(!pools.remove_if_same("n1", &first));
        assert!(pools.remove_if_same("n1", &second));
        assert!(pools.is_empty());
    }
}
