//! Registry of live sessions.

use super::NodeSession;
use crate::error::{HubError, TerminateReason};
use crate::pool::{MessagePools, NodeMessagePool};
use crate::telemetry::{HubEvent, Telemetry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Sessions by node id, bounded by the node limit.
///
/// Admission runs under an async lock so that the limit check, the replacement of an older
/// session for the same node and the insert happen as one step.
#[derive(Debug)]
pub struct SessionManager {
    node_limit: usize,
    node_count: AtomicUsize,
    sessions: RwLock<HashMap<String, Arc<NodeSession>>>,
    admission: tokio::sync::Mutex<()>,
    pools: Arc<MessagePools>,
    telemetry: Telemetry,
}

impl SessionManager {
    pub fn new(node_limit: usize, pools: Arc<MessagePools>) -> Self {
        Self {
            node_limit,
            node_count: AtomicUsize::new(0),
            sessions: RwLock::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
            pools,
            telemetry: Telemetry::null(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn node_limit(&self) -> usize {
        self.node_limit
    }

    pub fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Acquire)
    }

    pub fn pools(&self) -> &Arc<MessagePools> {
        &self.pools
    }

    /// Admit a session for `node_id`, built by `build` around the node's pool.
    ///
    /// An existing session for the node is terminated first and does not count against the
    /// limit. A new node is refused once the limit is reached.
    pub async fn admit<F>(&self, node_id: &str, build: F) -> Result<Arc<NodeSession>, HubError>
    where
        F: FnOnce(Arc<NodeMessagePool>) -> Arc<NodeSession>,
    {
        let _admission = self.admission.lock().await;

        match self.get(node_id) {
            Some(old) => {
                tracing::info!(target: "cloudhub::session", node_id, "replacing existing session");
                old.terminate(TerminateReason::Replaced).await;
                self.remove_session(&old);
            }
            None if self.node_count() >= self.node_limit => {
                tracing::warn!(
                    target: "cloudhub::session",
                    node_id,
                    limit = self.node_limit,
                    "node limit reached, refusing connection"
                );
                self.telemetry
                    .emit(HubEvent::NodeLimitReached { node_id: node_id.to_string(), limit: self.node_limit })
                    .await;
                return Err(HubError::NodeLimit { node_id: node_id.to_string(), limit: self.node_limit });
            }
            None => {}
        }

        let session = build(self.pools.get_or_create(node_id));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_string(), Arc::clone(&session));
        self.node_count.fetch_add(1, Ordering::AcqRel);
        self.telemetry.emit(HubEvent::SessionOpened { node_id: node_id.to_string() }).await;
        Ok(session)
    }

    /// Unregister `session` if it is still the node's current one. Its pool goes with it.
    pub fn remove_session(&self, session: &Arc<NodeSession>) -> bool {
        let node_id = session.node_id();
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(node_id) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(node_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.node_count.fetch_sub(1, Ordering::AcqRel);
            self.pools.remove_if_same(node_id, session.pool());
        }
        removed
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(node_id).cloned()
    }

    /// Every registered session.
    pub fn sessions(&self) -> Vec<Arc<NodeSession>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// Reset the watchdog of `node_id`'s session.
    pub fn keepalive(&self, node_id: &str) -> bool {
        match self.get(node_id) {
            Some(session) => {
                session.keepalive();
                true
            }
            None => {
                tracing::debug!(target: "cloudhub::session", node_id, "keepalive for unknown node");
                false
            }
        }
    }

    /// Deliver an ack for `parent_id` to `node_id`'s session.
    pub fn receive_ack(&self, node_id: &str, parent_id: &str) -> bool {
        self.get(node_id).is_some_and(|session| session.receive_ack(parent_id))
    }

    /// Terminate and unregister every session.
    pub async fn terminate_all(&self, reason: TerminateReason) {
        let _admission = self.admission.lock().await;
        for session in self.sessions() {
            session.terminate(reason).await;
            self.remove_session(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectsync::{MemorySyncStore, SyncPoints};
    use crate::pool::PoolSettings;
    use crate::session::{HubInfo, SessionSettings};
    use crate::telemetry::MemorySink;
    use crate::transport::memory::{pair, MemoryConnection};
    use crate::transport::PeerHeaders;

    fn builder(node_id: &str) -> (Arc<MemoryConnection>, impl FnOnce(Arc<NodeMessagePool>) -> Arc<NodeSession>) {
        let (conn, _edge) = pair(PeerHeaders::for_node(node_id, ""));
        let conn = Arc::new(conn);
        let info = HubInfo::new(node_id, "");
        let dyn_conn = conn.clone();
        let build = move |pool: Arc<NodeMessagePool>| {
            Arc::new(NodeSession::new(
                info,
                dyn_conn,
                pool,
                SyncPoints::new(Arc::new(MemorySyncStore::new())),
                SessionSettings::default(),
            ))
        };
        (conn, build)
    }

    fn manager(limit: usize) -> SessionManager {
        SessionManager::new(limit, Arc::new(MessagePools::new(PoolSettings::default())))
    }

    #[tokio::test]
    async fn limit_refuses_new_nodes() {
        let sink = MemorySink::new();
        let mgr = manager(1).with_telemetry(Telemetry::new(sink.clone()));
        let (_, build) = builder("n1");
        mgr.admit("n1", build).await.unwrap();
        let (_, build) = builder("n2");
        let err = mgr.admit("n2", build).await.unwrap_err();
        assert!(matches!(err, HubError::NodeLimit { limit: 1, .. }));
        assert_eq!(mgr.node_count(), 1);
        assert!(sink.events().contains(&HubEvent::NodeLimitReached { node_id: "n2".into(), limit: 1 }));
    }

    #[tokio::test]
    async fn same_node_replaces_at_the_limit() {
        let mgr = manager(1);
        let (old_conn, build) = builder("n1");
        let old = mgr.admit("n1", build).await.unwrap();
        let old_pool = Arc::clone(old.pool());

        let (new_conn, build) = builder("n1");
        let new = mgr.admit("n1", build).await.unwrap();

        assert_eq!(old.terminate_reason(), Some(TerminateReason::Replaced));
        assert!(old_pool.is_shut_down());
        assert_eq!(old_conn.close_count(), 1);
        assert!(!new_conn.is_closed());
        assert!(!Arc::ptr_eq(&old_pool, new.pool()));
        assert_eq!(mgr.node_count(), 1);
        assert!(Arc::ptr_eq(&mgr.get("n1").unwrap(), &new));
        // the old session's cleanup must not evict its successor
        assert!(!mgr.remove_session(&old));
        assert_eq!(mgr.node_count(), 1);
    }

    #[tokio::test]
    async fn buffered_pool_is_handed_to_the_session() {
        let mgr = manager(4);
        let buffered = mgr.pools().get_or_create("n1");
        let (_, build) = builder("n1");
        let session = mgr.admit("n1", build).await.unwrap();
        assert!(Arc::ptr_eq(&buffered, session.pool()));
        assert!(mgr.remove_session(&session));
        assert!(mgr.pools().get("n1").is_none());
        assert_eq!(mgr.node_count(), 0);
    }

    #[tokio::test]
    async fn routes_keepalive_and_acks() {
        let mgr = manager(4);
        let (_, build) = builder("n1");
        mgr.admit("n1", build).await.unwrap();
        assert!(mgr.keepalive("n1"));
        assert!(!mgr.keepalive("n2"));
        assert!(!mgr.receive_ack("n1", "unknown"));
    }

    #[tokio::test]
    async fn terminate_all_empties_registry() {
        let mgr = manager(4);
        for id in ["a", "b", "c"] {
            let (_, build) = builder(id);
            mgr.admit(id, build).await.unwrap();
        }
        mgr.terminate_all(TerminateReason::Shutdown).await;
        assert_eq!(mgr.node_count(), 0);
        assert!(mgr.sessions().is_empty());
    }

    #[tokio::test]
    async fn concurrent_admits_respect_limit() {
        let mgr = Arc::new(manager(3));
        let mut tasks = Vec::new();
        for i in 0..10 {
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                let id = format!("n{i}");
                let (_, build) = builder(&id);
                mgr.admit(&id, build).await.is_ok()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(mgr.node_count(), 3);
    }
}
