//! One edge connection's lifecycle.
//!
//! [`NodeSession::start`] launches three tasks bound to the session's cancellation token:
//!
//! - the keepalive watchdog, which terminates the session when no keepalive arrives in time;
//! - the no-ack sender, which writes each queued message once;
//! - the ack sender, which writes one message per object at a time and waits for the node to
//!   acknowledge it, rewriting on every retry interval and re-queueing with backoff once the
//!   retry budget is spent.
//!
//! [`NodeSession::terminate`] runs once no matter how many paths call it: it cancels the token,
//! shuts the pool down and closes the connection.

use super::HubInfo;
use crate::error::{HubError, TerminateReason};
use crate::message::{operation, Message};
use crate::objectsync::SyncPoints;
use crate::pool::NodeMessagePool;
use crate::telemetry::{HubEvent, Telemetry};
use crate::transport::{Connection, TransportError};
use crate::workqueue::WorkQueue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timers and budgets of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Longest silence tolerated between keepalives.
    pub keepalive_interval: Duration,
    /// Pause between rewrites of an unacknowledged message.
    pub ack_retry_interval: Duration,
    /// Rewrites before the message goes back on the queue.
    pub ack_max_retries: usize,
    /// Bound on each write.
    pub write_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            ack_retry_interval: Duration::from_secs(5),
            ack_max_retries: 4,
            write_timeout: Duration::from_secs(30),
        }
    }
}

enum AckOutcome {
    Acked,
    TimedOut { writes: usize },
    Cancelled,
}

/// State of one connected node.
pub struct NodeSession {
    info: HubInfo,
    conn: Arc<dyn Connection>,
    pool: Arc<NodeMessagePool>,
    sync_points: SyncPoints,
    telemetry: Telemetry,
    settings: SessionSettings,
    keepalive_tx: mpsc::Sender<()>,
    keepalive_rx: Mutex<Option<mpsc::Receiver<()>>>,
    ack_waiters: Mutex<HashMap<String, oneshot::Sender<()>>>,
    terminate_reason: AtomicU8,
    terminated: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSession")
            .field("info", &self.info)
            .field("settings", &self.settings)
            .field("terminated", &self.is_terminated())
            .field("terminate_reason", &self.terminate_reason())
            .finish_non_exhaustive()
    }
}

impl NodeSession {
    pub fn new(
        info: HubInfo,
        conn: Arc<dyn Connection>,
        pool: Arc<NodeMessagePool>,
        sync_points: SyncPoints,
        settings: SessionSettings,
    ) -> Self {
        let (keepalive_tx, keepalive_rx) = mpsc::channel(1);
        Self {
            info,
            conn,
            pool,
            sync_points,
            telemetry: Telemetry::null(),
            settings,
            keepalive_tx,
            keepalive_rx: Mutex::new(Some(keepalive_rx)),
            ack_waiters: Mutex::new(HashMap::new()),
            terminate_reason: AtomicU8::new(0),
            terminated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn info(&self) -> &HubInfo {
        &self.info
    }

    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    pub fn pool(&self) -> &Arc<NodeMessagePool> {
        &self.pool
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Token cancelled when the session terminates.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the session has terminated.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// First reason recorded, if any.
    pub fn terminate_reason(&self) -> Option<TerminateReason> {
        TerminateReason::from_u8(self.terminate_reason.load(Ordering::Acquire))
    }

    fn set_terminate_reason(&self, reason: TerminateReason) {
        let _ = self.terminate_reason.compare_exchange(
            0,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.ack_waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the watchdog and both send loops. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        let rx = self.keepalive_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(rx) = rx else {
            tracing::warn!(target: "cloudhub::session", node_id = %self.info.node_id, "session already started");
            return;
        };
        tracing::info!(target: "cloudhub::session", node_id = %self.info.node_id, "start session");
        tokio::spawn(Arc::clone(self).run_watchdog(rx));
        tokio::spawn(Arc::clone(self).run_ack_sender());
        tokio::spawn(Arc::clone(self).run_noack_sender());
    }

    /// Reset the keepalive watchdog.
    pub fn keepalive(&self) {
        if self.keepalive_tx.try_send(()).is_err() {
            tracing::debug!(target: "cloudhub::session", node_id = %self.info.node_id, "keepalive already pending");
        }
    }

    /// Wake the ack sender waiting on `parent_id`. Returns whether one was waiting.
    pub fn receive_ack(&self, parent_id: &str) -> bool {
        match self.waiters().remove(parent_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// End the session. Only the first call has an effect; the first reason recorded wins.
    pub async fn terminate(&self, reason: TerminateReason) {
        self.set_terminate_reason(reason);
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = self.terminate_reason().unwrap_or(reason);
        tracing::info!(target: "cloudhub::session", node_id = %self.info.node_id, %reason, "terminating session");
        self.cancel.cancel();
        self.pool.shutdown();
        self.waiters().clear();
        if let Err(err) = self.conn.close().await {
            tracing::debug!(target: "cloudhub::session", node_id = %self.info.node_id, error = %err, "close failed");
        }
        self.telemetry
            .emit(HubEvent::SessionClosed { node_id: self.info.node_id.clone(), reason })
            .await;
    }

    async fn run_watchdog(self: Arc<Self>, mut keepalives: mpsc::Receiver<()>) {
        let interval = self.settings.keepalive_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = tokio::time::timeout(interval, keepalives.recv()) => match received {
                    Ok(Some(())) => {
                        tracing::trace!(target: "cloudhub::session", node_id = %self.info.node_id, "node is alive");
                    }
                    Ok(None) => return,
                    Err(_) => {
                        tracing::error!(
                            target: "cloudhub::session",
                            node_id = %self.info.node_id,
                            ?interval,
                            "keepalive timed out"
                        );
                        self.terminate(TerminateReason::Transport).await;
                        return;
                    }
                },
            }
        }
    }

    async fn next_key(&self, queue: &WorkQueue) -> Option<String> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            key = queue.get() => key,
        }
    }

    async fn fail(&self, err: HubError) {
        let reason = match &err {
            HubError::NodeStopped { .. } => TerminateReason::NodeStop,
            HubError::Transport(_) => TerminateReason::Transport,
            _ => TerminateReason::Shutdown,
        };
        tracing::error!(target: "cloudhub::session", node_id = %self.info.node_id, error = %err, "send loop failed");
        self.terminate(reason).await;
    }

    async fn run_noack_sender(self: Arc<Self>) {
        let queue = self.pool.noack_queue().clone();
        while let Some(key) = self.next_key(&queue).await {
            let result = self.sync_noack(&key).await;
            queue.forget(&key);
            queue.done(&key);
            if let Err(err) = result {
                self.fail(err).await;
                return;
            }
        }
        self.terminate(TerminateReason::Shutdown).await;
    }

    async fn sync_noack(&self, key: &str) -> Result<(), HubError> {
        let node_id = &self.info.node_id;
        let Some(mut msg) = self.pool.delete_noack(key) else {
            tracing::warn!(target: "cloudhub::session", %node_id, key, "no-ack message missing from store");
            return Err(HubError::NodeStopped { node_id: node_id.clone() });
        };
        if msg.is_node_stopped() {
            tracing::warn!(target: "cloudhub::session", %node_id, "node is deleted, its messages will be cleaned up");
            return Err(HubError::NodeStopped { node_id: node_id.clone() });
        }
        tracing::trace!(target: "cloudhub::session", %node_id, message = %msg.describe(), "send no-ack message");
        msg.trim_node_prefix();
        self.write(&msg).await?;
        self.telemetry
            .emit(HubEvent::MessageWritten {
                node_id: node_id.clone(),
                message_id: msg.id().to_string(),
                ack: false,
            })
            .await;
        Ok(())
    }

    async fn run_ack_sender(self: Arc<Self>) {
        let queue = self.pool.ack_queue().clone();
        while let Some(key) = self.next_key(&queue).await {
            let result = self.sync_ack(&queue, &key).await;
            queue.done(&key);
            match result {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    self.fail(err).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(target: "cloudhub::session", node_id = %self.info.node_id, error = %err, "ack message not delivered");
                }
            }
        }
        self.terminate(TerminateReason::Shutdown).await;
    }

    async fn sync_ack(&self, queue: &WorkQueue, key: &str) -> Result<(), HubError> {
        let node_id = &self.info.node_id;
        let Some(msg) = self.pool.get_ack(key) else {
            tracing::debug!(target: "cloudhub::session", %node_id, key, "ack message already gone");
            return Ok(());
        };
        tracing::trace!(target: "cloudhub::session", %node_id, message = %msg.describe(), "send ack message");

        let copy = msg.trimmed();
        match self.send_with_retry(&copy).await? {
            AckOutcome::Acked => {
                self.telemetry
                    .emit(HubEvent::AckReceived { node_id: node_id.clone(), message_id: msg.id().to_string() })
                    .await;
                self.save_delivered(&msg).await;
                queue.forget(key);
                Ok(())
            }
            AckOutcome::TimedOut { writes } => {
                queue.add_rate_limited(key);
                self.telemetry
                    .emit(HubEvent::AckTimeout {
                        node_id: node_id.clone(),
                        message_id: msg.id().to_string(),
                        attempts: writes,
                    })
                    .await;
                Err(HubError::Timeout { message_id: msg.id().to_string(), attempts: writes })
            }
            AckOutcome::Cancelled => Ok(()),
        }
    }

    async fn send_with_retry(&self, copy: &Message) -> Result<AckOutcome, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(copy.id().to_string(), tx);
        let outcome = self.await_ack(copy, rx).await;
        self.waiters().remove(copy.id());
        outcome
    }

    async fn await_ack(
        &self,
        copy: &Message,
        mut acked: oneshot::Receiver<()>,
    ) -> Result<AckOutcome, TransportError> {
        self.write(copy).await?;
        self.telemetry
            .emit(HubEvent::MessageWritten {
                node_id: self.info.node_id.clone(),
                message_id: copy.id().to_string(),
                ack: true,
            })
            .await;
        let mut writes = 1;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(AckOutcome::Cancelled),
                res = &mut acked => {
                    return Ok(match res {
                        Ok(()) => AckOutcome::Acked,
                        Err(_) => AckOutcome::Cancelled,
                    });
                }
                _ = tokio::time::sleep(self.settings.ack_retry_interval) => {
                    if writes > self.settings.ack_max_retries {
                        return Ok(AckOutcome::TimedOut { writes });
                    }
                    tracing::debug!(
                        target: "cloudhub::session",
                        node_id = %self.info.node_id,
                        message_id = %copy.id(),
                        writes,
                        "no ack yet, rewriting"
                    );
                    self.write(copy).await?;
                    writes += 1;
                }
            }
        }
    }

    async fn save_delivered(&self, msg: &Message) {
        if let Err(err) = self.sync_points.save_delivered(&self.info.node_id, msg).await {
            tracing::warn!(
                target: "cloudhub::objectsync",
                node_id = %self.info.node_id,
                message_id = %msg.id(),
                error = %err,
                "failed to save sync point"
            );
        }
        if msg.operation() == operation::DELETE {
            self.pool.delete(msg);
        }
    }

    async fn write(&self, msg: &Message) -> Result<(), TransportError> {
        self.conn.set_write_deadline(Some(Instant::now() + self.settings.write_timeout));
        self.conn.write_message_async(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{group, source, MESSAGE_OK};
    use crate::objectsync::{MemorySyncStore, SyncPointKey};
    use crate::pool::{ack_key, PoolSettings};
    use crate::telemetry::MemorySink;
    use crate::transport::memory::{pair, EdgePeer, MemoryConnection};
    use crate::transport::PeerHeaders;
    use serde_json::json;

    struct Fixture {
        session: Arc<NodeSession>,
        conn: Arc<MemoryConnection>,
        edge: EdgePeer,
        store: MemorySyncStore,
        sink: MemorySink,
    }

    fn fixture() -> Fixture {
        let (conn, edge) = pair(PeerHeaders::for_node("n1", "p"));
        let conn = Arc::new(conn);
        let store = MemorySyncStore::new();
        let sink = MemorySink::new();
        let pool = Arc::new(NodeMessagePool::new("n1", PoolSettings::default()));
        let session = NodeSession::new(
            HubInfo::new("n1", "p"),
            conn.clone(),
            pool,
            SyncPoints::new(Arc::new(store.clone())),
            SessionSettings::default(),
        )
        .with_telemetry(Telemetry::new(sink.clone()));
        Fixture { session: Arc::new(session), conn, edge, store, sink }
    }

    fn pod(op: &str, rv: &str) -> Message {
        Message::new()
            .with_route(source::EDGE_CONTROLLER, group::RESOURCE, "node/n1/default/pod/web", op)
            .with_resource_version(rv)
            .with_content(json!({"metadata": {"uid": "u1", "name": "web"}}))
    }

    fn put_ack(session: &NodeSession, msg: Message) {
        let key = ack_key(&msg).unwrap();
        session.pool().put_ack(key, msg);
    }

    #[tokio::test(start_paused = true)]
    async fn noack_message_is_trimmed_and_written_once() {
        let mut fx = fixture();
        fx.session.start();
        let msg = Message::new().with_route(source::EDGE_CONTROLLER, group::USER, "node/n1/default/podlist/all", operation::UPDATE);
        fx.session.pool().put_noack(msg.clone());

        let seen = fx.edge.recv().await.unwrap();
        assert_eq!(seen.id(), msg.id());
        assert_eq!(seen.resource(), "default/podlist/all");
        tokio::task::yield_now().await;
        assert_eq!(fx.session.pool().noack_len(), 0);
        assert!(fx.sink.events().iter().any(|e| matches!(e, HubEvent::MessageWritten { ack: false, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn acked_message_saves_sync_point() {
        let mut fx = fixture();
        fx.session.start();
        put_ack(&fx.session, pod(operation::UPDATE, "3"));

        let seen = fx.edge.recv().await.unwrap();
        assert_eq!(seen.resource(), "default/pod/web");
        fx.session.keepalive();
        assert!(fx.session.receive_ack(seen.id()));

        let key = SyncPointKey::new("default", "n1.u1");
        while fx.store.peek(&key).map(|p| p.status.object_resource_version) != Some("3".into()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // updates stay in the store for later dedup
        assert_eq!(fx.session.pool().ack_len(), 1);
        assert!(fx.sink.events().iter().any(|e| matches!(e, HubEvent::AckReceived { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn acked_delete_removes_record_and_message() {
        let mut fx = fixture();
        fx.session.start();
        put_ack(&fx.session, pod(operation::UPDATE, "3"));
        let first = fx.edge.recv().await.unwrap();
        fx.session.receive_ack(first.id());
        let key = SyncPointKey::new("default", "n1.u1");
        while fx.store.peek(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        put_ack(&fx.session, pod(operation::DELETE, ""));
        let delete = fx.edge.recv().await.unwrap();
        assert_eq!(delete.operation(), operation::DELETE);
        fx.session.receive_ack(delete.id());
        while fx.store.peek(&key).is_some() || fx.session.pool().ack_len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_rewritten_then_requeued() {
        let mut fx = fixture();
        let settings = SessionSettings { keepalive_interval: Duration::from_secs(3600), ..Default::default() };
        fx.session = Arc::new(
            NodeSession::new(
                HubInfo::new("n1", "p"),
                fx.conn.clone(),
                Arc::clone(fx.session.pool()),
                SyncPoints::new(Arc::new(fx.store.clone())),
                settings,
            )
            .with_telemetry(Telemetry::new(fx.sink.clone())),
        );
        fx.session.start();
        put_ack(&fx.session, pod(operation::UPDATE, "4"));

        let first = fx.edge.recv().await.unwrap();
        for _ in 0..4 {
            let again = fx.edge.recv().await.unwrap();
            assert_eq!(again.id(), first.id());
        }
        assert_eq!(fx.conn.write_count(), 5);

        // budget spent at 25s, key comes back after its backoff
        let requeued = fx.edge.recv().await.unwrap();
        assert_eq!(requeued.id(), first.id());
        assert!(fx.sink.events().iter().any(|e| matches!(e, HubEvent::AckTimeout { attempts: 5, .. })));
        assert_eq!(fx.session.pool().ack_len(), 1);

        fx.session.receive_ack(requeued.id());
        let key = SyncPointKey::new("default", "n1.u1");
        while fx.store.peek(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.store.peek(&key).unwrap().object_resource_version(), "4");
    }

    #[tokio::test(start_paused = true)]
    async fn missed_keepalive_terminates() {
        let fx = fixture();
        fx.session.start();
        fx.edge.closed().await;
        assert_eq!(fx.session.terminate_reason(), Some(TerminateReason::Transport));
        assert!(fx.session.pool().is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_is_idempotent() {
        let fx = fixture();
        fx.session.start();
        fx.session.terminate(TerminateReason::Replaced).await;
        fx.session.terminate(TerminateReason::Transport).await;
        fx.session.terminate(TerminateReason::Shutdown).await;
        tokio::task::yield_now().await;
        assert_eq!(fx.conn.close_count(), 1);
        assert_eq!(fx.session.terminate_reason(), Some(TerminateReason::Replaced));
        let closed = fx
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, HubEvent::SessionClosed { .. }))
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_a_transport_error() {
        let fx = fixture();
        fx.conn.fail_writes(true);
        fx.session.start();
        put_ack(&fx.session, pod(operation::UPDATE, "1"));
        fx.session.closed().await;
        assert_eq!(fx.session.terminate_reason(), Some(TerminateReason::Transport));
    }

    #[tokio::test(start_paused = true)]
    async fn node_stop_message_ends_session() {
        let fx = fixture();
        fx.session.start();
        let stop = Message::new().with_route(source::EDGE_CONTROLLER, group::RESOURCE, "node/n1", operation::DELETE);
        fx.session.pool().put_noack(stop);
        fx.session.closed().await;
        assert_eq!(fx.session.terminate_reason(), Some(TerminateReason::NodeStop));
        assert_eq!(fx.conn.write_count(), 0);
    }

    #[tokio::test]
    async fn ack_for_unknown_message_is_ignored() {
        let fx = fixture();
        let resp = Message::new().with_parent_id("nobody").with_content(MESSAGE_OK);
        assert!(!fx.session.receive_ack(resp.parent_id()));
    }
}
