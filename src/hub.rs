//! Top-level wiring.
//!
//! A [`CloudHub`] owns the session registry, the dispatcher, the sync points and the
//! authorization layer, and runs:
//!
//! - the downstream dispatch loop draining the bus inbox,
//! - the sync-point reconciler (when an object snapshot is provided),
//! - one serve task per edge connection: authenticate, admit, start the session, then read
//!   upstream messages through authorization into the dispatcher until the session ends.
//!
//! ```rust,no_run
//! use cloudhub::{CloudHub, HubConfig};
//!
//! # async fn run() -> Result<(), cloudhub::HubError> {
//! let hub = CloudHub::from_config(HubConfig::load(None)?)?;
//! hub.start();
//! let listener = hub.bind().await?;
//! hub.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

use crate::auth::layer::InboundMessage;
use crate::auth::{
    AuthError, AuthorizationLayer, AuthorizerChain, CertificateAuthenticator, MemoryObjectGraph,
    MessageAuthorizer, ObjectGraph,
};
use crate::bus::{groups, ControlPlaneBus};
use crate::config::{ConfigError, HubConfig};
use crate::dispatcher::{MessageDispatcher, UpstreamService};
use crate::error::{HubError, TerminateReason};
use crate::message::{group, operation, source, Message, RESOURCE_NODE};
use crate::objectsync::{MemorySyncStore, ObjectSnapshot, Reconciler, SyncPointStore, SyncPoints};
use crate::pool::{MessagePools, NodeMessagePool};
use crate::session::{HubInfo, NodeSession, SessionManager, SessionSettings};
use crate::telemetry::Telemetry;
use crate::transport::server::TlsListener;
use crate::transport::tls::TlsMaterial;
use crate::transport::Connection;
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// `connect` or `disconnect` notice for `info`'s node, published to the edge controllers.
pub fn connection_event(info: &HubInfo, connected: bool) -> Message {
    let op = if connected { operation::CONNECT } else { operation::DISCONNECT };
    let msg = Message::new().with_route(
        source::CLOUD_HUB,
        group::RESOURCE,
        format!("{RESOURCE_NODE}/{}", info.node_id),
        op,
    );
    let timestamp = msg.header.timestamp / 1000;
    msg.with_content(json!({
        "event_type": op,
        "timestamp": timestamp,
        "client_id": info.node_id,
    }))
}

/// Assembles a [`CloudHub`].
pub struct CloudHubBuilder {
    config: HubConfig,
    bus: Option<ControlPlaneBus>,
    store: Option<Arc<dyn SyncPointStore>>,
    graph: Option<Arc<dyn ObjectGraph>>,
    snapshot: Option<Arc<dyn ObjectSnapshot>>,
    tls: Option<TlsMaterial>,
    telemetry: Telemetry,
}

impl fmt::Debug for CloudHubBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudHubBuilder")
            .field("config", &self.config)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl CloudHubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            bus: None,
            store: None,
            graph: None,
            snapshot: None,
            tls: None,
            telemetry: Telemetry::log(),
        }
    }

    /// Bus shared with the controllers. A private one is created otherwise.
    pub fn bus(mut self, bus: ControlPlaneBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sync-point backend. Defaults to [`MemorySyncStore`].
    pub fn store(mut self, store: Arc<dyn SyncPointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Node-to-object relations consulted by the `node` authorizer.
    pub fn object_graph(mut self, graph: Arc<dyn ObjectGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Control-plane view the reconciler compares sync points against.
    pub fn snapshot(mut self, snapshot: Arc<dyn ObjectSnapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Server identity and client CA. Enables certificate authentication of nodes.
    pub fn tls(mut self, material: TlsMaterial) -> Self {
        self.tls = Some(material);
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Result<CloudHub, HubError> {
        let config = self.config;
        config.validate()?;
        let telemetry = self.telemetry;

        let pools = Arc::new(MessagePools::new(config.pool_settings()?));
        let sessions =
            Arc::new(SessionManager::new(config.node_limit, pools).with_telemetry(telemetry.clone()));
        let store: Arc<dyn SyncPointStore> =
            self.store.unwrap_or_else(|| Arc::new(MemorySyncStore::new()));
        let sync_points = SyncPoints::new(store).with_telemetry(telemetry.clone());
        let bus = self.bus.unwrap_or_default();
        let dispatcher = MessageDispatcher::new(Arc::clone(&sessions), sync_points.clone(), bus.clone());

        let graph: Arc<dyn ObjectGraph> = self.graph.unwrap_or_else(|| Arc::new(MemoryObjectGraph::new()));
        let authorizer = MessageAuthorizer::new(
            AuthorizerChain::from_modes(&config.auth.modes, graph),
            config.auth.enabled,
            config.auth.debug,
        );
        let authorization = AuthorizationLayer::new(authorizer).with_telemetry(telemetry.clone());
        let authenticator = self
            .tls
            .as_ref()
            .map(|tls| CertificateAuthenticator::new(tls.ca_pem(), config.auth.enabled, config.auth.debug))
            .transpose()?;

        tracing::info!(
            target: "cloudhub::hub",
            node_limit = config.node_limit,
            keepalive = ?config.keepalive_interval(),
            auth_enabled = config.auth.enabled,
            auth_debug = config.auth.debug,
            "hub configured"
        );

        Ok(CloudHub {
            inner: Arc::new(HubInner {
                session_settings: config.session_settings(),
                config,
                bus,
                sessions,
                dispatcher,
                sync_points,
                authorization,
                authenticator,
                snapshot: self.snapshot,
                tls: self.tls,
                telemetry,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct HubInner {
    config: HubConfig,
    session_settings: SessionSettings,
    bus: ControlPlaneBus,
    sessions: Arc<SessionManager>,
    dispatcher: MessageDispatcher,
    sync_points: SyncPoints,
    authorization: AuthorizationLayer,
    authenticator: Option<CertificateAuthenticator>,
    snapshot: Option<Arc<dyn ObjectSnapshot>>,
    tls: Option<TlsMaterial>,
    telemetry: Telemetry,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The running hub. Cheap to clone.
#[derive(Clone)]
pub struct CloudHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for CloudHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudHub")
            .field("listen", &self.inner.config.listen)
            .field("nodes", &self.inner.sessions.node_count())
            .field("shutting_down", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CloudHub {
    pub fn builder(config: HubConfig) -> CloudHubBuilder {
        CloudHubBuilder::new(config)
    }

    /// Hub built from `config` alone, reading TLS material from the configured paths.
    pub fn from_config(config: HubConfig) -> Result<Self, HubError> {
        let tls = match &config.tls {
            Some(paths) => Some(TlsMaterial::from_files(&paths.ca, &paths.cert, &paths.key)?),
            None => None,
        };
        let mut builder = CloudHubBuilder::new(config);
        if let Some(tls) = tls {
            builder = builder.tls(tls);
        }
        builder.build()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &ControlPlaneBus {
        &self.inner.bus
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    pub fn sync_points(&self) -> &SyncPoints {
        &self.inner.sync_points
    }

    /// Token cancelled by [`CloudHub::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    /// Spawn the downstream dispatch loop and, with a snapshot, the reconciler.
    pub fn start(&self) {
        let inner = &self.inner;
        match inner.bus.take_inbox() {
            Some(inbox) => {
                let dispatcher = inner.dispatcher.clone();
                self.track(tokio::spawn(dispatcher.run_downstream(inbox, inner.cancel.clone())));
            }
            None => {
                tracing::warn!(target: "cloudhub::hub", "bus inbox already taken, downstream dispatch not started");
            }
        }
        if let Some(snapshot) = &inner.snapshot {
            let reconciler =
                Reconciler::new(Arc::clone(inner.sync_points.store()), Arc::clone(snapshot), inner.bus.clone())
                    .with_interval(inner.config.reconcile_interval());
            self.track(tokio::spawn(reconciler.run(inner.cancel.clone())));
        }
    }

    /// Bind the configured address with the configured TLS material.
    pub async fn bind(&self) -> Result<TlsListener, HubError> {
        let tls = self.inner.tls.as_ref().ok_or_else(|| ConfigError::Invalid {
            field: "tls",
            reason: "ca, cert and key are required to listen".into(),
        })?;
        let listener = TlsListener::bind(
            self.inner.config.listen,
            tls.server_config()?,
            self.inner.config.handshake_timeout(),
        )
        .await?;
        Ok(listener)
    }

    /// Accept edge connections until shutdown. Each connection is served on its own task.
    pub async fn serve(&self, listener: TlsListener) -> Result<(), HubError> {
        tracing::info!(target: "cloudhub::hub", addr = %listener.local_addr()?, "accepting edge connections");
        loop {
            let incoming = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(incoming) => incoming,
                    Err(err) => {
                        tracing::warn!(target: "cloudhub::hub", error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                        continue;
                    }
                },
            };
            let hub = self.clone();
            tokio::spawn(async move {
                let peer = incoming.peer_addr();
                match incoming.handshake().await {
                    Ok(conn) => {
                        if let Err(err) = hub.serve_connection(Arc::new(conn)).await {
                            tracing::debug!(target: "cloudhub::hub", %peer, error = %err, "connection not served");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "cloudhub::hub", %peer, error = %err, "handshake failed");
                    }
                }
            });
        }
    }

    fn authenticate(&self, conn: &dyn Connection) -> Result<HubInfo, AuthError> {
        if let Some(authenticator) = &self.inner.authenticator {
            return authenticator.authenticate(conn);
        }
        let headers = conn.peer_headers();
        let node_id = headers
            .node_id()
            .ok_or_else(|| AuthError::Unauthenticated("missing node_id header".into()))?;
        Ok(HubInfo::new(node_id, headers.project_id().unwrap_or_default()))
    }

    /// Serve one established connection until its session ends.
    ///
    /// Fails without reading anything when the peer cannot be authenticated or the node limit
    /// is reached; the connection is closed in both cases.
    pub async fn serve_connection(&self, conn: Arc<dyn Connection>) -> Result<(), HubError> {
        let inner = &self.inner;
        let info = match self.authenticate(conn.as_ref()) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(target: "cloudhub::auth", error = %err, "rejecting connection");
                let _ = conn.close().await;
                return Err(err.into());
            }
        };

        let build = {
            let info = info.clone();
            let conn = Arc::clone(&conn);
            let sync_points = inner.sync_points.clone();
            let telemetry = inner.telemetry.clone();
            let settings = inner.session_settings;
            move |pool: Arc<NodeMessagePool>| {
                Arc::new(NodeSession::new(info, conn, pool, sync_points, settings).with_telemetry(telemetry))
            }
        };
        let session = match inner.sessions.admit(&info.node_id, build).await {
            Ok(session) => session,
            Err(err) => {
                let _ = conn.close().await;
                return Err(err);
            }
        };

        session.start();
        tracing::info!(target: "cloudhub::hub", node_id = %info.node_id, project_id = %info.project_id, "edge node connected");
        self.publish_event(&info, true);

        self.read_loop(&session, conn.as_ref()).await;

        inner.sessions.remove_session(&session);
        let reason = session.terminate_reason();
        tracing::info!(target: "cloudhub::hub", node_id = %info.node_id, ?reason, "edge node disconnected");
        if reason != Some(TerminateReason::Replaced) {
            self.publish_event(&info, false);
        }
        Ok(())
    }

    async fn read_loop(&self, session: &Arc<NodeSession>, conn: &dyn Connection) {
        let upstream = self.inner.authorization.layer(UpstreamService::new(self.inner.dispatcher.clone()));
        loop {
            let msg = tokio::select! {
                _ = session.closed() => return,
                read = conn.read_message() => match read {
                    Ok(msg) => msg,
                    Err(err) => {
                        if !session.is_terminated() {
                            tracing::warn!(
                                target: "cloudhub::hub",
                                node_id = %session.node_id(),
                                error = %err,
                                "read failed"
                            );
                        }
                        session.terminate(TerminateReason::Transport).await;
                        return;
                    }
                },
            };
            let _ = upstream.clone().oneshot(InboundMessage::new(session.info().clone(), msg)).await;
        }
    }

    fn publish_event(&self, info: &HubInfo, connected: bool) {
        if let Err(err) = self.inner.bus.publish(groups::EDGE_CONTROLLER, connection_event(info, connected)) {
            tracing::warn!(
                target: "cloudhub::hub",
                node_id = %info.node_id,
                connected,
                error = %err,
                "failed to publish connection event"
            );
        }
    }

    /// Stop accepting, terminate every session and wait for background tasks.
    pub async fn shutdown(&self) {
        tracing::info!(target: "cloudhub::hub", "shutting down");
        self.inner.cancel.cancel();
        self.inner.sessions.terminate_all(TerminateReason::Shutdown).await;
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(target: "cloudhub::hub", error = %err, "background task failed");
            }
        }
    }
}
