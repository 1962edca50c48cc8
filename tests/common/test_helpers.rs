#![allow(dead_code)]

use cloudhub::message::{group, source};
use cloudhub::objectsync::{SyncPointSpec, SyncPointStore};
use cloudhub::transport::memory::{pair, EdgePeer, MemoryConnection};
use cloudhub::{
    CloudHub, Connection, HubConfig, HubError, MemorySyncStore, Message, PeerHeaders, SyncPoint,
    SyncPointKey, Telemetry,
};
use serde_json::json;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

/// Defaults with a keepalive long enough to never fire unless a test wants it to.
pub fn config() -> HubConfig {
    HubConfig { keepalive_interval_secs: 3600, ..HubConfig::default() }
}

pub fn hub(config: HubConfig, store: &MemorySyncStore) -> CloudHub {
    CloudHub::builder(config)
        .store(Arc::new(store.clone()))
        .telemetry(Telemetry::null())
        .build()
        .unwrap()
}

/// Pod `web` with UID `u1` addressed to `node`.
pub fn pod(node: &str, op: &str, rv: &str) -> Message {
    Message::new()
        .with_route(source::EDGE_CONTROLLER, group::RESOURCE, format!("node/{node}/default/pod/web"), op)
        .with_resource_version(rv)
        .with_content(json!({"metadata": {"uid": "u1", "name": "web", "namespace": "default"}}))
}

pub fn pod_key(node: &str) -> SyncPointKey {
    SyncPointKey::new("default", format!("{node}.u1"))
}

/// Record that `node` already confirmed version `rv` of pod `web`.
pub async fn seed(store: &MemorySyncStore, node: &str, rv: &str) {
    let spec = SyncPointSpec { object_kind: "pod".into(), object_name: "web".into(), ..Default::default() };
    let mut point = store.create(SyncPoint::new(pod_key(node), spec)).await.unwrap();
    point.status.object_resource_version = rv.into();
    store.update_status(&point).await.unwrap();
}

pub fn confirmed_version(store: &MemorySyncStore, node: &str) -> Option<String> {
    store.peek(&pod_key(node)).map(|p| p.object_resource_version().to_string())
}

/// Poll `cond` every 10ms, failing after ten seconds of (possibly paused) time.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// A node connected to a hub over an in-memory link.
pub struct EdgeNode {
    pub conn: Arc<MemoryConnection>,
    pub edge: EdgePeer,
    pub serve: JoinHandle<Result<(), HubError>>,
}

/// In-memory link whose hub side reports `node_id` in its headers.
pub fn link(node_id: &str) -> (MemoryConnection, EdgePeer) {
    pair(PeerHeaders::for_node(node_id, "project"))
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<MemoryConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Serve a new link for `node_id` and wait until its session is registered.
pub async fn connect(hub: &CloudHub, node_id: &str) -> EdgeNode {
    connect_with(hub, link(node_id)).await
}

pub async fn connect_with(hub: &CloudHub, (conn, edge): (MemoryConnection, EdgePeer)) -> EdgeNode {
    let conn = Arc::new(conn);
    let node_id = conn.peer_headers().node_id().unwrap_or_default().to_string();
    let serving = hub.clone();
    let served: Arc<dyn Connection> = conn.clone();
    let serve = tokio::spawn(async move { serving.serve_connection(served).await });
    let sessions = Arc::clone(hub.sessions());
    eventually(|| sessions.get(&node_id).is_some_and(|s| same_connection(s.connection(), &conn))).await;
    EdgeNode { conn, edge, serve }
}

/// Log output captured by a `tracing_subscriber::fmt` subscriber.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's logs into the returned buffer until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}

/// A throwaway CA issuing server and node certificates.
pub struct Pki {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

/// PEM certificate and key of one issued identity, with the DER certificate.
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: rustls::pki_types::CertificateDer<'static>,
}

impl Pki {
    pub fn new() -> Self {
        use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "cloudhub-test-ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    fn issue(&self, cn: &str, names: Vec<String>, purpose: rcgen::ExtendedKeyUsagePurpose) -> Identity {
        use rcgen::{CertificateParams, DnType, KeyPair};
        let mut params = CertificateParams::new(names).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.extended_key_usages = vec![purpose];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Identity { cert_pem: cert.pem(), key_pem: key.serialize_pem(), der: cert.der().clone() }
    }

    /// Server identity valid for `localhost`.
    pub fn server(&self) -> Identity {
        self.issue("cloudhub", vec!["localhost".into()], rcgen::ExtendedKeyUsagePurpose::ServerAuth)
    }

    /// Node identity with common name `cn`.
    pub fn node(&self, cn: &str) -> Identity {
        self.issue(cn, Vec::new(), rcgen::ExtendedKeyUsagePurpose::ClientAuth)
    }

    /// Hub-side TLS material.
    pub fn hub_material(&self) -> cloudhub::transport::tls::TlsMaterial {
        let server = self.server();
        cloudhub::transport::tls::TlsMaterial::from_pem(self.ca_pem(), server.cert_pem, server.key_pem)
    }

    /// Node-side TLS material presenting a certificate named `cn`.
    pub fn node_material(&self, cn: &str) -> cloudhub::transport::tls::TlsMaterial {
        let node = self.node(cn);
        cloudhub::transport::tls::TlsMaterial::from_pem(self.ca_pem(), node.cert_pem, node.key_pem)
    }
}
