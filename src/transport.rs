//! Wire transport to edge nodes.
//!
//! Everything above this module talks to a node through the [`Connection`] capability set.
//! Two implementations ship with the crate:
//!
//! - [`FramedConnection`]: length-delimited JSON frames over any byte stream, used with mutual
//!   TLS by [`server::TlsListener`];
//! - [`memory::MemoryConnection`]: an in-process pair for embedding and tests.
//!
//! Each connection serializes its writes internally, so two writes never interleave on the wire.

pub mod codec;
pub mod framed;
pub mod memory;
pub mod server;
pub mod tls;

pub use codec::{JsonCodec, MAX_FRAME_LENGTH};
pub use framed::FramedConnection;

use crate::message::Message;
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

/// Header carrying the node id in the handshake frame.
pub const HEADER_NODE_ID: &str = "node_id";
/// Header carrying the project id in the handshake frame.
pub const HEADER_PROJECT_ID: &str = "project_id";

/// Errors raised by a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds the {max} byte limit")]
    FrameTooLarge { max: usize },
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("{0} deadline exceeded")]
    Deadline(&'static str),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Headers presented by the client when the connection is established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerHeaders(BTreeMap<String, String>);

impl PeerHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for a node handshake.
    pub fn for_node(node_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::new().with(HEADER_NODE_ID, node_id).with(HEADER_PROJECT_ID, project_id)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn node_id(&self) -> Option<&str> {
        self.get(HEADER_NODE_ID).filter(|v| !v.is_empty())
    }

    pub fn project_id(&self) -> Option<&str> {
        self.get(HEADER_PROJECT_ID)
    }
}

/// Full-duplex, message-framed, authenticated link to one edge node.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Certificates the peer presented during the TLS handshake.
    fn peer_certificates(&self) -> &[CertificateDer<'static>];

    /// Headers the peer sent right after the handshake.
    fn peer_headers(&self) -> &PeerHeaders;

    /// Read the next message. Only one task reads a connection.
    async fn read_message(&self) -> Result<Message, TransportError>;

    /// Write one message. Concurrent callers are serialized.
    async fn write_message_async(&self, msg: &Message) -> Result<(), TransportError>;

    /// Bound subsequent reads; `None` removes the bound.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Bound subsequent writes; `None` removes the bound.
    fn set_write_deadline(&self, deadline: Option<Instant>);

    /// Close the connection, unblocking any pending read. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Run `fut` until `deadline`, reporting `what` on expiry.
pub(crate) async fn with_deadline<F, T>(
    deadline: Option<Instant>,
    what: &'static str,
    fut: F,
) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| TransportError::Deadline(what))?,
        None => fut.await,
    }
}
