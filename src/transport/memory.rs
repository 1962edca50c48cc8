//! In-process connection pair.
//!
//! [`pair`] returns the hub side, a [`MemoryConnection`], and the node side, an [`EdgePeer`].
//! Messages keep the same size limit as the wire codec. The hub side counts writes and closes
//! so callers can assert on them.

use super::codec::encode_payload;
use super::{with_deadline, Connection, PeerHeaders, TransportError};
use crate::message::{operation, Message, MESSAGE_OK};
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Create a connected hub/edge pair. The hub side reports `headers` as the peer's headers.
pub fn pair(headers: PeerHeaders) -> (MemoryConnection, EdgePeer) {
    let (to_hub, inbound) = mpsc::unbounded_channel();
    let (outbound, from_hub) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let hub = MemoryConnection {
        headers,
        certificates: Vec::new(),
        inbound: Mutex::new(inbound),
        outbound,
        write_path: Mutex::new(()),
        writes: AtomicUsize::new(0),
        closes: AtomicUsize::new(0),
        fail_writes: AtomicBool::new(false),
        read_deadline: StdMutex::new(None),
        write_deadline: StdMutex::new(None),
        closed: closed.clone(),
    };
    (hub, EdgePeer { to_hub, from_hub, closed })
}

/// Hub side of an in-process link.
#[derive(Debug)]
pub struct MemoryConnection {
    headers: PeerHeaders,
    certificates: Vec<CertificateDer<'static>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    outbound: mpsc::UnboundedSender<Message>,
    write_path: Mutex<()>,
    writes: AtomicUsize,
    closes: AtomicUsize,
    fail_writes: AtomicBool,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
    closed: CancellationToken,
}

impl MemoryConnection {
    /// Report `certificates` as the peer's TLS chain.
    pub fn with_certificates(mut self, certificates: Vec<CertificateDer<'static>>) -> Self {
        self.certificates = certificates;
        self
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Calls to `close` that actually closed the link.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn load(slot: &StdMutex<Option<Instant>>) -> Option<Instant> {
    *slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Connection for MemoryConnection {
    fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    fn peer_headers(&self) -> &PeerHeaders {
        &self.headers
    }

    async fn read_message(&self) -> Result<Message, TransportError> {
        let deadline = load(&self.read_deadline);
        let read = async {
            let mut inbound = self.inbound.lock().await;
            inbound.recv().await.ok_or(TransportError::Closed)
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = with_deadline(deadline, "read", read) => res,
        }
    }

    async fn write_message_async(&self, msg: &Message) -> Result<(), TransportError> {
        let deadline = load(&self.write_deadline);
        let write = async {
            let _path = self.write_path.lock().await;
            if self.closed.is_cancelled() {
                return Err(TransportError::Closed);
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure").into());
            }
            encode_payload(msg)?;
            self.outbound.send(msg.clone()).map_err(|_| TransportError::Closed)?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        with_deadline(deadline, "write", write).await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Node side of an in-process link.
#[derive(Debug)]
pub struct EdgePeer {
    to_hub: mpsc::UnboundedSender<Message>,
    from_hub: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
}

impl EdgePeer {
    /// Send a message to the hub.
    pub fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.to_hub.send(msg).map_err(|_| TransportError::Closed)
    }

    /// Acknowledge `msg` the way an edge agent does.
    pub fn ack(&self, msg: &Message) -> Result<(), TransportError> {
        self.send(msg.response(MESSAGE_OK))
    }

    /// Send a keepalive.
    pub fn keepalive(&self) -> Result<(), TransportError> {
        self.send(Message::new().with_route("", "", "", operation::KEEPALIVE))
    }

    /// Next message written by the hub.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_hub.recv().await
    }

    /// Next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.from_hub.try_recv().ok()
    }

    /// Resolves once the hub closes the link.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_reach_edge_and_acks_reach_hub() {
        let (hub, mut edge) = pair(PeerHeaders::for_node("n1", "p"));
        let msg = Message::new().with_route("s", "g", "r", operation::UPDATE);
        hub.write_message_async(&msg).await.unwrap();
        let seen = edge.recv().await.unwrap();
        assert_eq!(seen, msg);
        edge.ack(&seen).unwrap();
        let ack = hub.read_message().await.unwrap();
        assert_eq!(ack.parent_id(), msg.id());
        assert_eq!(hub.write_count(), 1);
    }

    #[tokio::test]
    async fn close_counts_once_and_blocks_io() {
        let (hub, edge) = pair(PeerHeaders::new());
        hub.close().await.unwrap();
        hub.close().await.unwrap();
        assert_eq!(hub.close_count(), 1);
        assert!(edge.is_closed());
        assert!(matches!(hub.read_message().await, Err(TransportError::Closed)));
        assert!(matches!(hub.write_message_async(&Message::new()).await, Err(TransportError::Closed)));
        assert!(edge.keepalive().is_err());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_io() {
        let (hub, _edge) = pair(PeerHeaders::new());
        hub.fail_writes(true);
        let err = hub.write_message_async(&Message::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert_eq!(hub.write_count(), 0);
    }
}
