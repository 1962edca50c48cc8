//! [`Connection`] over any framed byte stream.

use super::codec::JsonCodec;
use super::{with_deadline, Connection, PeerHeaders, TransportError};
use crate::message::Message;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

type MessageFramed<S> = Framed<S, JsonCodec<Message>>;

/// Length-delimited JSON messages over `S`, with one read half and one mutex-guarded write half.
pub struct FramedConnection<S> {
    headers: PeerHeaders,
    certificates: Vec<CertificateDer<'static>>,
    reader: Mutex<SplitStream<MessageFramed<S>>>,
    writer: Mutex<SplitSink<MessageFramed<S>, Message>>,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
    closed: CancellationToken,
}

impl<S> fmt::Debug for FramedConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection")
            .field("headers", &self.headers)
            .field("certificates", &self.certificates.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        framed: MessageFramed<S>,
        headers: PeerHeaders,
        certificates: Vec<CertificateDer<'static>>,
    ) -> Self {
        let (writer, reader) = framed.split();
        Self {
            headers,
            certificates,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_deadline: StdMutex::new(None),
            write_deadline: StdMutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Wrap a raw stream that has already exchanged headers.
    pub fn from_stream(stream: S, headers: PeerHeaders, certificates: Vec<CertificateDer<'static>>) -> Self {
        Self::new(Framed::new(stream, JsonCodec::new()), headers, certificates)
    }
}

fn load(slot: &StdMutex<Option<Instant>>) -> Option<Instant> {
    *slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn store(slot: &StdMutex<Option<Instant>>, value: Option<Instant>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    fn peer_headers(&self) -> &PeerHeaders {
        &self.headers
    }

    async fn read_message(&self) -> Result<Message, TransportError> {
        let deadline = load(&self.read_deadline);
        let read = async {
            let mut reader = self.reader.lock().await;
            reader.next().await.unwrap_or(Err(TransportError::Closed))
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = with_deadline(deadline, "read", read) => res,
        }
    }

    async fn write_message_async(&self, msg: &Message) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let deadline = load(&self.write_deadline);
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(msg.clone()).await
        };
        with_deadline(deadline, "write", write).await
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        store(&self.read_deadline, deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        store(&self.write_deadline, deadline);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::operation;
    use std::sync::Arc;
    use std::time::Duration;

    fn pair() -> (FramedConnection<tokio::io::DuplexStream>, FramedConnection<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            FramedConnection::from_stream(a, PeerHeaders::for_node("n1", "p"), Vec::new()),
            FramedConnection::from_stream(b, PeerHeaders::new(), Vec::new()),
        )
    }

    #[tokio::test]
    async fn messages_cross_in_order() {
        let (hub, edge) = pair();
        for rv in ["1", "2", "3"] {
            let msg = Message::new().with_route("s", "g", "r", operation::UPDATE).with_resource_version(rv);
            hub.write_message_async(&msg).await.unwrap();
        }
        for rv in ["1", "2", "3"] {
            assert_eq!(edge.read_message().await.unwrap().resource_version(), rv);
        }
        assert_eq!(hub.peer_headers().node_id(), Some("n1"));
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (hub, _edge) = pair();
        let hub = Arc::new(hub);
        let reader = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.read_message().await })
        };
        tokio::task::yield_now().await;
        hub.close().await.unwrap();
        hub.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(TransportError::Closed)));
        let err = hub.write_message_async(&Message::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn peer_close_ends_reads() {
        let (hub, edge) = pair();
        edge.close().await.unwrap();
        drop(edge);
        assert!(matches!(hub.read_message().await, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_applies() {
        let (hub, _edge) = pair();
        hub.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)));
        assert!(matches!(hub.read_message().await, Err(TransportError::Deadline("read"))));
    }
}
