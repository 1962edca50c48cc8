//! TCP + mutual TLS listener and the matching client dialer.
//!
//! After the TLS handshake the client sends one frame holding its [`PeerHeaders`]; everything
//! after that is [`Message`] frames.

use super::codec::JsonCodec;
use super::{FramedConnection, PeerHeaders, TransportError};
use crate::message::Message;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;

/// Server-side TLS connection to a node.
pub type NodeConnection = FramedConnection<server::TlsStream<TcpStream>>;

/// Client-side TLS connection to the hub.
pub type HubConnection = FramedConnection<client::TlsStream<TcpStream>>;

/// Accepts TCP connections; the TLS and header exchange happen in [`Incoming::handshake`].
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("listener", &self.listener)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsListener {
    pub async fn bind(
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, acceptor: TlsAcceptor::from(config), handshake_timeout })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Next raw connection. Cheap; run the handshake on its own task.
    pub async fn accept(&self) -> Result<Incoming, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Incoming {
            stream,
            peer,
            acceptor: self.acceptor.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// A TCP connection that has not completed the TLS and header exchange yet.
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Complete TLS, then read the header frame, all within the handshake timeout.
    pub async fn handshake(self) -> Result<NodeConnection, TransportError> {
        let Incoming { stream, acceptor, handshake_timeout, .. } = self;
        let exchange = async move {
            let tls = acceptor.accept(stream).await?;
            let certificates = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            let mut framed = Framed::new(tls, JsonCodec::<PeerHeaders>::new());
            let headers = framed
                .next()
                .await
                .ok_or_else(|| TransportError::Handshake("closed before headers".into()))??;
            let framed = framed.map_codec(|_| JsonCodec::<Message>::new());
            Ok::<_, TransportError>(FramedConnection::new(framed, headers, certificates))
        };
        tokio::time::timeout(handshake_timeout, exchange)
            .await
            .map_err(|_| TransportError::Handshake("timed out".into()))?
    }
}

/// Connect to a hub as a node, sending `headers` once TLS is up.
pub async fn dial(
    addr: SocketAddr,
    server_name: &str,
    config: Arc<ClientConfig>,
    headers: PeerHeaders,
) -> Result<HubConnection, TransportError> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| TransportError::Handshake(format!("invalid server name: {e}")))?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let tls = TlsConnector::from(config).connect(name, stream).await?;
    let certificates = tls
        .get_ref()
        .1
        .peer_certificates()
        .map(<[_]>::to_vec)
        .unwrap_or_default();
    let mut framed = Framed::new(tls, JsonCodec::<PeerHeaders>::new());
    framed.send(headers.clone()).await?;
    let framed = framed.map_codec(|_| JsonCodec::<Message>::new());
    Ok(FramedConnection::new(framed, headers, certificates))
}
