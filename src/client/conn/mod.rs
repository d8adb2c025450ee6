//! Client connections.
//!
//! A [`Connection`] is an HTTP/1.1 client connection over a transport stream
//! (TCP, TLS, an in-memory duplex, or a CONNECT tunnel). The hyper connection
//! driver runs on its own task; the [`Connection`] value holds the sending
//! half plus the bookkeeping the pool and the transaction state machine need.
//!
//! Permits taken from the manager's connection limits travel with the
//! connection and are released when it is dropped.

use std::fmt;
use std::future::poll_fn;
use std::net::SocketAddr;

use http::Response;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod transport;

use self::transport::{BoxIo, StreamInfo};
use super::payload::Payload;
use super::pool::{ConnectionId, PartitionKey, PoolableConnection};
use crate::bridge::io::TokioIo;
use crate::Error;

/// What is known about an established connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Address of the peer (the proxy when proxied).
    pub remote_addr: Option<SocketAddr>,
    /// Local address.
    pub local_addr: Option<SocketAddr>,
    /// Was TLS negotiated?
    pub secure: bool,
    /// Does this connection go through a proxy?
    pub proxied: bool,
}

impl ConnectionInfo {
    pub(crate) fn new(stream: StreamInfo, secure: bool, proxied: bool) -> Self {
        Self {
            remote_addr: stream.remote_addr,
            local_addr: stream.local_addr,
            secure,
            proxied,
        }
    }
}

/// An HTTP/1.1 client connection.
pub struct Connection {
    id: ConnectionId,
    sender: http1::SendRequest<Payload>,
    key: PartitionKey,
    info: ConnectionInfo,
    created: Instant,
    last_used: Instant,
    do_not_cache: bool,
    tunnel_target: Option<(String, u16)>,
    permits: Vec<OwnedSemaphorePermit>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("info", &self.info)
            .field("do_not_cache", &self.do_not_cache)
            .field("tunnel_target", &self.tunnel_target)
            .finish()
    }
}

impl Connection {
    /// Run the HTTP/1.1 handshake over `io` and spawn the connection driver.
    pub(crate) async fn handshake(
        io: BoxIo,
        key: PartitionKey,
        info: ConnectionInfo,
    ) -> Result<Self, Error> {
        Self::handshake_with_id(ConnectionId::next(), io, key, info).await
    }

    async fn handshake_with_id(
        id: ConnectionId,
        io: BoxIo,
        key: PartitionKey,
        info: ConnectionInfo,
    ) -> Result<Self, Error> {
        trace!(conn.id = %id, %key, "handshake h1");
        let (sender, conn) = http1::Builder::new()
            .handshake::<_, Payload>(TokioIo::new(io))
            .await
            .map_err(Error::protocol)?;

        tokio::spawn(async move {
            match conn.with_upgrades().await {
                Ok(()) => trace!(conn.id = %id, "connection closed"),
                Err(error) => debug!(conn.id = %id, %error, "connection driver error"),
            }
        });

        let now = Instant::now();
        Ok(Self {
            id,
            sender,
            key,
            info,
            created: now,
            last_used: now,
            do_not_cache: false,
            tunnel_target: None,
            permits: Vec::new(),
        })
    }

    /// Replace the stream of a connection whose CONNECT tunnel was just
    /// established (typically with TLS over the tunnel). Identity, permits
    /// and flags carry over.
    pub(crate) async fn over_tunnel(self, io: BoxIo, secure: bool) -> Result<Self, Error> {
        let info = ConnectionInfo {
            secure,
            ..self.info
        };
        let mut conn = Self::handshake_with_id(self.id, io, self.key.clone(), info).await?;
        conn.created = self.created;
        conn.do_not_cache = self.do_not_cache;
        conn.permits = self.permits;
        Ok(conn)
    }

    pub(crate) fn hold(&mut self, permit: OwnedSemaphorePermit) {
        self.permits.push(permit);
    }

    pub(crate) fn set_tunnel_target(&mut self, host: String, port: u16) {
        self.tunnel_target = Some((host, port));
    }

    /// Target still waiting for a CONNECT tunnel through the proxy.
    pub(crate) fn tunnel_target(&self) -> Option<(&str, u16)> {
        self.tunnel_target
            .as_ref()
            .map(|(host, port)| (host.as_str(), *port))
    }

    pub(crate) fn needs_tunnel(&self) -> bool {
        self.tunnel_target.is_some()
    }

    /// Send a request and wait for its response head.
    pub(crate) async fn send_request(
        &mut self,
        request: http::Request<Payload>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        self.touch();
        self.sender.send_request(request).await
    }

    /// Wait until the connection can take another request.
    pub(crate) async fn ready(&mut self) -> Result<(), Error> {
        poll_fn(|cx| self.sender.poll_ready(cx))
            .await
            .map_err(Error::protocol)
    }

    /// Record activity, e.g. after a pool hit.
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Partition this connection belongs to.
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Connection details.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// When the connection was last used for a request.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Never return this connection to the pool.
    pub fn mark_do_not_cache(&mut self) {
        self.do_not_cache = true;
    }
}

impl PoolableConnection for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn created_at(&self) -> Instant {
        self.created
    }

    fn is_secure(&self) -> bool {
        self.info.secure
    }

    fn do_not_cache(&self) -> bool {
        self.do_not_cache
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::BodyExt as _;
    use hyper::service::service_fn;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Connection: Send);

    async fn serve(io: tokio::io::DuplexStream) {
        let service = service_fn(|_req: http::Request<Incoming>| async {
            Ok::<_, hyper::Error>(Response::new(http_body_util::Full::new(Bytes::from_static(
                b"hello",
            ))))
        });
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await;
    }

    #[tokio::test]
    async fn send_over_duplex() {
        let _ = tracing_subscriber::fmt::try_init();

        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(serve(server));

        let mut conn = Connection::handshake(
            Box::new(client),
            PartitionKey::route("http", "example.com", 80),
            ConnectionInfo::default(),
        )
        .await
        .unwrap();
        assert!(conn.is_open());

        for _ in 0..2 {
            conn.ready().await.unwrap();
            let request = http::Request::builder()
                .uri("/")
                .header(http::header::HOST, "example.com")
                .body(Payload::empty())
                .unwrap();
            let response = conn.send_request(request).await.unwrap();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, "hello");
        }
    }

    #[tokio::test]
    async fn closed_peer_closes_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::handshake(
            Box::new(client),
            PartitionKey::route("http", "example.com", 80),
            ConnectionInfo::default(),
        )
        .await
        .unwrap();
        drop(server);

        let request = http::Request::builder()
            .uri("/")
            .body(Payload::empty())
            .unwrap();
        assert!(conn.send_request(request).await.is_err());
        assert!(conn.ready().await.is_err() || !conn.is_open());
    }
}
