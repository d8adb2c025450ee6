//! Connection acquisition.
//!
//! The [`ConnectionManager`] hands a [`Connection`] to each transaction:
//! an idle one from the [`ConnectionPool`] when the partition has one,
//! otherwise a freshly opened one. Opening takes a permit from the global
//! limit and one from the per-partition limit; the permits live inside the
//! connection and are returned when it closes, whether it was pooled in
//! between or failed half way.
//!
//! Without an acquire timeout, hitting a limit fails immediately. With one,
//! the manager waits for a pooled connection to come back or a permit to be
//! released, up to the deadline.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use hyper::upgrade::Upgraded;
use parking_lot::Mutex;
use rustls::ClientConfig;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::conn::transport::{authority_uri, tls, BoxIo, Transport, TransportStream};
use super::conn::{Connection, ConnectionInfo};
use super::pool::{ConnectionPool, PartitionKey, PoolConfig, PoolableConnection};
use crate::bridge::io::TokioIo;
use crate::config::Config;
use crate::request::{ProxyServer, Request};
use crate::{BoxError, Error};

/// Acquires pooled or new connections within the configured limits.
pub struct ConnectionManager {
    config: Arc<Config>,
    pool: ConnectionPool,
    transport: Arc<dyn Transport>,
    tls: OnceLock<Arc<ClientConfig>>,
    global: Option<Arc<Semaphore>>,
    per_host: Mutex<HashMap<PartitionKey, Arc<Semaphore>>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pool", &self.pool)
            .field(
                "available",
                &self.global.as_ref().map(|s| s.available_permits()),
            )
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager opening connections through `transport`.
    pub fn new(config: Arc<Config>, transport: Arc<dyn Transport>) -> Self {
        let pool = ConnectionPool::new(PoolConfig::from(config.as_ref()));
        let global = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        Self {
            config,
            pool,
            transport,
            tls: OnceLock::new(),
            global,
            per_host: Mutex::new(HashMap::new()),
        }
    }

    /// The idle connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Partition `request` belongs to, by its own strategy or the client's.
    pub fn partition_key(&self, request: &Request) -> Result<PartitionKey, Error> {
        let proxy = self.config.proxy_for(request);
        request
            .partitioning()
            .unwrap_or(&self.config.partitioning)
            .partition_key(request.uri(), proxy)
    }

    /// A connection for `request`, pooled if possible.
    pub async fn acquire(&self, request: &Request) -> Result<Connection, Error> {
        if self.pool.is_closed() {
            return Err(Error::Closed);
        }

        let key = self.partition_key(request)?;
        let deadline = self
            .config
            .acquire_free_connection_timeout
            .map(|timeout| Instant::now() + timeout);

        let permits = loop {
            let available = self.pool.available();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(mut conn) = self.pool.poll(&key) {
                debug!(%key, conn.id = %conn.id(), "reusing pooled connection");
                conn.touch();
                return Ok(conn);
            }

            let refused = match self.try_permits(&key) {
                Ok(permits) => break permits,
                Err(refused) => refused,
            };

            let Some(deadline) = deadline else {
                debug!(%key, error = %refused, "connection limit reached");
                return Err(refused);
            };

            trace!(%key, "waiting for a free connection");
            tokio::select! {
                _ = &mut available => {
                    if self.pool.is_closed() {
                        return Err(Error::Closed);
                    }
                }
                permits = self.wait_permits(&key) => break permits?,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(%key, error = %refused, "timed out waiting for a free connection");
                    return Err(refused);
                }
            }
        };

        self.open(request, key, permits).await
    }

    /// A connection that is never pooled, acquired under its own timeout.
    pub async fn obtain_connection(&self, request: &Request) -> Result<Connection, Error> {
        let timeout = self
            .config
            .request_timeout_for(request)
            .or(self.config.connect_timeout);

        let mut conn = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.acquire(request))
                .await
                .map_err(|_| Error::RequestTimeout(timeout))??,
            None => self.acquire(request).await?,
        };
        conn.mark_do_not_cache();
        Ok(conn)
    }

    /// Return a connection after its transaction completed.
    ///
    /// The connection is pooled once hyper reports it ready for another
    /// request; otherwise it is dropped and its permits released.
    pub async fn release(&self, mut conn: Connection) -> bool {
        if conn.do_not_cache() || !conn.is_open() {
            self.discard(conn, "not reusable");
            return false;
        }

        if let Err(error) = conn.ready().await {
            trace!(conn.id = %conn.id(), %error, "connection not ready after response");
            return false;
        }

        let key = conn.key().clone();
        self.pool.offer(&key, conn)
    }

    /// Drop a connection without pooling it.
    pub fn discard(&self, conn: Connection, reason: &'static str) {
        trace!(conn.id = %conn.id(), key = %conn.key(), reason, "discarding connection");
        drop(conn);
    }

    /// Switch a proxied connection over to its established CONNECT tunnel,
    /// running TLS inside the tunnel for secure targets.
    pub(crate) async fn finish_tunnel(
        &self,
        conn: Connection,
        upgraded: Upgraded,
        request: &Request,
    ) -> Result<Connection, Error> {
        let io: BoxIo = Box::new(TokioIo::new(upgraded));
        let (host, _) = request.host_and_port()?;

        if request.is_secure() {
            let (io, session) = self.handshake_tls(io, host).await?;
            trace!(conn.id = %conn.id(), ?session, "tls established through tunnel");
            conn.over_tunnel(io, true).await
        } else {
            conn.over_tunnel(io, false).await
        }
    }

    /// Close the pool. Connections in use finish their transaction and are
    /// then dropped.
    pub fn close(&self) {
        self.pool.destroy();
    }

    fn try_permits(&self, key: &PartitionKey) -> Result<Vec<OwnedSemaphorePermit>, Error> {
        let mut permits = Vec::with_capacity(2);

        if let (Some(global), Some(max)) = (&self.global, self.config.max_connections) {
            let permit = global
                .clone()
                .try_acquire_owned()
                .map_err(|_| Error::TooManyConnections(max))?;
            permits.push(permit);
        }

        if let (Some(host), Some(max)) = (
            self.host_semaphore(key),
            self.config.max_connections_per_host,
        ) {
            let permit = host
                .try_acquire_owned()
                .map_err(|_| Error::TooManyConnectionsPerHost(max))?;
            permits.push(permit);
        }

        Ok(permits)
    }

    async fn wait_permits(&self, key: &PartitionKey) -> Result<Vec<OwnedSemaphorePermit>, Error> {
        let mut permits = Vec::with_capacity(2);
        if let Some(global) = &self.global {
            permits.push(
                global
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Closed)?,
            );
        }
        if let Some(host) = self.host_semaphore(key) {
            permits.push(host.acquire_owned().await.map_err(|_| Error::Closed)?);
        }
        Ok(permits)
    }

    fn host_semaphore(&self, key: &PartitionKey) -> Option<Arc<Semaphore>> {
        let max = self.config.max_connections_per_host?;
        let mut per_host = self.per_host.lock();
        Some(
            per_host
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(max)))
                .clone(),
        )
    }

    fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls
            .get_or_init(|| match &self.config.tls {
                Some(config) => config.clone(),
                None => Arc::new(tls::default_tls_config()),
            })
            .clone()
    }

    async fn handshake_tls(&self, io: BoxIo, host: &str) -> Result<(BoxIo, tls::TlsSession), Error> {
        tls::connect(
            io,
            host,
            self.tls_config(),
            self.config.hostname_verifier.as_deref(),
        )
        .await
    }

    async fn open(
        &self,
        request: &Request,
        key: PartitionKey,
        permits: Vec<OwnedSemaphorePermit>,
    ) -> Result<Connection, Error> {
        let (host, port) = request.host_and_port()?;
        let proxy = self.config.proxy_for(request);
        let (dial_host, dial_port) = match proxy {
            Some(proxy) => (proxy.host(), proxy.port()),
            None => (host, port),
        };
        let target = format!("{dial_host}:{dial_port}");

        debug!(%key, %target, "opening connection");
        let stream = match self.config.connect_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, self.dial(request, proxy, dial_host, dial_port))
                    .await
                    .map_err(|_| Error::ConnectTimeout {
                        target: target.clone(),
                        timeout,
                    })?
            }
            None => self.dial(request, proxy, dial_host, dial_port).await,
        }
        .map_err(|error| Error::connect(target.clone(), error))?;

        let TransportStream { stream, info } = stream;
        let tunnel = proxy.is_some() && (request.is_secure() || request.is_websocket());

        let (io, secure) = if request.is_secure() && !tunnel {
            let (io, session) = self.handshake_tls(stream, host).await?;
            trace!(%target, ?session, "tls established");
            (io, true)
        } else {
            (stream, false)
        };

        let mut conn =
            Connection::handshake(io, key, ConnectionInfo::new(info, secure, proxy.is_some()))
                .await?;
        for permit in permits {
            conn.hold(permit);
        }
        if tunnel {
            conn.set_tunnel_target(host.to_owned(), port);
        }

        debug!(conn.id = %conn.id(), key = %conn.key(), "connection established");
        Ok(conn)
    }

    async fn dial(
        &self,
        request: &Request,
        proxy: Option<&ProxyServer>,
        host: &str,
        port: u16,
    ) -> Result<TransportStream, BoxError> {
        let resolver = request.resolver().filter(|_| proxy.is_none());
        let Some(resolver) = resolver else {
            return self.transport.connect(authority_uri(host, port)?).await;
        };

        let addrs = resolver.resolve(host, port).await?;
        let mut last: Option<BoxError> = None;
        for addr in addrs {
            let uri = authority_uri(&addr.ip().to_string(), addr.port())?;
            trace!(%addr, "connecting to resolved address");
            match self.transport.connect(uri).await {
                Ok(stream) => return Ok(stream),
                Err(error) => last = Some(error),
            }
        }
        Err(last.unwrap_or_else(|| format!("resolver returned no addresses for {host}").into()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::client::conn::transport::duplex::{self, DuplexListener};

    assert_impl_all!(ConnectionManager: Send, Sync);

    async fn serve(mut listener: DuplexListener) {
        while let Some((_, io)) = listener.accept().await {
            tokio::spawn(async move {
                let service = hyper::service::service_fn(|_req: http::Request<hyper::body::Incoming>| async {
                    Ok::<_, hyper::Error>(http::Response::new(http_body_util::Empty::<
                        bytes::Bytes,
                    >::new()))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(io), service)
                    .await;
            });
        }
    }

    fn manager(config: Config) -> (ConnectionManager, duplex::DuplexTransport) {
        let (transport, listener) = duplex::pair();
        tokio::spawn(serve(listener));
        (
            ConnectionManager::new(Arc::new(config), Arc::new(transport.clone())),
            transport,
        )
    }

    fn request(url: &str) -> Request {
        Request::get(url).build().unwrap()
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let (manager, transport) = manager(Config::default());
        let request = request("http://example.com/");

        let conn = manager.acquire(&request).await.unwrap();
        let id = conn.id();
        assert!(manager.release(conn).await);

        let conn = manager.acquire(&request).await.unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(transport.connections_opened(), 1);
    }

    #[tokio::test]
    async fn per_host_limit_fails_fast() {
        let config = Config {
            max_connections_per_host: Some(1),
            ..Config::default()
        };
        let (manager, _) = manager(config);

        let _held = manager
            .acquire(&request("http://example.com/"))
            .await
            .unwrap();
        let error = manager
            .acquire(&request("http://example.com/other"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::TooManyConnectionsPerHost(1)));

        manager
            .acquire(&request("http://example.org/"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn global_limit_fails_fast() {
        let config = Config {
            max_connections: Some(1),
            ..Config::default()
        };
        let (manager, _) = manager(config);

        let held = manager
            .acquire(&request("http://example.com/"))
            .await
            .unwrap();
        let error = manager
            .acquire(&request("http://example.org/"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::TooManyConnections(1)));

        drop(held);
        manager
            .acquire(&request("http://example.org/"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waits_for_released_connection() {
        let config = Config {
            max_connections_per_host: Some(1),
            acquire_free_connection_timeout: Some(Duration::from_secs(5)),
            ..Config::default()
        };
        let (manager, transport) = manager(config);
        let manager = Arc::new(manager);
        let request = request("http://example.com/");

        let conn = manager.acquire(&request).await.unwrap();
        let id = conn.id();

        let waiter = {
            let manager = manager.clone();
            let request = request.clone();
            tokio::spawn(async move { manager.acquire(&request).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(manager.release(conn).await);
        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(transport.connections_opened(), 1);
    }

    #[tokio::test]
    async fn dropped_connection_frees_waiter() {
        let config = Config {
            max_connections_per_host: Some(1),
            acquire_free_connection_timeout: Some(Duration::from_secs(5)),
            ..Config::default()
        };
        let (manager, transport) = manager(config);
        let manager = Arc::new(manager);
        let request = request("http://example.com/");

        let conn = manager.acquire(&request).await.unwrap();
        let waiter = {
            let manager = manager.clone();
            let request = request.clone();
            tokio::spawn(async move { manager.acquire(&request).await })
        };
        tokio::task::yield_now().await;

        manager.discard(conn, "test");
        waiter.await.unwrap().unwrap();
        assert_eq!(transport.connections_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout() {
        let config = Config {
            max_connections_per_host: Some(1),
            acquire_free_connection_timeout: Some(Duration::from_millis(100)),
            ..Config::default()
        };
        let (manager, _) = manager(config);
        let request = request("http://example.com/");

        let _held = manager.acquire(&request).await.unwrap();
        let error = manager.acquire(&request).await.unwrap_err();
        assert!(matches!(error, Error::TooManyConnectionsPerHost(1)));
    }

    #[tokio::test]
    async fn do_not_cache_is_never_pooled() {
        let (manager, _) = manager(Config::default());
        let request = request("http://example.com/");

        let conn = manager.obtain_connection(&request).await.unwrap();
        assert!(conn.do_not_cache());
        assert!(!manager.release(conn).await);
        assert_eq!(manager.pool().idle_count(), 0);
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let (transport, listener) = duplex::pair();
        drop(listener);
        let manager = ConnectionManager::new(Arc::new(Config::default()), Arc::new(transport));

        let error = manager
            .acquire(&request("http://example.com/"))
            .await
            .unwrap_err();
        assert!(error.is_connect(), "{error:?}");
    }

    #[tokio::test]
    async fn proxied_secure_requests_wait_for_tunnel() {
        let (manager, _) = manager(Config::default());
        let request = Request::get("https://example.com/")
            .proxy(ProxyServer::new("proxy.local", 3128))
            .build()
            .unwrap();

        let conn = manager.acquire(&request).await.unwrap();
        assert_eq!(conn.tunnel_target(), Some(("example.com", 443)));
        assert!(conn.info().proxied);
        assert!(!conn.info().secure);
    }

    #[tokio::test]
    async fn closed_manager_refuses() {
        let (manager, _) = manager(Config::default());
        manager.close();
        assert!(matches!(
            manager.acquire(&request("http://example.com/")).await,
            Err(Error::Closed)
        ));
    }
}
