//! The HTTP client.
//!
//! There are three levels of available APIs in this module:
//!
//! 1. The high-level [`Client`] API: submit a [`Request`] and get a
//!    [`ResponseFuture`], either buffering the whole [`Response`] or
//!    streaming it into your own [`AsyncHandler`]. Redirects, authentication,
//!    pooling and timeouts are handled along the way.
//! 2. The [`ConnectionManager`] and [`pool`] API, which hands out raw pooled
//!    [`Connection`][conn::Connection]s within the configured limits.
//! 3. The [connection][self::conn] API, which is the lowest-level API and
//!    allows for custom transports, such as the in-memory
//!    [`duplex`][conn::transport::duplex] transport used in tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::filter::FilterContext;
use crate::handler::{AsyncHandler, CompletionHandler};
use crate::request::Request;
use crate::response::Response;
use crate::{DebugLiteral, Error};

use self::conn::transport::Transport;
use self::conn::Connection;

mod builder;
pub mod conn;
mod future;
pub mod manager;
pub mod payload;
pub mod pool;
mod transaction;
pub mod websocket;
mod wire;

pub use self::builder::Builder;
pub use self::future::{ResponseFuture, TransactionHandle};
pub use self::manager::ConnectionManager;

/// Inner type for managing the client.
struct ClientRef {
    config: Arc<Config>,
    manager: Arc<ConnectionManager>,
    closed: AtomicBool,
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        self.manager.close();
    }
}

/// A high-level async HTTP client.
///
/// Cloning is cheap; clones share the pool and configuration.
///
/// # Example
/// ```no_run
/// # use courier::{Client, Request};
/// # async fn run() -> Result<(), courier::Error> {
/// let client = Client::builder().follow_redirect(true).build();
/// let response = client
///     .submit(Request::get("http://example.com").build()?)
///     .await?;
/// println!("Response: {}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_closed() { "closed" } else { "open" };
        f.debug_struct("Client")
            .field("state", &DebugLiteral(state))
            .field("manager", &self.inner.manager)
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl Client {
    /// Create a new builder for clients.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Client over TCP with the given configuration.
    pub fn new(config: Config) -> Self {
        Builder::from_config(config).build()
    }

    /// Client opening connections through `transport`.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let manager = Arc::new(ConnectionManager::new(config.clone(), transport));
        Client {
            inner: Arc::new(ClientRef {
                config,
                manager,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The client configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The connection manager behind this client.
    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Send `request` and buffer the whole response.
    pub fn submit(&self, request: Request) -> ResponseFuture<Response> {
        self.submit_with(request, CompletionHandler::new())
    }

    /// Send `request`, streaming the response into `handler`.
    ///
    /// Request filters run before this returns; a filter error resolves the
    /// future immediately. The returned future resolves with whatever
    /// [`AsyncHandler::on_completed`] produced. Must be called within a tokio
    /// runtime.
    pub fn submit_with<H>(&self, request: Request, mut handler: H) -> ResponseFuture<H::Output>
    where
        H: AsyncHandler,
    {
        let prepared = if self.is_closed() {
            Err(Error::Closed)
        } else {
            self.filter_request(request)
        };

        let upgradable = handler.upgrade().is_some();
        let request = match prepared {
            Ok(request) if request.is_websocket() && !upgradable => {
                Err(Error::InvalidRequest(
                    "websocket requests need a handler with upgrade support".into(),
                ))
            }
            other => other,
        };

        match request {
            Ok(request) => transaction::spawn(
                self.inner.config.clone(),
                self.inner.manager.clone(),
                request,
                handler,
            ),
            Err(error) => {
                debug!(%error, "request refused before sending");
                handler.on_throwable(&error);
                ResponseFuture::failed(error)
            }
        }
    }

    fn filter_request(&self, request: Request) -> Result<Request, Error> {
        let mut ctx = FilterContext::new(request);
        for filter in &self.inner.config.request_filters {
            ctx = filter.filter(ctx).map_err(Error::Handler)?;
        }
        Ok(ctx.into_request())
    }

    /// A connection for `request` that is never returned to the pool.
    ///
    /// Useful for protocols that take over the socket. The acquisition runs
    /// under the request timeout, or the connect timeout when there is none.
    pub async fn obtain_connection(&self, request: &Request) -> Result<Connection, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.manager.obtain_connection(request).await
    }

    /// Close the client. Pooled connections are dropped and further
    /// submissions fail with [`Error::Closed`]. Transactions in flight run
    /// to completion.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("closing client");
            self.inner.manager.close();
        }
    }

    /// Has [`close`](Self::close) been called?
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
