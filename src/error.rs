use std::time::Duration;

use thiserror::Error;

use crate::BoxError;

/// Client error type.
///
/// Every failure of a transaction is reported exactly once: to the handler
/// through [`AsyncHandler::on_throwable`](crate::AsyncHandler::on_throwable),
/// and to the caller through the [`ResponseFuture`](crate::client::ResponseFuture).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not connect to the remote host (refused, DNS failure, ...).
    #[error("connect to {target}: {source}")]
    Connect {
        /// The `host:port` we tried to reach.
        target: String,
        /// The underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Connecting took longer than the configured connect timeout.
    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout {
        /// The `host:port` we tried to reach.
        target: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The whole request took longer than the request timeout.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// No bytes were received for longer than the read timeout.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The global connection limit was reached.
    #[error("too many connections: {0}")]
    TooManyConnections(usize),

    /// The per-host connection limit was reached.
    #[error("too many connections per host: {0}")]
    TooManyConnectionsPerHost(usize),

    /// The configured hostname verifier rejected the TLS session.
    #[error("hostname verification failed for {0}")]
    HostnameVerification(String),

    /// TLS handshake failure.
    #[error("tls: {0}")]
    Tls(#[source] BoxError),

    /// Malformed response or unexpected end of the connection.
    #[error("protocol: {0}")]
    Protocol(#[source] BoxError),

    /// More redirects than allowed were followed.
    #[error("maximum redirects ({0}) exceeded")]
    MaxRedirects(usize),

    /// The transaction was aborted through its future.
    #[error("request aborted")]
    Aborted,

    /// The transaction was cancelled through its future.
    #[error("request cancelled")]
    Cancelled,

    /// The server refused or botched the WebSocket upgrade.
    #[error("websocket handshake: {0}")]
    WebSocketHandshake(String),

    /// The proxy refused to open a CONNECT tunnel.
    #[error("proxy refused tunnel: {0}")]
    Tunnel(http::StatusCode),

    /// The request URI could not be used.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The request could not be built or sent as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request body failed while being written.
    #[error("body: {0}")]
    Body(#[source] BoxError),

    /// The handler returned an error from one of its callbacks.
    #[error("handler: {0}")]
    Handler(#[source] BoxError),

    /// The client was closed.
    #[error("client closed")]
    Closed,
}

impl Error {
    pub(crate) fn protocol<E: Into<BoxError>>(error: E) -> Self {
        Error::Protocol(error.into())
    }

    pub(crate) fn connect<E: Into<BoxError>>(target: impl Into<String>, error: E) -> Self {
        Error::Connect {
            target: target.into(),
            source: error.into(),
        }
    }

    /// Did this error come from one of the timeouts?
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout { .. } | Error::RequestTimeout(_) | Error::ReadTimeout(_)
        )
    }

    /// Was the connection never established?
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::ConnectTimeout { .. }
                | Error::TooManyConnections(_)
                | Error::TooManyConnectionsPerHost(_)
                | Error::HostnameVerification(_)
                | Error::Tls(_)
        )
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Self {
        if error.is_user() {
            Error::InvalidRequest(error.to_string())
        } else {
            Error::Protocol(error.into())
        }
    }
}
