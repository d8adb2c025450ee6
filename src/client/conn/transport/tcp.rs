//! TCP transport.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::Uri;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{trace, Instrument as _};

use super::{StreamInfo, TransportStream};

/// Connects over TCP, resolving names with the system resolver.
///
/// Resolved addresses are tried in order until one accepts. Timeouts are
/// applied by the connection manager.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpTransport {
    /// Transport with `TCP_NODELAY` set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear `TCP_NODELAY` on new sockets.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    async fn connect(&self, host: String, port: u16) -> Result<TcpStream, TcpConnectionError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(TcpConnectionError::msg("dns resolution"))?
            .collect();

        if addrs.is_empty() {
            return Err(TcpConnectionError::new(format!("no addresses for {host}")));
        }

        let mut last = None;
        for address in addrs {
            trace!(%address, "tcp connecting");
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    stream
                        .set_nodelay(self.nodelay)
                        .map_err(TcpConnectionError::msg("set nodelay"))?;
                    return Ok(stream);
                }
                Err(error) => {
                    trace!(%address, %error, "tcp connect attempt failed");
                    last = Some(error);
                }
            }
        }

        Err(TcpConnectionError::build(
            "exhausted connection candidates",
            last.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")),
        ))
    }
}

type BoxFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

impl tower::Service<Uri> for TcpTransport {
    type Response = TransportStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let (host, port) = match get_host_and_port(&req) {
            Ok(target) => target,
            Err(error) => return Box::pin(std::future::ready(Err(error))),
        };

        let transport = self.clone();
        let span = tracing::trace_span!("tcp", %host, port);

        Box::pin(
            async move {
                let stream = transport.connect(host, port).await?;
                let info = StreamInfo {
                    remote_addr: stream.peer_addr().ok(),
                    local_addr: stream.local_addr().ok(),
                };
                trace!(peer.addr = ?info.remote_addr, "tcp connected");
                Ok(TransportStream::new(stream, info))
            }
            .instrument(span),
        )
    }
}

/// Error opening a TCP connection.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TcpConnectionError {
    fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self::build(message, error)
    }

    fn build<S, E>(message: S, error: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(error)),
        }
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

fn get_host_and_port(uri: &Uri) -> Result<(String, u16), TcpConnectionError> {
    let host = uri
        .host()
        .ok_or_else(|| TcpConnectionError::new("missing host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = match uri.port_u16() {
        Some(port) => port,
        None => match uri.scheme_str() {
            Some("http" | "ws") => 80,
            Some("https" | "wss") => 443,
            _ => return Err(TcpConnectionError::new("missing port")),
        },
    };

    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;

    use super::*;

    #[test]
    fn host_and_port() {
        assert_eq!(
            get_host_and_port(&Uri::from_static("https://example.com")).unwrap(),
            ("example.com".to_owned(), 443)
        );
        assert_eq!(
            get_host_and_port(&Uri::from_static("http://[::1]:8080")).unwrap(),
            ("::1".to_owned(), 8080)
        );
        assert!(get_host_and_port(&Uri::from_static("/relative")).is_err());
    }

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let stream = TcpTransport::new().oneshot(uri).await.unwrap();
        assert_eq!(stream.info().remote_addr, Some(addr));
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let error = TcpTransport::new().oneshot(uri).await.unwrap_err();
        assert!(error.to_string().starts_with("exhausted connection candidates"));
    }
}
