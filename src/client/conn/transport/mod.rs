//! Transports open the byte stream underneath a connection.
//!
//! A transport is a [`tower::Service`] from a [`Uri`] naming `host:port` to a
//! [`TransportStream`]. Any cloneable service with that shape is a
//! [`Transport`]; the connection manager holds it as a trait object.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::ServiceExt as _;

use crate::BoxError;

pub mod duplex;
pub mod tcp;
pub mod tls;

/// Object-safe bundle of the tokio I/O traits.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed byte stream.
pub type BoxIo = Box<dyn Io>;

/// Addresses of an established stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Address of the peer.
    pub remote_addr: Option<SocketAddr>,
    /// Local address.
    pub local_addr: Option<SocketAddr>,
}

/// A connected stream plus its addresses.
pub struct TransportStream {
    pub(crate) stream: BoxIo,
    pub(crate) info: StreamInfo,
}

impl TransportStream {
    /// Wrap a connected stream.
    pub fn new<S: Io>(stream: S, info: StreamInfo) -> Self {
        Self {
            stream: Box::new(stream),
            info,
        }
    }

    /// Addresses of the stream.
    pub fn info(&self) -> StreamInfo {
        self.info
    }
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send + 'static>>;

/// Opens transport streams.
pub trait Transport: Send + Sync + 'static {
    /// Connect to the authority of `uri`.
    fn connect(&self, uri: Uri) -> BoxFuture<TransportStream>;
}

impl<S> Transport for S
where
    S: tower::Service<Uri, Response = TransportStream> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    fn connect(&self, uri: Uri) -> BoxFuture<TransportStream> {
        let service = self.clone();
        Box::pin(async move { service.oneshot(uri).await.map_err(Into::into) })
    }
}

/// `http://host:port` for the transport, bracketing IPv6 literals.
pub(crate) fn authority_uri(host: &str, port: u16) -> Result<Uri, http::Error> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    Ok(Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query("/")
        .build()?)
}
