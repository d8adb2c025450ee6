//! In-memory transport for tests and embedding.
//!
//! [`pair`] returns a [`DuplexTransport`] for the client and a
//! [`DuplexListener`] that yields the server half of every connection the
//! client opens.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::Uri;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{StreamInfo, TransportStream};

const DEFAULT_BUFFER: usize = 64 * 1024;

/// Client side of an in-memory transport.
#[derive(Debug, Clone)]
pub struct DuplexTransport {
    max_buf_size: usize,
    sender: mpsc::UnboundedSender<(Uri, DuplexStream)>,
    opened: Arc<AtomicUsize>,
}

impl DuplexTransport {
    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }
}

/// Server side of an in-memory transport.
#[derive(Debug)]
pub struct DuplexListener {
    receiver: mpsc::UnboundedReceiver<(Uri, DuplexStream)>,
}

impl DuplexListener {
    /// Next connection, with the URI the client dialed. `None` once all
    /// transports are dropped.
    pub async fn accept(&mut self) -> Option<(Uri, DuplexStream)> {
        self.receiver.recv().await
    }
}

/// Connected transport and listener.
pub fn pair() -> (DuplexTransport, DuplexListener) {
    with_buffer(DEFAULT_BUFFER)
}

/// Connected transport and listener with a custom pipe buffer size.
pub fn with_buffer(max_buf_size: usize) -> (DuplexTransport, DuplexListener) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        DuplexTransport {
            max_buf_size,
            sender,
            opened: Arc::new(AtomicUsize::new(0)),
        },
        DuplexListener { receiver },
    )
}

impl tower::Service<Uri> for DuplexTransport {
    type Response = TransportStream;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<TransportStream, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let (client, server) = tokio::io::duplex(self.max_buf_size);
        let sent = self.sender.send((req, server));
        if sent.is_ok() {
            self.opened.fetch_add(1, Ordering::AcqRel);
        }

        Box::pin(async move {
            sent.map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
            Ok(TransportStream::new(client, StreamInfo::default()))
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tower::ServiceExt as _;

    use super::*;

    #[tokio::test]
    async fn duplex_round_trip() {
        let (transport, mut listener) = pair();
        let counter = transport.clone();

        let mut stream = transport
            .oneshot(Uri::from_static("http://example.com"))
            .await
            .unwrap();
        let (uri, mut server) = listener.accept().await.unwrap();
        assert_eq!(uri, "http://example.com/");
        assert_eq!(counter.connections_opened(), 1);

        stream.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn closed_listener_refuses() {
        let (transport, listener) = pair();
        drop(listener);
        let error = transport
            .oneshot(Uri::from_static("http://example.com"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionRefused);
    }
}
