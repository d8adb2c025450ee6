#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use courier::bridge::io::TokioIo;
use courier::client::conn::transport::duplex::{self, DuplexListener, DuplexTransport};
use courier::client::Builder;
use courier::handler::{AsyncHandler, State};
use courier::response::{BodyPart, ResponseStatus};
use courier::{BoxError, Client, Error};
use http::HeaderMap;
use http_body_util::Full;
use hyper::body::Incoming;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

pub type ServerResponse = http::Response<Full<Bytes>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn response(status: u16, body: &'static str) -> ServerResponse {
    http::Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

/// Client whose connections are served in memory by `handler`.
pub fn client<F, Fut>(builder: Builder, handler: F) -> (Client, DuplexTransport)
where
    F: Fn(http::Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResponse> + Send + 'static,
{
    init_tracing();
    let (transport, listener) = duplex::pair();
    tokio::spawn(serve(listener, Arc::new(handler)));
    (builder.transport(transport.clone()).build(), transport)
}

pub async fn serve<F, Fut>(mut listener: DuplexListener, handler: Arc<F>)
where
    F: Fn(http::Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResponse> + Send + 'static,
{
    while let Some((_, io)) = listener.accept().await {
        let handler = handler.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: http::Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req).await) }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(io), service)
                .with_upgrades()
                .await;
        });
    }
}

/// Client whose every connection reads one request head and answers with
/// `raw` bytes before closing.
pub fn raw_client(builder: Builder, raw: &'static [u8]) -> (Client, DuplexTransport) {
    init_tracing();
    let (transport, mut listener) = duplex::pair();
    tokio::spawn(async move {
        while let Some((_, mut io)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match io.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = io.write_all(raw).await;
                let _ = io.shutdown().await;
            });
        }
    });
    (builder.transport(transport.clone()).build(), transport)
}

/// Handler recording every callback it sees.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<String>>>,
    pub abort_on_status: bool,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

impl AsyncHandler for Recorder {
    type Output = Vec<String>;

    fn on_status_received(&mut self, status: &ResponseStatus) -> Result<State, BoxError> {
        self.push(format!("status {}", status.status_code()));
        if self.abort_on_status {
            Ok(State::Abort)
        } else {
            Ok(State::Continue)
        }
    }

    fn on_headers_received(&mut self, _headers: &HeaderMap) -> Result<State, BoxError> {
        self.push("headers");
        Ok(State::Continue)
    }

    fn on_body_part_received(&mut self, part: BodyPart) -> Result<State, BoxError> {
        self.push(format!(
            "part {:?} last={}",
            String::from_utf8_lossy(part.bytes()),
            part.is_last()
        ));
        Ok(State::Continue)
    }

    fn on_trailing_headers_received(&mut self, _trailers: &HeaderMap) -> Result<State, BoxError> {
        self.push("trailers");
        Ok(State::Continue)
    }

    fn on_throwable(&mut self, error: &Error) {
        self.push(format!("throwable {error}"));
    }

    fn on_completed(&mut self) -> Result<Vec<String>, BoxError> {
        self.push("completed");
        Ok(self.events())
    }
}
