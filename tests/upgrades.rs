#![allow(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;
use courier::bridge::io::TokioIo;
use courier::client::websocket::accept_key;
use courier::handler::{AsyncHandler, UpgradeHandler};
use courier::request::ProxyServer;
use courier::{BoxError, Client, Error, Request};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

mod common;

use common::{client, response, ServerResponse};

#[derive(Default, Clone)]
struct Socket {
    upgraded: Arc<Mutex<Option<Upgraded>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl UpgradeHandler for Socket {
    fn on_upgrade(&mut self, upgraded: Upgraded) {
        *self.upgraded.lock() = Some(upgraded);
    }

    fn on_failure(&mut self, error: &Error) {
        self.failures.lock().push(error.to_string());
    }
}

#[derive(Default)]
struct WebSocketHandler {
    socket: Socket,
}

impl AsyncHandler for WebSocketHandler {
    type Output = Option<Upgraded>;

    fn on_completed(&mut self) -> Result<Self::Output, BoxError> {
        Ok(self.socket.upgraded.lock().take())
    }

    fn upgrade(&mut self) -> Option<&mut dyn UpgradeHandler> {
        Some(&mut self.socket)
    }
}

/// Accept a WebSocket handshake and greet the client once upgraded.
fn accept_websocket(req: http::Request<Incoming>) -> ServerResponse {
    let key = req.headers()["sec-websocket-key"]
        .to_str()
        .unwrap()
        .to_owned();
    assert_eq!(req.headers()["sec-websocket-version"], "13");

    tokio::spawn(async move {
        let upgraded = hyper::upgrade::on(req).await.unwrap();
        let mut io = TokioIo::new(upgraded);
        io.write_all(b"hello").await.unwrap();
        io.flush().await.unwrap();
    });

    http::Response::builder()
        .status(101)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-accept", accept_key(&key))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn greeting(upgraded: Upgraded) -> String {
    let mut io = TokioIo::new(upgraded);
    let mut buf = [0u8; 5];
    io.read_exact(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn websocket_upgrade() {
    let (client, transport) = client(Client::builder(), |req| async move {
        assert_eq!(req.headers()["upgrade"], "websocket");
        accept_websocket(req)
    });

    let request = Request::get("ws://example.com/socket").build().unwrap();
    let upgraded = client
        .submit_with(request, WebSocketHandler::default())
        .await
        .unwrap()
        .expect("connection should be upgraded");

    assert_eq!(greeting(upgraded).await, "hello");
    assert_eq!(transport.connections_opened(), 1);
    assert_eq!(client.manager().pool().idle_count(), 0);
}

#[tokio::test]
async fn rejected_websocket_fails() {
    let (client, _) = client(Client::builder(), |_| async { response(200, "no") });

    let handler = WebSocketHandler::default();
    let failures = handler.socket.failures.clone();
    let request = Request::get("ws://example.com/socket").build().unwrap();
    let error = client.submit_with(request, handler).await.unwrap_err();

    assert!(matches!(error, Error::WebSocketHandshake(_)), "{error}");
    assert_eq!(failures.lock().len(), 1);
}

#[tokio::test]
async fn websocket_through_proxy_tunnel() {
    let (client, _) = client(
        Client::builder().proxy(ProxyServer::new("proxy.local", 8080)),
        |req| async move {
            assert_eq!(req.method(), http::Method::CONNECT);
            assert_eq!(req.uri(), "example.com:80");

            tokio::spawn(async move {
                let upgraded = hyper::upgrade::on(req).await.unwrap();
                let service = hyper::service::service_fn(|req| async move {
                    Ok::<_, std::convert::Infallible>(accept_websocket(req))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(upgraded, service)
                    .with_upgrades()
                    .await;
            });
            response(200, "")
        },
    );

    let request = Request::get("ws://example.com/socket").build().unwrap();
    let upgraded = client
        .submit_with(request, WebSocketHandler::default())
        .await
        .unwrap()
        .expect("connection should be upgraded");
    assert_eq!(greeting(upgraded).await, "hello");
}
