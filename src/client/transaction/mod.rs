//! The per-request state machine.
//!
//! Each submitted request runs as one task. The task acquires a connection,
//! establishes a CONNECT tunnel when a proxy needs one, writes the request
//! and then routes the response: response filters first, then the status
//! handlers for redirects and authentication challenges, and finally the
//! user's [`AsyncHandler`]. Redirects, authentication retries and filter
//! replays loop back with a derived [`TransactionContext`] while keeping the
//! same handler and future.
//!
//! The whole task races the caller's abort and the request timeout; losing
//! the race drops whatever connection the task held, so it is never pooled.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::header::EXPECT;
use http::{HeaderMap, StatusCode};
use http_body::Body as _;
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, Instrument as _};

mod auth;
mod context;
mod redirect;
mod status;

use self::auth::AuthTarget;
use self::context::{Invocation, Phase, TransactionContext};
use self::status::StatusHandler;
use super::conn::Connection;
use super::future::{Completer, ResponseFuture, Shared};
use super::manager::ConnectionManager;
use super::payload::{payload_for, ContinueGate, ProgressEvent};
use super::wire::{self, TargetForm};
use super::websocket;
use crate::config::Config;
use crate::filter::FilterContext;
use crate::handler::{AsyncHandler, State};
use crate::request::Request;
use crate::response::{BodyPart, ResponseStatus};
use crate::Error;

/// Start a transaction for `request` on the current runtime.
pub(crate) fn spawn<H>(
    config: Arc<Config>,
    manager: Arc<ConnectionManager>,
    request: Request,
    handler: H,
) -> ResponseFuture<H::Output>
where
    H: AsyncHandler,
{
    let (future, completer) = ResponseFuture::new();
    let span = tracing::debug_span!(
        "transaction",
        method = %request.method(),
        uri = %request.uri()
    );

    let transaction = Transaction {
        config,
        manager,
        handler,
        shared: completer.shared().clone(),
        ctx: TransactionContext::new(request),
        websocket_key: None,
        last_io: Instant::now(),
        completed: false,
        upgrade_notified: false,
    };
    tokio::spawn(transaction.run(completer).instrument(span));
    future
}

enum Step<T> {
    Done(T),
    Next(TransactionContext, Option<Connection>),
}

struct Transaction<H: AsyncHandler> {
    config: Arc<Config>,
    manager: Arc<ConnectionManager>,
    handler: H,
    shared: Arc<Shared>,
    ctx: TransactionContext,
    websocket_key: Option<String>,
    last_io: Instant,
    completed: bool,
    upgrade_notified: bool,
}

impl<H: AsyncHandler> Transaction<H> {
    async fn run(mut self, completer: Completer<H::Output>) {
        let shared = self.shared.clone();
        let timeout = self.config.request_timeout_for(&self.ctx.request);

        let outcome = {
            let drive = self.drive();
            tokio::select! {
                biased;
                interrupt = shared.interrupted() => Err(interrupt.into_error()),
                result = within(timeout, drive) => result,
            }
        };

        match outcome {
            Ok(output) => {
                debug!(redirects = self.ctx.redirect_count, "transaction completed");
                completer.complete(Ok(output));
            }
            Err(error) => {
                debug!(%error, phase = ?self.ctx.phase, "transaction failed");
                self.ctx.enter(Phase::Aborted);
                if !self.completed {
                    if self.ctx.request.is_websocket() && !self.upgrade_notified {
                        if let Some(upgrade) = self.handler.upgrade() {
                            upgrade.on_failure(&error);
                        }
                    }
                    self.handler.on_throwable(&error);
                }
                completer.complete(Err(error));
            }
        }
    }

    async fn drive(&mut self) -> Result<H::Output, Error> {
        let mut reuse = None;
        loop {
            let (conn, response) = match self.send(reuse.take()).await {
                Ok(sent) => sent,
                Err(error) => {
                    self.replay_after(error)?;
                    continue;
                }
            };

            match self.receive(conn, response).await? {
                Step::Done(output) => return Ok(output),
                Step::Next(ctx, conn) => {
                    self.ctx = ctx;
                    reuse = conn;
                }
            }
        }
    }

    /// Ask the I/O exception filters whether `error` should be replayed.
    fn replay_after(&mut self, error: Error) -> Result<(), Error> {
        if self.config.io_exception_filters.is_empty() {
            return Err(error);
        }

        let mut ctx = FilterContext::new(self.ctx.request.clone());
        for filter in &self.config.io_exception_filters {
            ctx = filter.filter(ctx, &error).map_err(Error::Handler)?;
        }
        if !ctx.replay_requested() {
            return Err(error);
        }

        debug!(%error, "replaying request after transport error");
        self.ctx = self.ctx.replay(ctx.into_request());
        Ok(())
    }

    async fn connection(
        &mut self,
        request: &Request,
        reuse: Option<Connection>,
    ) -> Result<Connection, Error> {
        if let Some(mut conn) = reuse {
            let same_partition = self
                .manager
                .partition_key(request)
                .is_ok_and(|key| key == *conn.key());
            if same_partition && self.wait(conn.ready(), &mut None).await?.is_ok() {
                trace!(conn.id = %conn.id(), "reusing connection");
                return Ok(conn);
            }
            self.manager.release(conn).await;
        }

        self.ctx.enter(Phase::Connecting);
        self.manager.acquire(request).await
    }

    async fn send(
        &mut self,
        reuse: Option<Connection>,
    ) -> Result<(Connection, http::Response<Incoming>), Error> {
        let request = self.ctx.request.clone();
        let mut conn = self.connection(&request, reuse).await?;
        if conn.needs_tunnel() {
            conn = self.tunnel(conn, &request).await?;
        }

        self.ctx.enter(Phase::SendingRequest);
        let form = TargetForm::for_request(&request, conn.info().proxied);

        let mut payload = payload_for(&request)?;
        let empty = payload.length() == Some(0);

        let mut events = None;
        if self.handler.progress().is_some() {
            let (tx, rx) = mpsc::unbounded_channel();
            payload = payload.with_progress(tx);
            events = Some(rx);
        }

        let gate = if expects_continue(&request) && !empty {
            let (gate, handle) = ContinueGate::new(self.config.expect_continue_timeout);
            payload = payload.with_gate(gate);
            Some(handle)
        } else {
            None
        };

        let mut head = wire::prepare(&request, form, &self.config, payload)?;
        if request.is_websocket() {
            self.websocket_key = Some(websocket::apply(head.headers_mut())?);
        }
        if let Some(gate) = &gate {
            let gate = gate.clone();
            hyper::ext::on_informational(&mut head, move |response| {
                if response.status() == StatusCode::CONTINUE {
                    gate.open();
                }
            });
        }

        if let Some(progress) = self.handler.progress() {
            progress.on_headers_written();
            if empty {
                progress.on_content_written();
            }
        }

        self.ctx.enter(Phase::AwaitingStatus);
        let response = self.wait(conn.send_request(head), &mut events).await??;

        if let Some(gate) = gate {
            // final status before 100 Continue: the body may be half written
            if gate.open() {
                conn.mark_do_not_cache();
            }
        }
        if let Some(events) = &mut events {
            while let Ok(event) = events.try_recv() {
                self.on_progress(event);
            }
        }

        Ok((conn, response))
    }

    async fn tunnel(&mut self, mut conn: Connection, request: &Request) -> Result<Connection, Error> {
        self.ctx.enter(Phase::TunnelEstablishing);
        let Some((host, port)) = conn.tunnel_target().map(|(h, p)| (h.to_owned(), p)) else {
            return Ok(conn);
        };
        let authority = format!("{host}:{port}");

        let mut credentials = None;
        let mut invocation = Invocation::Continue;
        loop {
            self.wait(conn.ready(), &mut None).await??;
            let head = wire::connect_request(
                &host,
                port,
                self.config.proxy_for(request),
                credentials.take(),
                &self.config,
            )?;
            let response = self.wait(conn.send_request(head), &mut None).await??;
            let status = response.status();

            if status.is_success() {
                let upgraded = self
                    .wait(hyper::upgrade::on(response), &mut None)
                    .await?
                    .map_err(Error::protocol)?;
                self.ctx.tunnel_established = true;
                debug!(%authority, conn.id = %conn.id(), "tunnel established");
                return self.manager.finish_tunnel(conn, upgraded, request).await;
            }

            if status != StatusCode::PROXY_AUTHENTICATION_REQUIRED || invocation == Invocation::Stop
            {
                return Err(Error::Tunnel(status));
            }

            let Some(answer) = auth::answer(
                request,
                response.headers(),
                &self.config,
                AuthTarget::Proxy,
                Some(&authority),
            )?
            else {
                return Err(Error::Tunnel(status));
            };
            debug!(%authority, "proxy asked for credentials");
            invocation = answer.invocation;
            credentials = Some(answer.value);

            let keep_alive = self.config.keep_alive_strategy.keep_alive(
                request,
                response.version(),
                response.headers(),
            );
            let drained = keep_alive
                && self
                    .wait(response.into_body().collect(), &mut None)
                    .await?
                    .is_ok();
            if !drained {
                self.manager.discard(conn, "proxy closed after 407");
                conn = self.manager.acquire(request).await?;
            }
        }
    }

    async fn receive(
        &mut self,
        conn: Connection,
        response: http::Response<Incoming>,
    ) -> Result<Step<H::Output>, Error> {
        self.ctx.enter(Phase::ReceivingHeaders);
        let request = self.ctx.request.clone();
        let (parts, body) = response.into_parts();

        let info = *conn.info();
        let status = ResponseStatus::new(parts.status, parts.version, request.uri().clone())
            .with_addrs(info.remote_addr, info.local_addr);
        let keep_alive =
            self.config
                .keep_alive_strategy
                .keep_alive(&request, parts.version, &parts.headers);
        trace!(status = %parts.status, keep_alive, "response head");

        if let Some(replay) = self.filter_response(&status, &parts.headers)? {
            let conn = self.settle(conn, body, keep_alive).await;
            let next = self.ctx.replay(replay);
            return Ok(Step::Next(next, conn));
        }

        if request.is_websocket() {
            return self.upgrade(conn, status, parts, body).await;
        }

        let follow_up = match status::select(
            parts.status,
            self.ctx.invocation,
            self.config.is_redirect_allowed(&request),
        ) {
            Some(StatusHandler::Redirect) => redirect::follow(
                &self.ctx,
                parts.status,
                &parts.headers,
                &self.config,
                keep_alive,
            )?,
            Some(StatusHandler::Authorization) => auth::follow(
                &self.ctx,
                &parts.headers,
                &self.config,
                keep_alive,
                AuthTarget::Origin,
            )?,
            Some(StatusHandler::ProxyAuthorization) => auth::follow(
                &self.ctx,
                &parts.headers,
                &self.config,
                keep_alive,
                AuthTarget::Proxy,
            )?,
            None => None,
        };

        if let Some(follow_up) = follow_up {
            let reuse = follow_up.reuse_connection;
            let next = self.ctx.follow_up(follow_up);
            let conn = self.settle(conn, body, keep_alive).await;
            let conn = match conn {
                Some(conn) if !reuse => {
                    self.manager.release(conn).await;
                    None
                }
                conn => conn,
            };
            return Ok(Step::Next(next, conn));
        }

        self.deliver(conn, status, parts.headers, body, keep_alive)
            .await
    }

    fn filter_response(
        &self,
        status: &ResponseStatus,
        headers: &HeaderMap,
    ) -> Result<Option<Request>, Error> {
        if self.config.response_filters.is_empty() {
            return Ok(None);
        }

        let mut ctx = FilterContext::new(self.ctx.request.clone())
            .with_response(status.clone(), headers.clone());
        for filter in &self.config.response_filters {
            ctx = filter.filter(ctx).map_err(Error::Handler)?;
        }

        if ctx.replay_requested() {
            debug!(status = %status.status(), "response filter asked for a replay");
            Ok(Some(ctx.into_request()))
        } else {
            Ok(None)
        }
    }

    /// Read past an intercepted body so the connection can serve another
    /// request. Returns the connection if it is still usable.
    async fn settle(
        &mut self,
        conn: Connection,
        body: Incoming,
        keep_alive: bool,
    ) -> Option<Connection> {
        if keep_alive {
            if let Ok(Ok(_)) = self.wait(body.collect(), &mut None).await {
                return Some(conn);
            }
        }
        self.manager.discard(conn, "intercepted response not reusable");
        None
    }

    async fn deliver(
        &mut self,
        conn: Connection,
        status: ResponseStatus,
        headers: HeaderMap,
        mut body: Incoming,
        keep_alive: bool,
    ) -> Result<Step<H::Output>, Error> {
        if self.handler.on_status_received(&status).map_err(Error::Handler)? == State::Abort {
            return self.abort_delivery(conn);
        }
        if self.handler.on_headers_received(&headers).map_err(Error::Handler)? == State::Abort {
            return self.abort_delivery(conn);
        }

        self.ctx.enter(Phase::ReceivingBody);
        let mut last_delivered = false;
        let mut trailers = None;
        loop {
            let Some(frame) = self.wait(body.frame(), &mut None).await? else {
                break;
            };
            match frame.map_err(Error::from)?.into_data() {
                Ok(data) => {
                    let last = body.is_end_stream();
                    last_delivered = last;
                    let part = BodyPart::new(data, last);
                    if self.handler.on_body_part_received(part).map_err(Error::Handler)?
                        == State::Abort
                    {
                        return self.abort_delivery(conn);
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers = Some(map);
                    }
                }
            }
        }

        if !last_delivered {
            let part = BodyPart::new(Bytes::new(), true);
            if self.handler.on_body_part_received(part).map_err(Error::Handler)? == State::Abort {
                return self.abort_delivery(conn);
            }
        }
        if let Some(trailers) = trailers {
            if self
                .handler
                .on_trailing_headers_received(&trailers)
                .map_err(Error::Handler)?
                == State::Abort
            {
                return self.abort_delivery(conn);
            }
        }

        self.ctx.enter(Phase::Completing);
        if keep_alive {
            self.manager.release(conn).await;
        } else {
            self.manager.discard(conn, "not keep-alive");
        }
        self.complete().map(Step::Done)
    }

    async fn upgrade(
        &mut self,
        conn: Connection,
        status: ResponseStatus,
        parts: http::response::Parts,
        body: Incoming,
    ) -> Result<Step<H::Output>, Error> {
        let key = self.websocket_key.take().unwrap_or_default();
        if let Err(error) = websocket::verify(parts.status, &parts.headers, &key) {
            self.manager.discard(conn, "websocket handshake failed");
            return Err(error);
        }

        if self.handler.on_status_received(&status).map_err(Error::Handler)? == State::Abort {
            return self.abort_delivery(conn);
        }
        if self
            .handler
            .on_headers_received(&parts.headers)
            .map_err(Error::Handler)?
            == State::Abort
        {
            return self.abort_delivery(conn);
        }

        let response = http::Response::from_parts(parts, body);
        let upgraded = self
            .wait(hyper::upgrade::on(response), &mut None)
            .await?
            .map_err(Error::protocol)?;

        let Some(upgrade) = self.handler.upgrade() else {
            return Err(Error::InvalidRequest(
                "handler cannot take an upgraded connection".into(),
            ));
        };
        upgrade.on_upgrade(upgraded);
        self.upgrade_notified = true;
        debug!(conn.id = %conn.id(), "connection upgraded to websocket");

        self.manager.discard(conn, "upgraded");
        self.complete().map(Step::Done)
    }

    fn abort_delivery(&mut self, conn: Connection) -> Result<Step<H::Output>, Error> {
        debug!(phase = ?self.ctx.phase, "handler aborted the transaction");
        self.manager.discard(conn, "handler aborted");
        self.complete().map(Step::Done)
    }

    fn complete(&mut self) -> Result<H::Output, Error> {
        self.completed = true;
        self.ctx.enter(Phase::Done);
        self.handler.on_completed().map_err(Error::Handler)
    }

    fn on_progress(&mut self, event: ProgressEvent) {
        if let ProgressEvent::Content { current, .. } = event {
            self.ctx.bytes_written = current;
        }
        let Some(progress) = self.handler.progress() else {
            return;
        };
        match event {
            ProgressEvent::Content {
                amount,
                current,
                total,
            } => progress.on_content_write_progress(amount, current, total),
            ProgressEvent::Written => progress.on_content_written(),
        }
    }

    /// When the read timeout expires, counting from the latest I/O or the
    /// latest [`touch`](crate::client::TransactionHandle::touch).
    fn read_deadline(&self) -> Option<Instant> {
        let timeout = self.config.read_timeout_for(&self.ctx.request)?;
        Some(self.last_io.max(self.shared.last_activity()) + timeout)
    }

    /// Wait for `future` under the read timeout, forwarding upload progress
    /// meanwhile. Progress counts as activity.
    async fn wait<F: Future>(
        &mut self,
        future: F,
        events: &mut Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    ) -> Result<F::Output, Error> {
        tokio::pin!(future);
        loop {
            let deadline = self.read_deadline();
            tokio::select! {
                output = &mut future => {
                    self.last_io = Instant::now();
                    return Ok(output);
                }
                Some(event) = next_event(events) => {
                    self.last_io = Instant::now();
                    self.on_progress(event);
                }
                () = sleep_until(deadline) => {
                    if self.read_deadline().is_some_and(|at| at <= Instant::now()) {
                        let timeout = self
                            .config
                            .read_timeout_for(&self.ctx.request)
                            .unwrap_or_default();
                        return Err(Error::ReadTimeout(timeout));
                    }
                }
            }
        }
    }
}

async fn within<T>(
    timeout: Option<std::time::Duration>,
    future: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .unwrap_or_else(|_| Err(Error::RequestTimeout(timeout))),
        None => future.await,
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ProgressEvent>>,
) -> Option<ProgressEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn expects_continue(request: &Request) -> bool {
    request
        .headers()
        .get(EXPECT)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_continue_detection() {
        let plain = Request::post("http://example.com/").body("x").build().unwrap();
        assert!(!expects_continue(&plain));

        let expect = Request::post("http://example.com/")
            .header(EXPECT, "100-Continue")
            .body("x")
            .build()
            .unwrap();
        assert!(expects_continue(&expect));
    }

    #[tokio::test(start_paused = true)]
    async fn within_times_out() {
        let result: Result<(), Error> = within(
            Some(std::time::Duration::from_secs(1)),
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(Error::RequestTimeout(_))));
    }
}
