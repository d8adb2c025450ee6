//! Response callbacks.
//!
//! An [`AsyncHandler`] receives one transaction's events in a fixed order:
//!
//! `on_status_received` → `on_headers_received` → `on_body_part_received`* →
//! `on_trailing_headers_received`? → `on_completed`
//!
//! Returning [`State::Abort`] from any callback skips straight to
//! `on_completed`. Failures are delivered once through `on_throwable`, and
//! no callback runs after `on_completed`.
//!
//! Optional capabilities are exposed through queries rather than extra
//! traits on the handler itself: [`AsyncHandler::progress`] for upload
//! progress and [`AsyncHandler::upgrade`] for protocol upgrades.

use http::HeaderMap;
use hyper::upgrade::Upgraded;

use crate::response::{BodyPart, Response, ResponseBuilder, ResponseStatus};
use crate::{BoxError, Error};

/// What the transaction should do after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Keep delivering events.
    Continue,
    /// Stop delivering events and complete.
    Abort,
}

/// Callbacks for one transaction.
pub trait AsyncHandler: Send + 'static {
    /// Value produced when the transaction completes.
    type Output: Send + 'static;

    /// The status line arrived.
    fn on_status_received(&mut self, status: &ResponseStatus) -> Result<State, BoxError> {
        let _ = status;
        Ok(State::Continue)
    }

    /// The response headers arrived.
    fn on_headers_received(&mut self, headers: &HeaderMap) -> Result<State, BoxError> {
        let _ = headers;
        Ok(State::Continue)
    }

    /// A chunk of body arrived. Chunks may be empty.
    fn on_body_part_received(&mut self, part: BodyPart) -> Result<State, BoxError> {
        let _ = part;
        Ok(State::Continue)
    }

    /// Trailing headers arrived after the last body part.
    fn on_trailing_headers_received(&mut self, trailers: &HeaderMap) -> Result<State, BoxError> {
        let _ = trailers;
        Ok(State::Continue)
    }

    /// The transaction failed.
    fn on_throwable(&mut self, error: &Error) {
        let _ = error;
    }

    /// The transaction finished; produce the result.
    fn on_completed(&mut self) -> Result<Self::Output, BoxError>;

    /// Upload progress capability.
    fn progress(&mut self) -> Option<&mut dyn ProgressListener> {
        None
    }

    /// Protocol upgrade capability, required for WebSocket requests.
    fn upgrade(&mut self) -> Option<&mut dyn UpgradeHandler> {
        None
    }
}

/// Upload progress notifications.
pub trait ProgressListener: Send {
    /// The request line and headers were handed to the connection.
    fn on_headers_written(&mut self) {}

    /// `amount` more bytes were written, `current` in total out of `total` if known.
    fn on_content_write_progress(&mut self, amount: u64, current: u64, total: Option<u64>) {
        let _ = (amount, current, total);
    }

    /// The whole request body was written.
    fn on_content_written(&mut self) {}
}

/// Receives the raw connection after a successful protocol upgrade.
pub trait UpgradeHandler: Send {
    /// The server switched protocols.
    fn on_upgrade(&mut self, upgraded: Upgraded);

    /// The upgrade failed.
    fn on_failure(&mut self, error: &Error) {
        let _ = error;
    }
}

/// Buffers the whole response into a [`Response`].
#[derive(Debug, Default)]
pub struct CompletionHandler {
    builder: ResponseBuilder,
}

impl CompletionHandler {
    /// New buffering handler.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AsyncHandler for CompletionHandler {
    type Output = Response;

    fn on_status_received(&mut self, status: &ResponseStatus) -> Result<State, BoxError> {
        self.builder.accumulate_status(status);
        Ok(State::Continue)
    }

    fn on_headers_received(&mut self, headers: &HeaderMap) -> Result<State, BoxError> {
        self.builder.accumulate_headers(headers);
        Ok(State::Continue)
    }

    fn on_body_part_received(&mut self, part: BodyPart) -> Result<State, BoxError> {
        self.builder.accumulate_part(part);
        Ok(State::Continue)
    }

    fn on_trailing_headers_received(&mut self, trailers: &HeaderMap) -> Result<State, BoxError> {
        self.builder.accumulate_trailers(trailers);
        Ok(State::Continue)
    }

    fn on_completed(&mut self) -> Result<Response, BoxError> {
        self.builder
            .build()
            .ok_or_else(|| "transaction completed before a status was received".into())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{StatusCode, Uri, Version};
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CompletionHandler: AsyncHandler, Send);

    #[test]
    fn completion_handler_buffers() {
        let mut handler = CompletionHandler::new();
        let status = ResponseStatus::new(
            StatusCode::OK,
            Version::HTTP_11,
            Uri::from_static("http://example.com/"),
        );
        handler.on_status_received(&status).unwrap();
        handler.on_headers_received(&HeaderMap::new()).unwrap();
        handler
            .on_body_part_received(BodyPart::new(Bytes::from_static(b"ok"), true))
            .unwrap();
        let response = handler.on_completed().unwrap();
        assert_eq!(response.body_as_string(), "ok");
    }

    #[test]
    fn completion_without_status_fails() {
        let mut handler = CompletionHandler::new();
        assert!(handler.on_completed().is_err());
    }
}
