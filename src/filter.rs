//! Request, response and I/O exception filters.
//!
//! Filters are the hook for pluggable policies such as retries or request
//! signing. Request filters run once at submission. Response filters see the
//! status and headers of every response before redirects or authentication
//! are considered, and may ask for the request to be replayed. I/O exception
//! filters see transport failures that happen before any status arrived and
//! may ask for a replay as well. A replay reuses the same handler and future.

use http::HeaderMap;

use crate::request::Request;
use crate::response::ResponseStatus;
use crate::{BoxError, Error};

/// State handed through a filter chain.
#[derive(Debug, Clone)]
pub struct FilterContext {
    request: Request,
    status: Option<ResponseStatus>,
    headers: Option<HeaderMap>,
    replay: bool,
}

impl FilterContext {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            status: None,
            headers: None,
            replay: false,
        }
    }

    pub(crate) fn with_response(mut self, status: ResponseStatus, headers: HeaderMap) -> Self {
        self.status = Some(status);
        self.headers = Some(headers);
        self
    }

    /// The request being filtered.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Response status, for response filters.
    pub fn response_status(&self) -> Option<&ResponseStatus> {
        self.status.as_ref()
    }

    /// Response headers, for response filters.
    pub fn response_headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    /// Has a filter asked for a replay?
    pub fn replay_requested(&self) -> bool {
        self.replay
    }

    /// Swap in a different request without asking for a replay.
    pub fn with_request(mut self, request: Request) -> Self {
        self.request = request;
        self
    }

    /// Ask for `request` to be sent again in place of the current one.
    pub fn replay(mut self, request: Request) -> Self {
        self.request = request;
        self.replay = true;
        self
    }

    pub(crate) fn into_request(self) -> Request {
        self.request
    }
}

/// Runs before a request is sent.
pub trait RequestFilter: Send + Sync + 'static {
    /// Inspect or replace the request. Errors fail the transaction.
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, BoxError>;
}

/// Runs when a response status and headers arrive.
pub trait ResponseFilter: Send + Sync + 'static {
    /// Inspect the response; call [`FilterContext::replay`] to resend.
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, BoxError>;
}

/// Runs when the transport fails before a status arrives.
pub trait IoExceptionFilter: Send + Sync + 'static {
    /// Inspect the failure; call [`FilterContext::replay`] to resend.
    fn filter(&self, ctx: FilterContext, error: &Error) -> Result<FilterContext, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_marks_context() {
        let request = Request::get("http://example.com/").build().unwrap();
        let ctx = FilterContext::new(request.clone());
        assert!(!ctx.replay_requested());

        let other = Request::get("http://example.com/retry").build().unwrap();
        let ctx = ctx.replay(other.clone());
        assert!(ctx.replay_requested());
        assert_eq!(ctx.into_request(), other);
    }
}
