//! Per-transaction state and its carry-forward rules.

use http::Uri;
use tracing::trace;

use crate::request::Request;

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    TunnelEstablishing,
    SendingRequest,
    AwaitingStatus,
    ReceivingHeaders,
    ReceivingBody,
    Completing,
    Done,
    Aborted,
}

/// May status handlers intercept the next response?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Invocation {
    /// Look up a status handler for the next status.
    Continue,
    /// Deliver the next status to the handler as is.
    Stop,
}

/// Mutable state of one transaction.
///
/// A redirect, authentication retry or filter replay does not mutate the
/// context in place; it derives the next context through
/// [`TransactionContext::follow_up`] or [`TransactionContext::replay`].
#[derive(Debug, Clone)]
pub(crate) struct TransactionContext {
    pub(crate) request: Request,
    pub(crate) phase: Phase,
    pub(crate) invocation: Invocation,
    pub(crate) redirect_count: usize,
    pub(crate) last_redirect: Option<Uri>,
    pub(crate) tunnel_established: bool,
    pub(crate) bytes_written: u64,
}

/// What a status handler decided the next transaction looks like.
#[derive(Debug)]
pub(crate) struct FollowUp {
    pub(crate) request: Request,
    pub(crate) invocation: Invocation,
    pub(crate) reuse_connection: bool,
    pub(crate) redirect: Option<Uri>,
}

impl TransactionContext {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            phase: Phase::Connecting,
            invocation: Invocation::Continue,
            redirect_count: 0,
            last_redirect: None,
            tunnel_established: false,
            bytes_written: 0,
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        trace!(from = ?self.phase, to = ?phase, "transaction phase");
        self.phase = phase;
    }

    /// The next transaction after a status handler intercepted a response.
    ///
    /// The redirect counter and last redirect carry forward; a redirect hop
    /// increments the counter by exactly one.
    pub(crate) fn follow_up(&self, next: FollowUp) -> TransactionContext {
        let (redirect_count, last_redirect) = match next.redirect {
            Some(uri) => (self.redirect_count + 1, Some(uri)),
            None => (self.redirect_count, self.last_redirect.clone()),
        };

        TransactionContext {
            request: next.request,
            phase: Phase::Connecting,
            invocation: next.invocation,
            redirect_count,
            last_redirect,
            tunnel_established: false,
            bytes_written: 0,
        }
    }

    /// A fresh transaction for a filter-requested replay of `request`.
    ///
    /// Whether the replay reuses the current connection is decided by the
    /// caller, which hands that connection on or releases it.
    pub(crate) fn replay(&self, request: Request) -> TransactionContext {
        TransactionContext {
            request,
            phase: Phase::Connecting,
            invocation: Invocation::Continue,
            redirect_count: self.redirect_count,
            last_redirect: self.last_redirect.clone(),
            tunnel_established: false,
            bytes_written: 0,
        }
    }
}
