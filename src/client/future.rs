//! Completion handles for submitted transactions.
//!
//! A [`ResponseFuture`] resolves with the handler's output or the error that
//! ended the transaction. Through it (or a cloned [`TransactionHandle`]) the
//! caller can abort the transaction, extend its read timeout, and register
//! listeners that run once the transaction is done.
//!
//! Dropping a [`ResponseFuture`] does not stop the transaction; call
//! [`ResponseFuture::abort`] for that.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use pin_project::pin_project;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::Error;

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Listener {
    Inline(Callback),
    On(Handle, Callback),
}

impl Listener {
    fn run(self) {
        match self {
            Listener::Inline(callback) => callback(),
            Listener::On(handle, callback) => {
                handle.spawn(async move { callback() });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Aborted,
    Cancelled,
}

impl Interrupt {
    pub(crate) fn into_error(self) -> Error {
        match self {
            Interrupt::Aborted => Error::Aborted,
            Interrupt::Cancelled => Error::Cancelled,
        }
    }
}

struct State {
    done: bool,
    interrupt: Option<Interrupt>,
    listeners: Vec<Listener>,
}

/// State shared by the future, its handles and the transaction task.
pub(crate) struct Shared {
    state: Mutex<State>,
    interrupted: Notify,
    activity: Mutex<Instant>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                done: false,
                interrupt: None,
                listeners: Vec::new(),
            }),
            interrupted: Notify::new(),
            activity: Mutex::new(Instant::now()),
        }
    }

    fn interrupt(&self, interrupt: Interrupt) {
        {
            let mut state = self.state.lock();
            if state.done || state.interrupt.is_some() {
                return;
            }
            state.interrupt = Some(interrupt);
        }
        tracing::debug!(?interrupt, "transaction interrupted");
        self.interrupted.notify_one();
    }

    /// Resolves once the transaction was aborted or cancelled.
    pub(crate) async fn interrupted(&self) -> Interrupt {
        loop {
            if let Some(interrupt) = self.state.lock().interrupt {
                return interrupt;
            }
            self.interrupted.notified().await;
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.state.lock().interrupt.is_some()
    }

    /// Last time the caller or the transaction reported activity.
    pub(crate) fn last_activity(&self) -> Instant {
        *self.activity.lock()
    }

    pub(crate) fn touch(&self) {
        *self.activity.lock() = Instant::now();
    }

    fn finish(&self) {
        let listeners = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener.run();
        }
    }

    fn add(&self, listener: Listener) {
        let mut state = self.state.lock();
        if state.done {
            drop(state);
            listener.run();
        } else {
            state.listeners.push(listener);
        }
    }
}

/// Resolves a [`ResponseFuture`] and runs its listeners, exactly once.
///
/// Dropping a completer without calling [`complete`](Completer::complete)
/// resolves the future with [`Error::Cancelled`].
pub(crate) struct Completer<T> {
    sender: Option<oneshot::Sender<Result<T, Error>>>,
    shared: Arc<Shared>,
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.sender.is_none())
            .finish()
    }
}

impl<T> Completer<T> {
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn complete(mut self, result: Result<T, Error>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.sender.take();
        self.shared.finish();
    }
}

/// Control over a running transaction, detached from its result.
#[derive(Clone)]
pub struct TransactionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

impl TransactionHandle {
    /// Has the transaction finished, successfully or not?
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// Stop the transaction. The handler sees [`Error::Aborted`] and the
    /// connection is discarded. Does nothing once the transaction is done.
    pub fn abort(&self) {
        self.shared.interrupt(Interrupt::Aborted);
    }

    /// Like [`abort`](Self::abort), resolving with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.interrupt(Interrupt::Cancelled);
    }

    /// Restart the read timeout, e.g. while the server is known to be busy.
    pub fn touch(&self) {
        self.shared.touch();
    }

    /// Run `listener` when the transaction is done, or now if it already is.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.add(Listener::Inline(Box::new(listener)));
    }

    /// Run `listener` on `handle`'s runtime when the transaction is done.
    pub fn add_listener_on<F>(&self, handle: &Handle, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .add(Listener::On(handle.clone(), Box::new(listener)));
    }
}

/// Result of a submitted transaction.
#[pin_project]
pub struct ResponseFuture<T> {
    #[pin]
    receiver: oneshot::Receiver<Result<T, Error>>,
    handle: TransactionHandle,
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("done", &self.handle.is_done())
            .finish()
    }
}

impl<T> ResponseFuture<T> {
    pub(crate) fn new() -> (Self, Completer<T>) {
        let (sender, receiver) = oneshot::channel();
        let shared = Arc::new(Shared::new());
        (
            Self {
                receiver,
                handle: TransactionHandle {
                    shared: shared.clone(),
                },
            },
            Completer {
                sender: Some(sender),
                shared,
            },
        )
    }

    /// A future that is already resolved with `error`.
    pub(crate) fn failed(error: Error) -> Self {
        let (future, completer) = Self::new();
        completer.complete(Err(error));
        future
    }

    /// Detached control handle.
    pub fn handle(&self) -> TransactionHandle {
        self.handle.clone()
    }

    /// See [`TransactionHandle::is_done`].
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// See [`TransactionHandle::abort`].
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// See [`TransactionHandle::cancel`].
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// See [`TransactionHandle::touch`].
    pub fn touch(&self) {
        self.handle.touch();
    }

    /// See [`TransactionHandle::add_listener`].
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.add_listener(listener);
    }

    /// See [`TransactionHandle::add_listener_on`].
    pub fn add_listener_on<F>(&self, handle: &Handle, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.add_listener_on(handle, listener);
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().receiver.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
