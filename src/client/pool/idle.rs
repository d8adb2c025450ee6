use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::{ConnectionId, PoolableConnection};

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Deadlines applied to idle connections.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Expiry {
    pub(super) idle_timeout: Option<Duration>,
    pub(super) ttl: Option<Duration>,
}

impl Expiry {
    fn is_expired<T: PoolableConnection>(&self, entry: &Idle<T>, now: Instant) -> bool {
        let idle = self
            .idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .is_some_and(|timeout| now.saturating_duration_since(entry.at) >= timeout);
        idle || self.is_past_ttl(&entry.inner, now)
    }

    pub(super) fn is_past_ttl<T: PoolableConnection>(&self, conn: &T, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(conn.created_at()) >= ttl)
    }
}

/// Idle connections of one partition, most recently used last.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T: PoolableConnection> IdleConnections<T> {
    pub(super) fn push(&mut self, inner: T) {
        self.inner.push(Idle::new(inner));
    }

    /// Pop the most recently used connection that is still usable.
    ///
    /// Unusable connections found on the way are dropped; the second value
    /// counts them.
    pub(super) fn pop(&mut self, expiry: Expiry) -> (Option<T>, usize) {
        let now = Instant::now();
        let mut dropped = 0;

        trace!("checking {} idle connections", self.len());

        while let Some(entry) = self.inner.pop() {
            if expiry.is_expired(&entry, now) {
                trace!(conn.id = %entry.inner.id(), "found expired connection");
                dropped += 1;
                continue;
            }

            if entry.inner.is_open() {
                trace!(conn.id = %entry.inner.id(), "found idle connection");
                return (Some(entry.inner), dropped);
            }

            trace!(conn.id = %entry.inner.id(), "found closed connection");
            dropped += 1;
        }

        (None, dropped)
    }

    /// Drop every connection that is closed or past a deadline.
    pub(super) fn evict(&mut self, expiry: Expiry) -> usize {
        let now = Instant::now();
        let before = self.inner.len();
        self.inner
            .retain(|entry| entry.inner.is_open() && !expiry.is_expired(entry, now));
        before - self.inner.len()
    }

    pub(super) fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let position = self.inner.iter().position(|entry| entry.inner.id() == id)?;
        Some(self.inner.remove(position).inner)
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
