//! Connection pooling.
//!
//! The pool caches idle HTTP/1.1 connections grouped by [`PartitionKey`]. A
//! connection is either idle in the pool, owned by exactly one transaction,
//! or closed: [`ConnectionPool::poll`] moves it out of the pool and
//! [`ConnectionPool::offer`] moves it back. Capacity limits on *open*
//! connections are enforced by the connection manager; the pool only bounds
//! how many idle connections it keeps.
//!
//! A single background task sweeps idle and expired connections on a fixed
//! period. It is started lazily on the first successful offer and holds only
//! a weak reference, so it ends once the pool is dropped or destroyed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

mod idle;
mod key;
mod weakopt;

use self::idle::{Expiry, IdleConnections};
pub use self::key::{ConnectionPartitioning, DefaultPartitioning, PartitionKey};
use self::weakopt::WeakOpt;

use super::conn::Connection;
use crate::Config;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection the pool can hold.
pub trait PoolableConnection: Send + 'static {
    /// Stable identifier.
    fn id(&self) -> ConnectionId;

    /// Is the underlying transport still usable?
    fn is_open(&self) -> bool;

    /// When the connection was opened.
    fn created_at(&self) -> Instant;

    /// Was TLS negotiated on this connection?
    fn is_secure(&self) -> bool;

    /// Must this connection be discarded instead of pooled?
    fn do_not_cache(&self) -> bool;
}

/// Pool limits and deadlines.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on idle connections.
    pub max_connections: Option<usize>,
    /// Cap on idle connections per partition.
    pub max_connections_per_host: Option<usize>,
    /// Idle deadline.
    pub idle_timeout: Option<Duration>,
    /// Absolute lifetime deadline.
    pub ttl: Option<Duration>,
    /// Sweep period.
    pub cleaner_period: Duration,
    /// Pool plain connections.
    pub allow_pooling: bool,
    /// Pool TLS connections.
    pub allow_pooling_ssl: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::from(&Config::default())
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_host: config.max_connections_per_host,
            idle_timeout: config.pooled_connection_idle_timeout,
            ttl: config.connection_ttl,
            cleaner_period: config.pooled_connection_cleaner_period,
            allow_pooling: config.allow_pooling_connections,
            allow_pooling_ssl: config.allow_pooling_ssl_connections,
        }
    }
}

impl PoolConfig {
    fn expiry(&self) -> Expiry {
        Expiry {
            idle_timeout: self.idle_timeout,
            ttl: self.ttl,
        }
    }
}

struct PoolInner<C> {
    config: PoolConfig,
    idle: Mutex<HashMap<PartitionKey, IdleConnections<C>>>,
    total: AtomicUsize,
    closed: AtomicBool,
    sweeping: AtomicBool,
    available: Notify,
}

/// Keyed cache of idle connections.
pub struct ConnectionPool<C: PoolableConnection = Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: PoolableConnection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolableConnection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: PoolableConnection> ConnectionPool<C> {
    /// Empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                sweeping: AtomicBool::new(false),
                available: Notify::new(),
            }),
        }
    }

    /// Return a connection to the pool.
    ///
    /// Returns `false` and drops (closes) the connection when it may not be
    /// pooled.
    pub fn offer(&self, key: &PartitionKey, conn: C) -> bool {
        let config = &self.inner.config;

        let refusal = if self.is_closed() {
            Some("pool is closed")
        } else if !config.allow_pooling {
            Some("pooling disabled")
        } else if conn.is_secure() && !config.allow_pooling_ssl {
            Some("pooling disabled for secure connections")
        } else if conn.do_not_cache() {
            Some("connection is marked do-not-cache")
        } else if !conn.is_open() {
            Some("connection is closed")
        } else if config.expiry().is_past_ttl(&conn, Instant::now()) {
            Some("connection is past its ttl")
        } else if !self.can_cache() {
            Some("pool is at capacity")
        } else {
            None
        };

        if let Some(reason) = refusal {
            trace!(%key, conn.id = %conn.id(), reason, "offer refused");
            return false;
        }

        {
            let mut idle = self.inner.idle.lock();
            let partition = idle.entry(key.clone()).or_default();
            if config
                .max_connections_per_host
                .is_some_and(|max| partition.len() >= max)
            {
                trace!(%key, conn.id = %conn.id(), "offer refused: partition is at capacity");
                return false;
            }

            trace!(%key, conn.id = %conn.id(), "connection returned to pool");
            partition.push(conn);
            self.inner.total.fetch_add(1, Ordering::AcqRel);
        }

        self.start_sweeper();
        self.inner.available.notify_waiters();
        true
    }

    /// Take an idle connection for `key`, if a usable one exists.
    pub fn poll(&self, key: &PartitionKey) -> Option<C> {
        if self.is_closed() {
            return None;
        }

        let mut idle = self.inner.idle.lock();
        let partition = idle.get_mut(key)?;
        let (conn, dropped) = partition.pop(self.inner.config.expiry());
        let taken = dropped + usize::from(conn.is_some());
        self.inner.total.fetch_sub(taken, Ordering::AcqRel);

        if partition.is_empty() {
            idle.remove(key);
        }

        if let Some(conn) = &conn {
            trace!(%key, conn.id = %conn.id(), "connection taken from pool");
        }
        conn
    }

    /// Remove a specific connection from whichever partition holds it.
    pub fn remove_all(&self, id: ConnectionId) -> bool {
        let mut idle = self.inner.idle.lock();
        let mut removed = false;
        idle.retain(|_, partition| {
            if partition.remove(id).is_some() {
                removed = true;
            }
            !partition.is_empty()
        });

        if removed {
            self.inner.total.fetch_sub(1, Ordering::AcqRel);
            trace!(conn.id = %id, "connection removed from pool");
        }
        removed
    }

    /// Is there room under the global cap?
    pub fn can_cache(&self) -> bool {
        self.inner
            .config
            .max_connections
            .map_or(true, |max| self.inner.total.load(Ordering::Acquire) < max)
    }

    /// Close every idle connection and refuse all future offers.
    pub fn destroy(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.inner.idle.lock().drain().collect();
        self.inner.total.store(0, Ordering::Release);
        trace!(partitions = drained.len(), "pool destroyed");
        drop(drained);
        self.inner.available.notify_waiters();
    }

    /// Has the pool been destroyed?
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of idle connections across all partitions.
    pub fn idle_count(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Number of idle connections for `key`.
    pub fn idle_count_for(&self, key: &PartitionKey) -> usize {
        self.inner.idle.lock().get(key).map_or(0, |idle| idle.len())
    }

    /// Resolves the next time a connection is offered back.
    ///
    /// The returned future must be enabled before polling the pool to avoid
    /// missing a wakeup.
    pub(crate) fn available(&self) -> tokio::sync::futures::Notified<'_> {
        self.inner.available.notified()
    }

    /// Evict closed, idle-expired and TTL-expired connections.
    pub fn sweep(&self) -> usize {
        sweep(&self.inner)
    }

    fn start_sweeper(&self) {
        if self.inner.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.sweeping.store(false, Ordering::Release);
            return;
        };

        let period = self.inner.config.cleaner_period;
        let pool = WeakOpt::downgrade(&self.inner);
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                sweep(&inner);
            }
            trace!("pool sweeper finished");
        });
    }
}

fn sweep<C: PoolableConnection>(inner: &PoolInner<C>) -> usize {
    let expiry = inner.config.expiry();
    let mut idle = inner.idle.lock();
    let mut evicted = 0;
    idle.retain(|_, partition| {
        evicted += partition.evict(expiry);
        !partition.is_empty()
    });

    if evicted > 0 {
        inner.total.fetch_sub(evicted, Ordering::AcqRel);
        trace!(evicted, "swept idle connections");
    }
    evicted
}
