use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;

use super::conn::transport::tcp::TcpTransport;
use super::conn::transport::tls::HostnameVerifier;
use super::conn::transport::Transport;
use super::pool::ConnectionPartitioning;
use super::Client;
use crate::auth::{NtlmEngine, SpnegoEngine};
use crate::config::{Config, KeepAliveStrategy};
use crate::filter::{IoExceptionFilter, RequestFilter, ResponseFilter};
use crate::request::realm::Realm;
use crate::request::ProxyServer;

/// A builder for a client.
///
/// Every setter maps to a field of [`Config`]; [`Builder::transport`] swaps
/// the TCP transport for another one, e.g. an in-memory duplex in tests.
pub struct Builder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create a new builder with the default configuration.
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    /// Start from an existing configuration.
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Direct access to the configuration being built.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Limit the number of open connections.
    pub fn max_connections(mut self, max: impl Into<Option<usize>>) -> Self {
        self.config.max_connections = max.into();
        self
    }

    /// Limit the number of open connections per host.
    pub fn max_connections_per_host(mut self, max: impl Into<Option<usize>>) -> Self {
        self.config.max_connections_per_host = max.into();
        self
    }

    /// How long a pooled connection may stay idle.
    pub fn pooled_connection_idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.pooled_connection_idle_timeout = timeout.into();
        self
    }

    /// Maximum age of a pooled connection.
    pub fn connection_ttl(mut self, ttl: impl Into<Option<Duration>>) -> Self {
        self.config.connection_ttl = ttl.into();
        self
    }

    /// Period of the idle connection sweep.
    pub fn pooled_connection_cleaner_period(mut self, period: Duration) -> Self {
        self.config.pooled_connection_cleaner_period = period;
        self
    }

    /// Wait up to `timeout` for a free connection instead of failing at the limit.
    pub fn acquire_free_connection_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.acquire_free_connection_timeout = timeout.into();
        self
    }

    /// Timeout for opening a connection.
    pub fn connect_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.connect_timeout = timeout.into();
        self
    }

    /// Timeout for a whole request.
    pub fn request_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.request_timeout = timeout.into();
        self
    }

    /// Idle timeout while waiting for response bytes.
    pub fn read_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.read_timeout = timeout.into();
        self
    }

    /// How long an `Expect: 100-continue` body waits for the interim response.
    pub fn expect_continue_timeout(mut self, timeout: Duration) -> Self {
        self.config.expect_continue_timeout = timeout;
        self
    }

    /// Follow redirects.
    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.config.follow_redirect = follow;
        self
    }

    /// Maximum number of redirects followed per request.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Keep the method (and body) when following a 302.
    pub fn strict_302_handling(mut self, strict: bool) -> Self {
        self.config.strict_302_handling = strict;
        self
    }

    /// Pool connections.
    pub fn allow_pooling_connections(mut self, allow: bool) -> Self {
        self.config.allow_pooling_connections = allow;
        self
    }

    /// Pool TLS connections.
    pub fn allow_pooling_ssl_connections(mut self, allow: bool) -> Self {
        self.config.allow_pooling_ssl_connections = allow;
        self
    }

    /// Set the `User-Agent` header sent with each request, `None` to send none.
    pub fn user_agent(mut self, user_agent: impl Into<Option<HeaderValue>>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Default realm for requests without one.
    pub fn realm(mut self, realm: Realm) -> Self {
        self.config.realm = Some(realm);
        self
    }

    /// Default proxy for requests without one.
    pub fn proxy(mut self, proxy: ProxyServer) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Use the provided TLS configuration.
    pub fn with_tls(mut self, config: rustls::ClientConfig) -> Self {
        self.config.tls = Some(Arc::new(config));
        self
    }

    /// Additional check after each TLS handshake.
    pub fn hostname_verifier(mut self, verifier: impl HostnameVerifier) -> Self {
        self.config.hostname_verifier = Some(Arc::new(verifier));
        self
    }

    /// Policy deciding whether connections stay open after a response.
    pub fn keep_alive_strategy(mut self, strategy: impl KeepAliveStrategy) -> Self {
        self.config.keep_alive_strategy = Arc::new(strategy);
        self
    }

    /// Policy grouping pooled connections.
    pub fn partitioning(mut self, partitioning: impl ConnectionPartitioning) -> Self {
        self.config.partitioning = Arc::new(partitioning);
        self
    }

    /// NTLM message engine.
    pub fn ntlm_engine(mut self, engine: impl NtlmEngine) -> Self {
        self.config.ntlm_engine = Some(Arc::new(engine));
        self
    }

    /// SPNEGO token engine.
    pub fn spnego_engine(mut self, engine: impl SpnegoEngine) -> Self {
        self.config.spnego_engine = Some(Arc::new(engine));
        self
    }

    /// Append a request filter.
    pub fn request_filter(mut self, filter: impl RequestFilter) -> Self {
        self.config.request_filters.push(Arc::new(filter));
        self
    }

    /// Append a response filter.
    pub fn response_filter(mut self, filter: impl ResponseFilter) -> Self {
        self.config.response_filters.push(Arc::new(filter));
        self
    }

    /// Append an I/O exception filter.
    pub fn io_exception_filter(mut self, filter: impl IoExceptionFilter) -> Self {
        self.config.io_exception_filters.push(Arc::new(filter));
        self
    }

    /// Provide a custom transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Build the client. Must be called within a tokio runtime for the pool
    /// sweeper to run.
    pub fn build(self) -> Client {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new()));
        Client::with_transport(self.config, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_reach_config() {
        let mut builder = Builder::new()
            .max_connections(10)
            .max_connections_per_host(2)
            .connect_timeout(None)
            .follow_redirect(true)
            .max_redirects(3)
            .strict_302_handling(true)
            .user_agent(None);

        let config = builder.config_mut();
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.max_connections_per_host, Some(2));
        assert_eq!(config.connect_timeout, None);
        assert!(config.follow_redirect);
        assert_eq!(config.max_redirects, 3);
        assert!(config.strict_302_handling);
        assert!(config.user_agent.is_none());
    }
}
