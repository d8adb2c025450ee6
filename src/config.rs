//! Client configuration.
//!
//! [`Config`] is plain data consumed by the connection manager, the pool and
//! the transaction state machine. Most users set it through
//! [`Client::builder`](crate::Client::builder).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, CONNECTION};
use http::{HeaderMap, Version};

use crate::auth::{NtlmEngine, SpnegoEngine};
use crate::client::conn::transport::tls::HostnameVerifier;
use crate::client::pool::{ConnectionPartitioning, DefaultPartitioning};
use crate::filter::{IoExceptionFilter, RequestFilter, ResponseFilter};
use crate::request::realm::Realm;
use crate::request::{ProxyServer, Request};

/// Decides whether a connection may be kept open after a response.
pub trait KeepAliveStrategy: Send + Sync + 'static {
    /// Keep the connection after `request` was answered with `version` and `headers`?
    fn keep_alive(&self, request: &Request, version: Version, headers: &HeaderMap) -> bool;
}

/// HTTP/1.1 connections persist unless either side says `Connection: close`;
/// HTTP/1.0 connections persist only with `Connection: keep-alive`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeepAliveStrategy;

fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

impl KeepAliveStrategy for DefaultKeepAliveStrategy {
    fn keep_alive(&self, request: &Request, version: Version, headers: &HeaderMap) -> bool {
        if has_connection_token(request.headers(), "close") {
            return false;
        }
        match version {
            Version::HTTP_11 => !has_connection_token(headers, "close"),
            Version::HTTP_10 => has_connection_token(headers, "keep-alive"),
            _ => false,
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct Config {
    /// Maximum number of open connections, `None` for no limit.
    pub max_connections: Option<usize>,
    /// Maximum number of open connections per partition, `None` for no limit.
    pub max_connections_per_host: Option<usize>,
    /// How long a pooled connection may sit idle.
    pub pooled_connection_idle_timeout: Option<Duration>,
    /// Maximum age of a connection before it is no longer pooled.
    pub connection_ttl: Option<Duration>,
    /// Period of the background sweep evicting idle and expired connections.
    pub pooled_connection_cleaner_period: Duration,
    /// How long to wait for a free connection slot; `None` fails immediately.
    pub acquire_free_connection_timeout: Option<Duration>,
    /// Timeout for opening a transport connection.
    pub connect_timeout: Option<Duration>,
    /// Timeout for a whole request, redirects and retries included.
    pub request_timeout: Option<Duration>,
    /// Timeout without any received bytes while waiting for the response.
    pub read_timeout: Option<Duration>,
    /// How long to hold an `Expect: 100-continue` body before sending it anyway.
    pub expect_continue_timeout: Duration,
    /// Follow redirects.
    pub follow_redirect: bool,
    /// Maximum number of redirects followed by one transaction.
    pub max_redirects: usize,
    /// Keep the method on 302 instead of switching to GET.
    pub strict_302_handling: bool,
    /// Pool connections at all.
    pub allow_pooling_connections: bool,
    /// Pool TLS connections.
    pub allow_pooling_ssl_connections: bool,
    /// `User-Agent` sent when the request has none.
    pub user_agent: Option<HeaderValue>,
    /// Realm used when the request has none.
    pub realm: Option<Realm>,
    /// Proxy used when the request has none.
    pub proxy: Option<ProxyServer>,
    /// TLS configuration; native roots are loaded when unset.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Extra check run after every TLS handshake.
    pub hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    /// Connection persistence policy.
    pub keep_alive_strategy: Arc<dyn KeepAliveStrategy>,
    /// Pool partitioning policy.
    pub partitioning: Arc<dyn ConnectionPartitioning>,
    /// NTLM message generator.
    pub ntlm_engine: Option<Arc<dyn NtlmEngine>>,
    /// SPNEGO token generator.
    pub spnego_engine: Option<Arc<dyn SpnegoEngine>>,
    /// Filters run at submission.
    pub request_filters: Vec<Arc<dyn RequestFilter>>,
    /// Filters run on every response.
    pub response_filters: Vec<Arc<dyn ResponseFilter>>,
    /// Filters run on transport failures.
    pub io_exception_filters: Vec<Arc<dyn IoExceptionFilter>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_connections_per_host: None,
            pooled_connection_idle_timeout: Some(Duration::from_secs(60)),
            connection_ttl: None,
            pooled_connection_cleaner_period: Duration::from_secs(1),
            acquire_free_connection_timeout: None,
            connect_timeout: Some(Duration::from_secs(5)),
            request_timeout: Some(Duration::from_secs(60)),
            read_timeout: Some(Duration::from_secs(60)),
            expect_continue_timeout: Duration::from_secs(1),
            follow_redirect: false,
            max_redirects: 5,
            strict_302_handling: false,
            allow_pooling_connections: true,
            allow_pooling_ssl_connections: true,
            user_agent: Some(HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))),
            realm: None,
            proxy: None,
            tls: None,
            hostname_verifier: None,
            keep_alive_strategy: Arc::new(DefaultKeepAliveStrategy),
            partitioning: Arc::new(DefaultPartitioning),
            ntlm_engine: None,
            spnego_engine: None,
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            io_exception_filters: Vec::new(),
        }
    }
}

impl Config {
    /// Redirects are followed if the request says so, otherwise if the client does.
    pub fn is_redirect_allowed(&self, request: &Request) -> bool {
        request.follow_redirect().unwrap_or(self.follow_redirect)
    }

    /// Effective read timeout for `request`.
    pub fn read_timeout_for(&self, request: &Request) -> Option<Duration> {
        request.read_timeout().or(self.read_timeout)
    }

    /// Effective request timeout for `request`.
    pub fn request_timeout_for(&self, request: &Request) -> Option<Duration> {
        request.request_timeout().or(self.request_timeout)
    }

    /// Proxy that applies to `request`, honoring non-proxy hosts.
    pub fn proxy_for<'a>(&'a self, request: &'a Request) -> Option<&'a ProxyServer> {
        let proxy = request.proxy().or(self.proxy.as_ref())?;
        match request.uri().host() {
            Some(host) if proxy.is_ignored_for(host) => None,
            _ => Some(proxy),
        }
    }

    /// Realm that applies to `request`.
    pub fn realm_for<'a>(&'a self, request: &'a Request) -> Option<&'a Realm> {
        request.realm().or(self.realm.as_ref())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_connections", &self.max_connections)
            .field("max_connections_per_host", &self.max_connections_per_host)
            .field(
                "pooled_connection_idle_timeout",
                &self.pooled_connection_idle_timeout,
            )
            .field("connection_ttl", &self.connection_ttl)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("follow_redirect", &self.follow_redirect)
            .field("max_redirects", &self.max_redirects)
            .field("strict_302_handling", &self.strict_302_handling)
            .field("allow_pooling_connections", &self.allow_pooling_connections)
            .field(
                "allow_pooling_ssl_connections",
                &self.allow_pooling_ssl_connections,
            )
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}
