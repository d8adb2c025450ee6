use std::fmt;

use super::realm::Realm;

/// An HTTP proxy.
///
/// Plain HTTP requests are sent to the proxy in absolute-form. Secure and
/// WebSocket requests go through a `CONNECT` tunnel opened on the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServer {
    host: String,
    port: u16,
    realm: Option<Realm>,
    non_proxy_hosts: Vec<String>,
}

impl ProxyServer {
    /// Proxy at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            realm: None,
            non_proxy_hosts: Vec::new(),
        }
    }

    /// Credentials for `Proxy-Authorization`.
    pub fn with_realm(mut self, realm: Realm) -> Self {
        self.realm = Some(realm);
        self
    }

    /// Hosts reached directly, bypassing the proxy. A leading `*` matches any prefix.
    pub fn with_non_proxy_host(mut self, host: impl Into<String>) -> Self {
        self.non_proxy_hosts.push(host.into());
        self
    }

    /// Proxy host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy credentials.
    pub fn realm(&self) -> Option<&Realm> {
        self.realm.as_ref()
    }

    /// Hosts that bypass this proxy.
    pub fn non_proxy_hosts(&self) -> &[String] {
        &self.non_proxy_hosts
    }

    /// Should a request to `host` skip this proxy?
    pub fn is_ignored_for(&self, host: &str) -> bool {
        self.non_proxy_hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                host.to_ascii_lowercase()
                    .ends_with(&suffix.to_ascii_lowercase())
            } else {
                pattern.eq_ignore_ascii_case(host)
            }
        })
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
