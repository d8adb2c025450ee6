use std::fmt;
use std::sync::Arc;

use http::Uri;

use crate::request::ProxyServer;
use crate::Error;

/// Identifies the group of pooled connections a request may reuse.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum PartitionKey {
    /// Connections to one origin, optionally through one proxy.
    Route {
        /// `http`, `https`, `ws` or `wss`.
        scheme: String,
        /// Target host, lowercased.
        host: String,
        /// Target port, with the scheme default filled in.
        port: u16,
        /// `host:port` of the proxy, if any.
        proxy: Option<String>,
    },
    /// A key chosen by a custom partitioning strategy.
    Custom(Arc<str>),
}

impl PartitionKey {
    /// Key for an origin reached directly.
    pub fn route(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        PartitionKey::Route {
            scheme: scheme.into(),
            host: host.into().to_ascii_lowercase(),
            port,
            proxy: None,
        }
    }

    /// Key chosen by a custom strategy.
    pub fn custom(key: impl Into<Arc<str>>) -> Self {
        PartitionKey::Custom(key.into())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Route {
                scheme,
                host,
                port,
                proxy,
            } => {
                write!(f, "{scheme}://{host}:{port}")?;
                if let Some(proxy) = proxy {
                    write!(f, " via {proxy}")?;
                }
                Ok(())
            }
            PartitionKey::Custom(key) => f.write_str(key),
        }
    }
}

/// Groups connections in the pool.
pub trait ConnectionPartitioning: Send + Sync + 'static {
    /// Key for requests to `uri`, sent through `proxy` if set.
    fn partition_key(&self, uri: &Uri, proxy: Option<&ProxyServer>) -> Result<PartitionKey, Error>;
}

/// Partitions by scheme, host and port, plus the proxy when one is used.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPartitioning;

impl ConnectionPartitioning for DefaultPartitioning {
    fn partition_key(&self, uri: &Uri, proxy: Option<&ProxyServer>) -> Result<PartitionKey, Error> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme in {uri}")))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidUri(format!("missing host in {uri}")))?;
        let port = uri
            .port_u16()
            .unwrap_or(if matches!(scheme, "https" | "wss") { 443 } else { 80 });

        Ok(PartitionKey::Route {
            scheme: scheme.to_owned(),
            host: host.to_ascii_lowercase(),
            port,
            proxy: proxy.map(ToString::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_filled_in() {
        let key = DefaultPartitioning
            .partition_key(&Uri::from_static("https://Example.com/a"), None)
            .unwrap();
        assert_eq!(key, PartitionKey::route("https", "example.com", 443));
        assert_eq!(key.to_string(), "https://example.com:443");
    }

    #[test]
    fn proxy_is_part_of_the_key() {
        let proxy = ProxyServer::new("proxy.local", 3128);
        let uri = Uri::from_static("http://example.com/");
        let direct = DefaultPartitioning.partition_key(&uri, None).unwrap();
        let proxied = DefaultPartitioning
            .partition_key(&uri, Some(&proxy))
            .unwrap();
        assert_ne!(direct, proxied);
        assert_eq!(
            proxied.to_string(),
            "http://example.com:80 via proxy.local:3128"
        );
    }

    #[test]
    fn relative_uri_is_rejected() {
        let error = DefaultPartitioning
            .partition_key(&Uri::from_static("/path"), None)
            .unwrap_err();
        assert!(matches!(error, Error::InvalidUri(_)));
    }
}
