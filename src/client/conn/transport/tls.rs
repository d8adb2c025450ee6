//! TLS over any transport stream.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{trace, warn};

use super::BoxIo;
use crate::Error;

/// Additional check of the negotiated session, run after the certificate
/// chain was validated by rustls.
pub trait HostnameVerifier: Send + Sync + 'static {
    /// Accept the session established with `host`?
    fn verify(&self, host: &str, session: &TlsSession) -> bool;
}

/// Details of a negotiated TLS session.
#[derive(Clone)]
pub struct TlsSession {
    server_name: String,
    peer_certificates: Vec<CertificateDer<'static>>,
    alpn: Option<Vec<u8>>,
    protocol_version: Option<rustls::ProtocolVersion>,
}

impl TlsSession {
    /// Server name sent in SNI.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Certificate chain presented by the server, leaf first.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    /// Negotiated ALPN protocol.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.protocol_version
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("server_name", &self.server_name)
            .field("peer_certificates", &self.peer_certificates.len())
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

/// Run a TLS handshake for `host` over `io`, then the hostname verifier if any.
pub(crate) async fn connect(
    io: BoxIo,
    host: &str,
    config: Arc<ClientConfig>,
    verifier: Option<&dyn HostnameVerifier>,
) -> Result<(BoxIo, TlsSession), Error> {
    let domain = host.trim_start_matches('[').trim_end_matches(']');
    let server_name = ServerName::try_from(domain.to_owned())
        .map_err(|error| Error::Tls(Box::new(error)))?;

    trace!(%host, "tls handshake");
    let stream = TlsConnector::from(config)
        .connect(server_name, io)
        .await
        .map_err(|error| Error::Tls(Box::new(error)))?;

    let (_, connection) = stream.get_ref();
    let session = TlsSession {
        server_name: domain.to_owned(),
        peer_certificates: connection
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default(),
        alpn: connection.alpn_protocol().map(<[u8]>::to_vec),
        protocol_version: connection.protocol_version(),
    };

    if let Some(verifier) = verifier {
        if !verifier.verify(domain, &session) {
            return Err(Error::HostnameVerification(domain.to_owned()));
        }
    }

    trace!(%host, ?session, "tls handshake complete");
    Ok((Box::new(stream), session))
}

/// TLS configuration trusting the platform's root certificates.
///
/// Certificates that fail to load are logged and skipped.
pub fn default_tls_config() -> ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!(%error, "could not load platform certificate");
    }
    for cert in native.certs {
        if let Err(error) = roots.add(cert) {
            warn!(%error, "skipping invalid platform certificate");
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols.push(b"http/1.1".to_vec());
    config
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(TlsSession: Send, Sync, Clone);

    struct RejectAll;

    impl HostnameVerifier for RejectAll {
        fn verify(&self, _: &str, _: &TlsSession) -> bool {
            false
        }
    }

    #[test]
    fn default_config_offers_http11() {
        let config = default_tls_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn handshake_failure_is_tls_error() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);

        let result = connect(
            Box::new(client),
            "example.com",
            Arc::new(default_tls_config()),
            Some(&RejectAll),
        )
        .await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[test]
    fn session_debug_hides_certificates() {
        let session = TlsSession {
            server_name: "example.com".into(),
            peer_certificates: vec![CertificateDer::from(vec![1, 2, 3])],
            alpn: Some(b"http/1.1".to_vec()),
            protocol_version: None,
        };
        assert_eq!(
            format!("{session:?}"),
            "TlsSession { server_name: \"example.com\", peer_certificates: 1, \
             alpn: Some(\"http/1.1\"), protocol_version: None }"
        );
    }
}
