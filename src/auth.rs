//! Authorization header values and challenge inspection.
//!
//! Basic and Digest credentials are rendered here from a [`Realm`]. NTLM and
//! SPNEGO/Kerberos tokens are produced by external engines plugged in through
//! [`NtlmEngine`] and [`SpnegoEngine`].

use base64::Engine as _;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::request::realm::{AuthScheme, Realm};
use crate::{BoxError, Error};

/// Produces NTLM negotiation messages.
pub trait NtlmEngine: Send + Sync + 'static {
    /// Base64 Type 1 (negotiate) message.
    fn type1_message(&self, domain: Option<&str>, workstation: Option<&str>) -> String;

    /// Base64 Type 3 (authenticate) message answering the server's Type 2 `challenge`.
    fn type3_message(
        &self,
        principal: &str,
        password: &str,
        domain: Option<&str>,
        workstation: Option<&str>,
        challenge: &str,
    ) -> Result<String, BoxError>;
}

/// Produces SPNEGO (`Negotiate`) tokens.
pub trait SpnegoEngine: Send + Sync + 'static {
    /// Base64 token for the service on `host`.
    fn generate_token(&self, host: &str) -> Result<String, BoxError>;
}

/// `Basic base64(principal:password)`.
pub fn basic_authorization(realm: &Realm) -> Result<HeaderValue, Error> {
    let credentials = format!("{}:{}", realm.principal(), realm.password());
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
    header_value(format!("Basic {encoded}"))
}

/// `Digest ...` directives for a realm whose response was computed.
pub fn digest_authorization(realm: &Realm) -> Result<HeaderValue, Error> {
    let mut value = String::from("Digest ");
    push_quoted(&mut value, "username", realm.principal());
    push_quoted(&mut value, "realm", realm.realm_name().unwrap_or_default());
    push_quoted(&mut value, "nonce", realm.nonce().unwrap_or_default());
    push_quoted(&mut value, "uri", realm.uri().unwrap_or("/"));
    push_unquoted(&mut value, "algorithm", realm.algorithm());
    push_quoted(&mut value, "response", realm.response().unwrap_or_default());

    if let Some(opaque) = realm.opaque() {
        push_quoted(&mut value, "opaque", opaque);
    }

    if let Some(qop) = realm.qop().filter(|qop| !qop.is_empty()) {
        push_unquoted(&mut value, "qop", qop);
        push_unquoted(&mut value, "nc", realm.nc());
        push_quoted(&mut value, "cnonce", realm.cnonce().unwrap_or_default());
    }

    value.truncate(value.trim_end_matches(", ").len());
    header_value(value)
}

/// `NTLM <type1>` to open an NTLM handshake.
pub fn ntlm_negotiate(engine: &dyn NtlmEngine, realm: &Realm) -> Result<HeaderValue, Error> {
    header_value(format!(
        "NTLM {}",
        engine.type1_message(realm.ntlm_domain(), realm.ntlm_host())
    ))
}

/// `NTLM <type3>` answering a Type 2 challenge.
pub fn ntlm_authenticate(
    engine: &dyn NtlmEngine,
    realm: &Realm,
    challenge: &str,
) -> Result<HeaderValue, Error> {
    let message = engine
        .type3_message(
            realm.principal(),
            realm.password(),
            realm.ntlm_domain(),
            realm.ntlm_host(),
            challenge,
        )
        .map_err(Error::Handler)?;
    header_value(format!("NTLM {message}"))
}

/// `Negotiate <token>` for the service on `host`.
pub fn negotiate(engine: &dyn SpnegoEngine, host: &str) -> Result<HeaderValue, Error> {
    let token = engine.generate_token(host).map_err(Error::Handler)?;
    header_value(format!("Negotiate {token}"))
}

/// The Authorization value to send before any challenge, if the realm asks for it.
///
/// Basic is always sendable; Digest only once a nonce is known.
pub fn preemptive_authorization(realm: &Realm) -> Result<Option<HeaderValue>, Error> {
    if !realm.use_preemptive_auth() {
        return Ok(None);
    }

    match realm.scheme() {
        AuthScheme::Basic => basic_authorization(realm).map(Some),
        AuthScheme::Digest if realm.response().is_some() => digest_authorization(realm).map(Some),
        _ => Ok(None),
    }
}

/// First value of `name` starting with `prefix`, compared case-insensitively.
pub fn header_with_prefix<'h>(
    headers: &'h HeaderMap,
    name: &HeaderName,
    prefix: &str,
) -> Option<&'h str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| {
            value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
}

fn push_quoted(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(value);
    out.push_str("\", ");
}

fn push_unquoted(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push('=');
    out.push_str(value);
    out.push_str(", ");
}

fn header_value(value: String) -> Result<HeaderValue, Error> {
    HeaderValue::try_from(value)
        .map_err(|_| Error::InvalidRequest("credentials are not a valid header value".into()))
}

#[cfg(test)]
mod tests {
    use http::header::WWW_AUTHENTICATE;

    use super::*;
    use crate::request::realm::RealmBuilder;

    #[test]
    fn basic() {
        let realm = Realm::basic("Aladdin", "open sesame");
        assert_eq!(
            basic_authorization(&realm).unwrap(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
        assert_eq!(
            preemptive_authorization(&realm).unwrap().unwrap(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn digest_directives() {
        let realm = RealmBuilder::new("Mufasa", "Circle Of Life")
            .scheme(AuthScheme::Digest)
            .realm_name("testrealm@host.com")
            .nonce("dcd98b7102dd2f0e8b11d0f600bfb0c093")
            .opaque("5ccc069c403ebaf9f0171e9517f40e41")
            .qop("auth")
            .cnonce("0a4f113b")
            .uri("/dir/index.html")
            .build();

        let value = digest_authorization(&realm).unwrap();
        assert_eq!(
            value,
            "Digest username=\"Mufasa\", realm=\"testrealm@host.com\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", uri=\"/dir/index.html\", \
             algorithm=MD5, response=\"6629fae49393a05397450978507c4ef1\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\", qop=auth, nc=00000001, \
             cnonce=\"0a4f113b\""
        );
    }

    #[test]
    fn digest_without_nonce_is_not_preemptive() {
        let realm = RealmBuilder::new("user", "pass")
            .scheme(AuthScheme::Digest)
            .use_preemptive_auth(true)
            .build();
        assert!(preemptive_authorization(&realm).unwrap().is_none());
    }

    #[test]
    fn prefix_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("ntlm"));
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("basic realm=\"x\""));

        assert_eq!(
            header_with_prefix(&headers, &WWW_AUTHENTICATE, "NTLM"),
            Some("ntlm")
        );
        assert_eq!(
            header_with_prefix(&headers, &WWW_AUTHENTICATE, "Basic"),
            Some("basic realm=\"x\"")
        );
        assert_eq!(
            header_with_prefix(&headers, &WWW_AUTHENTICATE, "Digest"),
            None
        );
    }

    struct FixedNtlm;

    impl NtlmEngine for FixedNtlm {
        fn type1_message(&self, _: Option<&str>, _: Option<&str>) -> String {
            "TYPE1".into()
        }

        fn type3_message(
            &self,
            principal: &str,
            _: &str,
            _: Option<&str>,
            _: Option<&str>,
            challenge: &str,
        ) -> Result<String, BoxError> {
            Ok(format!("{principal}-{challenge}"))
        }
    }

    #[test]
    fn ntlm_messages() {
        let realm = RealmBuilder::new("user", "pass")
            .scheme(AuthScheme::Ntlm)
            .build();
        assert_eq!(ntlm_negotiate(&FixedNtlm, &realm).unwrap(), "NTLM TYPE1");
        assert_eq!(
            ntlm_authenticate(&FixedNtlm, &realm, "CHALLENGE").unwrap(),
            "NTLM user-CHALLENGE"
        );
    }
}
