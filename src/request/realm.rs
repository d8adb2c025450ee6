//! Authentication realms.
//!
//! A [`Realm`] bundles the credentials and the scheme specific state needed to
//! answer one authentication challenge. Realms are immutable: answering a new
//! challenge means deriving a new realm with [`Realm::to_builder`], which
//! recomputes the Digest response for the new nonce.

use std::fmt;

use http::{Method, Uri};
use md5::{Digest as _, Md5};

/// Nonce count sent with the first Digest response for a nonce.
pub const DEFAULT_NC: &str = "00000001";

/// Authentication schemes understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    /// RFC 7617 Basic authentication.
    Basic,
    /// RFC 2617 Digest authentication.
    Digest,
    /// Microsoft NTLM, connection oriented.
    Ntlm,
    /// SPNEGO (`Negotiate`).
    Spnego,
    /// Kerberos, sent through the `Negotiate` scheme.
    Kerberos,
}

impl AuthScheme {
    /// The token used for this scheme in challenge and authorization headers.
    pub fn challenge_prefix(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
            AuthScheme::Digest => "Digest",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Spnego | AuthScheme::Kerberos => "Negotiate",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.challenge_prefix())
    }
}

/// Credentials plus scheme state for answering an authentication challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Realm {
    principal: String,
    password: String,
    scheme: AuthScheme,
    realm_name: Option<String>,
    nonce: Option<String>,
    algorithm: String,
    response: Option<String>,
    opaque: Option<String>,
    qop: Option<String>,
    nc: String,
    cnonce: Option<String>,
    uri: Option<String>,
    method: Method,
    use_preemptive_auth: bool,
    use_absolute_uri: bool,
    omit_query: bool,
    target_proxy: bool,
    ntlm_domain: Option<String>,
    ntlm_host: Option<String>,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("principal", &self.principal)
            .field("scheme", &self.scheme)
            .field("realm_name", &self.realm_name)
            .field("nonce", &self.nonce)
            .field("algorithm", &self.algorithm)
            .field("qop", &self.qop)
            .field("nc", &self.nc)
            .field("cnonce", &self.cnonce)
            .field("uri", &self.uri)
            .field("use_preemptive_auth", &self.use_preemptive_auth)
            .field("target_proxy", &self.target_proxy)
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Start building a realm for the given credentials.
    pub fn builder(principal: impl Into<String>, password: impl Into<String>) -> RealmBuilder {
        RealmBuilder::new(principal, password)
    }

    /// Shortcut for a preemptive Basic realm.
    pub fn basic(principal: impl Into<String>, password: impl Into<String>) -> Realm {
        RealmBuilder::new(principal, password)
            .scheme(AuthScheme::Basic)
            .use_preemptive_auth(true)
            .build()
    }

    /// Copy this realm back into a builder, e.g. to answer a fresh challenge.
    pub fn to_builder(&self) -> RealmBuilder {
        RealmBuilder {
            principal: self.principal.clone(),
            password: self.password.clone(),
            scheme: self.scheme,
            realm_name: self.realm_name.clone(),
            nonce: self.nonce.clone(),
            algorithm: self.algorithm.clone(),
            opaque: self.opaque.clone(),
            qop: self.qop.clone(),
            nc: self.nc.clone(),
            cnonce: self.cnonce.clone(),
            uri: self.uri.clone(),
            method: self.method.clone(),
            use_preemptive_auth: self.use_preemptive_auth,
            use_absolute_uri: self.use_absolute_uri,
            omit_query: self.omit_query,
            target_proxy: self.target_proxy,
            ntlm_domain: self.ntlm_domain.clone(),
            ntlm_host: self.ntlm_host.clone(),
        }
    }

    /// User name.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Authentication scheme.
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// The `realm` directive of the last challenge.
    pub fn realm_name(&self) -> Option<&str> {
        self.realm_name.as_deref()
    }

    /// Server nonce of the last Digest challenge.
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Digest algorithm (`MD5` or `MD5-sess`).
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Computed Digest response, present once a nonce is known.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Opaque value to echo back to the server.
    pub fn opaque(&self) -> Option<&str> {
        self.opaque.as_deref()
    }

    /// Quality of protection selected from the challenge.
    pub fn qop(&self) -> Option<&str> {
        self.qop.as_deref()
    }

    /// Nonce count.
    pub fn nc(&self) -> &str {
        &self.nc
    }

    /// Client nonce.
    pub fn cnonce(&self) -> Option<&str> {
        self.cnonce.as_deref()
    }

    /// Request URI the Digest response was computed for.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Method the Digest response was computed for.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Send credentials without waiting for a challenge.
    pub fn use_preemptive_auth(&self) -> bool {
        self.use_preemptive_auth
    }

    /// Use the absolute URI in the Digest `uri` directive.
    pub fn use_absolute_uri(&self) -> bool {
        self.use_absolute_uri
    }

    /// Leave the query out of the Digest `uri` directive.
    pub fn omit_query(&self) -> bool {
        self.omit_query
    }

    /// Whether this realm authenticates against a proxy.
    pub fn target_proxy(&self) -> bool {
        self.target_proxy
    }

    /// NTLM domain.
    pub fn ntlm_domain(&self) -> Option<&str> {
        self.ntlm_domain.as_deref()
    }

    /// NTLM workstation name.
    pub fn ntlm_host(&self) -> Option<&str> {
        self.ntlm_host.as_deref()
    }
}

/// Builder for [`Realm`].
#[derive(Debug, Clone)]
pub struct RealmBuilder {
    principal: String,
    password: String,
    scheme: AuthScheme,
    realm_name: Option<String>,
    nonce: Option<String>,
    algorithm: String,
    opaque: Option<String>,
    qop: Option<String>,
    nc: String,
    cnonce: Option<String>,
    uri: Option<String>,
    method: Method,
    use_preemptive_auth: bool,
    use_absolute_uri: bool,
    omit_query: bool,
    target_proxy: bool,
    ntlm_domain: Option<String>,
    ntlm_host: Option<String>,
}

impl RealmBuilder {
    /// New builder with Basic as the default scheme.
    pub fn new(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            password: password.into(),
            scheme: AuthScheme::Basic,
            realm_name: None,
            nonce: None,
            algorithm: "MD5".into(),
            opaque: None,
            qop: None,
            nc: DEFAULT_NC.into(),
            cnonce: None,
            uri: None,
            method: Method::GET,
            use_preemptive_auth: false,
            use_absolute_uri: false,
            omit_query: false,
            target_proxy: false,
            ntlm_domain: None,
            ntlm_host: None,
        }
    }

    /// Set the scheme.
    pub fn scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Set the realm name.
    pub fn realm_name(mut self, realm_name: impl Into<String>) -> Self {
        self.realm_name = Some(realm_name.into());
        self
    }

    /// Set the server nonce.
    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Set the Digest algorithm.
    pub fn algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    /// Set the opaque directive.
    pub fn opaque(mut self, opaque: impl Into<String>) -> Self {
        self.opaque = Some(opaque.into());
        self
    }

    /// Set the quality of protection.
    pub fn qop(mut self, qop: impl Into<String>) -> Self {
        self.qop = Some(qop.into());
        self
    }

    /// Set the nonce count.
    pub fn nc(mut self, nc: impl Into<String>) -> Self {
        self.nc = nc.into();
        self
    }

    /// Pin the client nonce instead of drawing a random one.
    pub fn cnonce(mut self, cnonce: impl Into<String>) -> Self {
        self.cnonce = Some(cnonce.into());
        self
    }

    /// Set the Digest `uri` directive directly.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the Digest `uri` directive from a request URI, honoring
    /// `use_absolute_uri` and `omit_query`.
    pub fn request_uri(mut self, uri: &Uri) -> Self {
        self.uri = Some(realm_uri(uri, self.use_absolute_uri, self.omit_query));
        self
    }

    /// Set the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Send credentials without waiting for a challenge.
    pub fn use_preemptive_auth(mut self, preemptive: bool) -> Self {
        self.use_preemptive_auth = preemptive;
        self
    }

    /// Use the absolute URI in the Digest `uri` directive.
    pub fn use_absolute_uri(mut self, absolute: bool) -> Self {
        self.use_absolute_uri = absolute;
        self
    }

    /// Leave the query out of the Digest `uri` directive.
    pub fn omit_query(mut self, omit: bool) -> Self {
        self.omit_query = omit;
        self
    }

    /// Mark the realm as authenticating against a proxy.
    pub fn target_proxy(mut self, target_proxy: bool) -> Self {
        self.target_proxy = target_proxy;
        self
    }

    /// Set the NTLM domain.
    pub fn ntlm_domain(mut self, domain: impl Into<String>) -> Self {
        self.ntlm_domain = Some(domain.into());
        self
    }

    /// Set the NTLM workstation.
    pub fn ntlm_host(mut self, host: impl Into<String>) -> Self {
        self.ntlm_host = Some(host.into());
        self
    }

    /// Absorb the directives of a `WWW-Authenticate` challenge.
    ///
    /// A challenge carrying a nonce switches the scheme to Digest, otherwise
    /// the scheme becomes Basic.
    pub fn parse_www_authenticate(mut self, header: &str) -> Self {
        self.realm_name = directive(header, "realm");
        self.nonce = directive(header, "nonce");
        if let Some(algorithm) = directive(header, "algorithm") {
            self.algorithm = algorithm;
        }
        self.opaque = directive(header, "opaque");
        self.qop = directive(header, "qop").and_then(|qop| match_qop(&qop));

        self.scheme = if self.nonce.as_deref().is_some_and(|n| !n.is_empty()) {
            AuthScheme::Digest
        } else {
            AuthScheme::Basic
        };
        self
    }

    /// Absorb the directives of a `Proxy-Authenticate` challenge.
    pub fn parse_proxy_authenticate(self, header: &str) -> Self {
        self.parse_www_authenticate(header).target_proxy(true)
    }

    /// Build the realm, computing the Digest response when a nonce is known.
    pub fn build(mut self) -> Realm {
        let mut response = None;

        if self.scheme == AuthScheme::Digest && self.nonce.as_deref().is_some_and(|n| !n.is_empty())
        {
            let cnonce = self.cnonce.take().unwrap_or_else(new_cnonce);
            let uri = self.uri.clone().unwrap_or_else(|| "/".into());
            response = Some(digest_response(&DigestInputs {
                principal: &self.principal,
                password: &self.password,
                realm: self.realm_name.as_deref().unwrap_or_default(),
                nonce: self.nonce.as_deref().unwrap_or_default(),
                algorithm: &self.algorithm,
                qop: self.qop.as_deref(),
                nc: &self.nc,
                cnonce: &cnonce,
                method: &self.method,
                uri: &uri,
            }));
            self.cnonce = Some(cnonce);
            self.uri = Some(uri);
        }

        Realm {
            principal: self.principal,
            password: self.password,
            scheme: self.scheme,
            realm_name: self.realm_name,
            nonce: self.nonce,
            algorithm: self.algorithm,
            response,
            opaque: self.opaque,
            qop: self.qop,
            nc: self.nc,
            cnonce: self.cnonce,
            uri: self.uri,
            method: self.method,
            use_preemptive_auth: self.use_preemptive_auth,
            use_absolute_uri: self.use_absolute_uri,
            omit_query: self.omit_query,
            target_proxy: self.target_proxy,
            ntlm_domain: self.ntlm_domain,
            ntlm_host: self.ntlm_host,
        }
    }
}

/// Compute the URI carried by the Digest `uri` directive.
pub fn realm_uri(uri: &Uri, absolute: bool, omit_query: bool) -> String {
    let path = match uri.path() {
        "" => "/",
        path => path,
    };
    let query = uri.query().filter(|_| !omit_query);

    let mut out = String::new();
    if absolute {
        if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
            out.push_str(scheme);
            out.push_str("://");
            out.push_str(authority.as_str());
        }
    }
    out.push_str(path);
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Prefer `auth` over `auth-int` when the server offers both.
fn match_qop(qop: &str) -> Option<String> {
    let options: Vec<&str> = qop.split(',').map(str::trim).collect();
    if options.contains(&"auth") {
        Some("auth".into())
    } else if options.contains(&"auth-int") {
        Some("auth-int".into())
    } else {
        None
    }
}

/// Extract `name=value` or `name="value"` from a challenge header.
pub(crate) fn directive(header: &str, name: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let needle = format!("{}=", name.to_ascii_lowercase());

    let mut from = 0;
    while let Some(found) = lower[from..].find(&needle) {
        let start = from + found;
        from = start + needle.len();

        // reject matches inside another directive name, e.g. `cnonce=` for `nonce=`
        let boundary = lower[..start]
            .chars()
            .next_back()
            .map_or(true, |c| c == ',' || c.is_whitespace());
        if !boundary {
            continue;
        }

        let rest = &header[from..];
        return Some(if let Some(quoted) = rest.strip_prefix('"') {
            quoted.split('"').next().unwrap_or_default().to_owned()
        } else {
            rest.split(',').next().unwrap_or_default().trim().to_owned()
        });
    }
    None
}

fn new_cnonce() -> String {
    let seed: [u8; 8] = rand::random();
    hex::encode(Md5::digest(seed))
}

struct DigestInputs<'a> {
    principal: &'a str,
    password: &'a str,
    realm: &'a str,
    nonce: &'a str,
    algorithm: &'a str,
    qop: Option<&'a str>,
    nc: &'a str,
    cnonce: &'a str,
    method: &'a Method,
    uri: &'a str,
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn digest_response(inputs: &DigestInputs<'_>) -> String {
    let mut ha1 = md5_hex(&format!(
        "{}:{}:{}",
        inputs.principal, inputs.realm, inputs.password
    ));
    if inputs.algorithm.eq_ignore_ascii_case("MD5-sess") {
        ha1 = md5_hex(&format!("{}:{}:{}", ha1, inputs.nonce, inputs.cnonce));
    }

    let ha2 = match inputs.qop {
        Some("auth-int") => md5_hex(&format!(
            "{}:{}:{}",
            inputs.method,
            inputs.uri,
            md5_hex("")
        )),
        _ => md5_hex(&format!("{}:{}", inputs.method, inputs.uri)),
    };

    match inputs.qop.filter(|qop| !qop.is_empty()) {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, inputs.nonce, inputs.nc, inputs.cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, inputs.nonce, ha2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc2617() -> RealmBuilder {
        Realm::builder("Mufasa", "Circle Of Life")
            .scheme(AuthScheme::Digest)
            .realm_name("testrealm@host.com")
            .nonce("dcd98b7102dd2f0e8b11d0f600bfb0c093")
            .qop("auth")
            .cnonce("0a4f113b")
            .uri("/dir/index.html")
            .method(Method::GET)
    }

    #[test]
    fn digest_matches_rfc2617_example() {
        let realm = rfc2617().build();
        assert_eq!(realm.response(), Some("6629fae49393a05397450978507c4ef1"));
    }

    #[test]
    fn digest_is_deterministic_for_fixed_cnonce() {
        let first = rfc2617().build();
        let second = rfc2617().build();
        assert_eq!(first.response(), second.response());
        assert_eq!(first, second);

        let other = rfc2617().nonce("another").build();
        assert_ne!(first.response(), other.response());
    }

    #[test]
    fn random_cnonce_is_generated() {
        let realm = rfc2617().build();
        assert_eq!(realm.cnonce(), Some("0a4f113b"));

        let mut builder = rfc2617();
        builder.cnonce = None;
        let realm = builder.build();
        assert_eq!(realm.cnonce().map(str::len), Some(32));
    }

    #[test]
    fn no_response_without_nonce() {
        let realm = Realm::builder("user", "pass")
            .scheme(AuthScheme::Digest)
            .build();
        assert!(realm.response().is_none());
    }

    #[test]
    fn parse_digest_challenge() {
        let realm = Realm::builder("user", "pass")
            .parse_www_authenticate(
                r#"Digest realm="test", qop="auth,auth-int", nonce="abc", opaque="xyz", algorithm=MD5-sess"#,
            )
            .build();

        assert_eq!(realm.scheme(), AuthScheme::Digest);
        assert_eq!(realm.realm_name(), Some("test"));
        assert_eq!(realm.nonce(), Some("abc"));
        assert_eq!(realm.opaque(), Some("xyz"));
        assert_eq!(realm.qop(), Some("auth"));
        assert_eq!(realm.algorithm(), "MD5-sess");
        assert!(realm.response().is_some());
    }

    #[test]
    fn parse_basic_challenge() {
        let realm = Realm::builder("user", "pass")
            .scheme(AuthScheme::Digest)
            .parse_www_authenticate(r#"Basic realm="x""#)
            .build();
        assert_eq!(realm.scheme(), AuthScheme::Basic);
        assert_eq!(realm.realm_name(), Some("x"));
    }

    #[test]
    fn directive_boundaries() {
        let header = r#"Digest cnonce="wrong", nonce="right""#;
        assert_eq!(directive(header, "nonce").as_deref(), Some("right"));
        assert_eq!(directive(header, "opaque"), None);
        assert_eq!(
            directive("Digest qop=auth, nonce=n", "qop").as_deref(),
            Some("auth")
        );
    }

    #[test]
    fn uri_forms() {
        let uri: Uri = "http://example.com:8080/a/b?c=d".parse().unwrap();
        assert_eq!(realm_uri(&uri, false, false), "/a/b?c=d");
        assert_eq!(realm_uri(&uri, false, true), "/a/b");
        assert_eq!(
            realm_uri(&uri, true, false),
            "http://example.com:8080/a/b?c=d"
        );

        let root: Uri = "http://example.com".parse().unwrap();
        assert_eq!(realm_uri(&root, false, false), "/");
    }

    #[test]
    fn debug_hides_password() {
        let realm = Realm::basic("user", "hunter2");
        assert!(!format!("{realm:?}").contains("hunter2"));
    }
}
