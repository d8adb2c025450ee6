//! Request heads as they go on the wire.
//!
//! Turns an immutable [`Request`] into the `http::Request` hyper writes:
//! request-target form, `Host`, default headers, cookies, range and any
//! preemptive credentials. CONNECT requests for proxy tunnels are built here
//! as well.

use http::header::{
    HeaderValue, ACCEPT, AUTHORIZATION, CONNECTION, COOKIE, HOST, PROXY_AUTHORIZATION, RANGE,
    USER_AGENT,
};
use http::uri::{Parts, Port};
use http::{Method, Uri, Version};

use super::payload::Payload;
use crate::auth::preemptive_authorization;
use crate::config::Config;
use crate::request::{ProxyServer, Request};
use crate::Error;

/// How the request line addresses its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetForm {
    /// `/path?query`, for direct connections and tunnels.
    Origin,
    /// `http://host:port/path?query`, for plain requests through a proxy.
    Absolute,
}

impl TargetForm {
    /// Plain HTTP through a proxy is sent in absolute-form; everything else,
    /// including secure and WebSocket requests tunneled through a proxy, in
    /// origin-form.
    pub(crate) fn for_request(request: &Request, proxied: bool) -> Self {
        if proxied && !request.is_secure() && !request.is_websocket() {
            TargetForm::Absolute
        } else {
            TargetForm::Origin
        }
    }
}

/// Returns true if the URI scheme is presumed secure.
fn is_schema_secure(uri: &Uri) -> bool {
    uri.scheme_str()
        .map(|scheme_str| matches!(scheme_str, "wss" | "https"))
        .unwrap_or_default()
}

/// Returns the port if it is not the default port for the scheme.
fn get_non_default_port(uri: &Uri) -> Option<Port<&str>> {
    match (uri.port().map(|p| p.as_u16()), is_schema_secure(uri)) {
        (Some(443), true) => None,
        (Some(80), false) => None,
        _ => uri.port(),
    }
}

/// `Host` header value for `uri`: the host plus any non-default port.
pub(crate) fn host_header(uri: &Uri) -> Result<HeaderValue, Error> {
    let hostname = uri
        .host()
        .ok_or_else(|| Error::InvalidUri(format!("no host in {uri}")))?;
    let value = match get_non_default_port(uri) {
        Some(port) => HeaderValue::from_str(&format!("{hostname}:{port}")),
        None => HeaderValue::from_str(hostname),
    };
    value.map_err(|_| Error::InvalidUri(format!("host of {uri} is not a valid header")))
}

/// Convert the URI to origin-form.
///
/// This form of the URI has no scheme or authority, and contains just
/// the path, usually used in HTTP/1 requests.
fn origin_form(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(path) if path.as_str() != "/" => {
            let mut parts = Parts::default();
            parts.path_and_query = Some(path.clone());
            Uri::from_parts(parts).unwrap_or_default()
        }
        _none_or_just_slash => Uri::default(),
    }
}

/// `Cookie` header value for the request's cookies, appended to any value
/// already set by the caller.
fn cookie_header(request: &Request) -> Result<Option<HeaderValue>, Error> {
    if request.cookies().is_empty() {
        return Ok(None);
    }

    let mut value = request
        .headers()
        .get(COOKIE)
        .and_then(|existing| existing.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_default();

    for cookie in request.cookies() {
        if !value.is_empty() {
            value.push_str("; ");
        }
        value.push_str(cookie.name());
        value.push('=');
        value.push_str(cookie.value());
    }

    HeaderValue::try_from(value)
        .map(Some)
        .map_err(|_| Error::InvalidRequest("cookie is not a valid header value".into()))
}

/// Build the request head for `request`, with `body` as its payload.
pub(crate) fn prepare(
    request: &Request,
    form: TargetForm,
    config: &Config,
    body: Payload,
) -> Result<http::Request<Payload>, Error> {
    let uri = match form {
        TargetForm::Origin => origin_form(request.uri()),
        TargetForm::Absolute => request.uri().clone(),
    };

    let mut headers = request.headers().clone();

    let host = match request.virtual_host() {
        Some(host) => HeaderValue::from_str(host)
            .map_err(|_| Error::InvalidRequest(format!("invalid virtual host {host}")))?,
        None => host_header(request.uri())?,
    };
    headers.insert(HOST, host);

    if let Some(user_agent) = &config.user_agent {
        headers
            .entry(USER_AGENT)
            .or_insert_with(|| user_agent.clone());
    }
    headers
        .entry(ACCEPT)
        .or_insert_with(|| HeaderValue::from_static("*/*"));

    if let Some(cookies) = cookie_header(request)? {
        headers.insert(COOKIE, cookies);
    }

    if request.range_offset() > 0 {
        let range = HeaderValue::try_from(format!("bytes={}-", request.range_offset()))
            .map_err(|_| Error::InvalidRequest("invalid range".into()))?;
        headers.insert(RANGE, range);
    }

    if let Some(realm) = config.realm_for(request) {
        let name = if realm.target_proxy() {
            PROXY_AUTHORIZATION
        } else {
            AUTHORIZATION
        };
        if !headers.contains_key(&name) && (form == TargetForm::Absolute || !realm.target_proxy())
        {
            if let Some(value) = preemptive_authorization(realm)? {
                headers.insert(name, value);
            }
        }
    }

    if form == TargetForm::Absolute && !headers.contains_key(PROXY_AUTHORIZATION) {
        if let Some(value) = proxy_credentials(config.proxy_for(request))? {
            headers.insert(PROXY_AUTHORIZATION, value);
        }
    }

    let mut head = http::Request::new(body);
    *head.method_mut() = request.method().clone();
    *head.uri_mut() = uri;
    *head.version_mut() = Version::HTTP_11;
    *head.headers_mut() = headers;
    Ok(head)
}

fn proxy_credentials(proxy: Option<&ProxyServer>) -> Result<Option<HeaderValue>, Error> {
    match proxy.and_then(ProxyServer::realm) {
        Some(realm) => preemptive_authorization(realm),
        None => Ok(None),
    }
}

/// `CONNECT host:port` asking a proxy for a tunnel.
///
/// `credentials` answers an earlier `407` on the same tunnel; without it,
/// preemptive proxy credentials are sent if the proxy realm asks for them.
pub(crate) fn connect_request(
    host: &str,
    port: u16,
    proxy: Option<&ProxyServer>,
    credentials: Option<HeaderValue>,
    config: &Config,
) -> Result<http::Request<Payload>, Error> {
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let mut parts = Parts::default();
    parts.authority = Some(
        authority
            .parse()
            .map_err(|_| Error::InvalidUri(format!("invalid tunnel target {authority}")))?,
    );
    let uri = Uri::from_parts(parts)
        .map_err(|error| Error::InvalidUri(format!("invalid tunnel target {authority}: {error}")))?;

    let mut head = http::Request::new(Payload::empty());
    *head.method_mut() = Method::CONNECT;
    *head.uri_mut() = uri;

    let headers = head.headers_mut();
    headers.insert(
        HOST,
        HeaderValue::try_from(authority.as_str())
            .map_err(|_| Error::InvalidUri(format!("invalid tunnel target {authority}")))?,
    );
    headers.insert(
        http::header::HeaderName::from_static("proxy-connection"),
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(user_agent) = &config.user_agent {
        headers.insert(USER_AGENT, user_agent.clone());
    }

    let credentials = match credentials {
        Some(credentials) => Some(credentials),
        None => proxy_credentials(proxy)?,
    };
    if let Some(credentials) = credentials {
        headers.insert(PROXY_AUTHORIZATION, credentials);
    }

    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{realm::Realm, Cookie};

    fn prepared(request: &Request, form: TargetForm) -> http::Request<Payload> {
        prepare(request, form, &Config::default(), Payload::empty()).unwrap()
    }

    #[test]
    fn test_host_header() {
        let cases = [
            ("http://example.com", "example.com"),
            ("http://example.com:8080", "example.com:8080"),
            ("https://example.com", "example.com"),
            ("https://example.com:8443", "example.com:8443"),
            ("http://example.com:443", "example.com:443"),
        ];
        for (uri, host) in cases {
            let uri: Uri = uri.parse().unwrap();
            assert_eq!(host_header(&uri).unwrap(), host, "{uri}");
        }
    }

    #[test]
    fn test_origin_form() {
        let uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri), "/");

        let uri = "/some/path/here".parse().unwrap();
        assert_eq!(origin_form(&uri), "/some/path/here");

        let uri = "http://example.com:8080/some/path?query#fragment"
            .parse()
            .unwrap();
        assert_eq!(origin_form(&uri), "/some/path?query");
    }

    #[test]
    fn absolute_form_through_plain_proxy() {
        let plain = Request::get("http://example.com/a?b=1").build().unwrap();
        let secure = Request::get("https://example.com/a").build().unwrap();
        let socket = Request::get("ws://example.com/a").build().unwrap();

        assert_eq!(TargetForm::for_request(&plain, true), TargetForm::Absolute);
        assert_eq!(TargetForm::for_request(&plain, false), TargetForm::Origin);
        assert_eq!(TargetForm::for_request(&secure, true), TargetForm::Origin);
        assert_eq!(TargetForm::for_request(&socket, true), TargetForm::Origin);

        let head = prepared(&plain, TargetForm::Absolute);
        assert_eq!(head.uri(), "http://example.com/a?b=1");
        let head = prepared(&plain, TargetForm::Origin);
        assert_eq!(head.uri(), "/a?b=1");
    }

    #[test]
    fn default_headers() {
        let request = Request::get("http://example.com:8080/")
            .header(ACCEPT, "text/plain")
            .cookie(Cookie::new("a", "1"))
            .cookie(Cookie::new("b", "2"))
            .range_offset(100)
            .build()
            .unwrap();
        let head = prepared(&request, TargetForm::Origin);
        let headers = head.headers();

        assert_eq!(headers[HOST], "example.com:8080");
        assert_eq!(headers[ACCEPT], "text/plain");
        assert!(headers[USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("courier/"));
        assert_eq!(headers[COOKIE], "a=1; b=2");
        assert_eq!(headers[RANGE], "bytes=100-");
        assert_eq!(head.version(), Version::HTTP_11);
    }

    #[test]
    fn virtual_host_overrides_host() {
        let request = Request::get("http://10.0.0.1/")
            .header(HOST, "ignored")
            .virtual_host("service.internal")
            .build()
            .unwrap();
        let head = prepared(&request, TargetForm::Origin);
        assert_eq!(head.headers()[HOST], "service.internal");
    }

    #[test]
    fn preemptive_basic() {
        let request = Request::get("http://example.com/")
            .realm(Realm::basic("user", "secret"))
            .build()
            .unwrap();
        let head = prepared(&request, TargetForm::Origin);
        assert_eq!(head.headers()[AUTHORIZATION], "Basic dXNlcjpzZWNyZXQ=");
        assert!(!head.headers().contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn proxy_credentials_only_in_absolute_form() {
        let proxy = ProxyServer::new("proxy.local", 3128).with_realm(Realm::basic("p", "q"));
        let request = Request::get("http://example.com/")
            .proxy(proxy)
            .build()
            .unwrap();

        let head = prepared(&request, TargetForm::Absolute);
        assert_eq!(head.headers()[PROXY_AUTHORIZATION], "Basic cDpx");

        let head = prepared(&request, TargetForm::Origin);
        assert!(!head.headers().contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn connect_uses_authority_form() {
        let proxy = ProxyServer::new("proxy.local", 3128).with_realm(Realm::basic("p", "q"));
        let head =
            connect_request("example.com", 443, Some(&proxy), None, &Config::default()).unwrap();
        assert_eq!(head.method(), Method::CONNECT);
        assert_eq!(head.uri(), "example.com:443");
        assert_eq!(head.headers()[HOST], "example.com:443");
        assert_eq!(head.headers()[PROXY_AUTHORIZATION], "Basic cDpx");

        let head = connect_request("::1", 8443, None, None, &Config::default()).unwrap();
        assert_eq!(head.uri(), "[::1]:8443");
    }
}
