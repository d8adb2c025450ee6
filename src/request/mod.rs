//! Immutable request values and their builder.
//!
//! A [`Request`] is built once from a [`RequestBuilder`]. Building percent-encodes
//! the URI, merges query parameters, infers the body charset and copies every
//! collection out of the builder, so later changes to the builder never leak into
//! requests already submitted. Building twice from the same builder state yields
//! equal requests.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, Uri};
use parking_lot::Mutex;

use crate::client::pool::ConnectionPartitioning;
use crate::{BoxError, Error};

pub mod proxy;
pub mod realm;

pub use self::proxy::ProxyServer;
use self::realm::Realm;

/// A stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + 'static>>;

/// A replayable body source. Each call to [`create`](BodyGenerator::create)
/// must yield the full body again, which lets redirects and authentication
/// retries resend it.
pub trait BodyGenerator: Send + Sync + 'static {
    /// Length of the generated body, if known up front.
    fn content_length(&self) -> Option<u64> {
        None
    }

    /// Open a fresh stream over the body.
    fn create(&self) -> BodyStream;
}

/// A multipart body produced by an external encoder.
pub trait MultipartBody: Send + Sync + 'static {
    /// `Content-Type` including the boundary parameter.
    fn content_type(&self) -> HeaderValue;

    /// Length of the encoded body, if known up front.
    fn content_length(&self) -> Option<u64>;

    /// Open a fresh stream over the encoded parts.
    fn open(&self) -> BodyStream;
}

/// Resolves host names for a single request, overriding the transport's resolver.
pub trait NameResolver: Send + Sync + 'static {
    /// Resolve `host` to candidate socket addresses, tried in order.
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'static>>;
}

/// A body stream that can only be sent once.
#[derive(Clone)]
pub struct OneShotStream(Arc<Mutex<Option<BodyStream>>>);

impl OneShotStream {
    /// Wrap a stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::pin(stream)))))
    }

    /// Take the stream out; `None` once it was already sent.
    pub(crate) fn take(&self) -> Option<BodyStream> {
        self.0.lock().take()
    }
}

impl fmt::Debug for OneShotStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let consumed = self.0.lock().is_none();
        f.debug_struct("OneShotStream")
            .field("consumed", &consumed)
            .finish()
    }
}

/// A slice of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBody {
    pub(crate) path: PathBuf,
    pub(crate) offset: u64,
    pub(crate) length: Option<u64>,
}

impl FileBody {
    /// The whole file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            length: None,
        }
    }

    /// Only `length` bytes starting at `offset`.
    pub fn region(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length: Some(length),
        }
    }

    /// Path of the file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Request body.
#[derive(Clone, Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// In-memory bytes.
    Bytes(Bytes),
    /// Text, encoded with the request charset.
    Text(String),
    /// A stream that can be sent only once.
    Stream(OneShotStream),
    /// A replayable generator.
    Generator(Arc<dyn BodyGenerator>),
    /// `application/x-www-form-urlencoded` parameters.
    Form(Vec<(String, String)>),
    /// Multipart parts from an external encoder.
    Multipart(Arc<dyn MultipartBody>),
    /// File contents.
    File(FileBody),
}

impl RequestBody {
    /// Is there no body at all?
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RequestBody::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            RequestBody::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            RequestBody::Generator(_) => f.write_str("Generator"),
            RequestBody::Form(params) => f.debug_tuple("Form").field(params).finish(),
            RequestBody::Multipart(_) => f.write_str("Multipart"),
            RequestBody::File(file) => f.debug_tuple("File").field(file).finish(),
        }
    }
}

impl PartialEq for RequestBody {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RequestBody::Empty, RequestBody::Empty) => true,
            (RequestBody::Bytes(a), RequestBody::Bytes(b)) => a == b,
            (RequestBody::Text(a), RequestBody::Text(b)) => a == b,
            (RequestBody::Stream(a), RequestBody::Stream(b)) => Arc::ptr_eq(&a.0, &b.0),
            (RequestBody::Generator(a), RequestBody::Generator(b)) => Arc::ptr_eq(a, b),
            (RequestBody::Form(a), RequestBody::Form(b)) => a == b,
            (RequestBody::Multipart(a), RequestBody::Multipart(b)) => Arc::ptr_eq(a, b),
            (RequestBody::File(a), RequestBody::File(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(bytes.into())
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Text(text)
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Text(text.to_owned())
    }
}

/// A cookie sent with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
}

impl Cookie {
    /// New cookie.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Cookie name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cookie value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// An immutable HTTP request.
#[derive(Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: RequestBody,
    charset: Option<String>,
    proxy: Option<ProxyServer>,
    realm: Option<Realm>,
    follow_redirect: Option<bool>,
    request_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    range_offset: u64,
    virtual_host: Option<String>,
    partitioning: Option<Arc<dyn ConnectionPartitioning>>,
    resolver: Option<Arc<dyn NameResolver>>,
}

macro_rules! method_constructor {
    ($name:ident, $method:ident) => {
        #[doc = concat!("Start building a `", stringify!($method), "` request.")]
        pub fn $name(url: impl Into<String>) -> RequestBuilder {
            RequestBuilder::new(Method::$method, url)
        }
    };
}

impl Request {
    method_constructor!(get, GET);
    method_constructor!(post, POST);
    method_constructor!(put, PUT);
    method_constructor!(delete, DELETE);
    method_constructor!(head, HEAD);
    method_constructor!(options, OPTIONS);
    method_constructor!(patch, PATCH);

    /// Start building a request with any method.
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    /// Copy this request into a builder.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: self.uri.to_string(),
            query: Vec::new(),
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
            body: self.body.clone(),
            charset: self.charset.clone(),
            proxy: self.proxy.clone(),
            realm: self.realm.clone(),
            follow_redirect: self.follow_redirect,
            request_timeout: self.request_timeout,
            read_timeout: self.read_timeout,
            range_offset: self.range_offset,
            virtual_host: self.virtual_host.clone(),
            partitioning: self.partitioning.clone(),
            resolver: self.resolver.clone(),
            error: None,
        }
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Encoded target URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Cookies sent in the `Cookie` header.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Request body.
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Charset used to encode text bodies.
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Per-request proxy override.
    pub fn proxy(&self) -> Option<&ProxyServer> {
        self.proxy.as_ref()
    }

    /// Per-request realm override.
    pub fn realm(&self) -> Option<&Realm> {
        self.realm.as_ref()
    }

    /// Per-request redirect override.
    pub fn follow_redirect(&self) -> Option<bool> {
        self.follow_redirect
    }

    /// Per-request total timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Per-request read (idle) timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Offset sent as `Range: bytes=<offset>-` when non-zero.
    pub fn range_offset(&self) -> u64 {
        self.range_offset
    }

    /// Overrides the `Host` header.
    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    /// Per-request partitioning strategy.
    pub fn partitioning(&self) -> Option<&Arc<dyn ConnectionPartitioning>> {
        self.partitioning.as_ref()
    }

    /// Per-request name resolver.
    pub fn resolver(&self) -> Option<&Arc<dyn NameResolver>> {
        self.resolver.as_ref()
    }

    /// Does the URI use a TLS scheme (`https` or `wss`)?
    pub fn is_secure(&self) -> bool {
        matches!(self.uri.scheme_str(), Some("https" | "wss"))
    }

    /// Does the URI use a WebSocket scheme (`ws` or `wss`)?
    pub fn is_websocket(&self) -> bool {
        matches!(self.uri.scheme_str(), Some("ws" | "wss"))
    }

    /// Host and port of the target, with the scheme's default port filled in.
    pub fn host_and_port(&self) -> Result<(&str, u16), Error> {
        let host = self
            .uri
            .host()
            .ok_or_else(|| Error::InvalidUri(format!("no host in {}", self.uri)))?;
        let port = self
            .uri
            .port_u16()
            .unwrap_or(if self.is_secure() { 443 } else { 80 });
        Ok((host, port))
    }
}

fn same_arc<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.uri == other.uri
            && self.headers == other.headers
            && self.cookies == other.cookies
            && self.body == other.body
            && self.charset == other.charset
            && self.proxy == other.proxy
            && self.realm == other.realm
            && self.follow_redirect == other.follow_redirect
            && self.request_timeout == other.request_timeout
            && self.read_timeout == other.read_timeout
            && self.range_offset == other.range_offset
            && self.virtual_host == other.virtual_host
            && same_arc(&self.partitioning, &other.partitioning)
            && same_arc(&self.resolver, &other.resolver)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body", &self.body)
            .field("proxy", &self.proxy)
            .field("realm", &self.realm)
            .field("follow_redirect", &self.follow_redirect)
            .finish_non_exhaustive()
    }
}

/// Mutable builder for [`Request`].
#[derive(Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: RequestBody,
    charset: Option<String>,
    proxy: Option<ProxyServer>,
    realm: Option<Realm>,
    follow_redirect: Option<bool>,
    request_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    range_offset: u64,
    virtual_host: Option<String>,
    partitioning: Option<Arc<dyn ConnectionPartitioning>>,
    resolver: Option<Arc<dyn NameResolver>>,
    error: Option<String>,
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl RequestBuilder {
    /// New builder for `method` and an absolute `url`.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: RequestBody::Empty,
            charset: None,
            proxy: None,
            realm: None,
            follow_redirect: None,
            request_timeout: None,
            read_timeout: None,
            range_offset: 0,
            virtual_host: None,
            partitioning: None,
            resolver: None,
            error: None,
        }
    }

    /// Replace the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Replace the URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Append a query parameter; it is percent-encoded at build time.
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Append a header value, keeping existing values for the same name.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        match (name.try_into(), value.try_into()) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => {
                self.error.get_or_insert_with(|| "invalid header".into());
            }
        }
        self
    }

    /// Set a header, replacing existing values.
    pub fn set_header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        match (name.try_into(), value.try_into()) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => {
                self.error.get_or_insert_with(|| "invalid header".into());
            }
        }
        self
    }

    /// Remove all values of a header.
    pub fn remove_header(mut self, name: impl http::header::AsHeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Add a cookie.
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Replace all cookies.
    pub fn cookies(mut self, cookies: Vec<Cookie>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Stream the body from a one-shot stream.
    pub fn body_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        self.body = RequestBody::Stream(OneShotStream::new(stream));
        self
    }

    /// Generate the body from a replayable generator.
    pub fn body_generator(mut self, generator: Arc<dyn BodyGenerator>) -> Self {
        self.body = RequestBody::Generator(generator);
        self
    }

    /// Send the file as body.
    pub fn file(mut self, file: FileBody) -> Self {
        self.body = RequestBody::File(file);
        self
    }

    /// Add a form parameter, switching the body to a urlencoded form.
    pub fn form_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.body {
            RequestBody::Form(params) => params.push((name.into(), value.into())),
            _ => self.body = RequestBody::Form(vec![(name.into(), value.into())]),
        }
        self
    }

    /// Send a multipart body.
    pub fn multipart(mut self, body: Arc<dyn MultipartBody>) -> Self {
        self.body = RequestBody::Multipart(body);
        self
    }

    /// Charset used for text bodies.
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    /// Route this request through a proxy.
    pub fn proxy(mut self, proxy: ProxyServer) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Authenticate with this realm.
    pub fn realm(mut self, realm: Realm) -> Self {
        self.realm = Some(realm);
        self
    }

    /// Override the client's redirect policy.
    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = Some(follow);
        self
    }

    /// Override the client's request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Override the client's read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Resume a download from `offset`.
    pub fn range_offset(mut self, offset: u64) -> Self {
        self.range_offset = offset;
        self
    }

    /// Override the `Host` header.
    pub fn virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }

    /// Send the URL's own host as `Host` again.
    pub fn clear_virtual_host(mut self) -> Self {
        self.virtual_host = None;
        self
    }

    /// Group pooled connections with a custom strategy.
    pub fn partitioning(mut self, partitioning: Arc<dyn ConnectionPartitioning>) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    /// Resolve the host with a custom resolver.
    pub fn resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build the immutable request.
    pub fn build(&self) -> Result<Request, Error> {
        if let Some(error) = &self.error {
            return Err(Error::InvalidRequest(error.clone()));
        }

        let uri = self.encoded_uri()?;

        let mut headers = self.headers.clone();
        let charset = self.charset.clone().or_else(|| {
            headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .and_then(charset_from_content_type)
        });

        if let Some(charset) = &charset {
            if matches!(self.body, RequestBody::Text(_)) && !is_supported_charset(charset) {
                return Err(Error::InvalidRequest(format!(
                    "unsupported charset {charset}"
                )));
            }
        }

        match &self.body {
            RequestBody::Form(_) if !headers.contains_key(CONTENT_TYPE) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
            }
            RequestBody::Multipart(multipart) if !headers.contains_key(CONTENT_TYPE) => {
                headers.insert(CONTENT_TYPE, multipart.content_type());
            }
            _ => {}
        }

        Ok(Request {
            method: self.method.clone(),
            uri,
            headers,
            cookies: self.cookies.clone(),
            body: self.body.clone(),
            charset,
            proxy: self.proxy.clone(),
            realm: self.realm.clone(),
            follow_redirect: self.follow_redirect,
            request_timeout: self.request_timeout,
            read_timeout: self.read_timeout,
            range_offset: self.range_offset,
            virtual_host: self.virtual_host.clone(),
            partitioning: self.partitioning.clone(),
            resolver: self.resolver.clone(),
        })
    }

    fn encoded_uri(&self) -> Result<Uri, Error> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|error| Error::InvalidUri(format!("{}: {error}", self.url)))?;

        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(Error::InvalidUri(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::InvalidUri(format!("no host in {}", self.url)));
        }

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        url.set_fragment(None);

        url.as_str()
            .parse()
            .map_err(|error| Error::InvalidUri(format!("{url}: {error}")))
    }
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_owned())
    })
}

fn is_supported_charset(charset: &str) -> bool {
    matches!(
        charset.to_ascii_lowercase().as_str(),
        "utf-8" | "utf8" | "us-ascii" | "ascii" | "iso-8859-1" | "latin1"
    )
}

/// Encode a text body with the request charset, UTF-8 by default.
pub(crate) fn encode_text(text: &str, charset: Option<&str>) -> Result<Bytes, Error> {
    let charset = charset.map(str::to_ascii_lowercase);
    match charset.as_deref() {
        None | Some("utf-8" | "utf8") => Ok(Bytes::copy_from_slice(text.as_bytes())),
        Some("us-ascii" | "ascii") => text
            .is_ascii()
            .then(|| Bytes::copy_from_slice(text.as_bytes()))
            .ok_or_else(|| Error::InvalidRequest("body is not ascii".into())),
        Some("iso-8859-1" | "latin1") => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from)
            .ok_or_else(|| Error::InvalidRequest("body is not latin-1".into())),
        Some(other) => Err(Error::InvalidRequest(format!("unsupported charset {other}"))),
    }
}

/// Encode form parameters as `application/x-www-form-urlencoded`.
pub(crate) fn encode_form(params: &[(String, String)]) -> Bytes {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_is_idempotent() {
        let builder = Request::post("http://example.com/a b")
            .query_param("q", "a&b")
            .header("x-test", "1")
            .cookie(Cookie::new("session", "abc"))
            .body("hello");

        let first = builder.build().unwrap();
        let second = builder.build().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.uri(), "http://example.com/a%20b?q=a%26b");
    }

    #[test]
    fn build_copies_collections() {
        let builder = Request::get("http://example.com/").header("x-a", "1");
        let request = builder.build().unwrap();

        let builder = builder.header("x-b", "2");
        let later = builder.build().unwrap();

        assert!(request.headers().get("x-b").is_none());
        assert!(later.headers().get("x-b").is_some());
    }

    #[test]
    fn stream_bodies_compare_by_identity() {
        let builder =
            Request::post("http://example.com/").body_stream(futures_util::stream::empty());
        assert_eq!(builder.build().unwrap(), builder.build().unwrap());

        let other =
            Request::post("http://example.com/").body_stream(futures_util::stream::empty());
        assert_ne!(builder.build().unwrap(), other.build().unwrap());
    }

    #[test]
    fn charset_is_inferred_from_content_type() {
        let request = Request::post("http://example.com/")
            .header(CONTENT_TYPE, "text/plain; charset=ISO-8859-1")
            .body("caf\u{e9}")
            .build()
            .unwrap();
        assert_eq!(request.charset(), Some("ISO-8859-1"));
        assert_eq!(
            encode_text("caf\u{e9}", request.charset()).unwrap().as_ref(),
            b"caf\xe9"
        );
    }

    #[test]
    fn unsupported_charset_is_rejected() {
        let error = Request::post("http://example.com/")
            .charset("shift_jis")
            .body("text")
            .build()
            .unwrap_err();
        assert!(matches!(error, Error::InvalidRequest(_)));
    }

    #[test]
    fn form_sets_content_type() {
        let request = Request::post("http://example.com/")
            .form_param("a", "1 2")
            .form_param("b", "&")
            .build()
            .unwrap();
        assert_eq!(
            request.headers()[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
        let RequestBody::Form(params) = request.body() else {
            panic!("expected form body");
        };
        assert_eq!(encode_form(params), "a=1+2&b=%26");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(
            Request::get("ftp://example.com/").build(),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            Request::get("not a url").build(),
            Err(Error::InvalidUri(_))
        ));
    }

    #[test]
    fn default_ports() {
        let request = Request::get("wss://example.com/socket").build().unwrap();
        assert!(request.is_secure());
        assert!(request.is_websocket());
        assert_eq!(request.host_and_port().unwrap(), ("example.com", 443));

        let request = Request::get("http://example.com:8080/").build().unwrap();
        assert_eq!(request.host_and_port().unwrap(), ("example.com", 8080));
    }

    #[test]
    fn to_builder_round_trips() {
        let request = Request::put("http://example.com/x?y=1")
            .header("x-a", "1")
            .follow_redirect(true)
            .build()
            .unwrap();
        assert_eq!(request.to_builder().build().unwrap(), request);
    }
}
