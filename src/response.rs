//! Response status, body parts and the buffering response assembler.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode, Uri, Version};

/// Status line of a response plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    status: StatusCode,
    version: Version,
    uri: Uri,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl ResponseStatus {
    /// Status received for a request to `uri`.
    pub fn new(status: StatusCode, version: Version, uri: Uri) -> Self {
        Self {
            status,
            version,
            uri,
            remote_addr: None,
            local_addr: None,
        }
    }

    pub(crate) fn with_addrs(
        mut self,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        self.remote_addr = remote_addr;
        self.local_addr = local_addr;
        self
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Status code as an integer.
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Canonical reason phrase.
    pub fn reason(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or_default()
    }

    /// Protocol version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// URI of the request this status answers.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Address of the peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// A chunk of response body.
///
/// Chunk boundaries are whatever the framing decoder produced. Only the
/// `last` flag marks the end of the body; an empty part is not a terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    bytes: Bytes,
    last: bool,
}

impl BodyPart {
    /// New body part.
    pub fn new(bytes: Bytes, last: bool) -> Self {
        Self { bytes, last }
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Take the raw bytes.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Number of bytes in this part.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Does this part carry no bytes?
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Is this the final part of the body?
    pub fn is_last(&self) -> bool {
        self.last
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    status: ResponseStatus,
    headers: HeaderMap,
    trailers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status.status()
    }

    /// Status line and connection details.
    pub fn response_status(&self) -> &ResponseStatus {
        &self.status
    }

    /// Canonical reason phrase.
    pub fn reason(&self) -> &'static str {
        self.status.reason()
    }

    /// Protocol version.
    pub fn version(&self) -> Version {
        self.status.version()
    }

    /// Headers, with trailing headers merged in.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Trailing headers only.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Final URI, after any redirects.
    pub fn uri(&self) -> &Uri {
        self.status.uri()
    }

    /// Was this response a redirect?
    pub fn is_redirected(&self) -> bool {
        matches!(self.status.status_code(), 301 | 302 | 303 | 307 | 308)
    }

    /// Address of the peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.status.remote_addr()
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.status.local_addr()
    }

    /// `Content-Type` header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Did the response carry any body bytes?
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Take the body bytes.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body decoded with the `Content-Type` charset (Latin-1 honored, UTF-8 otherwise).
    pub fn body_as_string(&self) -> String {
        let latin1 = self
            .content_type()
            .map(|ct| ct.to_ascii_lowercase())
            .is_some_and(|ct| ct.contains("charset=iso-8859-1") || ct.contains("charset=latin1"));

        if latin1 {
            self.body.iter().map(|&b| char::from(b)).collect()
        } else {
            String::from_utf8_lossy(&self.body).into_owned()
        }
    }
}

/// Accumulates status, headers and body parts into a [`Response`].
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    status: Option<ResponseStatus>,
    headers: HeaderMap,
    trailers: HeaderMap,
    parts: Vec<BodyPart>,
}

impl ResponseBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the status line.
    pub fn accumulate_status(&mut self, status: &ResponseStatus) -> &mut Self {
        self.status = Some(status.clone());
        self
    }

    /// Record response headers.
    pub fn accumulate_headers(&mut self, headers: &HeaderMap) -> &mut Self {
        for (name, value) in headers {
            self.headers.append(name, value.clone());
        }
        self
    }

    /// Record trailing headers; they are merged into the headers as well.
    pub fn accumulate_trailers(&mut self, trailers: &HeaderMap) -> &mut Self {
        for (name, value) in trailers {
            self.trailers.append(name, value.clone());
            self.headers.append(name, value.clone());
        }
        self
    }

    /// Record a body part.
    pub fn accumulate_part(&mut self, part: BodyPart) -> &mut Self {
        self.parts.push(part);
        self
    }

    /// Forget everything accumulated so far.
    pub fn reset(&mut self) {
        self.status = None;
        self.headers.clear();
        self.trailers.clear();
        self.parts.clear();
    }

    /// Materialize the response; `None` if no status was ever received.
    pub fn build(&self) -> Option<Response> {
        let status = self.status.clone()?;

        let length = self.parts.iter().map(BodyPart::len).sum();
        let mut body = BytesMut::with_capacity(length);
        for part in &self.parts {
            body.extend_from_slice(part.bytes());
        }

        Some(Response {
            status,
            headers: self.headers.clone(),
            trailers: self.trailers.clone(),
            body: body.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn status(code: u16) -> ResponseStatus {
        ResponseStatus::new(
            StatusCode::from_u16(code).unwrap(),
            Version::HTTP_11,
            Uri::from_static("http://example.com/"),
        )
    }

    #[test]
    fn build_without_status_is_none() {
        let mut builder = ResponseBuilder::new();
        builder.accumulate_part(BodyPart::new(Bytes::from_static(b"x"), true));
        assert!(builder.build().is_none());
    }

    #[test]
    fn assembles_parts_in_order() {
        let mut builder = ResponseBuilder::new();
        builder
            .accumulate_status(&status(200))
            .accumulate_part(BodyPart::new(Bytes::from_static(b"hello "), false))
            .accumulate_part(BodyPart::new(Bytes::new(), false))
            .accumulate_part(BodyPart::new(Bytes::from_static(b"world"), true));

        let response = builder.build().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body_as_string(), "hello world");
        assert!(response.has_body());
        assert!(!response.is_redirected());
    }

    #[test]
    fn trailers_merge_into_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-a", HeaderValue::from_static("1"));
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));

        let mut builder = ResponseBuilder::new();
        builder
            .accumulate_status(&status(200))
            .accumulate_headers(&headers)
            .accumulate_trailers(&trailers);

        let response = builder.build().unwrap();
        assert_eq!(response.headers()["x-a"], "1");
        assert_eq!(response.headers()["x-checksum"], "abc");
        assert_eq!(response.trailers().len(), 1);
    }

    #[test]
    fn latin1_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=ISO-8859-1"),
        );
        let mut builder = ResponseBuilder::new();
        builder
            .accumulate_status(&status(200))
            .accumulate_headers(&headers)
            .accumulate_part(BodyPart::new(Bytes::from_static(b"caf\xe9"), true));
        assert_eq!(builder.build().unwrap().body_as_string(), "caf\u{e9}");
    }

    #[test]
    fn reset_clears_state() {
        let mut builder = ResponseBuilder::new();
        builder.accumulate_status(&status(301));
        assert!(builder.build().unwrap().is_redirected());
        builder.reset();
        assert!(builder.build().is_none());
    }
}
