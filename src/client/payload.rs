//! Request body generation.
//!
//! Every [`RequestBody`] kind has a [`PayloadGenerator`] in a fixed table.
//! A generator either writes the whole body into the [`PayloadSink`] at once
//! (in-memory bodies) or defers to a stream that hyper pulls as the
//! connection becomes writable (streams, generators, multipart, files).
//! Backpressure therefore never blocks the connection task: a stream that
//! is not polled simply waits.
//!
//! [`Payload`] is the [`http_body::Body`] handed to hyper. It reports upload
//! progress over a channel and can be held back behind a [`ContinueGate`]
//! until the server answers `100 Continue`.

use std::future::Future as _;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::task::AtomicWaker;
use http_body::{Body, Frame, SizeHint};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::trace;

use crate::request::{encode_form, encode_text, BodyStream, FileBody, Request, RequestBody};
use crate::{BoxError, Error};

const FILE_CHUNK: usize = 8 * 1024;

/// Writes one kind of request body.
pub trait PayloadGenerator: Send + Sync + 'static {
    /// Does this generator write `body`?
    fn handles(&self, body: &RequestBody) -> bool;

    /// Length of the body, if known before writing.
    fn content_length(&self, request: &Request) -> Option<u64>;

    /// Write the body of `request` into `sink`.
    ///
    /// Returns `true` if the whole body was written by this call, `false` if
    /// writing was deferred to a stream pulled later.
    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error>;
}

/// Destination of a [`PayloadGenerator`].
#[derive(Default)]
pub struct PayloadSink {
    body: Option<PayloadBody>,
}

impl std::fmt::Debug for PayloadSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.body {
            None => "empty",
            Some(PayloadBody::Empty) => "empty",
            Some(PayloadBody::Full(_)) => "full",
            Some(PayloadBody::Stream(_)) => "deferred",
        };
        f.debug_tuple("PayloadSink").field(&state).finish()
    }
}

impl PayloadSink {
    /// Write the entire body now.
    pub fn write_all(&mut self, bytes: Bytes) {
        self.body = Some(if bytes.is_empty() {
            PayloadBody::Empty
        } else {
            PayloadBody::Full(Some(bytes))
        });
    }

    /// Write the body later, as the connection pulls from `stream`.
    pub fn defer(&mut self, stream: BodyStream) {
        self.body = Some(PayloadBody::Stream(stream));
    }

    fn into_payload(self, length: Option<u64>) -> Payload {
        let body = self.body.unwrap_or(PayloadBody::Empty);
        let length = match &body {
            PayloadBody::Empty => Some(0),
            PayloadBody::Full(bytes) => bytes.as_ref().map(|b| b.len() as u64),
            PayloadBody::Stream(_) => length,
        };
        Payload::new(body, length)
    }
}

#[derive(Debug)]
struct EmptyPayload;

impl PayloadGenerator for EmptyPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Empty)
    }

    fn content_length(&self, _: &Request) -> Option<u64> {
        Some(0)
    }

    fn generate(&self, _: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        sink.write_all(Bytes::new());
        Ok(true)
    }
}

#[derive(Debug)]
struct BytesPayload;

impl PayloadGenerator for BytesPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Bytes(_))
    }

    fn content_length(&self, request: &Request) -> Option<u64> {
        match request.body() {
            RequestBody::Bytes(bytes) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::Bytes(bytes) = request.body() {
            sink.write_all(bytes.clone());
        }
        Ok(true)
    }
}

#[derive(Debug)]
struct TextPayload;

impl PayloadGenerator for TextPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Text(_))
    }

    fn content_length(&self, request: &Request) -> Option<u64> {
        match request.body() {
            RequestBody::Text(text) => encode_text(text, request.charset())
                .ok()
                .map(|bytes| bytes.len() as u64),
            _ => None,
        }
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::Text(text) = request.body() {
            sink.write_all(encode_text(text, request.charset())?);
        }
        Ok(true)
    }
}

#[derive(Debug)]
struct FormPayload;

impl PayloadGenerator for FormPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Form(_))
    }

    fn content_length(&self, request: &Request) -> Option<u64> {
        match request.body() {
            RequestBody::Form(params) => Some(encode_form(params).len() as u64),
            _ => None,
        }
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::Form(params) = request.body() {
            sink.write_all(encode_form(params));
        }
        Ok(true)
    }
}

#[derive(Debug)]
struct StreamPayload;

impl PayloadGenerator for StreamPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Stream(_))
    }

    fn content_length(&self, _: &Request) -> Option<u64> {
        None
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::Stream(stream) = request.body() {
            let stream = stream.take().ok_or_else(|| {
                Error::InvalidRequest("stream body was already sent and cannot be replayed".into())
            })?;
            sink.defer(stream);
        }
        Ok(false)
    }
}

#[derive(Debug)]
struct GeneratorPayload;

impl PayloadGenerator for GeneratorPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Generator(_))
    }

    fn content_length(&self, request: &Request) -> Option<u64> {
        match request.body() {
            RequestBody::Generator(generator) => generator.content_length(),
            _ => None,
        }
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::Generator(generator) = request.body() {
            sink.defer(generator.create());
        }
        Ok(false)
    }
}

#[derive(Debug)]
struct MultipartPayload;

impl PayloadGenerator for MultipartPayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::Multipart(_))
    }

    fn content_length(&self, request: &Request) -> Option<u64> {
        match request.body() {
            RequestBody::Multipart(multipart) => multipart.content_length(),
            _ => None,
        }
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::Multipart(multipart) = request.body() {
            sink.defer(multipart.open());
        }
        Ok(false)
    }
}

#[derive(Debug)]
struct FilePayload;

impl PayloadGenerator for FilePayload {
    fn handles(&self, body: &RequestBody) -> bool {
        matches!(body, RequestBody::File(_))
    }

    fn content_length(&self, request: &Request) -> Option<u64> {
        let RequestBody::File(file) = request.body() else {
            return None;
        };
        let available = std::fs::metadata(file.path())
            .ok()?
            .len()
            .saturating_sub(file.offset);
        Some(file.length.map_or(available, |length| length.min(available)))
    }

    fn generate(&self, request: &Request, sink: &mut PayloadSink) -> Result<bool, Error> {
        if let RequestBody::File(file) = request.body() {
            sink.defer(file_stream(file.clone()));
        }
        Ok(false)
    }
}

enum FileState {
    Pending(FileBody),
    Reading(tokio::io::Take<tokio::fs::File>),
}

async fn next_file_chunk(state: FileState) -> Result<Option<(Bytes, FileState)>, BoxError> {
    let mut reader = match state {
        FileState::Pending(file) => {
            let mut handle = tokio::fs::File::open(&file.path).await?;
            handle.seek(SeekFrom::Start(file.offset)).await?;
            handle.take(file.length.unwrap_or(u64::MAX))
        }
        FileState::Reading(reader) => reader,
    };

    let mut buf = BytesMut::with_capacity(FILE_CHUNK);
    if reader.read_buf(&mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some((buf.freeze(), FileState::Reading(reader))))
}

fn file_stream(file: FileBody) -> BodyStream {
    Box::pin(futures_util::stream::try_unfold(
        FileState::Pending(file),
        next_file_chunk,
    ))
}

static GENERATORS: [&dyn PayloadGenerator; 8] = [
    &EmptyPayload,
    &BytesPayload,
    &TextPayload,
    &FormPayload,
    &StreamPayload,
    &GeneratorPayload,
    &MultipartPayload,
    &FilePayload,
];

/// The generator responsible for `body`.
pub fn generator_for(body: &RequestBody) -> Result<&'static dyn PayloadGenerator, Error> {
    GENERATORS
        .iter()
        .copied()
        .find(|generator| generator.handles(body))
        .ok_or_else(|| Error::InvalidRequest(format!("no payload generator for {body:?}")))
}

/// Build the wire body for `request`.
pub(crate) fn payload_for(request: &Request) -> Result<Payload, Error> {
    let generator = generator_for(request.body())?;
    let length = generator.content_length(request);
    let mut sink = PayloadSink::default();
    let written = generator.generate(request, &mut sink)?;
    trace!(?length, written, "payload generated");
    Ok(sink.into_payload(length))
}

/// Upload progress reported by a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressEvent {
    Content {
        amount: u64,
        current: u64,
        total: Option<u64>,
    },
    Written,
}

enum PayloadBody {
    Empty,
    Full(Option<Bytes>),
    Stream(BodyStream),
}

/// The request body written by hyper.
pub struct Payload {
    body: PayloadBody,
    length: Option<u64>,
    written: u64,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    gate: Option<ContinueGate>,
    finished: bool,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("length", &self.length)
            .field("written", &self.written)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

impl Payload {
    fn new(body: PayloadBody, length: Option<u64>) -> Self {
        Self {
            body,
            length,
            written: 0,
            events: None,
            gate: None,
            finished: false,
        }
    }

    /// A body with no bytes.
    pub fn empty() -> Self {
        Self::new(PayloadBody::Empty, Some(0))
    }

    /// Known length of the body.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub(crate) fn with_progress(mut self, events: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn with_gate(mut self, gate: ContinueGate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.emit(ProgressEvent::Written);
        }
    }
}

impl Body for Payload {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(gate) = &mut this.gate {
            ready!(gate.poll_open(cx));
            this.gate = None;
        }

        let chunk = match &mut this.body {
            PayloadBody::Empty => None,
            PayloadBody::Full(bytes) => bytes.take(),
            PayloadBody::Stream(stream) => match ready!(stream.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => Some(bytes),
                Some(Err(error)) => return Poll::Ready(Some(Err(error))),
                None => None,
            },
        };

        match chunk {
            Some(bytes) => {
                let amount = bytes.len() as u64;
                this.written += amount;
                this.emit(ProgressEvent::Content {
                    amount,
                    current: this.written,
                    total: this.length,
                });
                // hyper stops polling once the body reports its end
                if this.is_end_stream() || this.length == Some(this.written) {
                    this.finish();
                }
                Poll::Ready(Some(Ok(Frame::data(bytes))))
            }
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.body {
            PayloadBody::Empty => true,
            PayloadBody::Full(bytes) => bytes.is_none(),
            PayloadBody::Stream(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.length {
            Some(length) => SizeHint::with_exact(length.saturating_sub(self.written)),
            None => SizeHint::default(),
        }
    }
}

#[derive(Debug, Default)]
struct GateShared {
    open: AtomicBool,
    waker: AtomicWaker,
}

/// Holds a body back until `100 Continue` arrives or a timeout elapses.
#[derive(Debug)]
pub(crate) struct ContinueGate {
    shared: Arc<GateShared>,
    timeout: Pin<Box<Sleep>>,
}

/// Opens a [`ContinueGate`] from elsewhere.
#[derive(Debug, Clone)]
pub(crate) struct GateHandle {
    shared: Arc<GateShared>,
}

impl ContinueGate {
    pub(crate) fn new(timeout: Duration) -> (Self, GateHandle) {
        let shared = Arc::new(GateShared::default());
        (
            Self {
                shared: shared.clone(),
                timeout: Box::pin(tokio::time::sleep(timeout)),
            },
            GateHandle { shared },
        )
    }

    fn poll_open(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.open.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        self.shared.waker.register(cx.waker());
        if self.shared.open.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        if self.timeout.as_mut().poll(cx).is_ready() {
            trace!("no 100 continue before timeout, sending body");
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl GateHandle {
    /// Release the body. Returns `true` if this call opened the gate.
    pub(crate) fn open(&self) -> bool {
        let opened = !self.shared.open.swap(true, Ordering::AcqRel);
        self.shared.waker.wake();
        opened
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::sync::Arc;

    use http_body_util::BodyExt as _;

    use super::*;
    use crate::request::BodyGenerator;

    async fn collect(payload: Payload) -> Bytes {
        payload.collect().await.unwrap().to_bytes()
    }

    #[test]
    fn every_body_kind_has_a_generator() {
        let bodies = [
            RequestBody::Empty,
            RequestBody::Bytes(Bytes::from_static(b"x")),
            RequestBody::Text("x".into()),
            RequestBody::Form(vec![("a".into(), "b".into())]),
            RequestBody::File(FileBody::new("/nonexistent")),
        ];
        for body in &bodies {
            assert!(generator_for(body).is_ok(), "{body:?}");
        }
    }

    #[tokio::test]
    async fn in_memory_bodies_are_written_at_once() {
        let request = Request::post("http://example.com/")
            .body("hello")
            .build()
            .unwrap();
        let generator = generator_for(request.body()).unwrap();
        assert_eq!(generator.content_length(&request), Some(5));

        let mut sink = PayloadSink::default();
        assert!(generator.generate(&request, &mut sink).unwrap());

        let payload = sink.into_payload(Some(5));
        assert_eq!(payload.size_hint().exact(), Some(5));
        assert_eq!(collect(payload).await, "hello");
    }

    #[tokio::test]
    async fn stream_bodies_are_one_shot() {
        let request = Request::post("http://example.com/")
            .body_stream(futures_util::stream::iter(vec![
                Ok::<_, BoxError>(Bytes::from_static(b"a")),
                Ok(Bytes::from_static(b"")),
                Ok(Bytes::from_static(b"b")),
            ]))
            .build()
            .unwrap();

        let payload = payload_for(&request).unwrap();
        assert_eq!(payload.size_hint().exact(), None);
        assert_eq!(collect(payload).await, "ab");

        assert!(matches!(
            payload_for(&request),
            Err(Error::InvalidRequest(_))
        ));
    }

    struct Repeat;

    impl BodyGenerator for Repeat {
        fn content_length(&self) -> Option<u64> {
            Some(3)
        }

        fn create(&self) -> BodyStream {
            Box::pin(futures_util::stream::iter(vec![Ok::<_, BoxError>(
                Bytes::from_static(b"abc"),
            )]))
        }
    }

    #[tokio::test]
    async fn generators_replay() {
        let request = Request::put("http://example.com/")
            .body_generator(Arc::new(Repeat))
            .build()
            .unwrap();
        for _ in 0..2 {
            let payload = payload_for(&request).unwrap();
            assert_eq!(payload.length(), Some(3));
            assert_eq!(collect(payload).await, "abc");
        }
    }

    #[tokio::test]
    async fn file_region() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let request = Request::put("http://example.com/")
            .file(FileBody::region(file.path(), 2, 5))
            .build()
            .unwrap();
        let payload = payload_for(&request).unwrap();
        assert_eq!(payload.length(), Some(5));
        assert_eq!(collect(payload).await, "23456");

        let request = Request::put("http://example.com/")
            .file(FileBody::new(file.path()))
            .build()
            .unwrap();
        assert_eq!(collect(payload_for(&request).unwrap()).await, "0123456789");
    }

    #[tokio::test]
    async fn progress_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = Request::post("http://example.com/")
            .body(Bytes::from_static(b"abcd"))
            .build()
            .unwrap();
        let payload = payload_for(&request).unwrap().with_progress(tx);
        collect(payload).await;

        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Content {
                amount: 4,
                current: 4,
                total: Some(4)
            })
        );
        assert_eq!(rx.recv().await, Some(ProgressEvent::Written));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_holds_body_until_opened() {
        let request = Request::post("http://example.com/")
            .body("data")
            .build()
            .unwrap();
        let (gate, handle) = ContinueGate::new(Duration::from_secs(30));
        let payload = payload_for(&request).unwrap().with_gate(gate);

        let task = tokio::spawn(collect(payload));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());

        assert!(handle.open());
        assert!(!handle.open());
        assert_eq!(task.await.unwrap(), "data");
    }

    #[tokio::test(start_paused = true)]
    async fn gate_times_out() {
        let request = Request::post("http://example.com/")
            .body("data")
            .build()
            .unwrap();
        let (gate, handle) = ContinueGate::new(Duration::from_secs(1));
        let payload = payload_for(&request).unwrap().with_gate(gate);
        assert_eq!(collect(payload).await, "data");
        assert!(!handle.is_open());
    }
}
