//! The seam between the engine and the wire.
//!
//! A [`Transport`] performs one attempt: it connects (or reuses a
//! connection), writes the request, and resolves with the response head
//! while the body keeps streaming. Connection milestones are reported
//! through the [`AttemptProbe`] so the engine can drive timings and phase
//! timeouts without knowing how the bytes move.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;
use url::Url;

use crate::error::BoxError;
use crate::timings::AttemptEvent;

mod http1;

pub use http1::HyperTransport;

pub type BoxBodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

pub trait Transport: Send + Sync {
    fn perform(
        &self,
        request: TransportRequest,
        probe: AttemptProbe,
    ) -> BoxFuture<'static, Result<ResponseLike, BoxError>>;
}

#[derive(Debug)]
pub struct TransportRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl TransportRequest {
    pub(crate) fn new(method: Method, url: Url, headers: HeaderMap, body: RequestBody) -> Self {
        Self {
            method,
            url,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_parts(self) -> (Method, Url, HeaderMap, RequestBody) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// A response head plus a body that has not been read yet.
pub struct ResponseLike {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
    remote_addr: Option<SocketAddr>,
    from_cache: bool,
}

impl std::fmt::Debug for ResponseLike {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseLike")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("remote_addr", &self.remote_addr)
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}

impl ResponseLike {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self::streaming(status, headers, Full::new(body.into()))
    }

    pub fn streaming<B>(status: StatusCode, headers: HeaderMap, body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body: body.map_err(Into::into).boxed_unsync(),
            remote_addr: None,
            from_cache: false,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub(crate) fn from_cache(mut self) -> Self {
        self.from_cache = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn into_parts(self) -> ResponseParts {
        ResponseParts {
            status: self.status,
            version: self.version,
            headers: self.headers,
            body: self.body,
            remote_addr: self.remote_addr,
            from_cache: self.from_cache,
        }
    }
}

pub(crate) struct ResponseParts {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ResponseBody,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) from_cache: bool,
}

#[derive(Debug, Default)]
struct ProbeShared {
    activity_pending: AtomicBool,
    upload_failed: AtomicBool,
}

/// Reports connection milestones of one attempt back to the engine.
#[derive(Clone, Debug)]
pub struct AttemptProbe {
    sender: mpsc::UnboundedSender<AttemptEvent>,
    shared: Arc<ProbeShared>,
}

impl AttemptProbe {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<AttemptEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let probe = Self {
            sender,
            shared: Arc::new(ProbeShared::default()),
        };
        (probe, receiver)
    }

    /// A probe nobody listens to.
    pub fn detached() -> Self {
        Self::channel().0
    }

    fn send(&self, event: AttemptEvent) {
        let _ = self.sender.send(event);
    }

    pub fn socket(&self, reused: bool, needs_lookup: bool) {
        self.send(AttemptEvent::Socket {
            reused,
            needs_lookup,
        });
    }

    pub fn lookup(&self) {
        self.send(AttemptEvent::Lookup);
    }

    pub fn connect(&self, remote: Option<SocketAddr>) {
        self.send(AttemptEvent::Connect { remote });
    }

    pub fn secure_connect(&self) {
        self.send(AttemptEvent::SecureConnect);
    }

    /// Bytes moved on the socket. Bursts coalesce into one event.
    pub fn activity(&self) {
        if !self.shared.activity_pending.swap(true, Ordering::AcqRel) {
            self.send(AttemptEvent::Activity);
        }
    }

    pub(crate) fn activity_observed(&self) {
        self.shared.activity_pending.store(false, Ordering::Release);
    }

    fn upload_progress(&self, transferred: u64, total: Option<u64>) {
        self.send(AttemptEvent::UploadProgress { transferred, total });
    }

    fn upload_complete(&self) {
        self.send(AttemptEvent::UploadComplete);
    }

    fn mark_upload_failed(&self) {
        self.shared.upload_failed.store(true, Ordering::Release);
    }

    pub(crate) fn upload_failed(&self) -> bool {
        self.shared.upload_failed.load(Ordering::Acquire)
    }
}

enum BodyKind {
    Empty,
    Full(Option<Bytes>),
    Stream(BoxBodyStream),
    Channel(mpsc::UnboundedReceiver<Bytes>),
}

/// Request body handed to a transport. Reports upload progress and
/// completion through the attempt probe as it is polled.
pub struct RequestBody {
    kind: BodyKind,
    probe: AttemptProbe,
    transferred: u64,
    total: Option<u64>,
    finished: bool,
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            BodyKind::Empty => "empty",
            BodyKind::Full(_) => "full",
            BodyKind::Stream(_) => "stream",
            BodyKind::Channel(_) => "channel",
        };
        formatter
            .debug_struct("RequestBody")
            .field("kind", &kind)
            .field("transferred", &self.transferred)
            .field("total", &self.total)
            .finish()
    }
}

impl RequestBody {
    fn with_kind(kind: BodyKind, total: Option<u64>, probe: AttemptProbe) -> Self {
        Self {
            kind,
            probe,
            transferred: 0,
            total,
            finished: false,
        }
    }

    pub(crate) fn empty(probe: AttemptProbe) -> Self {
        Self::with_kind(BodyKind::Empty, Some(0), probe)
    }

    pub(crate) fn full(bytes: Bytes, probe: AttemptProbe) -> Self {
        let total = Some(bytes.len() as u64);
        Self::with_kind(BodyKind::Full(Some(bytes)), total, probe)
    }

    pub(crate) fn stream(stream: BoxBodyStream, total: Option<u64>, probe: AttemptProbe) -> Self {
        Self::with_kind(BodyKind::Stream(stream), total, probe)
    }

    pub(crate) fn channel(
        receiver: mpsc::UnboundedReceiver<Bytes>,
        total: Option<u64>,
        probe: AttemptProbe,
    ) -> Self {
        Self::with_kind(BodyKind::Channel(receiver), total, probe)
    }

    /// Reads the whole body, reporting progress as a real upload would.
    pub async fn collect_bytes(self) -> Result<Bytes, BoxError> {
        Ok(BodyExt::collect(self).await?.to_bytes())
    }

    fn complete(&mut self) {
        if !self.finished {
            self.finished = true;
            self.probe.upload_complete();
        }
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let next = match &mut this.kind {
            BodyKind::Empty => None,
            BodyKind::Full(bytes) => bytes.take(),
            BodyKind::Stream(stream) => match stream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => Some(chunk),
                Poll::Ready(Some(Err(error))) => {
                    this.probe.mark_upload_failed();
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => None,
            },
            BodyKind::Channel(receiver) => match receiver.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(chunk) => chunk,
            },
        };

        match next {
            Some(chunk) => {
                this.transferred += chunk.len() as u64;
                this.probe.upload_progress(this.transferred, this.total);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            None => {
                this.complete();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            BodyKind::Empty => SizeHint::with_exact(0),
            BodyKind::Full(bytes) => {
                SizeHint::with_exact(bytes.as_ref().map_or(0, |bytes| bytes.len() as u64))
            }
            BodyKind::Stream(_) | BodyKind::Channel(_) => match self.total {
                Some(total) => SizeHint::with_exact(total.saturating_sub(self.transferred)),
                None => SizeHint::default(),
            },
        }
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        if matches!(self.kind, BodyKind::Empty | BodyKind::Full(None)) {
            self.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::stream;

    use super::{AttemptProbe, RequestBody};
    use crate::timings::AttemptEvent;

    #[tokio::test]
    async fn full_body_reports_progress_then_completion() {
        let (probe, mut events) = AttemptProbe::channel();
        let body = RequestBody::full(Bytes::from_static(b"abcd"), probe);
        assert_eq!(body.collect_bytes().await.unwrap(), Bytes::from_static(b"abcd"));

        assert_eq!(
            events.recv().await,
            Some(AttemptEvent::UploadProgress {
                transferred: 4,
                total: Some(4)
            })
        );
        assert_eq!(events.recv().await, Some(AttemptEvent::UploadComplete));
    }

    #[tokio::test]
    async fn dropped_empty_body_still_completes_upload() {
        let (probe, mut events) = AttemptProbe::channel();
        drop(RequestBody::empty(probe));
        assert_eq!(events.recv().await, Some(AttemptEvent::UploadComplete));
    }

    #[tokio::test]
    async fn failing_stream_marks_upload_failed() {
        let (probe, _events) = AttemptProbe::channel();
        let chunks: Vec<Result<Bytes, crate::BoxError>> =
            vec![Ok(Bytes::from_static(b"a")), Err("disk gone".into())];
        let body = RequestBody::stream(Box::pin(stream::iter(chunks)), None, probe.clone());
        assert!(body.collect_bytes().await.is_err());
        assert!(probe.upload_failed());
    }

    #[test]
    fn activity_bursts_coalesce() {
        let (probe, mut events) = AttemptProbe::channel();
        probe.activity();
        probe.activity();
        assert_eq!(events.try_recv().ok(), Some(AttemptEvent::Activity));
        assert!(events.try_recv().is_err());
        probe.activity_observed();
        probe.activity();
        assert_eq!(events.try_recv().ok(), Some(AttemptEvent::Activity));
    }
}
