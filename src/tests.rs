use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_ENCODING, LOCATION};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::engine::{EVENT_BUFFER, EngineMode, LifecycleEvent, RequestEngine, Settlement};
use crate::error::BoxError;
use crate::hooks::Hooks;
use crate::options::NormalizedOptions;
use crate::retry::{RetryOptions, SystemClock};
use crate::timeout::TimeoutBudgets;
use crate::transport::{AttemptProbe, ResponseLike, Transport, TransportRequest};
use crate::util::lock_unpoisoned;

pub(crate) enum Scripted {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Fail(std::io::ErrorKind),
    Hang,
}

impl Scripted {
    pub(crate) fn ok(status: u16, body: &'static str) -> Self {
        Self::Respond {
            status: StatusCode::from_u16(status).expect("test status"),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    pub(crate) fn redirect(status: u16, location: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static(location));
        Self::Respond {
            status: StatusCode::from_u16(status).expect("test status"),
            headers,
            body: Bytes::new(),
        }
    }

    pub(crate) fn with_headers(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self::Respond {
            status: StatusCode::from_u16(status).expect("test status"),
            headers,
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SeenRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

/// Plays back canned outcomes, one per attempt.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            seen: Arc::default(),
        })
    }

    pub(crate) fn request_count(&self) -> usize {
        lock_unpoisoned(&self.seen).len()
    }

    pub(crate) fn requests(&self) -> Vec<SeenRequest> {
        lock_unpoisoned(&self.seen).clone()
    }
}

impl Transport for ScriptedTransport {
    fn perform(
        &self,
        request: TransportRequest,
        probe: AttemptProbe,
    ) -> BoxFuture<'static, Result<ResponseLike, BoxError>> {
        let next = lock_unpoisoned(&self.script).pop_front();
        let seen = Arc::clone(&self.seen);
        Box::pin(async move {
            probe.socket(false, true);
            probe.lookup();
            probe.connect(None);
            let (method, url, headers, body) = request.into_parts();
            let body = body.collect_bytes().await?;
            lock_unpoisoned(&seen).push(SeenRequest {
                method,
                url,
                headers,
                body,
            });
            match next {
                Some(Scripted::Respond {
                    status,
                    headers,
                    body,
                }) => Ok(ResponseLike::new(status, headers, body)),
                Some(Scripted::Fail(kind)) => Err(std::io::Error::from(kind).into()),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err("script exhausted".into()),
            }
        })
    }
}

/// Defaults the client would produce, without a client.
pub(crate) fn options_for(method: Method, url: &str) -> NormalizedOptions {
    NormalizedOptions {
        url: Url::parse(url).expect("test url"),
        method,
        headers: HeaderMap::new(),
        body: None,
        json: None,
        form: None,
        allow_get_body: false,
        timeout: TimeoutBudgets::default(),
        retry: RetryOptions::standard(),
        hooks: Hooks::default(),
        follow_redirect: true,
        max_redirects: 10,
        method_rewriting: false,
        decompress: true,
        throw_http_errors: true,
        ignore_invalid_cookies: false,
        cookie_jar: None,
        cache: None,
        transport: ScriptedTransport::new([]),
        clock: Arc::new(SystemClock),
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("write gzip");
    encoder.finish().expect("finish gzip")
}

async fn stream_body(options: NormalizedOptions) -> (Settlement, Vec<u8>, Option<HeaderMap>) {
    let (sender, mut receiver) = mpsc::channel(EVENT_BUFFER);
    let engine = RequestEngine::new(options, EngineMode::Stream, sender, CancellationToken::new());
    let collector = async move {
        let mut body = Vec::new();
        let mut headers = None;
        while let Some(event) = receiver.recv().await {
            match event {
                LifecycleEvent::Response(head) => headers = Some(head.headers().clone()),
                LifecycleEvent::Data(chunk) => body.extend_from_slice(&chunk),
                _ => {}
            }
        }
        (body, headers)
    };
    let (outcome, (body, headers)) = tokio::join!(engine.run(), collector);
    (outcome.settlement, body, headers)
}

#[tokio::test]
async fn gzip_body_is_decoded_and_encoding_header_dropped() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let transport = ScriptedTransport::new([Scripted::with_headers(200, headers, gzip(b"hello gzip"))]);
    let mut options = options_for(Method::GET, "http://a.test/");
    options.transport = transport.clone();

    let (settlement, body, headers) = stream_body(options).await;
    assert_eq!(settlement, Settlement::Completed);
    assert_eq!(body, b"hello gzip");
    assert!(headers.expect("response head").get(CONTENT_ENCODING).is_none());
    let sent = &transport.requests()[0];
    assert_eq!(sent.headers["accept-encoding"], "gzip, deflate, br, zstd");
}

#[tokio::test]
async fn decompress_off_passes_raw_bytes_through() {
    let compressed = gzip(b"raw");
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let transport = ScriptedTransport::new([Scripted::with_headers(200, headers, compressed.clone())]);
    let mut options = options_for(Method::GET, "http://a.test/");
    options.transport = transport.clone();
    options.decompress = false;

    let (_, body, headers) = stream_body(options).await;
    assert_eq!(body, compressed);
    assert_eq!(headers.expect("response head")[CONTENT_ENCODING], "gzip");
    assert!(transport.requests()[0].headers.get("accept-encoding").is_none());
}

#[tokio::test]
async fn unknown_encoding_is_passed_through() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("x-custom"));
    let transport = ScriptedTransport::new([Scripted::with_headers(200, headers, "opaque")]);
    let mut options = options_for(Method::GET, "http://a.test/");
    options.transport = transport;

    let (settlement, body, _) = stream_body(options).await;
    assert_eq!(settlement, Settlement::Completed);
    assert_eq!(body, b"opaque");
}

#[tokio::test(start_paused = true)]
async fn stream_mode_does_not_retry_after_response_started() {
    let transport = ScriptedTransport::new([Scripted::ok(200, "fine")]);
    let mut options = options_for(Method::GET, "http://a.test/");
    options.transport = transport.clone();

    let (settlement, body, _) = stream_body(options).await;
    assert_eq!(settlement, Settlement::Completed);
    assert_eq!(body, b"fine");
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn connection_reset_is_retried() {
    let transport = ScriptedTransport::new([
        Scripted::Fail(std::io::ErrorKind::ConnectionReset),
        Scripted::ok(200, "second"),
    ]);
    let mut options = options_for(Method::GET, "http://a.test/");
    options.transport = transport.clone();

    let (settlement, body, _) = stream_body(options).await;
    assert_eq!(settlement, Settlement::Completed);
    assert_eq!(body, b"second");
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn post_is_not_retried_by_default() {
    let transport = ScriptedTransport::new([
        Scripted::Fail(std::io::ErrorKind::ConnectionReset),
        Scripted::ok(200, "unused"),
    ]);
    let mut options = options_for(Method::POST, "http://a.test/");
    options.transport = transport.clone();
    options.retry = RetryOptions::standard();

    let (settlement, _, _) = stream_body(options).await;
    assert_eq!(settlement, Settlement::Failed);
    assert_eq!(transport.request_count(), 1);
}
