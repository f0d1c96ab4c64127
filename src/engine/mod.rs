//! Per-request state machine.
//!
//! A [`RequestEngine`] drives one logical request through as many attempts
//! as redirects and retries need. Every attempt races the transport against
//! the cancellation token and the earliest armed timeout, and each
//! observable step is published as a [`LifecycleEvent`] on a bounded
//! channel, so a slow stream consumer backpressures the download.

pub(crate) mod body;
pub(crate) mod redirect;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::cache::{CachedResponse, cache_key, is_cacheable_method, storable_ttl};
use crate::decode::ContentDecoder;
use crate::error::{BoxError, Error, ErrorCode, classify_transport_error};
use crate::hooks;
use crate::options::{NormalizedOptions, ensure_supported_protocol};
use crate::response::{Progress, Response, ResponseHead};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::timeout::{TimeoutBudgets, TimeoutController};
use crate::timings::{AttemptEvent, TimingTracker, Timings};
use crate::transport::{AttemptProbe, ResponseBody, ResponseLike, TransportRequest};
use crate::util::{ensure_accept_encoding, is_ok_status, redact_uri_for_logs};

use self::body::{PreparedBody, WriterSlot};
use self::redirect::RedirectPlan;

pub(crate) const EVENT_BUFFER: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EngineMode {
    /// Events are the product; a started download is never replayed.
    Stream,
    /// The promise adapter buffers the body and may restart the engine.
    Promise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EngineState {
    Idle,
    BodyPreparing,
    AwaitingTransport,
    ReceivingResponse,
    Redirecting,
    Retrying,
    Erroring,
    Settled,
}

/// Observable step of a request, in the order it happened.
#[derive(Debug)]
#[non_exhaustive]
pub enum LifecycleEvent {
    /// An attempt is about to reach the transport.
    Request {
        method: Method,
        url: Url,
        retry_count: usize,
    },
    UploadProgress(Progress),
    Redirect {
        head: ResponseHead,
        url: Url,
    },
    /// The last attempt failed and a new one is starting.
    Retry {
        retry_count: usize,
        code: ErrorCode,
        message: String,
    },
    Response(ResponseHead),
    Data(Bytes),
    DownloadProgress(Progress),
    End(Timings),
    Error(Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Settlement {
    Completed,
    Failed,
    Canceled,
}

pub(crate) struct EngineOutcome {
    pub(crate) options: NormalizedOptions,
    pub(crate) retry_count: usize,
    pub(crate) settlement: Settlement,
}

enum AttemptOutcome {
    Completed,
    Redirected,
    Canceled,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Emit,
    Collect,
}

struct BodyRead {
    collected: Bytes,
    raw: Option<Bytes>,
    transferred: u64,
}

/// Clocks and timers of the attempt in flight.
struct Attempt {
    tracker: TimingTracker,
    timeouts: TimeoutController,
    probe: AttemptProbe,
    probe_events: mpsc::UnboundedReceiver<AttemptEvent>,
    remote: Option<SocketAddr>,
    uploaded: u64,
}

impl Attempt {
    fn start(secure: bool, budgets: TimeoutBudgets) -> Self {
        let now = Instant::now();
        let (probe, probe_events) = AttemptProbe::channel();
        let mut timeouts = TimeoutController::new(budgets, secure);
        timeouts.start(now);
        Self {
            tracker: TimingTracker::start(now, secure),
            timeouts,
            probe,
            probe_events,
            remote: None,
            uploaded: 0,
        }
    }

    fn record(&mut self, event: &AttemptEvent) {
        let now = Instant::now();
        match event {
            AttemptEvent::Connect {
                remote: Some(remote),
            } => self.remote = Some(*remote),
            AttemptEvent::UploadProgress { transferred, .. } => self.uploaded = *transferred,
            _ => {}
        }
        self.tracker.observe(event, now);
        self.timeouts.observe(event, now);
    }

    fn expired(&mut self) -> Option<Error> {
        let now = Instant::now();
        let expired = self.timeouts.expired(now)?;
        debug!(phase = %expired.phase, budget_ms = expired.budget.as_millis() as u64, "attempt timed out");
        Some(Error::timeout(expired.phase, expired.budget))
    }

    fn fail(&mut self, error: Error) -> Error {
        self.timeouts.cancel_all();
        self.tracker.error(Instant::now());
        error.with_timings(self.tracker.timings().clone())
    }

    fn abort(&mut self) {
        self.timeouts.cancel_all();
        self.tracker.abort(Instant::now());
    }

    fn finish(&mut self) -> Timings {
        self.record(&AttemptEvent::End);
        self.timeouts.cancel_all();
        self.tracker.timings().clone()
    }
}

pub(crate) struct RequestEngine {
    options: NormalizedOptions,
    mode: EngineMode,
    state: EngineState,
    retry_count: usize,
    request_url: Url,
    redirect_urls: Vec<Url>,
    writer: Option<WriterSlot>,
    events: mpsc::Sender<LifecycleEvent>,
    cancel: CancellationToken,
    scheduler: RetryScheduler,
    response_emitted: bool,
}

impl RequestEngine {
    pub(crate) fn new(
        options: NormalizedOptions,
        mode: EngineMode,
        events: mpsc::Sender<LifecycleEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_url: options.url.clone(),
            scheduler: RetryScheduler::new(options.clock.clone()),
            options,
            mode,
            state: EngineState::Idle,
            retry_count: 0,
            redirect_urls: Vec::new(),
            writer: None,
            events,
            cancel,
            response_emitted: false,
        }
    }

    /// Continues a request that already went through `retry_count` retries.
    pub(crate) fn resume(mut self, retry_count: usize, request_url: Url) -> Self {
        self.retry_count = retry_count;
        self.request_url = request_url;
        self
    }

    pub(crate) fn with_writer(mut self, writer: WriterSlot) -> Self {
        self.writer = Some(writer);
        self
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "request state changed");
            self.state = next;
        }
    }

    /// False once the request is canceled or nobody listens anymore.
    async fn emit(&self, event: LifecycleEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    pub(crate) async fn run(mut self) -> EngineOutcome {
        let settlement = loop {
            if self.cancel.is_cancelled() {
                break Settlement::Canceled;
            }

            let span = info_span!(
                "volley.attempt",
                method = %self.options.method,
                uri = %redact_uri_for_logs(&self.options.url),
                retry_count = self.retry_count,
                redirects = self.redirect_urls.len(),
            );
            let error = match self.attempt().instrument(span).await {
                Ok(AttemptOutcome::Completed) => break Settlement::Completed,
                Ok(AttemptOutcome::Redirected) => continue,
                Ok(AttemptOutcome::Canceled) => break Settlement::Canceled,
                Err(error) => error,
            };
            if self.cancel.is_cancelled() {
                break Settlement::Canceled;
            }

            self.transition(EngineState::Erroring);
            let failure = Failure {
                retry_count: self.retry_count,
                forced: false,
                may_retry: self.mode == EngineMode::Promise || !self.response_emitted,
                writer: self.writer.as_ref(),
                cancel: &self.cancel,
                scheduler: &self.scheduler,
            };
            match settle_error(&mut self.options, error, failure).await {
                Verdict::Retry(error) => {
                    self.transition(EngineState::Retrying);
                    self.retry_count += 1;
                    self.response_emitted = false;
                    let event = LifecycleEvent::Retry {
                        retry_count: self.retry_count,
                        code: error.code(),
                        message: error.to_string(),
                    };
                    if !self.emit(event).await {
                        break Settlement::Canceled;
                    }
                }
                Verdict::Fail(error) => {
                    self.transition(EngineState::Settled);
                    let _ = self.emit(LifecycleEvent::Error(error)).await;
                    break Settlement::Failed;
                }
                Verdict::Canceled => break Settlement::Canceled,
            }
        };

        self.transition(EngineState::Settled);
        EngineOutcome {
            options: self.options,
            retry_count: self.retry_count,
            settlement,
        }
    }

    async fn attempt(&mut self) -> Result<AttemptOutcome, Error> {
        self.transition(EngineState::BodyPreparing);
        ensure_supported_protocol(&self.options.url)?;
        let mut prepared = body::prepare(&mut self.options, self.writer.as_mut())?;
        self.apply_session_headers().await?;

        let (short_circuit, payload_changed) = hooks::run_before_request(&mut self.options).await?;
        if payload_changed && short_circuit.is_none() {
            prepared = if self.options.has_payload() {
                self.options.headers.remove(CONTENT_LENGTH);
                body::prepare(&mut self.options, self.writer.as_mut())?
            } else {
                PreparedBody::Empty
            };
        }

        let method = self.options.method.clone();
        let url = self.options.url.clone();
        let upload_total = prepared.total();
        let mut attempt = Attempt::start(url.scheme() == "https", self.options.timeout);

        self.transition(EngineState::AwaitingTransport);
        debug!("sending request");
        let request_event = LifecycleEvent::Request {
            method: method.clone(),
            url: url.clone(),
            retry_count: self.retry_count,
        };
        if !self.emit(request_event).await
            || !self
                .emit(LifecycleEvent::UploadProgress(Progress::new(0, upload_total)))
                .await
        {
            attempt.abort();
            return Ok(AttemptOutcome::Canceled);
        }

        let response = match self
            .exchange(short_circuit, prepared, &method, &url, &mut attempt)
            .await
        {
            Ok(Some(response)) => response,
            Ok(None) => {
                attempt.abort();
                return Ok(AttemptOutcome::Canceled);
            }
            Err(error) => return Err(attempt.fail(error)),
        };

        match self.receive(response, &method, &url, &mut attempt).await {
            Ok(AttemptOutcome::Canceled) => {
                attempt.abort();
                Ok(AttemptOutcome::Canceled)
            }
            Ok(outcome) => Ok(outcome),
            Err(error) => Err(attempt.fail(error)),
        }
    }

    /// Headers derived from per-client state rather than the caller.
    async fn apply_session_headers(&mut self) -> Result<(), Error> {
        if self.options.decompress {
            ensure_accept_encoding(&mut self.options.headers);
        }
        let Some(jar) = self.options.cookie_jar.clone() else {
            return Ok(());
        };
        let cookies = jar
            .get_cookie_string(&self.options.url)
            .await
            .map_err(|source| Error::request(ErrorCode::Generic, source))?;
        if !cookies.is_empty() {
            let value = HeaderValue::from_str(&cookies)
                .map_err(|source| Error::request(ErrorCode::Generic, source))?;
            self.options.headers.insert(COOKIE, value);
        }
        Ok(())
    }

    async fn cache_lookup(&self, method: &Method, url: &Url) -> Result<Option<ResponseLike>, Error> {
        let Some(cache) = &self.options.cache else {
            return Ok(None);
        };
        if !is_cacheable_method(method) {
            return Ok(None);
        }
        let entry = cache
            .get(&cache_key(method, url))
            .await
            .map_err(cache_error)?;
        Ok(entry.map(|entry| {
            debug!("serving response from cache");
            ResponseLike::new(entry.status, entry.headers, entry.body).from_cache()
        }))
    }

    async fn store_in_cache(
        &self,
        method: &Method,
        url: &Url,
        entry: CachedResponse,
        ttl: Duration,
    ) -> Result<(), Error> {
        let Some(cache) = &self.options.cache else {
            return Ok(());
        };
        cache
            .put(&cache_key(method, url), entry, ttl)
            .await
            .map_err(cache_error)
    }

    /// Waits for the response head. `None` means the request was canceled.
    async fn exchange(
        &self,
        short_circuit: Option<ResponseLike>,
        prepared: PreparedBody,
        method: &Method,
        url: &Url,
        attempt: &mut Attempt,
    ) -> Result<Option<ResponseLike>, Error> {
        if let Some(response) = short_circuit {
            debug!("beforeRequest hook supplied the response");
            return Ok(Some(response));
        }
        if let Some(cached) = self.cache_lookup(method, url).await? {
            return Ok(Some(cached));
        }

        let request = TransportRequest::new(
            method.clone(),
            url.clone(),
            self.options.headers.clone(),
            prepared.into_request_body(attempt.probe.clone()),
        );
        let mut pending = self.options.transport.perform(request, attempt.probe.clone());

        loop {
            let deadline = attempt.timeouts.next_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                Some(event) = attempt.probe_events.recv() => {
                    if !self.observe(event, attempt).await {
                        return Ok(None);
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    if let Some(error) = attempt.expired() {
                        return Err(error);
                    }
                }
                result = &mut pending => {
                    let response = result.map_err(|source| transport_error(source, &attempt.probe))?;
                    while let Ok(event) = attempt.probe_events.try_recv() {
                        if !self.observe(event, attempt).await {
                            return Ok(None);
                        }
                    }
                    return Ok(Some(response));
                }
            }
        }
    }

    async fn observe(&self, event: AttemptEvent, attempt: &mut Attempt) -> bool {
        if event == AttemptEvent::Activity {
            attempt.probe.activity_observed();
        }
        attempt.record(&event);
        match event {
            AttemptEvent::UploadProgress { transferred, total } => {
                self.emit(LifecycleEvent::UploadProgress(Progress::new(transferred, total)))
                    .await
            }
            AttemptEvent::UploadComplete => {
                self.emit(LifecycleEvent::UploadProgress(Progress::finished(attempt.uploaded)))
                    .await
            }
            _ => true,
        }
    }

    async fn store_cookies(&self, head: &ResponseHead) -> Result<(), Error> {
        let Some(jar) = &self.options.cookie_jar else {
            return Ok(());
        };
        for value in head.headers.get_all(SET_COOKIE) {
            let raw = String::from_utf8_lossy(value.as_bytes());
            if let Err(source) = jar.set_cookie(&raw, &head.url).await {
                if self.options.ignore_invalid_cookies {
                    warn!(error = %source, "ignoring invalid set-cookie header");
                    continue;
                }
                return Err(Error::request(ErrorCode::Generic, source));
            }
        }
        Ok(())
    }

    async fn receive(
        &mut self,
        response: ResponseLike,
        method: &Method,
        url: &Url,
        attempt: &mut Attempt,
    ) -> Result<AttemptOutcome, Error> {
        let parts = response.into_parts();
        attempt.record(&AttemptEvent::Response);
        self.transition(EngineState::ReceivingResponse);
        debug!(status = %parts.status, from_cache = parts.from_cache, "response received");

        let mut head = ResponseHead {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            url: url.clone(),
            request_url: self.request_url.clone(),
            redirect_urls: self.redirect_urls.clone(),
            retry_count: self.retry_count,
            is_from_cache: parts.from_cache,
            ip: parts.remote_addr.or(attempt.remote),
        };
        self.store_cookies(&head).await?;

        if let Some(plan) = redirect::plan(&self.options, &head)? {
            drop(parts.body);
            let timings = attempt.finish();
            return self.follow_redirect(head, plan, timings).await;
        }

        let raw_headers = head.headers.clone();
        let download_total = content_length(&raw_headers);
        let decoder = if self.options.decompress {
            ContentDecoder::for_response(method, head.status, &head.headers)
        } else {
            None
        };
        if decoder.is_some() {
            head.headers.remove(CONTENT_ENCODING);
            head.headers.remove(CONTENT_LENGTH);
        }
        let cache_ttl = match &self.options.cache {
            Some(_) if !head.is_from_cache => storable_ttl(method, head.status, &raw_headers),
            _ => None,
        };
        let follow_redirect = self.options.follow_redirect;

        if self.mode == EngineMode::Stream
            && self.options.throw_http_errors
            && !is_ok_status(head.status, follow_redirect)
        {
            let Some(read) = self
                .read_body(parts.body, decoder, download_total, Delivery::Collect, false, attempt)
                .await?
            else {
                return Ok(AttemptOutcome::Canceled);
            };
            let timings = attempt.finish();
            let response = Response::new(head, read.collected, timings, follow_redirect);
            return Err(Error::http(response));
        }

        let status = head.status;
        if !self.emit(LifecycleEvent::Response(head)).await {
            return Ok(AttemptOutcome::Canceled);
        }
        self.response_emitted = true;
        if !self
            .emit(LifecycleEvent::DownloadProgress(Progress::new(0, download_total)))
            .await
        {
            return Ok(AttemptOutcome::Canceled);
        }

        let Some(read) = self
            .read_body(
                parts.body,
                decoder,
                download_total,
                Delivery::Emit,
                cache_ttl.is_some(),
                attempt,
            )
            .await?
        else {
            return Ok(AttemptOutcome::Canceled);
        };
        let timings = attempt.finish();

        if let (Some(ttl), Some(body)) = (cache_ttl, read.raw) {
            let entry = CachedResponse {
                status,
                headers: raw_headers,
                body,
            };
            self.store_in_cache(method, url, entry, ttl).await?;
        }

        if !self
            .emit(LifecycleEvent::DownloadProgress(Progress::finished(read.transferred)))
            .await
            || !self.emit(LifecycleEvent::End(timings)).await
        {
            return Ok(AttemptOutcome::Canceled);
        }
        Ok(AttemptOutcome::Completed)
    }

    async fn follow_redirect(
        &mut self,
        head: ResponseHead,
        plan: RedirectPlan,
        timings: Timings,
    ) -> Result<AttemptOutcome, Error> {
        self.transition(EngineState::Redirecting);
        if self.redirect_urls.len() >= self.options.max_redirects {
            let response = Response::new(head, Bytes::new(), timings, self.options.follow_redirect);
            return Err(Error::max_redirects(self.options.max_redirects, response));
        }
        if !plan.rewrite_to_get && !body::is_replayable(&self.options, self.writer.as_ref()) {
            return Err(body::consumed_body_error());
        }

        let next_url = plan.url.clone();
        debug!(
            status = %head.status,
            location = %redact_uri_for_logs(&next_url),
            "following redirect"
        );
        redirect::apply(&mut self.options, plan);
        self.redirect_urls.push(next_url.clone());
        hooks::run_before_redirect(&mut self.options, &head).await?;

        let event = LifecycleEvent::Redirect {
            head,
            url: next_url,
        };
        if !self.emit(event).await {
            return Ok(AttemptOutcome::Canceled);
        }
        Ok(AttemptOutcome::Redirected)
    }

    /// Pulls body frames through the decoder. `None` means canceled.
    async fn read_body(
        &self,
        mut body: ResponseBody,
        mut decoder: Option<ContentDecoder>,
        total: Option<u64>,
        delivery: Delivery,
        keep_raw: bool,
        attempt: &mut Attempt,
    ) -> Result<Option<BodyRead>, Error> {
        let mut collected = BytesMut::new();
        let mut raw = keep_raw.then(BytesMut::new);
        let mut transferred = 0_u64;

        loop {
            let deadline = attempt.timeouts.next_deadline();
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                Some(event) = attempt.probe_events.recv() => {
                    if !self.observe(event, attempt).await {
                        return Ok(None);
                    }
                    continue;
                }
                _ = sleep_until_deadline(deadline) => {
                    if let Some(error) = attempt.expired() {
                        return Err(error);
                    }
                    continue;
                }
                frame = body.frame() => frame,
            };

            let Some(frame) = frame else {
                break;
            };
            let frame = frame.map_err(read_error)?;
            let Ok(chunk) = frame.into_data() else {
                continue;
            };
            if chunk.is_empty() {
                continue;
            }
            transferred += chunk.len() as u64;
            if let Some(raw) = raw.as_mut() {
                raw.extend_from_slice(&chunk);
            }

            let chunk = match decoder.as_mut() {
                Some(decoder) => decoder.push(&chunk).map_err(decode_error)?,
                None => chunk,
            };
            if !self.deliver(chunk, delivery, &mut collected).await {
                return Ok(None);
            }
            if delivery == Delivery::Emit
                && !self
                    .emit(LifecycleEvent::DownloadProgress(Progress::new(transferred, total)))
                    .await
            {
                return Ok(None);
            }
        }

        if let Some(decoder) = decoder.as_mut() {
            let tail = decoder.finish().map_err(decode_error)?;
            if !self.deliver(tail, delivery, &mut collected).await {
                return Ok(None);
            }
        }

        Ok(Some(BodyRead {
            collected: collected.freeze(),
            raw: raw.map(BytesMut::freeze),
            transferred,
        }))
    }

    async fn deliver(&self, chunk: Bytes, delivery: Delivery, collected: &mut BytesMut) -> bool {
        if chunk.is_empty() {
            return true;
        }
        match delivery {
            Delivery::Collect => {
                collected.extend_from_slice(&chunk);
                true
            }
            Delivery::Emit => self.emit(LifecycleEvent::Data(chunk)).await,
        }
    }
}

/// Inputs of the shared failure path.
pub(crate) struct Failure<'a> {
    pub(crate) retry_count: usize,
    /// Retry requested by an `afterResponse` hook; skips the scheduler.
    pub(crate) forced: bool,
    pub(crate) may_retry: bool,
    pub(crate) writer: Option<&'a WriterSlot>,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) scheduler: &'a RetryScheduler,
}

pub(crate) enum Verdict {
    /// Replay the request; carries the error that caused it.
    Retry(Error),
    Fail(Error),
    Canceled,
}

/// Retry-or-fail decision shared by the engine and the promise adapter.
///
/// An approved retry sleeps for the computed delay and runs the
/// `beforeRetry` hooks. Everything else, including a failing
/// `beforeRetry` hook, goes through the `beforeError` hooks.
pub(crate) async fn settle_error(
    options: &mut NormalizedOptions,
    error: Error,
    failure: Failure<'_>,
) -> Verdict {
    let mut error = attach_options(error, options);

    if failure.may_retry && !matches!(error, Error::InvalidOptions { .. }) {
        let attempt_count = failure.retry_count + 1;
        let decision = if failure.forced {
            RetryDecision {
                should_retry: true,
                delay: Duration::from_millis(1),
            }
        } else {
            failure
                .scheduler
                .decide(&options.retry, &options.method, &error, attempt_count)
        };
        if decision.should_retry {
            if body::is_replayable(options, failure.writer) {
                warn!(
                    code = %error.code(),
                    attempt = attempt_count,
                    delay_ms = decision.delay.as_millis() as u64,
                    "request failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = failure.cancel.cancelled() => return Verdict::Canceled,
                    _ = sleep(decision.delay) => {}
                }
                match hooks::run_before_retry(options, &error, attempt_count).await {
                    Ok(()) => return Verdict::Retry(error),
                    Err(hook_error) => error = attach_options(hook_error, options),
                }
            } else {
                error = attach_options(body::consumed_body_error(), options);
            }
        }
    }

    let hooks = options.hooks.clone();
    let error = hooks::run_before_error(&hooks, error).await;
    if failure.cancel.is_cancelled() {
        Verdict::Canceled
    } else {
        Verdict::Fail(error)
    }
}

fn attach_options(error: Error, options: &NormalizedOptions) -> Error {
    if error.has_options() {
        error
    } else {
        error.with_options(Arc::new(options.clone()))
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn transport_error(source: BoxError, probe: &AttemptProbe) -> Error {
    let code = classify_transport_error(&*source);
    if probe.upload_failed() {
        let code = if code == ErrorCode::Generic {
            ErrorCode::Upload
        } else {
            code
        };
        return Error::Upload {
            code,
            source,
            context: Box::default(),
        };
    }
    Error::Request {
        code,
        source,
        context: Box::default(),
    }
}

fn read_error(source: BoxError) -> Error {
    let code = match classify_transport_error(&*source) {
        ErrorCode::Generic => ErrorCode::ReadingResponseStream,
        code => code,
    };
    Error::Read {
        code,
        source,
        context: Box::default(),
    }
}

fn decode_error(source: crate::decode::DecodeError) -> Error {
    Error::Read {
        code: ErrorCode::ReadingResponseStream,
        source: Box::new(source),
        context: Box::default(),
    }
}

fn cache_error(source: BoxError) -> Error {
    warn!(error = %source, "response cache failed");
    Error::Cache {
        source,
        context: Box::default(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{Method, StatusCode};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{EVENT_BUFFER, EngineMode, LifecycleEvent, RequestEngine, Settlement};
    use crate::error::TimeoutPhase;
    use crate::retry::RetryOptions;
    use crate::tests::{Scripted, ScriptedTransport, options_for};

    async fn run(
        options: crate::options::NormalizedOptions,
        mode: EngineMode,
    ) -> (Settlement, usize, Vec<LifecycleEvent>) {
        let (sender, mut receiver) = mpsc::channel(EVENT_BUFFER);
        let engine = RequestEngine::new(options, mode, sender, CancellationToken::new());
        let collector = async move {
            let mut events = Vec::new();
            while let Some(event) = receiver.recv().await {
                events.push(event);
            }
            events
        };
        let (outcome, events) = tokio::join!(engine.run(), collector);
        (outcome.settlement, outcome.retry_count, events)
    }

    fn names(events: &[LifecycleEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|event| match event {
                LifecycleEvent::Request { .. } => "request",
                LifecycleEvent::UploadProgress(_) => "upload",
                LifecycleEvent::Redirect { .. } => "redirect",
                LifecycleEvent::Retry { .. } => "retry",
                LifecycleEvent::Response(_) => "response",
                LifecycleEvent::Data(_) => "data",
                LifecycleEvent::DownloadProgress(_) => "download",
                LifecycleEvent::End(_) => "end",
                LifecycleEvent::Error(_) => "error",
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn successful_attempt_emits_events_in_order() {
        let transport = ScriptedTransport::new([Scripted::ok(200, "hello")]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();

        let (settlement, retries, events) = run(options, EngineMode::Stream).await;
        assert_eq!(settlement, Settlement::Completed);
        assert_eq!(retries, 0);
        let names = names(&events);
        assert_eq!(names.first(), Some(&"request"));
        let downloaded: Vec<_> = names.into_iter().filter(|name| *name != "upload").collect();
        assert_eq!(
            downloaded,
            ["request", "response", "download", "data", "download", "download", "end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_status_is_retried_up_to_the_limit() {
        let transport = ScriptedTransport::new([
            Scripted::ok(503, ""),
            Scripted::ok(503, ""),
            Scripted::ok(503, ""),
        ]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();

        let (settlement, retries, events) = run(options, EngineMode::Stream).await;
        assert_eq!(settlement, Settlement::Failed);
        assert_eq!(retries, 2);
        assert_eq!(transport.request_count(), 3);
        let Some(LifecycleEvent::Error(error)) = events.last() else {
            panic!("expected a terminal error event");
        };
        assert_eq!(error.response().map(|response| response.status()), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(error.options().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_transport_hits_the_request_timeout() {
        let transport = ScriptedTransport::new([Scripted::Hang]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();
        options.retry = RetryOptions::disabled();
        options.timeout.request = Some(Duration::from_millis(50));

        let (settlement, _, events) = run(options, EngineMode::Promise).await;
        assert_eq!(settlement, Settlement::Failed);
        let Some(LifecycleEvent::Error(error)) = events.last() else {
            panic!("expected a terminal error event");
        };
        assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Request));
        let timings = error.timings().expect("timings");
        assert!(timings.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_settles_silently() {
        let transport = ScriptedTransport::new([Scripted::ok(200, "x")]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();
        let (sender, _receiver) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = RequestEngine::new(options, EngineMode::Promise, sender, cancel)
            .run()
            .await;
        assert_eq!(outcome.settlement, Settlement::Canceled);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_redirects_is_enforced() {
        let transport = ScriptedTransport::new([
            Scripted::redirect(302, "/1"),
            Scripted::redirect(302, "/2"),
            Scripted::redirect(302, "/3"),
        ]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();
        options.max_redirects = 2;

        let (settlement, _, events) = run(options, EngineMode::Promise).await;
        assert_eq!(settlement, Settlement::Failed);
        let Some(LifecycleEvent::Error(error)) = events.last() else {
            panic!("expected a terminal error event");
        };
        assert_eq!(error.code().as_str(), "ERR_TOO_MANY_REDIRECTS");
        let response = error.response().expect("redirect response");
        assert_eq!(response.redirect_urls().len(), 2);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_options_are_never_retried() {
        let transport = ScriptedTransport::new([]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();
        options.body = Some(crate::options::BodySource::Bytes("x".into()));

        let (settlement, retries, _) = run(options, EngineMode::Promise).await;
        assert_eq!(settlement, Settlement::Failed);
        assert_eq!(retries, 0);
        assert_eq!(transport.request_count(), 0);
    }
}
