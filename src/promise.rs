//! Promise-style surface over the engine.
//!
//! A [`ResponsePromise`] buffers the whole response, runs the
//! `afterResponse` hooks and turns a non-ok status into an HTTP error that
//! goes through the same retry path as transport failures. It can be
//! canceled from anywhere through a [`CancelHandle`]; whichever of
//! "settled" and "canceled" happens first wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http::HeaderValue;
use http::header::ACCEPT;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{
    EVENT_BUFFER, EngineMode, Failure, LifecycleEvent, RequestEngine, Settlement, Verdict,
    settle_error,
};
use crate::error::{Error, ErrorCode};
use crate::hooks::{self, AfterResponseAction};
use crate::options::NormalizedOptions;
use crate::response::{Response, ResponseHead};
use crate::retry::RetryScheduler;
use crate::timings::Timings;
use crate::util::is_ok_status;

const PENDING: u8 = 0;
const SETTLED: u8 = 1;
const CANCELED: u8 = 2;

#[derive(Debug)]
struct PromiseControl {
    status: AtomicU8,
    token: CancellationToken,
}

impl PromiseControl {
    fn cancel(&self) -> bool {
        let won = self
            .status
            .compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    fn settle(&self) -> bool {
        self.status
            .compare_exchange(PENDING, SETTLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_canceled(&self) -> bool {
        self.status.load(Ordering::Acquire) == CANCELED
    }
}

/// Cancels a [`ResponsePromise`] without owning it.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    control: Arc<PromiseControl>,
}

impl CancelHandle {
    /// Returns false when the promise had already settled.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn is_canceled(&self) -> bool {
        self.control.is_canceled()
    }
}

enum PromiseState {
    Pending(Box<NormalizedOptions>),
    Failed(Error),
    Running(BoxFuture<'static, crate::Result<Response>>),
    Done,
}

/// Lazily started request that resolves to a fully buffered [`Response`].
#[must_use = "a ResponsePromise does nothing until awaited"]
pub struct ResponsePromise {
    control: Arc<PromiseControl>,
    state: PromiseState,
}

impl std::fmt::Debug for ResponsePromise {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            PromiseState::Pending(_) => "pending",
            PromiseState::Failed(_) => "failed",
            PromiseState::Running(_) => "running",
            PromiseState::Done => "done",
        };
        formatter
            .debug_struct("ResponsePromise")
            .field("state", &state)
            .field("canceled", &self.control.is_canceled())
            .finish()
    }
}

impl ResponsePromise {
    fn with_state(state: PromiseState) -> Self {
        Self {
            control: Arc::new(PromiseControl {
                status: AtomicU8::new(PENDING),
                token: CancellationToken::new(),
            }),
            state,
        }
    }

    pub(crate) fn new(options: NormalizedOptions) -> Self {
        Self::with_state(PromiseState::Pending(Box::new(options)))
    }

    /// A promise that rejects with `error` when awaited.
    pub(crate) fn failed(error: Error) -> Self {
        Self::with_state(PromiseState::Failed(error))
    }

    /// Aborts the request. Returns false when it had already settled.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.control.is_canceled()
    }

    /// Awaits the response and parses the body as JSON. Sends
    /// `accept: application/json` unless an accept header was set.
    pub async fn json<T>(mut self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        if let PromiseState::Pending(options) = &mut self.state
            && !options.headers.contains_key(ACCEPT)
        {
            options
                .headers
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        let response = self.await?;
        response
            .json()
            .map_err(|error| error.with_response(response.clone()))
    }

    pub async fn text(self) -> crate::Result<String> {
        let response = self.await?;
        response
            .text()
            .map_err(|error| error.with_response(response.clone()))
    }

    pub async fn buffer(self) -> crate::Result<Bytes> {
        Ok(self.await?.into_body())
    }
}

impl Future for ResponsePromise {
    type Output = crate::Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, PromiseState::Done) {
                PromiseState::Pending(options) => {
                    let control = Arc::clone(&this.control);
                    this.state = PromiseState::Running(Box::pin(drive(*options, control)));
                }
                PromiseState::Failed(error) => {
                    let result = if this.control.settle() {
                        Err(error)
                    } else {
                        Err(Error::cancel())
                    };
                    return Poll::Ready(result);
                }
                PromiseState::Running(mut future) => {
                    return match future.as_mut().poll(cx) {
                        Poll::Ready(result) => Poll::Ready(result),
                        Poll::Pending => {
                            this.state = PromiseState::Running(future);
                            Poll::Pending
                        }
                    };
                }
                PromiseState::Done => {
                    return Poll::Ready(Err(Error::request(
                        ErrorCode::Generic,
                        "response promise polled after completion",
                    )));
                }
            }
        }
    }
}

async fn drive(options: NormalizedOptions, control: Arc<PromiseControl>) -> crate::Result<Response> {
    let token = control.token.clone();
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::cancel()),
        result = run_to_response(options, token.clone()) => result,
    };
    if control.settle() {
        result
    } else {
        debug!("request canceled before it settled");
        Err(Error::cancel())
    }
}

enum Collected {
    Complete {
        head: ResponseHead,
        body: Bytes,
        timings: Timings,
    },
    Failed(Error),
    Nothing,
}

/// Buffers one engine run. Anything collected for an attempt that was
/// redirected or retried is thrown away.
async fn collect(mut events: mpsc::Receiver<LifecycleEvent>) -> Collected {
    let mut head = None;
    let mut body = BytesMut::new();
    while let Some(event) = events.recv().await {
        match event {
            LifecycleEvent::Request { .. }
            | LifecycleEvent::Redirect { .. }
            | LifecycleEvent::Retry { .. } => {
                head = None;
                body.clear();
            }
            LifecycleEvent::Response(next) => head = Some(next),
            LifecycleEvent::Data(chunk) => body.extend_from_slice(&chunk),
            LifecycleEvent::End(timings) => {
                if let Some(head) = head.take() {
                    return Collected::Complete {
                        head,
                        body: body.split().freeze(),
                        timings,
                    };
                }
            }
            LifecycleEvent::Error(error) => return Collected::Failed(error),
            LifecycleEvent::UploadProgress(_) | LifecycleEvent::DownloadProgress(_) => {}
        }
    }
    Collected::Nothing
}

enum Reviewed {
    Accept(Response),
    /// A hook asked for a retry; carries the response it saw.
    Retry(Response),
}

async fn run_after_response(options: &mut NormalizedOptions, response: Response) -> Result<Reviewed, Error> {
    let hooks = options.hooks.clone();
    let mut response = response;
    for index in 0..hooks.after_response_len() {
        let seen = response.clone();
        match hooks::run_after_response_hook(&hooks, index, response, options).await {
            None => return Ok(Reviewed::Accept(seen)),
            Some(Err(error)) => return Err(error.with_response(seen)),
            Some(Ok(AfterResponseAction::Continue(next))) => response = next,
            Some(Ok(AfterResponseAction::Retry(patch))) => {
                options.hooks.truncate_after_response(index);
                patch.apply(options)?;
                return Ok(Reviewed::Retry(seen));
            }
        }
    }
    Ok(Reviewed::Accept(response))
}

async fn run_to_response(mut options: NormalizedOptions, cancel: CancellationToken) -> crate::Result<Response> {
    let request_url = options.url.clone();
    let scheduler = RetryScheduler::new(options.clock.clone());
    let mut retry_count = 0;

    loop {
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let engine = RequestEngine::new(options, EngineMode::Promise, sender, cancel.clone())
            .resume(retry_count, request_url.clone());
        let (outcome, collected) = tokio::join!(engine.run(), collect(receiver));
        options = outcome.options;
        retry_count = outcome.retry_count;

        let response = match (outcome.settlement, collected) {
            (Settlement::Completed, Collected::Complete { head, body, timings }) => {
                Response::new(head, body, timings, options.follow_redirect)
            }
            (Settlement::Failed, Collected::Failed(error)) => {
                return resolve_terminal(error, &options);
            }
            _ => return Err(Error::cancel()),
        };

        let (error, forced) = match run_after_response(&mut options, response).await {
            Ok(Reviewed::Accept(response)) => {
                if is_ok_status(response.status(), options.follow_redirect) {
                    return Ok(response);
                }
                (Error::http(response), false)
            }
            Ok(Reviewed::Retry(response)) => {
                let error = Error::request(ErrorCode::Generic, "retry requested by an afterResponse hook")
                    .with_response(response);
                (error, true)
            }
            Err(error) => (error, false),
        };

        let failure = Failure {
            retry_count,
            forced,
            may_retry: true,
            writer: None,
            cancel: &cancel,
            scheduler: &scheduler,
        };
        match settle_error(&mut options, error, failure).await {
            Verdict::Retry(_) => retry_count += 1,
            Verdict::Fail(error) => return resolve_terminal(error, &options),
            Verdict::Canceled => return Err(Error::cancel()),
        }
    }
}

/// An HTTP error resolves with its response when the caller opted out of
/// throwing on status.
fn resolve_terminal(error: Error, options: &NormalizedOptions) -> crate::Result<Response> {
    if !options.throw_http_errors
        && let Error::Http { .. } = &error
        && let Some(response) = error.response()
    {
        return Ok(response.clone());
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::Method;

    use super::ResponsePromise;
    use crate::hooks::{AfterResponseAction, Hooks};
    use crate::options::OptionsPatch;
    use crate::tests::{Scripted, ScriptedTransport, options_for};

    #[tokio::test(start_paused = true)]
    async fn http_status_is_retried_then_rejected() {
        let transport = ScriptedTransport::new([
            Scripted::ok(500, "a"),
            Scripted::ok(500, "b"),
            Scripted::ok(500, "c"),
        ]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();

        let error = ResponsePromise::new(options).await.unwrap_err();
        assert_eq!(error.code().as_str(), "ERR_NON_2XX_3XX_RESPONSE");
        let response = error.response().unwrap();
        assert_eq!(response.retry_count(), 2);
        assert_eq!(response.body().as_ref(), b"c");
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_http_error_resolves_without_throw_http_errors() {
        let transport = ScriptedTransport::new([Scripted::ok(404, "gone")]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport;
        options.throw_http_errors = false;

        let response = ResponsePromise::new(options).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert!(!response.is_ok());
        assert_eq!(response.text().unwrap(), "gone");
    }

    #[tokio::test]
    async fn cancel_before_start_never_reaches_the_transport() {
        let transport = ScriptedTransport::new([Scripted::ok(200, "x")]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();

        let promise = ResponsePromise::new(options);
        assert!(promise.cancel());
        let error = promise.await.unwrap_err();
        assert!(error.is_canceled());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn cancel_after_settle_has_no_effect() {
        let transport = ScriptedTransport::new([Scripted::ok(200, "done")]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport;

        let promise = ResponsePromise::new(options);
        let handle = promise.cancel_handle();
        let response = promise.await.unwrap();
        assert!(!handle.cancel());
        assert!(!handle.is_canceled());
        assert_eq!(response.body().as_ref(), b"done");
    }

    #[tokio::test(start_paused = true)]
    async fn after_response_retry_merges_patch_and_truncates_hooks() {
        let transport = ScriptedTransport::new([Scripted::ok(401, "stale"), Scripted::ok(200, "fresh")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        let hooks = Hooks::new().after_response(move |response, _options| {
            let calls = Arc::clone(&hook_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if response.status().as_u16() == 401 {
                    let patch = OptionsPatch::new().header(
                        http::header::AUTHORIZATION,
                        http::HeaderValue::from_static("Bearer fresh"),
                    );
                    return Ok(AfterResponseAction::Retry(patch));
                }
                Ok(AfterResponseAction::Continue(response))
            }
        });
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();
        options.hooks = hooks;

        let response = ResponsePromise::new(options).await.unwrap();
        assert_eq!(response.body().as_ref(), b"fresh");
        assert_eq!(response.retry_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let requests = transport.requests();
        assert_eq!(requests[1].headers[http::header::AUTHORIZATION], "Bearer fresh");
    }

    #[tokio::test]
    async fn json_sets_accept_and_parses() {
        let transport = ScriptedTransport::new([Scripted::ok(200, r#"{"id":7}"#)]);
        let mut options = options_for(Method::GET, "http://a.test/");
        options.transport = transport.clone();

        let value: serde_json::Value = ResponsePromise::new(options).json().await.unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(transport.requests()[0].headers[http::header::ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn eager_failure_rejects_when_awaited() {
        let error = crate::error::Error::invalid_options("bad");
        let error = ResponsePromise::failed(error).await.unwrap_err();
        assert_eq!(error.code().as_str(), "ERR_INVALID_OPTIONS");
    }
}
