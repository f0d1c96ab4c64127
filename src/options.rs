use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use url::Url;

use crate::cache::ResponseCache;
use crate::cookies::CookieJar;
use crate::error::{BoxError, Error};
use crate::hooks::Hooks;
use crate::retry::{Clock, RetryOptions};
use crate::timeout::TimeoutBudgets;
use crate::transport::{BoxBodyStream, Transport};
use crate::util::lock_unpoisoned;

/// A header value as supplied by the caller.
///
/// `Undefined` drops the header from the merged set. `Null` is rejected
/// when the options are normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderInput {
    Value(HeaderValue),
    Undefined,
    Null,
}

impl From<HeaderValue> for HeaderInput {
    fn from(value: HeaderValue) -> Self {
        Self::Value(value)
    }
}

pub(crate) fn apply_header_inputs(
    headers: &mut HeaderMap,
    inputs: impl IntoIterator<Item = (HeaderName, HeaderInput)>,
) -> Result<(), Error> {
    for (name, input) in inputs {
        match input {
            HeaderInput::Value(value) => {
                headers.insert(name, value);
            }
            HeaderInput::Undefined => {
                headers.remove(&name);
            }
            HeaderInput::Null => {
                return Err(Error::invalid_options(format!(
                    "header `{name}` must not be null"
                )));
            }
        }
    }
    Ok(())
}

/// Single-use body stream shared between clones of the options.
#[derive(Clone)]
pub struct SharedBodyStream {
    inner: Arc<Mutex<Option<BoxBodyStream>>>,
    length: Option<u64>,
}

impl SharedBodyStream {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(stream.map_err(Into::into))))),
            length: None,
        }
    }

    /// Declares the total length, sent as `content-length`.
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn is_consumed(&self) -> bool {
        lock_unpoisoned(&self.inner).is_none()
    }

    pub(crate) fn take(&self) -> Option<BoxBodyStream> {
        lock_unpoisoned(&self.inner).take()
    }
}

#[derive(Clone)]
pub enum BodySource {
    Bytes(Bytes),
    Stream(SharedBodyStream),
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => formatter.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(stream) => formatter
                .debug_struct("Stream")
                .field("length", &stream.length)
                .field("consumed", &stream.is_consumed())
                .finish(),
        }
    }
}

impl From<Bytes> for BodySource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// Replacement request payload carried by an [`OptionsPatch`].
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    Body(BodySource),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Empty,
}

/// Fully merged options for one logical request.
#[derive(Clone)]
pub struct NormalizedOptions {
    pub(crate) url: Url,
    pub(crate) method: Method,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<BodySource>,
    pub(crate) json: Option<serde_json::Value>,
    pub(crate) form: Option<Vec<(String, String)>>,
    pub(crate) allow_get_body: bool,
    pub(crate) timeout: TimeoutBudgets,
    pub(crate) retry: RetryOptions,
    pub(crate) hooks: Hooks,
    pub(crate) follow_redirect: bool,
    pub(crate) max_redirects: usize,
    pub(crate) method_rewriting: bool,
    pub(crate) decompress: bool,
    pub(crate) throw_http_errors: bool,
    pub(crate) ignore_invalid_cookies: bool,
    pub(crate) cookie_jar: Option<Arc<dyn CookieJar>>,
    pub(crate) cache: Option<Arc<dyn ResponseCache>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for NormalizedOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NormalizedOptions")
            .field("url", &crate::util::redact_uri_for_logs(&self.url))
            .field("method", &self.method)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("body", &self.body)
            .field("json", &self.json.is_some())
            .field("form", &self.form.is_some())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("follow_redirect", &self.follow_redirect)
            .field("max_redirects", &self.max_redirects)
            .field("method_rewriting", &self.method_rewriting)
            .field("decompress", &self.decompress)
            .field("throw_http_errors", &self.throw_http_errors)
            .finish_non_exhaustive()
    }
}

impl NormalizedOptions {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&BodySource> {
        self.body.as_ref()
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json.as_ref()
    }

    pub fn form(&self) -> Option<&[(String, String)]> {
        self.form.as_deref()
    }

    pub fn timeout(&self) -> &TimeoutBudgets {
        &self.timeout
    }

    pub fn retry(&self) -> &RetryOptions {
        &self.retry
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn follow_redirect(&self) -> bool {
        self.follow_redirect
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn method_rewriting(&self) -> bool {
        self.method_rewriting
    }

    pub fn decompress(&self) -> bool {
        self.decompress
    }

    pub fn throw_http_errors(&self) -> bool {
        self.throw_http_errors
    }

    pub(crate) fn has_payload(&self) -> bool {
        self.body.is_some() || self.json.is_some() || self.form.is_some()
    }

    pub(crate) fn set_payload(&mut self, payload: Payload) {
        self.body = None;
        self.json = None;
        self.form = None;
        match payload {
            Payload::Body(body) => self.body = Some(body),
            Payload::Json(json) => self.json = Some(json),
            Payload::Form(form) => self.form = Some(form),
            Payload::Empty => {}
        }
    }
}

pub(crate) fn ensure_supported_protocol(url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::UnsupportedProtocol {
            protocol: format!("{other}:"),
            context: Box::default(),
        }),
    }
}

/// Partial options returned by hooks and merged into the live options.
#[derive(Clone, Debug, Default)]
pub struct OptionsPatch {
    url: Option<Url>,
    method: Option<Method>,
    headers: Vec<(HeaderName, HeaderInput)>,
    payload: Option<Payload>,
    timeout: Option<TimeoutBudgets>,
    retry_limit: Option<usize>,
    follow_redirect: Option<bool>,
    max_redirects: Option<usize>,
    decompress: Option<bool>,
    throw_http_errors: Option<bool>,
}

impl OptionsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn header(self, name: HeaderName, value: HeaderValue) -> Self {
        self.header_input(name, HeaderInput::Value(value))
    }

    pub fn remove_header(self, name: HeaderName) -> Self {
        self.header_input(name, HeaderInput::Undefined)
    }

    pub fn header_input(mut self, name: HeaderName, input: HeaderInput) -> Self {
        self.headers.push((name, input));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Some(Payload::Body(BodySource::Bytes(body.into())));
        self
    }

    pub fn json(mut self, json: serde_json::Value) -> Self {
        self.payload = Some(Payload::Json(json));
        self
    }

    pub fn form(mut self, form: Vec<(String, String)>) -> Self {
        self.payload = Some(Payload::Form(form));
        self
    }

    pub fn clear_body(mut self) -> Self {
        self.payload = Some(Payload::Empty);
        self
    }

    pub fn timeout(mut self, timeout: TimeoutBudgets) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_limit(mut self, limit: usize) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn follow_redirect(mut self, follow_redirect: bool) -> Self {
        self.follow_redirect = Some(follow_redirect);
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = Some(max_redirects);
        self
    }

    pub fn decompress(mut self, decompress: bool) -> Self {
        self.decompress = Some(decompress);
        self
    }

    pub fn throw_http_errors(mut self, throw_http_errors: bool) -> Self {
        self.throw_http_errors = Some(throw_http_errors);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_empty()
            && self.payload.is_none()
            && self.timeout.is_none()
            && self.retry_limit.is_none()
            && self.follow_redirect.is_none()
            && self.max_redirects.is_none()
            && self.decompress.is_none()
            && self.throw_http_errors.is_none()
    }

    pub(crate) fn touches_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub(crate) fn apply(self, options: &mut NormalizedOptions) -> Result<(), Error> {
        if let Some(url) = self.url {
            ensure_supported_protocol(&url)?;
            options.url = url;
        }
        if let Some(method) = self.method {
            options.method = method;
        }
        apply_header_inputs(&mut options.headers, self.headers)?;
        if let Some(payload) = self.payload {
            options.set_payload(payload);
        }
        if let Some(timeout) = self.timeout {
            options.timeout.merge_from(&timeout);
        }
        if let Some(limit) = self.retry_limit {
            options.retry = options.retry.clone().limit(limit);
        }
        if let Some(follow_redirect) = self.follow_redirect {
            options.follow_redirect = follow_redirect;
        }
        if let Some(max_redirects) = self.max_redirects {
            options.max_redirects = max_redirects;
        }
        if let Some(decompress) = self.decompress {
            options.decompress = decompress;
        }
        if let Some(throw_http_errors) = self.throw_http_errors {
            options.throw_http_errors = throw_http_errors;
        }
        Ok(())
    }
}
