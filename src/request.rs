use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use http::header::{HeaderName, HeaderValue};
use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::client::Client;
use crate::engine::body::validate_payload;
use crate::error::{BoxError, Error, TimeoutPhase};
use crate::hooks::{self, Hooks};
use crate::options::{
    BodySource, HeaderInput, NormalizedOptions, SharedBodyStream, apply_header_inputs,
    ensure_supported_protocol,
};
use crate::promise::ResponsePromise;
use crate::retry::RetryOptions;
use crate::stream::RequestStream;
use crate::timeout::TimeoutBudgets;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value, resolve_url};

/// Per-request options layered over the client defaults.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    url: String,
    query_pairs: Vec<(String, String)>,
    headers: Vec<(HeaderName, HeaderInput)>,
    body: Option<BodySource>,
    json: Option<serde_json::Value>,
    form: Option<Vec<(String, String)>>,
    timeout: TimeoutBudgets,
    retry: Option<RetryOptions>,
    hooks: Hooks,
    follow_redirect: Option<bool>,
    max_redirects: Option<usize>,
    method_rewriting: Option<bool>,
    decompress: Option<bool>,
    throw_http_errors: Option<bool>,
    allow_get_body: Option<bool>,
    ignore_invalid_cookies: Option<bool>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            query_pairs: Vec::new(),
            headers: Vec::new(),
            body: None,
            json: None,
            form: None,
            timeout: TimeoutBudgets::default(),
            retry: None,
            hooks: Hooks::default(),
            follow_redirect: None,
            max_redirects: None,
            method_rewriting: None,
            decompress: None,
            throw_http_errors: None,
            allow_get_body: None,
            ignore_invalid_cookies: None,
        }
    }

    pub fn header(self, name: HeaderName, value: HeaderValue) -> Self {
        self.header_input(name, HeaderInput::Value(value))
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// `Undefined` drops a client default; `Null` fails when the request
    /// is sent.
    pub fn header_input(mut self, name: HeaderName, input: HeaderInput) -> Self {
        self.headers.push((name, input));
        self
    }

    pub fn remove_header(self, name: HeaderName) -> Self {
        self.header_input(name, HeaderInput::Undefined)
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::invalid_options(format!("failed to encode query: {source}")))?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(BodySource::Bytes(body.into()));
        self
    }

    /// Single-use body: a retry or redirect that needs it again fails.
    pub fn body_stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.body = Some(BodySource::Stream(SharedBodyStream::new(stream)));
        self
    }

    pub fn body_reader<R>(self, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.body_stream(ReaderStream::new(reader))
    }

    pub fn shared_body(mut self, body: SharedBodyStream) -> Self {
        self.body = Some(BodySource::Stream(body));
        self
    }

    pub fn json<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload)
            .map_err(|source| Error::invalid_options(format!("failed to encode json body: {source}")))?;
        self.json = Some(value);
        Ok(self)
    }

    pub fn form<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map_err(|source| Error::invalid_options(format!("failed to encode form body: {source}")))?;
        self.form = Some(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect(),
        );
        Ok(self)
    }

    /// Budget for the whole attempt.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.phase_timeout(TimeoutPhase::Request, timeout)
    }

    pub fn phase_timeout(mut self, phase: TimeoutPhase, timeout: Duration) -> Self {
        self.timeout.set(phase, Some(timeout.max(Duration::from_millis(1))));
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutBudgets) -> Self {
        self.timeout.merge_from(&timeouts);
        self
    }

    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn retry_limit(mut self, limit: usize) -> Self {
        let retry = self.retry.take().unwrap_or_else(|| self.client.retry.clone());
        self.retry = Some(retry.limit(limit));
        self
    }

    /// Runs after the client hooks of the same kind.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks.extend(&hooks);
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

    pub fn method_rewriting(mut self, method_rewriting: bool) -> Self {
        self.method_rewriting = Some(method_rewriting);
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

    pub fn allow_get_body(mut self, allow_get_body: bool) -> Self {
        self.allow_get_body = Some(allow_get_body);
        self
    }

    pub fn ignore_invalid_cookies(mut self, ignore_invalid_cookies: bool) -> Self {
        self.ignore_invalid_cookies = Some(ignore_invalid_cookies);
        self
    }

    /// Merges client defaults with this request and runs the `init` hooks.
    pub fn normalize(self) -> crate::Result<NormalizedOptions> {
        let client = self.client;
        let mut url = resolve_url(client.prefix_url.as_ref(), &self.url)?;
        append_query_pairs(&mut url, &self.query_pairs);
        ensure_supported_protocol(&url)?;

        let mut headers = client.headers.clone();
        apply_header_inputs(&mut headers, self.headers)?;

        let mut timeout = client.timeout;
        timeout.merge_from(&self.timeout);
        let retry = self
            .retry
            .unwrap_or_else(|| client.retry.clone())
            .with_budget_defaults(&timeout);

        let mut hooks = client.hooks.clone();
        hooks.extend(&self.hooks);

        let mut options = NormalizedOptions {
            url,
            method: self.method,
            headers,
            body: self.body,
            json: self.json,
            form: self.form,
            allow_get_body: self.allow_get_body.unwrap_or(client.allow_get_body),
            timeout,
            retry,
            hooks,
            follow_redirect: self.follow_redirect.unwrap_or(client.follow_redirect),
            max_redirects: self.max_redirects.unwrap_or(client.max_redirects),
            method_rewriting: self.method_rewriting.unwrap_or(client.method_rewriting),
            decompress: self.decompress.unwrap_or(client.decompress),
            throw_http_errors: self.throw_http_errors.unwrap_or(client.throw_http_errors),
            ignore_invalid_cookies: self
                .ignore_invalid_cookies
                .unwrap_or(client.ignore_invalid_cookies),
            cookie_jar: client.cookie_jar.clone(),
            cache: client.cache.clone(),
            transport: client.transport.clone(),
            clock: client.clock.clone(),
        };
        hooks::run_init(&mut options)?;
        ensure_supported_protocol(&options.url)?;
        validate_payload(&options)?;
        Ok(options)
    }

    /// Starts nothing until awaited. Option errors surface on await.
    pub fn send(self) -> ResponsePromise {
        match self.normalize() {
            Ok(options) => ResponsePromise::new(options),
            Err(error) => ResponsePromise::failed(error),
        }
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.send().json().await
    }

    /// Spawns the request on the current runtime and hands back its
    /// event stream.
    pub fn stream(self) -> crate::Result<RequestStream> {
        let options = self.normalize()?;
        Ok(RequestStream::spawn(options))
    }
}
