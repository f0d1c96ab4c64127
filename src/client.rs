use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method};
use url::Url;

use crate::cache::ResponseCache;
use crate::config::ClientConfig;
use crate::cookies::CookieJar;
use crate::error::{Error, TimeoutPhase};
use crate::hooks::Hooks;
use crate::options::{HeaderInput, apply_header_inputs, ensure_supported_protocol};
use crate::request::RequestBuilder;
use crate::retry::{Clock, RetryOptions, SystemClock};
use crate::timeout::TimeoutBudgets;
use crate::transport::{HyperTransport, Transport};
use crate::util::{parse_header_name, parse_header_value};

const DEFAULT_USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MAX_REDIRECTS: usize = 10;

pub struct ClientBuilder {
    prefix_url: Option<String>,
    headers: Vec<(HeaderName, HeaderInput)>,
    timeout: TimeoutBudgets,
    retry: RetryOptions,
    hooks: Hooks,
    follow_redirect: bool,
    max_redirects: usize,
    method_rewriting: bool,
    decompress: bool,
    throw_http_errors: bool,
    ignore_invalid_cookies: bool,
    allow_get_body: bool,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    cache: Option<Arc<dyn ResponseCache>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            prefix_url: None,
            headers: vec![(
                USER_AGENT,
                HeaderInput::Value(HeaderValue::from_static(DEFAULT_USER_AGENT)),
            )],
            timeout: TimeoutBudgets::default(),
            retry: RetryOptions::standard(),
            hooks: Hooks::default(),
            follow_redirect: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            method_rewriting: false,
            decompress: true,
            throw_http_errors: true,
            ignore_invalid_cookies: false,
            allow_get_body: false,
            cookie_jar: None,
            cache: None,
            transport: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: ClientConfig) -> crate::Result<Self> {
        config.apply(Self::new())
    }

    /// Base that relative request URLs are joined onto.
    pub fn prefix_url(mut self, prefix_url: impl Into<String>) -> Self {
        self.prefix_url = Some(prefix_url.into());
        self
    }

    pub fn default_header(self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_header_input(name, HeaderInput::Value(value))
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn default_header_input(mut self, name: HeaderName, input: HeaderInput) -> Self {
        self.headers.push((name, input));
        self
    }

    pub fn user_agent(self, user_agent: HeaderValue) -> Self {
        self.default_header(USER_AGENT, user_agent)
    }

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
        self.retry = retry;
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks.extend(&hooks);
        self
    }

    pub fn follow_redirect(mut self, follow_redirect: bool) -> Self {
        self.follow_redirect = follow_redirect;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn method_rewriting(mut self, method_rewriting: bool) -> Self {
        self.method_rewriting = method_rewriting;
        self
    }

    pub fn decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    pub fn throw_http_errors(mut self, throw_http_errors: bool) -> Self {
        self.throw_http_errors = throw_http_errors;
        self
    }

    pub fn ignore_invalid_cookies(mut self, ignore_invalid_cookies: bool) -> Self {
        self.ignore_invalid_cookies = ignore_invalid_cookies;
        self
    }

    pub fn allow_get_body(mut self, allow_get_body: bool) -> Self {
        self.allow_get_body = allow_get_body;
        self
    }

    pub fn cookie_jar(mut self, cookie_jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(cookie_jar);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Wall clock used for `Retry-After` dates.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        let prefix_url = match self.prefix_url {
            Some(prefix_url) => {
                let url = Url::parse(&prefix_url).map_err(|source| {
                    Error::invalid_options(format!("invalid prefix url `{prefix_url}`: {source}"))
                })?;
                ensure_supported_protocol(&url)?;
                Some(url)
            }
            None => None,
        };

        let mut headers = HeaderMap::new();
        apply_header_inputs(&mut headers, self.headers)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };

        Ok(Client {
            prefix_url,
            headers,
            timeout: self.timeout,
            retry: self.retry,
            hooks: self.hooks,
            follow_redirect: self.follow_redirect,
            max_redirects: self.max_redirects,
            method_rewriting: self.method_rewriting,
            decompress: self.decompress,
            throw_http_errors: self.throw_http_errors,
            ignore_invalid_cookies: self.ignore_invalid_cookies,
            allow_get_body: self.allow_get_body,
            cookie_jar: self.cookie_jar,
            cache: self.cache,
            transport,
            clock: self.clock,
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build volley client: {error}"))
    }
}

/// Shared defaults plus the transport. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    pub(crate) prefix_url: Option<Url>,
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: TimeoutBudgets,
    pub(crate) retry: RetryOptions,
    pub(crate) hooks: Hooks,
    pub(crate) follow_redirect: bool,
    pub(crate) max_redirects: usize,
    pub(crate) method_rewriting: bool,
    pub(crate) decompress: bool,
    pub(crate) throw_http_errors: bool,
    pub(crate) ignore_invalid_cookies: bool,
    pub(crate) allow_get_body: bool,
    pub(crate) cookie_jar: Option<Arc<dyn CookieJar>>,
    pub(crate) cache: Option<Arc<dyn ResponseCache>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("prefix_url", &self.prefix_url.as_ref().map(Url::as_str))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("follow_redirect", &self.follow_redirect)
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn prefix_url(&self) -> Option<&Url> {
        self.prefix_url.as_ref()
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.headers
    }
}
