use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, Method, StatusCode};
use rand::RngExt;

use crate::error::{Error, ErrorCode};
use crate::timeout::TimeoutBudgets;

const BACKOFF_UNIT_MS: u64 = 1000;
const MAX_JITTER_MS: u64 = 100;

pub trait Clock: Send + Sync {
    fn now_system(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// What a custom delay calculator gets to look at.
pub struct RetryContext<'a> {
    pub attempt_count: usize,
    pub retry_options: &'a RetryOptions,
    pub error: &'a Error,
    pub method: &'a Method,
    pub retry_after: Option<Duration>,
}

pub type DelayCalculator = Arc<dyn Fn(&RetryContext<'_>, Duration) -> Duration + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    limit: usize,
    methods: Vec<Method>,
    status_codes: BTreeSet<u16>,
    error_codes: BTreeSet<ErrorCode>,
    max_retry_after: Option<Duration>,
    calculate_delay: Option<DelayCalculator>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryOptions")
            .field("limit", &self.limit)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("error_codes", &self.error_codes)
            .field("max_retry_after", &self.max_retry_after)
            .field("calculate_delay", &self.calculate_delay.is_some())
            .finish()
    }
}

impl RetryOptions {
    pub fn standard() -> Self {
        Self {
            limit: 2,
            methods: default_retry_methods(),
            status_codes: default_retry_status_codes(),
            error_codes: default_retry_error_codes(),
            max_retry_after: None,
            calculate_delay: None,
        }
    }

    pub fn disabled() -> Self {
        Self::standard().limit(0)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        let mut collected: Vec<Method> = Vec::new();
        for method in methods {
            let method = normalize_method(method);
            if !collected.contains(&method) {
                collected.push(method);
            }
        }
        self.methods = collected;
        self
    }

    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes = codes.into_iter().collect();
        self
    }

    pub fn error_codes(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.error_codes = codes.into_iter().collect();
        self
    }

    pub fn max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = Some(max_retry_after);
        self
    }

    /// Replaces the computed delay. Returning zero cancels the retry.
    pub fn calculate_delay<F>(mut self, calculate_delay: F) -> Self
    where
        F: Fn(&RetryContext<'_>, Duration) -> Duration + Send + Sync + 'static,
    {
        self.calculate_delay = Some(Arc::new(calculate_delay));
        self
    }

    pub fn configured_limit(&self) -> usize {
        self.limit
    }

    pub fn allowed_methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn configured_max_retry_after(&self) -> Option<Duration> {
        self.max_retry_after
    }

    /// Unset `max_retry_after` falls back to the smaller of the request and
    /// connect budgets. With neither set it stays unbounded.
    pub(crate) fn with_budget_defaults(mut self, budgets: &TimeoutBudgets) -> Self {
        if self.max_retry_after.is_none() {
            self.max_retry_after = [budgets.request, budgets.connect].into_iter().flatten().min();
        }
        self
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::standard()
    }
}

/// Extension methods compare case-sensitively in `http`, so `get` would miss `GET`.
fn normalize_method(method: Method) -> Method {
    let upper = method.as_str().to_ascii_uppercase();
    if upper == method.as_str() {
        return method;
    }
    Method::from_bytes(upper.as_bytes()).unwrap_or(method)
}

fn default_retry_methods() -> Vec<Method> {
    vec![
        Method::GET,
        Method::PUT,
        Method::HEAD,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
}

fn default_retry_status_codes() -> BTreeSet<u16> {
    [408_u16, 413, 429, 500, 502, 503, 504, 521, 522, 524]
        .into_iter()
        .collect()
}

fn default_retry_error_codes() -> BTreeSet<ErrorCode> {
    [
        ErrorCode::TimedOut,
        ErrorCode::ConnectionReset,
        ErrorCode::AddressInUse,
        ErrorCode::ConnectionRefused,
        ErrorCode::BrokenPipe,
        ErrorCode::NotFound,
        ErrorCode::NetworkUnreachable,
        ErrorCode::DnsTemporaryFailure,
    ]
    .into_iter()
    .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn from_delay(delay: Duration) -> Self {
        Self {
            should_retry: !delay.is_zero(),
            delay,
        }
    }
}

/// Parses `Retry-After` as seconds or an HTTP date. Dates in the past
/// collapse to one millisecond so a retry still happens.
pub fn retry_after_delay(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw_value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<f64>() {
        if !seconds.is_finite() {
            return None;
        }
        if seconds <= 0.0 {
            return Some(Duration::from_millis(1));
        }
        return Some(Duration::from_millis((seconds * 1000.0) as u64));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) if !duration.is_zero() => Some(duration),
        _ => Some(Duration::from_millis(1)),
    }
}

fn backoff_for_attempt(attempt_count: usize) -> Duration {
    let capped_exponent = attempt_count.saturating_sub(1).min(31) as u32;
    let base_ms = BACKOFF_UNIT_MS.saturating_mul(1_u64 << capped_exponent);
    let jitter_ms = rand::rng().random_range(0..MAX_JITTER_MS);
    Duration::from_millis(base_ms.saturating_add(jitter_ms))
}

/// Decides whether a failed attempt is retried and after how long.
#[derive(Clone)]
pub struct RetryScheduler {
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn decide(
        &self,
        options: &RetryOptions,
        method: &Method,
        error: &Error,
        attempt_count: usize,
    ) -> RetryDecision {
        let retry_after = error
            .response()
            .and_then(|response| retry_after_delay(response.headers(), self.clock.now_system()));
        let computed = computed_delay(options, method, error, attempt_count, retry_after);
        let delay = match &options.calculate_delay {
            Some(calculate_delay) => calculate_delay(
                &RetryContext {
                    attempt_count,
                    retry_options: options,
                    error,
                    method,
                    retry_after,
                },
                computed,
            ),
            None => computed,
        };
        RetryDecision::from_delay(delay)
    }
}

fn computed_delay(
    options: &RetryOptions,
    method: &Method,
    error: &Error,
    attempt_count: usize,
    retry_after: Option<Duration>,
) -> Duration {
    if attempt_count > options.limit {
        return Duration::ZERO;
    }
    if !options.methods.contains(&normalize_method(method.clone())) {
        return Duration::ZERO;
    }

    let status = error.response().map(|response| response.status());
    let code_matches = options.error_codes.contains(&error.code());
    let status_matches = status.is_some_and(|status| options.status_codes.contains(&status.as_u16()));
    if !code_matches && !status_matches {
        return Duration::ZERO;
    }

    if error.response().is_some() {
        if let Some(retry_after) = retry_after {
            if let Some(max_retry_after) = options.max_retry_after
                && retry_after > max_retry_after
            {
                return Duration::ZERO;
            }
            return retry_after;
        }
        if status == Some(StatusCode::PAYLOAD_TOO_LARGE) {
            return Duration::ZERO;
        }
    }

    backoff_for_attempt(attempt_count)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use http::header::RETRY_AFTER;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{Clock, RetryOptions, RetryScheduler, retry_after_delay};
    use crate::error::{Error, ErrorCode};
    use crate::response::Response;
    use crate::timeout::TimeoutBudgets;

    struct FixedClock(SystemTime);

    impl Clock for FixedClock {
        fn now_system(&self) -> SystemTime {
            self.0
        }
    }

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(Arc::new(FixedClock(SystemTime::UNIX_EPOCH)))
    }

    fn http_error(status: u16, retry_after: Option<&'static str>) -> Error {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        }
        let status = StatusCode::from_u16(status).unwrap();
        Error::http(Response::for_tests(status, headers, "https://a.test/"))
    }

    #[test]
    fn timeout_error_backs_off_exponentially_with_jitter() {
        let error = Error::timeout(crate::TimeoutPhase::Request, Duration::from_millis(5));
        let options = RetryOptions::standard();
        for attempt in 1..=2 {
            let decision = scheduler().decide(&options, &Method::GET, &error, attempt);
            let floor = Duration::from_millis(1000 << (attempt - 1));
            assert!(decision.should_retry);
            assert!(decision.delay >= floor);
            assert!(decision.delay < floor + Duration::from_millis(100));
        }
    }

    #[test]
    fn attempts_beyond_limit_are_not_retried() {
        let error = Error::request(ErrorCode::ConnectionReset, "reset");
        let decision = scheduler().decide(&RetryOptions::standard(), &Method::GET, &error, 3);
        assert!(!decision.should_retry);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn non_retryable_method_or_code_is_not_retried() {
        let error = Error::request(ErrorCode::ConnectionReset, "reset");
        let options = RetryOptions::standard();
        assert!(!scheduler().decide(&options, &Method::POST, &error, 1).should_retry);

        let generic = Error::request(ErrorCode::Generic, "boom");
        assert!(!scheduler().decide(&options, &Method::GET, &generic, 1).should_retry);
    }

    #[test]
    fn method_match_ignores_case() {
        let error = Error::request(ErrorCode::ConnectionReset, "reset");
        let lower = Method::from_bytes(b"get").unwrap();
        let options = RetryOptions::standard();
        assert!(scheduler().decide(&options, &lower, &error, 1).should_retry);

        let custom = RetryOptions::standard().methods([Method::from_bytes(b"purge").unwrap()]);
        assert_eq!(custom.allowed_methods()[0].as_str(), "PURGE");
        let upper = Method::from_bytes(b"PURGE").unwrap();
        assert!(scheduler().decide(&custom, &upper, &error, 1).should_retry);
    }

    #[test]
    fn retry_after_seconds_win_over_backoff() {
        let error = http_error(413, Some("2"));
        let decision = scheduler().decide(&RetryOptions::standard(), &Method::GET, &error, 1);
        assert_eq!(decision.delay, Duration::from_secs(2));
    }

    #[test]
    fn payload_too_large_without_retry_after_is_not_retried() {
        let error = http_error(413, None);
        let decision = scheduler().decide(&RetryOptions::standard(), &Method::GET, &error, 1);
        assert!(!decision.should_retry);
    }

    #[test]
    fn retry_after_above_max_cancels_retry() {
        let error = http_error(503, Some("30"));
        let options = RetryOptions::standard().max_retry_after(Duration::from_secs(10));
        assert!(!scheduler().decide(&options, &Method::GET, &error, 1).should_retry);
    }

    #[test]
    fn max_retry_after_defaults_to_smallest_budget() {
        let budgets = TimeoutBudgets {
            request: Some(Duration::from_secs(8)),
            connect: Some(Duration::from_secs(3)),
            ..TimeoutBudgets::default()
        };
        let options = RetryOptions::standard().with_budget_defaults(&budgets);
        assert_eq!(options.configured_max_retry_after(), Some(Duration::from_secs(3)));

        let unbounded = RetryOptions::standard().with_budget_defaults(&TimeoutBudgets::default());
        assert_eq!(unbounded.configured_max_retry_after(), None);
    }

    #[test]
    fn calculate_delay_overrides_computed_value() {
        let error = Error::request(ErrorCode::ConnectionReset, "reset");
        let options = RetryOptions::standard().calculate_delay(|context, computed| {
            assert_eq!(context.attempt_count, 1);
            assert!(computed >= Duration::from_secs(1));
            Duration::from_millis(5)
        });
        let decision = scheduler().decide(&options, &Method::GET, &error, 1);
        assert_eq!(decision.delay, Duration::from_millis(5));

        let cancel = RetryOptions::standard().calculate_delay(|_, _| Duration::ZERO);
        assert!(!scheduler().decide(&cancel, &Method::GET, &error, 1).should_retry);
    }

    #[test]
    fn retry_after_http_date_is_relative_to_clock() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Thu, 01 Jan 1970 00:00:05 GMT"),
        );
        assert_eq!(
            retry_after_delay(&headers, SystemTime::UNIX_EPOCH),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            retry_after_delay(&headers, SystemTime::UNIX_EPOCH + Duration::from_secs(60)),
            Some(Duration::from_millis(1))
        );
    }
}
