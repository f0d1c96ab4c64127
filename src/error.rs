use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

use crate::options::NormalizedOptions;
use crate::response::Response;
use crate::timings::Timings;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Named attempt phase whose budget ran out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Lookup,
    Connect,
    SecureConnect,
    Socket,
    Send,
    Response,
    Request,
}

impl TimeoutPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Connect => "connect",
            Self::SecureConnect => "secureConnect",
            Self::Socket => "socket",
            Self::Send => "send",
            Self::Response => "response",
            Self::Request => "request",
        }
    }
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Stable machine-readable error code. Retry policies match on these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    TimedOut,
    ConnectionReset,
    AddressInUse,
    ConnectionRefused,
    BrokenPipe,
    NotFound,
    NetworkUnreachable,
    DnsTemporaryFailure,
    NonOkResponse,
    TooManyRedirects,
    ReadingResponseStream,
    Upload,
    CacheAccess,
    UnsupportedProtocol,
    Canceled,
    InvalidOptions,
    InvalidRedirectLocation,
    BodyParseFailure,
    Generic,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimedOut => "ETIMEDOUT",
            Self::ConnectionReset => "ECONNRESET",
            Self::AddressInUse => "EADDRINUSE",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::BrokenPipe => "EPIPE",
            Self::NotFound => "ENOTFOUND",
            Self::NetworkUnreachable => "ENETUNREACH",
            Self::DnsTemporaryFailure => "EAI_AGAIN",
            Self::NonOkResponse => "ERR_NON_2XX_3XX_RESPONSE",
            Self::TooManyRedirects => "ERR_TOO_MANY_REDIRECTS",
            Self::ReadingResponseStream => "ERR_READING_RESPONSE_STREAM",
            Self::Upload => "ERR_UPLOAD",
            Self::CacheAccess => "ERR_CACHE_ACCESS",
            Self::UnsupportedProtocol => "ERR_UNSUPPORTED_PROTOCOL",
            Self::Canceled => "ERR_CANCELED",
            Self::InvalidOptions => "ERR_INVALID_OPTIONS",
            Self::InvalidRedirectLocation => "ERR_INVALID_REDIRECT_LOCATION",
            Self::BodyParseFailure => "ERR_BODY_PARSE_FAILURE",
            Self::Generic => "ERR_REQUEST",
        }
    }

    pub(crate) fn from_io_kind(kind: std::io::ErrorKind) -> Option<Self> {
        use std::io::ErrorKind;

        match kind {
            ErrorKind::TimedOut => Some(Self::TimedOut),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Some(Self::ConnectionReset)
            }
            ErrorKind::AddrInUse => Some(Self::AddressInUse),
            ErrorKind::ConnectionRefused => Some(Self::ConnectionRefused),
            ErrorKind::BrokenPipe => Some(Self::BrokenPipe),
            ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable => {
                Some(Self::NetworkUnreachable)
            }
            ErrorKind::UnexpectedEof => Some(Self::ConnectionReset),
            _ => None,
        }
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ALL_CODES
            .iter()
            .copied()
            .find(|code| code.as_str() == value)
            .ok_or_else(|| Error::invalid_options(format!("unknown error code `{value}`")))
    }
}

const ALL_CODES: [ErrorCode; 19] = [
    ErrorCode::TimedOut,
    ErrorCode::ConnectionReset,
    ErrorCode::AddressInUse,
    ErrorCode::ConnectionRefused,
    ErrorCode::BrokenPipe,
    ErrorCode::NotFound,
    ErrorCode::NetworkUnreachable,
    ErrorCode::DnsTemporaryFailure,
    ErrorCode::NonOkResponse,
    ErrorCode::TooManyRedirects,
    ErrorCode::ReadingResponseStream,
    ErrorCode::Upload,
    ErrorCode::CacheAccess,
    ErrorCode::UnsupportedProtocol,
    ErrorCode::Canceled,
    ErrorCode::InvalidOptions,
    ErrorCode::InvalidRedirectLocation,
    ErrorCode::BodyParseFailure,
    ErrorCode::Generic,
];

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// What was known about the request when it failed.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    options: Option<Arc<NormalizedOptions>>,
    response: Option<Arc<Response>>,
    timings: Option<Timings>,
}

impl ErrorContext {
    pub fn options(&self) -> Option<&NormalizedOptions> {
        self.options.as_deref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_deref()
    }

    pub fn timings(&self) -> Option<&Timings> {
        self.timings.as_ref()
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{source}")]
    Request {
        code: ErrorCode,
        #[source]
        source: BoxError,
        context: Box<ErrorContext>,
    },
    #[error("response code {status}")]
    Http {
        status: StatusCode,
        context: Box<ErrorContext>,
    },
    #[error("redirected {max_redirects} times, aborting")]
    MaxRedirects {
        max_redirects: usize,
        context: Box<ErrorContext>,
    },
    #[error("timeout awaiting '{phase}' for {budget_ms}ms")]
    Timeout {
        phase: TimeoutPhase,
        budget_ms: u128,
        context: Box<ErrorContext>,
    },
    #[error("failed to read response body: {source}")]
    Read {
        code: ErrorCode,
        #[source]
        source: BoxError,
        context: Box<ErrorContext>,
    },
    #[error("failed to upload request body: {source}")]
    Upload {
        code: ErrorCode,
        #[source]
        source: BoxError,
        context: Box<ErrorContext>,
    },
    #[error("response cache failed: {source}")]
    Cache {
        #[source]
        source: BoxError,
        context: Box<ErrorContext>,
    },
    #[error("unsupported protocol \"{protocol}\"")]
    UnsupportedProtocol {
        protocol: String,
        context: Box<ErrorContext>,
    },
    #[error("request was canceled")]
    Cancel { context: Box<ErrorContext> },
    #[error("invalid request options: {message}")]
    InvalidOptions { message: String },
    #[error("failed to parse response body: {source}; body={body}")]
    ParseBody {
        #[source]
        source: BoxError,
        body: String,
        context: Box<ErrorContext>,
    },
}

impl Error {
    pub(crate) fn request(code: ErrorCode, source: impl Into<BoxError>) -> Self {
        Self::Request {
            code,
            source: source.into(),
            context: Box::default(),
        }
    }

    pub(crate) fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    pub(crate) fn cancel() -> Self {
        Self::Cancel {
            context: Box::default(),
        }
    }

    pub(crate) fn timeout(phase: TimeoutPhase, budget: std::time::Duration) -> Self {
        Self::Timeout {
            phase,
            budget_ms: budget.as_millis(),
            context: Box::default(),
        }
    }

    pub(crate) fn http(response: Response) -> Self {
        let status = response.status();
        Self::Http {
            status,
            context: Box::new(ErrorContext {
                timings: Some(response.timings().clone()),
                response: Some(Arc::new(response)),
                options: None,
            }),
        }
    }

    pub(crate) fn max_redirects(max_redirects: usize, response: Response) -> Self {
        Self::MaxRedirects {
            max_redirects,
            context: Box::new(ErrorContext {
                timings: Some(response.timings().clone()),
                response: Some(Arc::new(response)),
                options: None,
            }),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Request { code, .. } => *code,
            Self::Http { .. } => ErrorCode::NonOkResponse,
            Self::MaxRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::Timeout { .. } => ErrorCode::TimedOut,
            Self::Read { code, .. } => *code,
            Self::Upload { code, .. } => *code,
            Self::Cache { .. } => ErrorCode::CacheAccess,
            Self::UnsupportedProtocol { .. } => ErrorCode::UnsupportedProtocol,
            Self::Cancel { .. } => ErrorCode::Canceled,
            Self::InvalidOptions { .. } => ErrorCode::InvalidOptions,
            Self::ParseBody { .. } => ErrorCode::BodyParseFailure,
        }
    }

    fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Request { context, .. }
            | Self::Http { context, .. }
            | Self::MaxRedirects { context, .. }
            | Self::Timeout { context, .. }
            | Self::Read { context, .. }
            | Self::Upload { context, .. }
            | Self::Cache { context, .. }
            | Self::UnsupportedProtocol { context, .. }
            | Self::Cancel { context }
            | Self::ParseBody { context, .. } => Some(context),
            Self::InvalidOptions { .. } => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::Request { context, .. }
            | Self::Http { context, .. }
            | Self::MaxRedirects { context, .. }
            | Self::Timeout { context, .. }
            | Self::Read { context, .. }
            | Self::Upload { context, .. }
            | Self::Cache { context, .. }
            | Self::UnsupportedProtocol { context, .. }
            | Self::Cancel { context }
            | Self::ParseBody { context, .. } => Some(context),
            Self::InvalidOptions { .. } => None,
        }
    }

    /// Options of the attempt that produced this error.
    pub fn options(&self) -> Option<&NormalizedOptions> {
        self.context().and_then(ErrorContext::options)
    }

    pub fn response(&self) -> Option<&Response> {
        self.context().and_then(ErrorContext::response)
    }

    pub fn timings(&self) -> Option<&Timings> {
        self.context().and_then(ErrorContext::timings)
    }

    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Self::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Cancel { .. })
    }

    pub(crate) fn with_options(mut self, options: Arc<NormalizedOptions>) -> Self {
        if let Some(context) = self.context_mut() {
            context.options = Some(options);
        }
        self
    }

    pub(crate) fn with_timings(mut self, timings: Timings) -> Self {
        if let Some(context) = self.context_mut()
            && context.timings.is_none()
        {
            context.timings = Some(timings);
        }
        self
    }

    pub(crate) fn with_response(mut self, response: Response) -> Self {
        if let Some(context) = self.context_mut() {
            context.timings.get_or_insert_with(|| response.timings().clone());
            context.response = Some(Arc::new(response));
        }
        self
    }

    pub(crate) fn has_options(&self) -> bool {
        self.options().is_some()
    }
}

/// Maps a transport failure to the code retry policies match on.
pub(crate) fn classify_transport_error(error: &(dyn std::error::Error + 'static)) -> ErrorCode {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(item) = current {
        if let Some(io_error) = item.downcast_ref::<std::io::Error>()
            && let Some(code) = ErrorCode::from_io_kind(io_error.kind())
        {
            return code;
        }
        if let Some(hyper_error) = item.downcast_ref::<hyper::Error>()
            && (hyper_error.is_incomplete_message() || hyper_error.is_closed())
        {
            return ErrorCode::ConnectionReset;
        }
        current = item.source();
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("failed to lookup address")
        || text.contains("name or service not known")
        || text.contains("no addresses resolved")
        || text.contains("nodename nor servname")
    {
        return ErrorCode::NotFound;
    }
    if text.contains("temporary failure in name resolution") {
        return ErrorCode::DnsTemporaryFailure;
    }
    if text.contains("connection refused") {
        return ErrorCode::ConnectionRefused;
    }
    if text.contains("connection reset")
        || text.contains("unexpected eof")
        || text.contains("connection closed")
    {
        return ErrorCode::ConnectionReset;
    }
    if text.contains("broken pipe") {
        return ErrorCode::BrokenPipe;
    }
    ErrorCode::Generic
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode, TimeoutPhase, classify_transport_error};

    #[test]
    fn timeout_error_names_phase_and_budget() {
        let error = Error::timeout(TimeoutPhase::SecureConnect, std::time::Duration::from_millis(250));
        assert_eq!(error.to_string(), "timeout awaiting 'secureConnect' for 250ms");
        assert_eq!(error.code(), ErrorCode::TimedOut);
        assert_eq!(error.timeout_phase(), Some(TimeoutPhase::SecureConnect));
    }

    #[test]
    fn classify_walks_source_chain_for_io_errors() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(classify_transport_error(&io_error), ErrorCode::ConnectionRefused);

        let text_error = std::io::Error::other("failed to lookup address information");
        assert_eq!(classify_transport_error(&text_error), ErrorCode::NotFound);
    }

    #[test]
    fn codes_parse_from_their_wire_names() {
        assert_eq!("EAI_AGAIN".parse::<ErrorCode>().unwrap(), ErrorCode::DnsTemporaryFailure);
        assert_eq!("ERR_REQUEST".parse::<ErrorCode>().unwrap(), ErrorCode::Generic);
        assert!("EWHATEVER".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn invalid_options_carries_no_context() {
        let error = Error::invalid_options("body and json are mutually exclusive");
        assert!(error.options().is_none());
        assert_eq!(error.code().as_str(), "ERR_INVALID_OPTIONS");
    }
}
