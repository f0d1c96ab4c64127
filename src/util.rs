use std::sync::Mutex;

use http::header::{ACCEPT_ENCODING, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) const ACCEPT_ENCODING_VALUE: &str = "gzip, deflate, br, zstd";

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn ensure_accept_encoding(headers: &mut HeaderMap) {
    if !headers.contains_key(ACCEPT_ENCODING) {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPT_ENCODING_VALUE));
    }
}

pub(crate) fn redact_uri_for_logs(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Resolves `input` against an optional prefix. Absolute inputs are used as given.
pub(crate) fn resolve_url(prefix_url: Option<&Url>, input: &str) -> Result<Url, Error> {
    if let Ok(url) = Url::parse(input) {
        return Ok(url);
    }
    let Some(prefix) = prefix_url else {
        return Err(Error::invalid_options(format!(
            "relative url `{input}` requires a prefix url"
        )));
    };
    let joined = join_base_path(prefix.as_str(), input);
    Url::parse(&joined)
        .map_err(|source| Error::invalid_options(format!("invalid url `{joined}`: {source}")))
}

pub(crate) fn append_query_pairs(url: &mut Url, query_pairs: &[(String, String)]) {
    if query_pairs.is_empty() {
        return;
    }
    let existing = url
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in existing.iter().chain(query_pairs) {
        serializer.append_pair(name, value);
    }
    let query = serializer.finish();
    url.set_query(Some(&query));
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse()
        .map_err(|_| Error::invalid_options(format!("invalid header name `{name}`")))
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value
        .parse()
        .map_err(|_| Error::invalid_options(format!("invalid value for header `{name}`")))
}

pub(crate) fn parse_method(method: &str) -> Result<Method, Error> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::invalid_options(format!("invalid method `{method}`")))
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 300 | 301 | 302 | 303 | 304 | 307 | 308)
}

/// 2xx is ok. Without redirect following, 3xx is ok too. 304 is always ok.
pub(crate) fn is_ok_status(status: StatusCode, follow_redirect: bool) -> bool {
    let code = status.as_u16();
    let limit = if follow_redirect { 299 } else { 399 };
    (200..=limit).contains(&code) || code == 304
}

pub(crate) fn default_port(url: &Url) -> Option<u16> {
    url.port_or_known_default()
}

/// Hostname or explicit port differ. A scheme downgrade also counts.
pub(crate) fn is_cross_origin(from: &Url, to: &Url) -> bool {
    if from.host_str().map(str::to_ascii_lowercase) != to.host_str().map(str::to_ascii_lowercase) {
        return true;
    }
    if from.port() != to.port() {
        return true;
    }
    from.scheme() == "https" && to.scheme() == "http"
}

/// Decodes a raw `location` header. Falls back to latin1 when not UTF-8.
pub(crate) fn decode_location(value: &HeaderValue) -> String {
    let bytes = value.as_bytes();
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => bytes.iter().map(|byte| char::from(*byte)).collect(),
    }
}

pub(crate) fn method_can_have_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
