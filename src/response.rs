use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, ErrorContext};
use crate::timings::Timings;
use crate::util::{is_ok_status, truncate_body};

/// Transfer progress of one direction of an attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    pub percent: f64,
    pub transferred: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub(crate) fn new(transferred: u64, total: Option<u64>) -> Self {
        let percent = match total {
            Some(0) => 0.0,
            Some(total) => (transferred as f64 / total as f64).min(1.0),
            None => 0.0,
        };
        Self {
            percent,
            transferred,
            total,
        }
    }

    pub(crate) fn finished(transferred: u64) -> Self {
        Self {
            percent: 1.0,
            transferred,
            total: Some(transferred),
        }
    }
}

/// Status line and metadata, known before the body arrives.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) request_url: Url,
    pub(crate) redirect_urls: Vec<Url>,
    pub(crate) retry_count: usize,
    pub(crate) is_from_cache: bool,
    pub(crate) ip: Option<SocketAddr>,
}

impl ResponseHead {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// URL of the first request in the redirect chain.
    pub fn request_url(&self) -> &Url {
        &self.request_url
    }

    pub fn redirect_urls(&self) -> &[Url] {
        &self.redirect_urls
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn is_from_cache(&self) -> bool {
        self.is_from_cache
    }

    pub fn ip(&self) -> Option<SocketAddr> {
        self.ip
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    head: ResponseHead,
    body: Bytes,
    timings: Timings,
    ok: bool,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, body: Bytes, timings: Timings, follow_redirect: bool) -> Self {
        let ok = is_ok_status(head.status, follow_redirect);
        Self {
            head,
            body,
            timings,
            ok,
        }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn url(&self) -> &Url {
        &self.head.url
    }

    pub fn request_url(&self) -> &Url {
        &self.head.request_url
    }

    pub fn redirect_urls(&self) -> &[Url] {
        &self.head.redirect_urls
    }

    pub fn retry_count(&self) -> usize {
        self.head.retry_count
    }

    pub fn is_from_cache(&self) -> bool {
        self.head.is_from_cache
    }

    pub fn ip(&self) -> Option<SocketAddr> {
        self.head.ip
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// 2xx, 304, or 3xx when redirects were not followed.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn text(&self) -> crate::Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(|source| Error::ParseBody {
            source: Box::new(source),
            body: truncate_body(&self.body),
            context: Box::<ErrorContext>::default(),
        })
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::ParseBody {
            source: Box::new(source),
            body: truncate_body(&self.body),
            context: Box::<ErrorContext>::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(status: StatusCode, headers: HeaderMap, url: &str) -> Self {
        let url = Url::parse(url).expect("test url");
        let head = ResponseHead {
            status,
            version: Version::HTTP_11,
            headers,
            url: url.clone(),
            request_url: url,
            redirect_urls: Vec::new(),
            retry_count: 0,
            is_from_cache: false,
            ip: None,
        };
        let timings = crate::timings::TimingTracker::start(tokio::time::Instant::now(), false)
            .timings()
            .clone();
        Self::new(head, Bytes::new(), timings, true)
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, StatusCode};
    use serde::Deserialize;

    use super::{Progress, Response};

    #[test]
    fn progress_percent_is_bounded() {
        assert_eq!(Progress::new(5, Some(10)).percent, 0.5);
        assert_eq!(Progress::new(20, Some(10)).percent, 1.0);
        assert_eq!(Progress::new(5, None).percent, 0.0);
        assert_eq!(Progress::finished(7).total, Some(7));
    }

    #[test]
    fn json_failure_keeps_truncated_body() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            _id: u64,
        }

        let response = Response::for_tests(StatusCode::OK, HeaderMap::new(), "https://a.test/");
        let error = response.json::<Payload>().unwrap_err();
        assert_eq!(error.code().as_str(), "ERR_BODY_PARSE_FAILURE");
    }
}
