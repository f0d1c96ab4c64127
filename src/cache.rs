use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::CACHE_CONTROL;
use http::{HeaderMap, Method, StatusCode};
use tokio::time::Instant;
use url::Url;

use crate::error::BoxError;
use crate::util::lock_unpoisoned;

/// Raw response as stored in a cache, before any content decoding.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<CachedResponse>, BoxError>>;

    /// Stores `response` for at most `ttl`.
    fn put(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<(), BoxError>>;
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Instant, CachedResponse)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<CachedResponse>, BoxError>> {
        let mut entries = lock_unpoisoned(&self.entries);
        let expired = entries
            .get(key)
            .is_some_and(|(expires_at, _)| *expires_at <= Instant::now());
        if expired {
            entries.remove(key);
        }
        let hit = entries.get(key).map(|(_, response)| response.clone());
        drop(entries);
        Box::pin(async move { Ok(hit) })
    }

    fn put(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        let now = Instant::now();
        let mut entries = lock_unpoisoned(&self.entries);
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        entries.insert(key.to_owned(), (now + ttl, response));
        drop(entries);
        Box::pin(async { Ok(()) })
    }
}

pub(crate) fn cache_key(method: &Method, url: &Url) -> String {
    format!("{method} {url}")
}

pub(crate) fn is_cacheable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

/// Lifetime of a storable response, from `cache-control: max-age`.
pub(crate) fn storable_ttl(method: &Method, status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if *method != Method::GET || status != StatusCode::OK {
        return None;
    }
    let mut max_age = None;
    for value in headers.get_all(CACHE_CONTROL) {
        let text = value.to_str().ok()?;
        for directive in text.split(',').map(str::trim) {
            let lower = directive.to_ascii_lowercase();
            if lower == "no-store" || lower == "private" {
                return None;
            }
            if let Some(seconds) = lower.strip_prefix("max-age=") {
                max_age = seconds.trim_matches('"').parse::<u64>().ok();
            }
        }
    }
    max_age.filter(|seconds| *seconds > 0).map(Duration::from_secs)
}
