use std::collections::BTreeMap;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use url::Url;

use crate::error::BoxError;
use crate::util::lock_unpoisoned;

/// Source of `cookie` headers and sink for `set-cookie` headers.
pub trait CookieJar: Send + Sync {
    fn get_cookie_string(&self, url: &Url) -> BoxFuture<'static, Result<String, BoxError>>;

    fn set_cookie(&self, raw_cookie: &str, url: &Url) -> BoxFuture<'static, Result<(), BoxError>>;
}

/// Host-scoped in-memory jar. Cookie attributes other than the name and
/// value are ignored.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, raw_cookie: &str, url: &Url) -> Result<(), BoxError> {
        let host = url.host_str().ok_or("cookie url has no host")?.to_ascii_lowercase();
        let pair = raw_cookie.split(';').next().unwrap_or_default();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid cookie `{raw_cookie}`"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(format!("invalid cookie name in `{raw_cookie}`").into());
        }
        lock_unpoisoned(&self.cookies)
            .entry(host)
            .or_default()
            .insert(name.to_owned(), value.trim().to_owned());
        Ok(())
    }

    fn cookie_string(&self, url: &Url) -> String {
        let Some(host) = url.host_str() else {
            return String::new();
        };
        let cookies = lock_unpoisoned(&self.cookies);
        cookies
            .get(&host.to_ascii_lowercase())
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default()
    }
}

impl CookieJar for MemoryCookieJar {
    fn get_cookie_string(&self, url: &Url) -> BoxFuture<'static, Result<String, BoxError>> {
        let cookie_string = self.cookie_string(url);
        Box::pin(async move { Ok(cookie_string) })
    }

    fn set_cookie(&self, raw_cookie: &str, url: &Url) -> BoxFuture<'static, Result<(), BoxError>> {
        let stored = self.store(raw_cookie, url);
        Box::pin(async move { stored })
    }
}
