//! Serde-backed client configuration.
//!
//! Durations are milliseconds. A header mapped to `null` is rejected, one
//! that is omitted keeps the builder default.

use std::collections::BTreeMap;
use std::time::Duration;

use http::header::HeaderName;
use serde::Deserialize;

use crate::client::ClientBuilder;
use crate::error::{Error, ErrorCode};
use crate::options::HeaderInput;
use crate::retry::RetryOptions;
use crate::timeout::TimeoutBudgets;
use crate::util::{parse_header_name, parse_header_value, parse_method};

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ClientConfig {
    pub prefix_url: Option<String>,
    pub headers: BTreeMap<String, Option<String>>,
    pub user_agent: Option<String>,
    pub timeout: TimeoutBudgets,
    pub retry: Option<RetryConfig>,
    pub follow_redirect: Option<bool>,
    pub max_redirects: Option<usize>,
    pub method_rewriting: Option<bool>,
    pub decompress: Option<bool>,
    pub throw_http_errors: Option<bool>,
    pub ignore_invalid_cookies: Option<bool>,
    pub allow_get_body: Option<bool>,
}

/// Unset fields keep the standard policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryConfig {
    pub limit: Option<usize>,
    pub methods: Option<Vec<String>>,
    pub status_codes: Option<Vec<u16>>,
    pub error_codes: Option<Vec<String>>,
    pub max_retry_after: Option<u64>,
}

impl ClientConfig {
    pub fn from_json_str(raw: &str) -> crate::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|source| Error::invalid_options(format!("invalid client config: {source}")))
    }

    pub(crate) fn apply(self, mut builder: ClientBuilder) -> crate::Result<ClientBuilder> {
        if let Some(prefix_url) = self.prefix_url {
            builder = builder.prefix_url(prefix_url);
        }
        if let Some(user_agent) = self.user_agent {
            builder = builder.user_agent(parse_header_value("user-agent", &user_agent)?);
        }
        for (name, value) in self.headers {
            let (name, input) = header_entry(&name, value.as_deref())?;
            builder = builder.default_header_input(name, input);
        }
        builder = builder.timeouts(self.timeout);
        if let Some(retry) = self.retry {
            builder = builder.retry(retry.into_options()?);
        }
        if let Some(follow_redirect) = self.follow_redirect {
            builder = builder.follow_redirect(follow_redirect);
        }
        if let Some(max_redirects) = self.max_redirects {
            builder = builder.max_redirects(max_redirects);
        }
        if let Some(method_rewriting) = self.method_rewriting {
            builder = builder.method_rewriting(method_rewriting);
        }
        if let Some(decompress) = self.decompress {
            builder = builder.decompress(decompress);
        }
        if let Some(throw_http_errors) = self.throw_http_errors {
            builder = builder.throw_http_errors(throw_http_errors);
        }
        if let Some(ignore_invalid_cookies) = self.ignore_invalid_cookies {
            builder = builder.ignore_invalid_cookies(ignore_invalid_cookies);
        }
        if let Some(allow_get_body) = self.allow_get_body {
            builder = builder.allow_get_body(allow_get_body);
        }
        Ok(builder)
    }
}

impl RetryConfig {
    pub fn into_options(self) -> crate::Result<RetryOptions> {
        let mut options = RetryOptions::standard();
        if let Some(limit) = self.limit {
            options = options.limit(limit);
        }
        if let Some(methods) = self.methods {
            let methods = methods
                .iter()
                .map(|method| parse_method(method))
                .collect::<Result<Vec<_>, _>>()?;
            options = options.methods(methods);
        }
        if let Some(status_codes) = self.status_codes {
            options = options.status_codes(status_codes);
        }
        if let Some(error_codes) = self.error_codes {
            let codes = error_codes
                .iter()
                .map(|code| code.parse::<ErrorCode>())
                .collect::<Result<Vec<_>, _>>()?;
            options = options.error_codes(codes);
        }
        if let Some(max_retry_after) = self.max_retry_after {
            options = options.max_retry_after(Duration::from_millis(max_retry_after));
        }
        Ok(options)
    }
}

fn header_entry(name: &str, value: Option<&str>) -> crate::Result<(HeaderName, HeaderInput)> {
    let name = parse_header_name(name)?;
    let input = match value {
        Some(value) => HeaderInput::Value(parse_header_value(name.as_str(), value)?),
        None => HeaderInput::Null,
    };
    Ok((name, input))
}
