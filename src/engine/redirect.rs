use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, TRANSFER_ENCODING,
};
use http::{Method, StatusCode};
use url::Url;

use crate::error::{Error, ErrorCode};
use crate::options::{NormalizedOptions, Payload, ensure_supported_protocol};
use crate::response::ResponseHead;
use crate::util::{decode_location, is_cross_origin, is_redirect_status, method_can_have_body};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RedirectPlan {
    pub(crate) url: Url,
    pub(crate) rewrite_to_get: bool,
    pub(crate) cross_origin: bool,
}

fn should_rewrite_to_get(method: &Method, status: StatusCode, method_rewriting: bool) -> bool {
    if !method_can_have_body(method) {
        return false;
    }
    match status {
        StatusCode::SEE_OTHER => true,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => method_rewriting,
        _ => false,
    }
}

/// Resolves the next hop, or `None` when the response is not a redirect
/// the engine should follow.
pub(crate) fn plan(
    options: &NormalizedOptions,
    head: &ResponseHead,
) -> Result<Option<RedirectPlan>, Error> {
    if !options.follow_redirect || !is_redirect_status(head.status) {
        return Ok(None);
    }
    let Some(location) = head.headers.get(LOCATION) else {
        return Ok(None);
    };

    let location = decode_location(location);
    let url = options.url.join(&location).map_err(|source| {
        Error::request(
            ErrorCode::InvalidRedirectLocation,
            format!("invalid redirect location `{location}`: {source}"),
        )
    })?;
    ensure_supported_protocol(&url)?;

    Ok(Some(RedirectPlan {
        cross_origin: is_cross_origin(&options.url, &url),
        rewrite_to_get: should_rewrite_to_get(&options.method, head.status, options.method_rewriting),
        url,
    }))
}

pub(crate) fn apply(options: &mut NormalizedOptions, plan: RedirectPlan) {
    let RedirectPlan {
        mut url,
        rewrite_to_get,
        cross_origin,
    } = plan;

    if rewrite_to_get {
        options.method = Method::GET;
        options.set_payload(Payload::Empty);
        options.headers.remove(CONTENT_LENGTH);
        options.headers.remove(CONTENT_TYPE);
        options.headers.remove(TRANSFER_ENCODING);
    }

    if cross_origin {
        options.headers.remove(HOST);
        options.headers.remove(COOKIE);
        options.headers.remove(AUTHORIZATION);
        let _ = url.set_username("");
        let _ = url.set_password(None);
    } else if url.username().is_empty() && url.password().is_none() {
        let _ = url.set_username(options.url.username());
        let _ = url.set_password(options.url.password());
    }

    options.url = url;
}
