//! Caller-supplied interception points.
//!
//! Hooks run in registration order. Hooks that return an
//! [`OptionsPatch`] have it merged into the live options before the next
//! hook sees them. A hook that fails turns into a request error that goes
//! through the usual failure path.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{BoxError, Error, ErrorCode};
use crate::options::{NormalizedOptions, OptionsPatch};
use crate::response::{Response, ResponseHead};
use crate::transport::ResponseLike;

pub type HookFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

pub enum BeforeRequestAction {
    Continue(OptionsPatch),
    /// Skip the transport and use this response instead.
    Respond(ResponseLike),
}

impl BeforeRequestAction {
    pub fn proceed() -> Self {
        Self::Continue(OptionsPatch::default())
    }
}

pub enum AfterResponseAction {
    Continue(Response),
    /// Re-run the request with the patch merged in.
    Retry(OptionsPatch),
}

type InitHook = Arc<dyn Fn(&NormalizedOptions) -> Result<OptionsPatch, BoxError> + Send + Sync>;
type BeforeRequestHook =
    Arc<dyn Fn(&NormalizedOptions) -> HookFuture<BeforeRequestAction> + Send + Sync>;
type BeforeRedirectHook =
    Arc<dyn Fn(&NormalizedOptions, &ResponseHead) -> HookFuture<OptionsPatch> + Send + Sync>;
type BeforeRetryHook =
    Arc<dyn Fn(&NormalizedOptions, &Error, usize) -> HookFuture<OptionsPatch> + Send + Sync>;
type BeforeErrorHook = Arc<dyn Fn(Error) -> HookFuture<Error> + Send + Sync>;
type AfterResponseHook =
    Arc<dyn Fn(Response, &NormalizedOptions) -> HookFuture<AfterResponseAction> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    init: Vec<InitHook>,
    before_request: Vec<BeforeRequestHook>,
    before_redirect: Vec<BeforeRedirectHook>,
    before_retry: Vec<BeforeRetryHook>,
    before_error: Vec<BeforeErrorHook>,
    after_response: Vec<AfterResponseHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Hooks")
            .field("init", &self.init.len())
            .field("before_request", &self.before_request.len())
            .field("before_redirect", &self.before_redirect.len())
            .field("before_retry", &self.before_retry.len())
            .field("before_error", &self.before_error.len())
            .field("after_response", &self.after_response.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs synchronously while the options are normalized.
    pub fn init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&NormalizedOptions) -> Result<OptionsPatch, BoxError> + Send + Sync + 'static,
    {
        self.init.push(Arc::new(hook));
        self
    }

    pub fn before_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(&NormalizedOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BeforeRequestAction, BoxError>> + Send + 'static,
    {
        self.before_request
            .push(Arc::new(move |options: &NormalizedOptions| -> HookFuture<BeforeRequestAction> {
                Box::pin(hook(options))
            }));
        self
    }

    pub fn before_redirect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(&NormalizedOptions, &ResponseHead) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OptionsPatch, BoxError>> + Send + 'static,
    {
        self.before_redirect
            .push(Arc::new(
                move |options: &NormalizedOptions, head: &ResponseHead| -> HookFuture<OptionsPatch> {
                    Box::pin(hook(options, head))
                },
            ));
        self
    }

    pub fn before_retry<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(&NormalizedOptions, &Error, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OptionsPatch, BoxError>> + Send + 'static,
    {
        self.before_retry.push(Arc::new(
            move |options: &NormalizedOptions, error: &Error, retry_count: usize| -> HookFuture<OptionsPatch> {
                Box::pin(hook(options, error, retry_count))
            },
        ));
        self
    }

    pub fn before_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Error, BoxError>> + Send + 'static,
    {
        self.before_error
            .push(Arc::new(move |error: Error| -> HookFuture<Error> {
                Box::pin(hook(error))
            }));
        self
    }

    pub fn after_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Response, &NormalizedOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AfterResponseAction, BoxError>> + Send + 'static,
    {
        self.after_response
            .push(Arc::new(
                move |response: Response, options: &NormalizedOptions| -> HookFuture<AfterResponseAction> {
                    Box::pin(hook(response, options))
                },
            ));
        self
    }

    /// Appends every hook of `other` after the ones already registered.
    pub fn extend(&mut self, other: &Hooks) {
        self.init.extend(other.init.iter().cloned());
        self.before_request
            .extend(other.before_request.iter().cloned());
        self.before_redirect
            .extend(other.before_redirect.iter().cloned());
        self.before_retry.extend(other.before_retry.iter().cloned());
        self.before_error.extend(other.before_error.iter().cloned());
        self.after_response
            .extend(other.after_response.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_empty()
            && self.before_request.is_empty()
            && self.before_redirect.is_empty()
            && self.before_retry.is_empty()
            && self.before_error.is_empty()
            && self.after_response.is_empty()
    }

    pub fn after_response_len(&self) -> usize {
        self.after_response.len()
    }

    /// Keeps only the `afterResponse` hooks before `index`, so a hook that
    /// asked for a retry is not run again on the retried response.
    pub(crate) fn truncate_after_response(&mut self, index: usize) {
        self.after_response.truncate(index);
    }
}

fn hook_error(source: BoxError) -> Error {
    Error::request(ErrorCode::Generic, source)
}

pub(crate) fn run_init(options: &mut NormalizedOptions) -> Result<(), Error> {
    let hooks = options.hooks.init.clone();
    for hook in hooks {
        let patch = hook(options).map_err(hook_error)?;
        patch.apply(options)?;
    }
    Ok(())
}

/// Returns a short-circuit response when a hook supplied one.
pub(crate) async fn run_before_request(
    options: &mut NormalizedOptions,
) -> Result<(Option<ResponseLike>, bool), Error> {
    let hooks = options.hooks.before_request.clone();
    let mut payload_changed = false;
    for hook in hooks {
        match hook(options).await.map_err(hook_error)? {
            BeforeRequestAction::Continue(patch) => {
                payload_changed |= patch.touches_payload();
                patch.apply(options)?;
            }
            BeforeRequestAction::Respond(response) => return Ok((Some(response), payload_changed)),
        }
    }
    Ok((None, payload_changed))
}

pub(crate) async fn run_before_redirect(
    options: &mut NormalizedOptions,
    head: &ResponseHead,
) -> Result<(), Error> {
    let hooks = options.hooks.before_redirect.clone();
    for hook in hooks {
        let patch = hook(options, head).await.map_err(hook_error)?;
        patch.apply(options)?;
    }
    Ok(())
}

pub(crate) async fn run_before_retry(
    options: &mut NormalizedOptions,
    error: &Error,
    retry_count: usize,
) -> Result<(), Error> {
    let hooks = options.hooks.before_retry.clone();
    for hook in hooks {
        let patch = hook(options, error, retry_count).await.map_err(hook_error)?;
        patch.apply(options)?;
    }
    Ok(())
}

/// Threads the error through every `beforeError` hook. A failing hook
/// ends the chain with its own error.
pub(crate) async fn run_before_error(hooks: &Hooks, mut error: Error) -> Error {
    for hook in hooks.before_error.iter() {
        error = match hook(error).await {
            Ok(replaced) => replaced,
            Err(source) => return hook_error(source),
        };
    }
    error
}

pub(crate) async fn run_after_response_hook(
    hooks: &Hooks,
    index: usize,
    response: Response,
    options: &NormalizedOptions,
) -> Option<Result<AfterResponseAction, Error>> {
    let hook = hooks.after_response.get(index)?;
    Some(hook(response, options).await.map_err(hook_error))
}
