//! `volley` drives HTTP(S) requests through their whole lifecycle: phase
//! timeouts, retries that honour `Retry-After`, credential-safe redirects,
//! hooks, and two consumer surfaces (an event stream and a cancelable
//! promise).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use volley::prelude::{Client, RetryOptions};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .prefix_url("https://api.example.com/v1/")
//!         .timeout(Duration::from_secs(5))
//!         .retry(RetryOptions::standard().limit(3))
//!         .try_build()?;
//!
//!     let item: Item = client.get("items/42").send().json().await?;
//!     println!("item id={}", item.id);
//!
//!     let mut stream = client.get("items/42/export").stream()?;
//!     let head = stream.response().await?;
//!     println!("export status={}", head.status());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Set a `request` budget; other phases are unbounded unless configured.
//! - Bodies supplied as streams are single-use. Prefer `body(..)` when the
//!   request may be retried or redirected with its method kept.

mod cache;
mod client;
mod config;
mod cookies;
mod decode;
mod engine;
mod error;
mod hooks;
mod options;
mod promise;
mod request;
mod response;
mod retry;
mod stream;
mod timeout;
mod timings;
mod transport;
mod util;

pub use crate::cache::{CachedResponse, MemoryCache, ResponseCache};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{ClientConfig, RetryConfig};
pub use crate::cookies::{CookieJar, MemoryCookieJar};
pub use crate::engine::LifecycleEvent;
pub use crate::error::{BoxError, Error, ErrorCode, ErrorContext, TimeoutPhase};
pub use crate::hooks::{AfterResponseAction, BeforeRequestAction, HookFuture, Hooks};
pub use crate::options::{BodySource, HeaderInput, NormalizedOptions, OptionsPatch, SharedBodyStream};
pub use crate::promise::{CancelHandle, ResponsePromise};
pub use crate::request::RequestBuilder;
pub use crate::response::{Progress, Response, ResponseHead};
pub use crate::retry::{
    Clock, DelayCalculator, RetryContext, RetryDecision, RetryOptions, RetryScheduler, SystemClock,
    retry_after_delay,
};
pub use crate::stream::{BodyWriter, RequestStream};
pub use crate::timeout::{Expired, TimeoutBudgets, TimeoutController};
pub use crate::timings::{AttemptEvent, Phases, Timings, TimingTracker};
pub use crate::transport::{
    AttemptProbe, BoxBodyStream, HyperTransport, RequestBody, ResponseBody, ResponseLike,
    Transport, TransportRequest,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CancelHandle, Client, ClientBuilder, ClientConfig, Error, ErrorCode, HeaderInput, Hooks,
        LifecycleEvent, OptionsPatch, RequestStream, Response, ResponsePromise, Result,
        RetryOptions, TimeoutBudgets, TimeoutPhase, Timings,
    };
}

#[cfg(test)]
mod tests;
