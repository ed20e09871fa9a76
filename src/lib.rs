//! `apiwire` is the request pipeline shared by generated API SDK clients.
//!
//! Every call goes through the same steps: credentials are read from a
//! [`TokenStore`], headers are composed, the request is handed to a
//! [`Transport`], the outcome is mapped to either a parsed body or an
//! [`ApiError`], and transient failures are retried with exponential backoff.
//! Lifecycle events are reported to any registered [`Observer`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use apiwire::prelude::{ApiClient, CallOptions, RetryPolicy};
//! use http::Method;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Widget {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::builder("https://api.example.com")
//!         .client_name("widgets-sdk")
//!         .request_timeout(Duration::from_secs(5))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_retries(3)
//!                 .base_delay(Duration::from_millis(200)),
//!         )
//!         .try_build()?;
//!     client.set_bearer_token("token-from-login");
//!
//!     let widget: Widget = client
//!         .call_json(
//!             Method::POST,
//!             "/v1/widgets",
//!             CallOptions::new().body(serde_json::json!({ "name": "demo" })),
//!         )
//!         .await?;
//!     println!("created widget {}", widget.id);
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - No retry policy: one attempt per call. Opt in with
//!   [`RetryPolicy::standard()`].
//! - `Content-Type: application/json` unless the caller sets one or sends
//!   multipart.
//! - The CSRF header is sent for every method except `GET`.

mod auth;
mod client;
mod config;
mod error;
mod multipart;
mod observe;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::auth::{
    AuthConfig, AuthContext, AuthMode, DEFAULT_BEARER_TOKEN_KEY, DEFAULT_CSRF_HEADER,
    DEFAULT_CSRF_TOKEN_KEY, MemoryTokenStore, TokenStore, compose_headers,
};
pub use crate::client::{ApiClient, ApiClientBuilder};
pub use crate::config::{ClientConfig, RetryConfig};
pub use crate::error::{ApiError, ApiErrorCode, NetworkErrorKind};
pub use crate::multipart::{MultipartForm, Part};
pub use crate::observe::{
    ErrorEncountered, NoopObserver, Observer, RequestStarted, ResponseReceived, RetryScheduled,
    TracingObserver,
};
pub use crate::request::{CallOptions, QueryValue, RequestBuilder, RequestDescriptor};
pub use crate::response::ApiResponse;
pub use crate::retry::{
    AttemptObserver, AttemptRecord, RetryClassifier, RetryPolicy, is_retryable_by_default,
};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::{HyperTransport, HyperTransportBuilder};
pub use crate::transport::{
    Transport, TransportBody, TransportError, TransportFuture, TransportRequest, TransportResponse,
};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub mod prelude {
    pub use crate::{
        ApiClient, ApiError, ApiErrorCode, ApiResponse, ApiResult, AuthMode, CallOptions,
        MultipartForm, NetworkErrorKind, Observer, RetryPolicy, TokenStore,
    };
}
