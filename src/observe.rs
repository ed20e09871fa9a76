use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};
use tracing::{info, warn};

use crate::error::ApiError;

#[derive(Debug)]
pub struct RequestStarted<'a> {
    pub client: &'a str,
    pub method: &'a Method,
    pub url: &'a str,
    /// Outgoing headers with credential values redacted.
    pub headers: &'a HeaderMap,
    pub body: Option<&'a serde_json::Value>,
    pub attempt: usize,
    pub timestamp: SystemTime,
}

#[derive(Debug)]
pub struct ResponseReceived<'a> {
    pub client: &'a str,
    pub method: &'a Method,
    pub url: &'a str,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub body: &'a serde_json::Value,
    pub attempt: usize,
    pub timestamp: SystemTime,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ErrorEncountered<'a> {
    pub client: &'a str,
    pub method: &'a Method,
    pub url: &'a str,
    pub error: &'a ApiError,
    pub attempt: usize,
    pub timestamp: SystemTime,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct RetryScheduled<'a> {
    pub client: &'a str,
    pub method: &'a Method,
    pub url: &'a str,
    pub error: &'a ApiError,
    pub attempt: usize,
    pub retries_remaining: usize,
    pub delay: Duration,
}

/// Sink for request lifecycle events.
///
/// Every attempt reports `on_request_start` followed by exactly one of
/// `on_response` or `on_error`. Observers have no say in the outcome; a
/// panicking observer is caught and its event dropped.
pub trait Observer: Send + Sync {
    fn on_request_start(&self, _event: &RequestStarted<'_>) {}

    fn on_response(&self, _event: &ResponseReceived<'_>) {}

    fn on_error(&self, _event: &ErrorEncountered<'_>) {}

    fn on_retry_scheduled(&self, _event: &RetryScheduled<'_>) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards every event to `tracing` under the `apiwire::events` target.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_request_start(&self, event: &RequestStarted<'_>) {
        info!(
            target: "apiwire::events",
            client = event.client,
            method = %event.method,
            url = event.url,
            attempt = event.attempt,
            headers = ?event.headers,
            has_body = event.body.is_some(),
            "request started"
        );
    }

    fn on_response(&self, event: &ResponseReceived<'_>) {
        info!(
            target: "apiwire::events",
            client = event.client,
            method = %event.method,
            url = event.url,
            attempt = event.attempt,
            status = event.status.as_u16(),
            elapsed_ms = event.elapsed.as_millis() as u64,
            "response received"
        );
    }

    fn on_error(&self, event: &ErrorEncountered<'_>) {
        warn!(
            target: "apiwire::events",
            client = event.client,
            method = %event.method,
            url = event.url,
            attempt = event.attempt,
            code = event.error.code().as_str(),
            elapsed_ms = event.elapsed.as_millis() as u64,
            error = %event.error,
            "request failed"
        );
    }

    fn on_retry_scheduled(&self, event: &RetryScheduled<'_>) {
        info!(
            target: "apiwire::events",
            client = event.client,
            method = %event.method,
            url = event.url,
            attempt = event.attempt,
            retries_remaining = event.retries_remaining,
            delay_ms = event.delay.as_millis() as u64,
            "retry scheduled"
        );
    }
}

pub(crate) fn notify_observers<F>(observers: &[Arc<dyn Observer>], notify: F)
where
    F: Fn(&dyn Observer),
{
    for observer in observers {
        if catch_unwind(AssertUnwindSafe(|| notify(observer.as_ref()))).is_err() {
            warn!("observer panicked; event dropped");
        }
    }
}
