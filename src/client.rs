use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::header::{AUTHORIZATION, COOKIE, HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info_span, warn};

use crate::ApiResult;
use crate::auth::{AuthConfig, AuthContext, AuthMode, MemoryTokenStore, TokenStore, compose_headers};
use crate::error::{ApiError, NetworkErrorKind};
use crate::observe::{
    ErrorEncountered, Observer, RequestStarted, ResponseReceived, RetryScheduled, notify_observers,
};
use crate::request::{CallOptions, ExecutionOptions, RequestBuilder, RequestDescriptor};
use crate::response::{ApiResponse, parse_body};
use crate::retry::{AttemptRecord, RetryPolicy};
use crate::transport::{Transport, TransportBody, TransportError, TransportRequest, TransportResponse};
use crate::util::{
    normalize_base_url, parse_header_name, parse_header_value, redact_headers,
    redact_uri_for_logs, resolve_url,
};

const DEFAULT_CLIENT_NAME: &str = "apiwire";

pub struct ApiClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    transport: Option<Arc<dyn Transport>>,
    token_store: Option<Arc<dyn TokenStore>>,
    auth_config: AuthConfig,
    retry_policy: Option<RetryPolicy>,
    observers: Vec<Arc<dyn Observer>>,
    client_name: String,
    total_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl ApiClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            transport: None,
            token_store: None,
            auth_config: AuthConfig::default(),
            retry_policy: None,
            observers: Vec::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            total_timeout: None,
            request_timeout: None,
            connect_timeout: None,
        }
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_store(mut self, token_store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(token_store);
        self
    }

    pub fn auth_config(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = auth_config;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry_policy = None;
        self
    }

    pub fn observer<O>(self, observer: O) -> Self
    where
        O: Observer + 'static,
    {
        self.observer_arc(Arc::new(observer))
    }

    pub fn observer_arc(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> ApiResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Time budget for a whole logical call, retries and delays included.
    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    /// Per-exchange timeout of the default transport. Ignored when a custom
    /// transport is supplied.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    /// Connect timeout of the default transport. Ignored when a custom
    /// transport is supplied.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn try_build(self) -> ApiResult<ApiClient> {
        let base_url = normalize_base_url(&self.base_url)?;
        let csrf_header = self.auth_config.csrf_header_name()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(self.request_timeout, self.connect_timeout)?,
        };
        let token_store: Arc<dyn TokenStore> = match self.token_store {
            Some(token_store) => token_store,
            None => Arc::new(MemoryTokenStore::new()),
        };

        Ok(ApiClient {
            inner: Arc::new(ClientShared {
                base_url,
                default_headers: self.default_headers,
                transport,
                token_store,
                sensitive_headers: vec![AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, csrf_header],
                auth_config: self.auth_config,
                client_name: self.client_name,
            }),
            retry_policy: self.retry_policy,
            observers: self.observers,
            total_timeout: self.total_timeout,
        })
    }

    #[track_caller]
    pub fn build(self) -> ApiClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build apiwire client: {error}; use try_build() to handle configuration errors")
        })
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport(
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
) -> ApiResult<Arc<dyn Transport>> {
    let mut builder = crate::transport::HyperTransport::builder();
    if let Some(request_timeout) = request_timeout {
        builder = builder.request_timeout(request_timeout);
    }
    if let Some(connect_timeout) = connect_timeout {
        builder = builder.connect_timeout(connect_timeout);
    }
    let transport: Arc<dyn Transport> = Arc::new(builder.try_build()?);
    Ok(transport)
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport(
    _request_timeout: Option<Duration>,
    _connect_timeout: Option<Duration>,
) -> ApiResult<Arc<dyn Transport>> {
    Err(ApiError::InvalidConfig {
        message: "no transport configured and the hyper-transport feature is disabled".to_owned(),
    })
}

struct ClientShared {
    base_url: String,
    default_headers: HeaderMap,
    transport: Arc<dyn Transport>,
    token_store: Arc<dyn TokenStore>,
    sensitive_headers: Vec<HeaderName>,
    auth_config: AuthConfig,
    client_name: String,
}

/// Entry point shared by every generated resource client.
///
/// Cloning is cheap and clones share the transport and the token store. The
/// client keeps no mutable state across calls; credentials are re-read from
/// the token store for every attempt.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientShared>,
    retry_policy: Option<RetryPolicy>,
    observers: Vec<Arc<dyn Observer>>,
    total_timeout: Option<Duration>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("client_name", &self.inner.client_name)
            .field("retry_policy", &self.retry_policy)
            .field("observers", &self.observers.len())
            .field("total_timeout", &self.total_timeout)
            .finish_non_exhaustive()
    }
}

struct PreparedCall<'a> {
    descriptor: &'a RequestDescriptor,
    url: String,
    redacted_url: String,
    query: Vec<(String, String)>,
    body: TransportBody,
    total_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl PreparedCall<'_> {
    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn budget_exhausted_error(&self) -> TransportError {
        let timeout_ms = self.total_timeout.map(|item| item.as_millis()).unwrap_or(0);
        TransportError::timeout(format!("total timeout of {timeout_ms}ms exceeded"))
    }
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.token_store
    }

    pub fn auth_context(&self) -> AuthContext {
        AuthContext::load(self.inner.token_store.as_ref(), &self.inner.auth_config)
    }

    pub fn set_bearer_token(&self, token: &str) {
        self.inner
            .token_store
            .set(&self.inner.auth_config.bearer_token_key, token);
    }

    pub fn clear_bearer_token(&self) {
        self.inner
            .token_store
            .remove(&self.inner.auth_config.bearer_token_key);
    }

    pub fn set_csrf_token(&self, token: &str) {
        self.inner
            .token_store
            .set(&self.inner.auth_config.csrf_token_key, token);
    }

    pub fn clear_auth(&self) {
        self.clear_bearer_token();
        self.inner
            .token_store
            .remove(&self.inner.auth_config.csrf_token_key);
    }

    pub fn with_retry_policy(&self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy: Some(retry_policy),
            ..self.clone()
        }
    }

    pub fn without_retry(&self) -> Self {
        Self {
            retry_policy: None,
            ..self.clone()
        }
    }

    pub fn with_observer(&self, observer: Arc<dyn Observer>) -> Self {
        let mut client = self.clone();
        client.observers.push(observer);
        client
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    /// Issues `method path` and returns the parsed response body.
    pub async fn call(
        &self,
        method: Method,
        path: impl Into<String>,
        options: CallOptions,
    ) -> ApiResult<serde_json::Value> {
        let (descriptor, execution_options) = options.into_parts(method, path.into());
        let response = self
            .execute_with_options(descriptor, execution_options)
            .await?;
        Ok(response.into_body())
    }

    pub async fn call_json<T>(
        &self,
        method: Method,
        path: impl Into<String>,
        options: CallOptions,
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let (descriptor, execution_options) = options.into_parts(method, path.into());
        self.execute_with_options(descriptor, execution_options)
            .await?
            .json()
    }

    pub async fn execute(&self, descriptor: RequestDescriptor) -> ApiResult<ApiResponse> {
        self.execute_with_options(descriptor, ExecutionOptions::default())
            .await
    }

    pub(crate) async fn execute_with_options(
        &self,
        descriptor: RequestDescriptor,
        execution_options: ExecutionOptions,
    ) -> ApiResult<ApiResponse> {
        descriptor.validate()?;
        let url = resolve_url(&self.inner.base_url, &descriptor.path)?;
        let body = match (&descriptor.body, &descriptor.multipart) {
            (_, Some(form)) => TransportBody::Multipart(form.clone()),
            (Some(body), None) => TransportBody::Bytes(Bytes::from(
                serde_json::to_vec(body).map_err(|source| ApiError::SerializeJson { source })?,
            )),
            (None, None) => TransportBody::Empty,
        };
        let total_timeout = execution_options.total_timeout.or(self.total_timeout);
        let call = PreparedCall {
            descriptor: &descriptor,
            redacted_url: redact_uri_for_logs(&url),
            url,
            query: descriptor.query_pairs(),
            body,
            total_timeout,
            // A budget too large to represent as an instant is unbounded.
            deadline: total_timeout.and_then(|item| Instant::now().checked_add(item)),
        };

        let retry_policy = execution_options
            .retry_policy
            .as_ref()
            .or(self.retry_policy.as_ref());
        match retry_policy {
            Some(retry_policy) => self.run_with_retry(&call, retry_policy).await,
            None => self.run_attempt(&call, 1).await,
        }
    }

    async fn run_with_retry(
        &self,
        call: &PreparedCall<'_>,
        retry_policy: &RetryPolicy,
    ) -> ApiResult<ApiResponse> {
        let started_at = Instant::now();
        let mut attempt = 1_usize;
        loop {
            let error = match self.run_attempt(call, attempt).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if !(error.is_http() || error.is_network()) {
                return Err(error);
            }
            if !retry_policy.should_retry(&error, attempt) {
                return Err(error);
            }

            let delay = retry_policy.retry_delay(&error, attempt);
            if let Some(remaining) = call.remaining()
                && delay >= remaining
            {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retry delay exceeds remaining time budget"
                );
                return Err(error);
            }

            let retries_remaining = retry_policy.max_retries_value().saturating_sub(attempt);
            retry_policy.notify_attempt_failed(&AttemptRecord {
                attempt,
                error: &error,
                elapsed: started_at.elapsed(),
                retries_remaining,
                next_delay: delay,
            });
            notify_observers(&self.observers, |observer| {
                observer.on_retry_scheduled(&RetryScheduled {
                    client: &self.inner.client_name,
                    method: &call.descriptor.method,
                    url: &call.redacted_url,
                    error: &error,
                    attempt,
                    retries_remaining,
                    delay,
                })
            });
            warn!(
                client = %self.inner.client_name,
                method = %call.descriptor.method,
                uri = %call.redacted_url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );

            if !delay.is_zero() {
                sleep(delay).await;
            }
            attempt += 1;
        }
    }

    async fn run_attempt(&self, call: &PreparedCall<'_>, attempt: usize) -> ApiResult<ApiResponse> {
        let descriptor = call.descriptor;
        let auth = match descriptor.auth {
            AuthMode::Inject => self.auth_context(),
            AuthMode::Skip => AuthContext::default(),
        };
        let headers = compose_headers(
            &self.inner.default_headers,
            descriptor,
            &auth,
            &self.inner.auth_config,
        )?;

        let span = info_span!(
            "apiwire.request",
            client = %self.inner.client_name,
            method = %descriptor.method,
            uri = %call.redacted_url,
            attempt = attempt
        );
        self.exchange(call, headers, attempt).instrument(span).await
    }

    async fn exchange(
        &self,
        call: &PreparedCall<'_>,
        headers: HeaderMap,
        attempt: usize,
    ) -> ApiResult<ApiResponse> {
        let method = &call.descriptor.method;
        let logged_headers = redact_headers(&headers, &self.inner.sensitive_headers);
        notify_observers(&self.observers, |observer| {
            observer.on_request_start(&RequestStarted {
                client: &self.inner.client_name,
                method,
                url: &call.redacted_url,
                headers: &logged_headers,
                body: call.descriptor.body.as_ref(),
                attempt,
                timestamp: SystemTime::now(),
            })
        });

        let request = TransportRequest {
            method: method.clone(),
            url: call.url.clone(),
            query: call.query.clone(),
            headers,
            body: call.body.clone(),
        };
        debug!("sending request");
        let started = Instant::now();
        let outcome = match call.remaining() {
            None => self.inner.transport.send(request).await,
            Some(remaining) if remaining.is_zero() => Err(call.budget_exhausted_error()),
            Some(remaining) => match timeout(remaining, self.inner.transport.send(request)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(call.budget_exhausted_error()),
            },
        };
        let elapsed = started.elapsed();
        let result = classify_outcome(method, &call.redacted_url, outcome, elapsed);

        match &result {
            Ok(response) => {
                debug!(
                    status = response.status().as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request completed"
                );
                notify_observers(&self.observers, |observer| {
                    observer.on_response(&ResponseReceived {
                        client: &self.inner.client_name,
                        method,
                        url: &call.redacted_url,
                        status: response.status(),
                        headers: response.headers(),
                        body: response.body(),
                        attempt,
                        timestamp: SystemTime::now(),
                        elapsed,
                    })
                });
            }
            Err(error) => {
                debug!(
                    code = error.code().as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request failed"
                );
                notify_observers(&self.observers, |observer| {
                    observer.on_error(&ErrorEncountered {
                        client: &self.inner.client_name,
                        method,
                        url: &call.redacted_url,
                        error,
                        attempt,
                        timestamp: SystemTime::now(),
                        elapsed,
                    })
                });
            }
        }
        result
    }
}

fn classify_outcome(
    method: &Method,
    uri: &str,
    outcome: Result<TransportResponse, TransportError>,
    elapsed: Duration,
) -> ApiResult<ApiResponse> {
    let response = outcome.map_err(|error| {
        let (kind, source) = error.into_parts();
        ApiError::Network {
            kind,
            method: method.clone(),
            uri: uri.to_owned(),
            source,
        }
    })?;

    if response.status.as_u16() >= 400 {
        let body = parse_body(&response.headers, &response.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&response.body).into_owned())
        });
        return Err(ApiError::Http {
            status: response.status.as_u16(),
            status_text: response.status_text,
            method: method.clone(),
            uri: uri.to_owned(),
            headers: Box::new(response.headers),
            body,
        });
    }

    let body = parse_body(&response.headers, &response.body).map_err(|source| {
        ApiError::Network {
            kind: NetworkErrorKind::Decode,
            method: method.clone(),
            uri: uri.to_owned(),
            source: Box::new(source),
        }
    })?;
    Ok(ApiResponse::new(
        response.status,
        response.status_text,
        response.headers,
        body,
        response.body,
        elapsed,
    ))
}
