use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ApiResult;
use crate::auth::AuthMode;
use crate::client::ApiClient;
use crate::error::ApiError;
use crate::multipart::MultipartForm;
use crate::response::ApiResponse;
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

/// Query parameter value. Lists expand to one `name=value` pair per item.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<QueryValue>),
}

impl QueryValue {
    fn push_pairs(&self, name: &str, pairs: &mut Vec<(String, String)>) {
        match self {
            Self::Str(value) => pairs.push((name.to_owned(), value.clone())),
            Self::Int(value) => pairs.push((name.to_owned(), value.to_string())),
            Self::Float(value) => pairs.push((name.to_owned(), value.to_string())),
            Self::Bool(value) => pairs.push((name.to_owned(), value.to_string())),
            Self::List(items) => {
                for item in items {
                    item.push_pairs(name, pairs);
                }
            }
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i32> for QueryValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for QueryValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for QueryValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T> From<Vec<T>> for QueryValue
where
    T: Into<QueryValue>,
{
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Description of one logical call. Every attempt of the call is built from
/// the same descriptor.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, QueryValue)>,
    pub body: Option<serde_json::Value>,
    pub multipart: Option<MultipartForm>,
    pub headers: HeaderMap,
    pub auth: AuthMode,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            multipart: None,
            headers: HeaderMap::new(),
            auth: AuthMode::Inject,
        }
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.query.len());
        for (name, value) in &self.query {
            value.push_pairs(name, &mut pairs);
        }
        pairs
    }

    pub(crate) fn validate(&self) -> Result<(), ApiError> {
        if self.body.is_some() && self.multipart.is_some() {
            return Err(ApiError::ConflictingBody {
                method: self.method.clone(),
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ExecutionOptions {
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) total_timeout: Option<Duration>,
}

/// Named optional arguments of [`ApiClient::call`].
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub query: Vec<(String, QueryValue)>,
    pub body: Option<serde_json::Value>,
    pub multipart: Option<MultipartForm>,
    pub headers: HeaderMap,
    pub auth: AuthMode,
    pub retry_policy: Option<RetryPolicy>,
    pub total_timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json<T>(self, payload: &T) -> ApiResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body =
            serde_json::to_value(payload).map_err(|source| ApiError::SerializeJson { source })?;
        Ok(self.body(body))
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.multipart = Some(form);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ApiResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn skip_auth(mut self) -> Self {
        self.auth = AuthMode::Skip;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn no_retry(self) -> Self {
        self.retry_policy(RetryPolicy::disabled())
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub(crate) fn into_parts(
        self,
        method: Method,
        path: String,
    ) -> (RequestDescriptor, ExecutionOptions) {
        let descriptor = RequestDescriptor {
            method,
            path,
            query: self.query,
            body: self.body,
            multipart: self.multipart,
            headers: self.headers,
            auth: self.auth,
        };
        let execution_options = ExecutionOptions {
            retry_policy: self.retry_policy,
            total_timeout: self.total_timeout,
        };
        (descriptor, execution_options)
    }
}

pub struct RequestBuilder<'a> {
    client: &'a ApiClient,
    descriptor: RequestDescriptor,
    execution_options: ExecutionOptions,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a ApiClient, method: Method, path: String) -> Self {
        Self {
            client,
            descriptor: RequestDescriptor::new(method, path),
            execution_options: ExecutionOptions::default(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.descriptor.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ApiResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.descriptor.query.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> ApiResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| ApiError::SerializeQuery { source })?;
        self.descriptor.query.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), QueryValue::Str(value.into_owned()))),
        );
        Ok(self)
    }

    pub fn body_value(mut self, body: serde_json::Value) -> Self {
        self.descriptor.body = Some(body);
        self
    }

    pub fn json<T>(self, payload: &T) -> ApiResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body =
            serde_json::to_value(payload).map_err(|source| ApiError::SerializeJson { source })?;
        Ok(self.body_value(body))
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.descriptor.multipart = Some(form);
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.descriptor.auth = AuthMode::Skip;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.execution_options.retry_policy = Some(retry_policy);
        self
    }

    pub fn no_retry(self) -> Self {
        self.retry_policy(RetryPolicy::disabled())
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.execution_options.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    pub async fn send(self) -> ApiResult<ApiResponse> {
        self.client
            .execute_with_options(self.descriptor, self.execution_options)
            .await
    }

    pub async fn send_value(self) -> ApiResult<serde_json::Value> {
        Ok(self.send().await?.into_body())
    }

    pub async fn send_json<T>(self) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        self.send().await?.json()
    }
}
