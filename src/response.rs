use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::ApiResult;
use crate::error::ApiError;

/// Successful outcome of a logical call.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    status: StatusCode,
    status_text: String,
    headers: HeaderMap,
    body: serde_json::Value,
    raw: Bytes,
    elapsed: Duration,
}

impl ApiResponse {
    pub(crate) fn new(
        status: StatusCode,
        status_text: String,
        headers: HeaderMap,
        body: serde_json::Value,
        raw: Bytes,
        elapsed: Duration,
    ) -> Self {
        Self {
            status,
            status_text,
            headers,
            body,
            raw,
            elapsed,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw
    }

    /// Transport time of the attempt that produced this response.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn into_body(self) -> serde_json::Value {
        self.body
    }

    pub fn json<T>(&self) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.body).map_err(|source| ApiError::Deserialize { source })
    }
}

fn declares_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

/// Empty bodies become `Null`. A body declared as JSON must parse; anything
/// else is parsed opportunistically and kept as text otherwise.
pub(crate) fn parse_body(
    headers: &HeaderMap,
    raw: &[u8],
) -> Result<serde_json::Value, serde_json::Error> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    if declares_json(headers) {
        return serde_json::from_slice(raw);
    }
    Ok(serde_json::from_slice(raw).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(raw).into_owned())
    }))
}
