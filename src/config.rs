use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ApiResult;
use crate::auth::AuthConfig;
use crate::client::ApiClientBuilder;
use crate::error::ApiError;
use crate::retry::RetryPolicy;

/// Serializable retry settings. Missing fields fall back to
/// [`RetryPolicy::standard`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub jitter_ratio: f64,
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let standard = RetryPolicy::standard();
        Self {
            max_retries: standard.max_retries_value(),
            base_delay_ms: standard.base_delay_value().as_millis() as u64,
            backoff_multiplier: standard.backoff_multiplier_value(),
            max_delay_ms: standard.max_delay_value().as_millis() as u64,
            jitter: standard.jitter_value(),
            jitter_ratio: standard.jitter_ratio_value(),
            respect_retry_after: standard.respect_retry_after_value(),
        }
    }
}

impl RetryConfig {
    pub fn into_policy(self) -> RetryPolicy {
        RetryPolicy::standard()
            .max_retries(self.max_retries)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .backoff_multiplier(self.backoff_multiplier)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(self.jitter)
            .jitter_ratio(self.jitter_ratio)
            .respect_retry_after(self.respect_retry_after)
    }
}

/// Client settings as they appear in an SDK's configuration file.
///
/// ```
/// let config = apiwire::ClientConfig::from_json_str(
///     r#"{ "base_url": "https://api.example.com", "retry": { "max_retries": 2 } }"#,
/// )
/// .unwrap();
/// assert_eq!(config.retry.map(|retry| retry.max_retries), Some(2));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub base_url: String,
    pub client_name: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
    /// Absent means a single attempt per call.
    pub retry: Option<RetryConfig>,
    pub auth: AuthConfig,
    pub default_headers: BTreeMap<String, String>,
}

impl ClientConfig {
    pub fn from_json_str(text: &str) -> ApiResult<Self> {
        serde_json::from_str(text).map_err(|source| ApiError::InvalidConfig {
            message: source.to_string(),
        })
    }

    pub fn from_json_value(value: serde_json::Value) -> ApiResult<Self> {
        serde_json::from_value(value).map_err(|source| ApiError::InvalidConfig {
            message: source.to_string(),
        })
    }
}

impl ApiClientBuilder {
    /// Starts a builder from file-based settings. Transport, token store and
    /// observers are still supplied in code.
    pub fn from_config(config: ClientConfig) -> ApiResult<Self> {
        let mut builder = Self::new(config.base_url).auth_config(config.auth);
        if let Some(client_name) = config.client_name {
            builder = builder.client_name(client_name);
        }
        if let Some(request_timeout_ms) = config.request_timeout_ms {
            builder = builder.request_timeout(Duration::from_millis(request_timeout_ms));
        }
        if let Some(connect_timeout_ms) = config.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(connect_timeout_ms));
        }
        if let Some(total_timeout_ms) = config.total_timeout_ms {
            builder = builder.total_timeout(Duration::from_millis(total_timeout_ms));
        }
        if let Some(retry) = config.retry {
            builder = builder.retry_policy(retry.into_policy());
        }
        for (name, value) in &config.default_headers {
            builder = builder.try_default_header(name, value)?;
        }
        Ok(builder)
    }
}
