use std::collections::HashMap;
use std::sync::RwLock;

use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::request::RequestDescriptor;
use crate::util::{parse_header_name, parse_header_value};

pub const DEFAULT_BEARER_TOKEN_KEY: &str = "access_token";
pub const DEFAULT_CSRF_TOKEN_KEY: &str = "csrftoken";
pub const DEFAULT_CSRF_HEADER: &str = "X-CSRFToken";

/// Key/value storage the credentials are read from at call time.
///
/// Login and logout flows write to the store; the pipeline only reads it.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub bearer_token_key: String,
    pub csrf_token_key: String,
    pub csrf_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bearer_token_key: DEFAULT_BEARER_TOKEN_KEY.to_owned(),
            csrf_token_key: DEFAULT_CSRF_TOKEN_KEY.to_owned(),
            csrf_header: DEFAULT_CSRF_HEADER.to_owned(),
        }
    }
}

impl AuthConfig {
    pub(crate) fn csrf_header_name(&self) -> Result<HeaderName, ApiError> {
        parse_header_name(&self.csrf_header)
    }
}

/// Credentials in effect for one attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub bearer_token: Option<String>,
    pub csrf_token: Option<String>,
}

impl AuthContext {
    pub fn load(store: &dyn TokenStore, config: &AuthConfig) -> Self {
        Self {
            bearer_token: non_empty(store.get(&config.bearer_token_key)),
            csrf_token: non_empty(store.get(&config.csrf_token_key)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|item| !item.trim().is_empty())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthMode {
    #[default]
    Inject,
    Skip,
}

/// Builds the header set for one attempt.
///
/// Precedence, lowest first: client default headers, caller headers,
/// `Content-Type`, CSRF header, `Authorization`. `Content-Type` defaults to
/// JSON unless the caller set one; it is dropped for multipart payloads so the
/// transport can add the boundary. The CSRF header is added for every method
/// but GET. Both credential headers replace caller values when a token is
/// present, and are skipped entirely under [`AuthMode::Skip`].
pub fn compose_headers(
    default_headers: &HeaderMap,
    descriptor: &RequestDescriptor,
    auth: &AuthContext,
    config: &AuthConfig,
) -> Result<HeaderMap, ApiError> {
    let mut headers = default_headers.clone();
    for name in descriptor.headers.keys() {
        headers.remove(name);
    }
    for (name, value) in &descriptor.headers {
        headers.append(name.clone(), value.clone());
    }

    if descriptor.multipart.is_some() {
        headers.remove(CONTENT_TYPE);
    } else if !descriptor.headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    if descriptor.auth == AuthMode::Skip {
        return Ok(headers);
    }

    if descriptor.method != Method::GET
        && let Some(csrf_token) = &auth.csrf_token
    {
        let name = config.csrf_header_name()?;
        let value = parse_header_value(name.as_str(), csrf_token)?;
        headers.insert(name, value);
    }

    if let Some(bearer_token) = &auth.bearer_token {
        let mut value = parse_header_value(
            AUTHORIZATION.as_str(),
            &format!("Bearer {bearer_token}"),
        )?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}
