use http::{HeaderMap, Method};
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Read,
    Decode,
    Other,
}

impl NetworkErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Read => "read",
            Self::Decode => "decode",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiErrorCode {
    Http,
    Network,
    InvalidBaseUrl,
    InvalidUri,
    SerializeJson,
    SerializeQuery,
    InvalidHeaderName,
    InvalidHeaderValue,
    ConflictingBody,
    Deserialize,
    InvalidConfig,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Network => "network",
            Self::InvalidBaseUrl => "invalid_base_url",
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::ConflictingBody => "conflicting_body",
            Self::Deserialize => "deserialize",
            Self::InvalidConfig => "invalid_config",
        }
    }
}

/// Failure of a logical call.
///
/// `Http` and `Network` are produced by an attempt against the server. The
/// remaining variants describe a request that could not be built and are
/// returned before any attempt is made. Retry exhaustion surfaces the last
/// attempt's error unchanged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("http error {status} {status_text} for {method} {uri}")]
    Http {
        status: u16,
        status_text: String,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: serde_json::Value,
    },
    #[error("network error ({kind}) for {method} {uri}: {source}")]
    Network {
        kind: NetworkErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("invalid base url: {base_url}")]
    InvalidBaseUrl { base_url: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("request for {method} {path} sets both a json body and a multipart payload")]
    ConflictingBody { method: Method, path: String },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: String },
}

impl ApiError {
    pub const fn code(&self) -> ApiErrorCode {
        match self {
            Self::Http { .. } => ApiErrorCode::Http,
            Self::Network { .. } => ApiErrorCode::Network,
            Self::InvalidBaseUrl { .. } => ApiErrorCode::InvalidBaseUrl,
            Self::InvalidUri { .. } => ApiErrorCode::InvalidUri,
            Self::SerializeJson { .. } => ApiErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ApiErrorCode::SerializeQuery,
            Self::InvalidHeaderName { .. } => ApiErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ApiErrorCode::InvalidHeaderValue,
            Self::ConflictingBody { .. } => ApiErrorCode::ConflictingBody,
            Self::Deserialize { .. } => ApiErrorCode::Deserialize,
            Self::InvalidConfig { .. } => ApiErrorCode::InvalidConfig,
        }
    }

    pub const fn is_http(&self) -> bool {
        matches!(self, Self::Http { .. })
    }

    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub const fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Target url of the failed attempt, with credentials and query removed.
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::Http { uri, .. } | Self::Network { uri, .. } => Some(uri),
            Self::InvalidUri { uri } => Some(uri),
            _ => None,
        }
    }
}
