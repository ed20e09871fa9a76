use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Uri};

use crate::error::ApiError;

pub(crate) const REDACTED: &str = "<redacted>";

fn invalid_base_url_error(base_url: &str) -> ApiError {
    ApiError::InvalidBaseUrl {
        base_url: base_url.to_owned(),
    }
}

/// Validates `base_url` and strips a single trailing slash.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<String, ApiError> {
    if base_url.trim().len() != base_url.len() || base_url.is_empty() {
        return Err(invalid_base_url_error(base_url));
    }

    let parsed = url::Url::parse(base_url).map_err(|_| invalid_base_url_error(base_url))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid_base_url_error(base_url));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid_base_url_error(base_url));
    }

    Ok(base_url.strip_suffix('/').unwrap_or(base_url).to_owned())
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let relative = path.trim_start_matches('/');
    match (base_url.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base_url.to_owned(),
        (false, false) => format!("{base_url}/{relative}"),
    }
}

/// Resolves a server-relative path against the base url. Absolute http(s)
/// urls pass through unchanged.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> Result<String, ApiError> {
    let url_text = match path.parse::<Uri>() {
        Ok(uri) if uri.host().is_some() => match uri.scheme_str() {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") =>
            {
                path.to_owned()
            }
            _ => {
                return Err(ApiError::InvalidUri {
                    uri: path.to_owned(),
                });
            }
        },
        _ => join_base_path(base_url, path),
    };
    url_text.parse::<Uri>().map_err(|_| ApiError::InvalidUri {
        uri: url_text.clone(),
    })?;
    Ok(url_text)
}

pub(crate) fn append_query_pairs(url: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return url.to_owned();
    }

    let (without_fragment, fragment) = match url.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (url, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(existing_query) = existing_query {
        for (name, value) in url::form_urlencoded::parse(existing_query.as_bytes()) {
            serializer.append_pair(&name, &value);
        }
    }
    for (name, value) in query_pairs {
        serializer.append_pair(name, value);
    }

    let mut merged = format!("{base}?{}", serializer.finish());
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

/// Strips userinfo, query and fragment so urls can be logged and put in
/// errors without leaking tokens.
pub(crate) fn redact_uri_for_logs(url_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url_text) else {
        return url_text.split('?').next().unwrap_or(url_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn redact_headers(headers: &HeaderMap, sensitive: &[HeaderName]) -> HeaderMap {
    let mut redacted = headers.clone();
    for name in sensitive {
        if redacted.contains_key(name) {
            redacted.insert(name.clone(), HeaderValue::from_static(REDACTED));
        }
    }
    redacted
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, ApiError> {
    name.parse().map_err(|source| ApiError::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, ApiError> {
    value.parse().map_err(|source| ApiError::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}
