use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::error::{BoxError, NetworkErrorKind};
use crate::multipart::MultipartForm;
use crate::util::append_query_pairs;

#[cfg(feature = "hyper-transport")]
pub use hyper_transport::{HyperTransport, HyperTransportBuilder};

pub type TransportFuture<'a> = BoxFuture<'a, Result<TransportResponse, TransportError>>;

/// The network boundary of the pipeline.
///
/// A transport performs exactly one exchange per `send` and never retries on
/// its own. Any failure to obtain a complete HTTP response is a
/// [`TransportError`]; non-2xx statuses are ordinary responses.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> TransportFuture<'_>;
}

#[derive(Clone, Debug)]
pub enum TransportBody {
    Empty,
    Bytes(Bytes),
    /// The transport encodes the form and sets its boundary-bearing
    /// `Content-Type`.
    Multipart(MultipartForm),
}

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: TransportBody,
}

impl TransportRequest {
    pub fn full_url(&self) -> String {
        append_query_pairs(&self.url, &self.query)
    }
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind} failure: {source}")]
pub struct TransportError {
    kind: NetworkErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: NetworkErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn timeout(source: impl Into<BoxError>) -> Self {
        Self::new(NetworkErrorKind::Timeout, source)
    }

    pub fn kind(&self) -> NetworkErrorKind {
        self.kind
    }

    pub(crate) fn into_parts(self) -> (NetworkErrorKind, BoxError) {
        (self.kind, self.source)
    }
}

#[cfg(feature = "hyper-transport")]
mod hyper_transport {
    use std::io::ErrorKind;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use http::header::{CONTENT_TYPE, HeaderValue};
    use http::{Request, Uri};
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper_rustls::HttpsConnectorBuilder;
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;

    use super::{
        Transport, TransportBody, TransportError, TransportFuture, TransportRequest,
        TransportResponse,
    };
    use crate::ApiResult;
    use crate::error::{ApiError, NetworkErrorKind};

    const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
    const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
    const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

    type HyperClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

    pub struct HyperTransportBuilder {
        connect_timeout: Duration,
        request_timeout: Option<Duration>,
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
        max_response_body_bytes: usize,
        http2_only: bool,
    }

    impl Default for HyperTransportBuilder {
        fn default() -> Self {
            Self {
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                request_timeout: None,
                pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
                pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
                max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
                http2_only: false,
            }
        }
    }

    impl HyperTransportBuilder {
        pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
            self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
            self
        }

        /// Bound on one exchange, from sending headers to the end of the
        /// response body. Expiry is reported as a timeout network error.
        pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
            self.request_timeout = Some(request_timeout.max(Duration::from_millis(1)));
            self
        }

        pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
            self.pool_idle_timeout = pool_idle_timeout;
            self
        }

        pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
            self.pool_max_idle_per_host = pool_max_idle_per_host;
            self
        }

        pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
            self.max_response_body_bytes = max_response_body_bytes.max(1);
            self
        }

        pub fn http2_only(mut self, http2_only: bool) -> Self {
            self.http2_only = http2_only;
            self
        }

        pub fn try_build(self) -> ApiResult<HyperTransport> {
            let mut http = HttpConnector::new();
            http.enforce_http(false);
            http.set_connect_timeout(Some(self.connect_timeout));

            let root_store =
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|source| ApiError::InvalidConfig {
                message: format!("failed to initialize tls: {source}"),
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();

            let https = HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http);
            let client: HyperClient = Client::builder(TokioExecutor::new())
                .pool_idle_timeout(self.pool_idle_timeout)
                .pool_max_idle_per_host(self.pool_max_idle_per_host)
                .http2_only(self.http2_only)
                .build(https);

            Ok(HyperTransport {
                client,
                request_timeout: self.request_timeout,
                max_response_body_bytes: self.max_response_body_bytes,
            })
        }
    }

    /// Default transport: pooled hyper client over rustls with webpki roots.
    #[derive(Clone)]
    pub struct HyperTransport {
        client: HyperClient,
        request_timeout: Option<Duration>,
        max_response_body_bytes: usize,
    }

    impl std::fmt::Debug for HyperTransport {
        fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter
                .debug_struct("HyperTransport")
                .field("request_timeout", &self.request_timeout)
                .field("max_response_body_bytes", &self.max_response_body_bytes)
                .finish_non_exhaustive()
        }
    }

    impl HyperTransport {
        pub fn builder() -> HyperTransportBuilder {
            HyperTransportBuilder::default()
        }

        async fn exchange(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let url = request.full_url();
            let uri = url
                .parse::<Uri>()
                .map_err(|source| TransportError::new(NetworkErrorKind::Other, source))?;
            let mut headers = request.headers;
            let body = match request.body {
                TransportBody::Empty => Bytes::new(),
                TransportBody::Bytes(body) => body,
                TransportBody::Multipart(form) => {
                    let content_type = HeaderValue::from_str(&form.content_type())
                        .map_err(|source| TransportError::new(NetworkErrorKind::Other, source))?;
                    headers.insert(CONTENT_TYPE, content_type);
                    form.encode()
                }
            };

            let mut builder = Request::builder().method(request.method).uri(uri);
            if let Some(request_headers) = builder.headers_mut() {
                request_headers.extend(headers);
            }
            let http_request = builder
                .body(Full::new(body))
                .map_err(|source| TransportError::new(NetworkErrorKind::Other, source))?;

            let response = self.client.request(http_request).await.map_err(|source| {
                let kind = classify_transport_error(&source);
                TransportError::new(kind, source)
            })?;
            let (parts, body) = response.into_parts();
            let body = read_all_body_limited(body, self.max_response_body_bytes).await?;
            let status_text = parts
                .extensions
                .get::<hyper::ext::ReasonPhrase>()
                .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
                .unwrap_or_else(|| parts.status.canonical_reason().unwrap_or_default().to_owned());

            Ok(TransportResponse {
                status: parts.status,
                status_text,
                headers: parts.headers,
                body,
            })
        }
    }

    impl Transport for HyperTransport {
        fn send(&self, request: TransportRequest) -> TransportFuture<'_> {
            Box::pin(async move {
                let Some(request_timeout) = self.request_timeout else {
                    return self.exchange(request).await;
                };
                match tokio::time::timeout(request_timeout, self.exchange(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::timeout(format!(
                        "no complete response within {}ms",
                        request_timeout.as_millis()
                    ))),
                }
            })
        }
    }

    async fn read_all_body_limited(
        mut body: Incoming,
        max_bytes: usize,
    ) -> Result<Bytes, TransportError> {
        let mut collected = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame =
                frame.map_err(|source| TransportError::new(NetworkErrorKind::Read, source))?;
            if let Some(data) = frame.data_ref() {
                if collected.len().saturating_add(data.len()) > max_bytes {
                    return Err(TransportError::new(
                        NetworkErrorKind::Other,
                        format!("response body exceeds {max_bytes} bytes"),
                    ));
                }
                collected.extend_from_slice(data);
            }
        }
        Ok(Bytes::from(collected))
    }

    fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> NetworkErrorKind {
        classify_error_chain(error, error.is_connect())
    }

    fn classify_error_chain(
        error: &(dyn std::error::Error + 'static),
        is_connect: bool,
    ) -> NetworkErrorKind {
        if let Some(kind) = io_error_kind(error, is_connect) {
            return kind;
        }

        let text = error_chain_text(error);
        if is_connect {
            if text.contains("dns")
                || text.contains("name or service not known")
                || text.contains("failed to lookup address")
            {
                return NetworkErrorKind::Dns;
            }
            if text.contains("timed out") || text.contains("deadline has elapsed") {
                return NetworkErrorKind::Timeout;
            }
            if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
                return NetworkErrorKind::Tls;
            }
            return NetworkErrorKind::Connect;
        }

        if text.contains("read")
            || text.contains("connection reset")
            || text.contains("broken pipe")
            || text.contains("unexpected eof")
            || text.contains("connection closed")
        {
            return NetworkErrorKind::Read;
        }
        NetworkErrorKind::Other
    }

    /// Maps the first `io::Error` found in the source chain, if its kind is
    /// one the pipeline distinguishes.
    fn io_error_kind(
        error: &(dyn std::error::Error + 'static),
        is_connect: bool,
    ) -> Option<NetworkErrorKind> {
        let mut current = Some(error);
        while let Some(inner) = current {
            if let Some(io_error) = inner.downcast_ref::<std::io::Error>() {
                match io_error.kind() {
                    ErrorKind::TimedOut => return Some(NetworkErrorKind::Timeout),
                    ErrorKind::ConnectionRefused => return Some(NetworkErrorKind::Connect),
                    ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof => {
                        return Some(if is_connect {
                            NetworkErrorKind::Connect
                        } else {
                            NetworkErrorKind::Read
                        });
                    }
                    _ => {}
                }
            }
            current = inner.source();
        }
        None
    }

    fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
        let mut text = error.to_string().to_ascii_lowercase();
        let mut source = error.source();
        while let Some(inner) = source {
            text.push_str(": ");
            text.push_str(&inner.to_string().to_ascii_lowercase());
            source = inner.source();
        }
        text
    }

}
