use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apiwire::{
    ApiClient, ApiError, ApiErrorCode, CallOptions, ErrorEncountered, MultipartForm,
    NetworkErrorKind, NoopObserver, Observer, RequestStarted, ResponseReceived, RetryPolicy,
    RetryScheduled, TracingObserver, Transport, TransportBody, TransportError, TransportFuture,
    TransportRequest, TransportResponse,
};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

enum Scripted {
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    Fail(NetworkErrorKind),
    Hang,
}

fn respond(status: u16, body: &'static str) -> Scripted {
    Scripted::Respond {
        status,
        headers: vec![("content-type", "application/json")],
        body,
    }
}

struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn new(outcomes: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("lock recorded requests").clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture<'_> {
        self.requests
            .lock()
            .expect("lock recorded requests")
            .push(request);
        let next = self
            .outcomes
            .lock()
            .expect("lock scripted outcomes")
            .pop_front();

        Box::pin(async move {
            match next {
                Some(Scripted::Respond {
                    status,
                    headers,
                    body,
                }) => {
                    let mut header_map = HeaderMap::new();
                    for (name, value) in headers {
                        header_map.insert(name, HeaderValue::from_static(value));
                    }
                    let status = StatusCode::from_u16(status).expect("scripted status is valid");
                    Ok(TransportResponse::new(status, header_map, body))
                }
                Some(Scripted::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Ok(TransportResponse::new(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::new(),
                )),
            }
        })
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
    start_headers: Mutex<Vec<HeaderMap>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock events").clone()
    }

    fn push(&self, event: String) {
        self.events.lock().expect("lock events").push(event);
    }
}

impl Observer for RecordingObserver {
    fn on_request_start(&self, event: &RequestStarted<'_>) {
        self.start_headers
            .lock()
            .expect("lock start headers")
            .push(event.headers.clone());
        self.push(format!("start:{}", event.attempt));
    }

    fn on_response(&self, event: &ResponseReceived<'_>) {
        self.push(format!("response:{}:{}", event.attempt, event.status.as_u16()));
    }

    fn on_error(&self, event: &ErrorEncountered<'_>) {
        self.push(format!(
            "error:{}:{}",
            event.attempt,
            event.error.code().as_str()
        ));
    }

    fn on_retry_scheduled(&self, event: &RetryScheduled<'_>) {
        self.push(format!("retry:{}", event.attempt));
    }
}

struct PanickingObserver;

impl Observer for PanickingObserver {
    fn on_request_start(&self, _event: &RequestStarted<'_>) {
        panic!("observer failure");
    }
}

fn fast_retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy::standard()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(20))
        .jitter(false)
}

fn client_with(transport: &Arc<ScriptedTransport>) -> ApiClient {
    ApiClient::builder("https://api.example.com/v1/")
        .client_name("pipeline-test")
        .transport_arc(transport.clone())
        .try_build()
        .expect("client should build")
}

#[tokio::test(flavor = "current_thread")]
async fn csrf_header_is_sent_on_post_and_omitted_on_get() {
    let transport = ScriptedTransport::new(vec![respond(201, "{}"), respond(200, "[]")]);
    let client = client_with(&transport);
    client.set_bearer_token("token-a");
    client.set_csrf_token("csrf-a");

    client
        .call(
            Method::POST,
            "/items",
            CallOptions::new().body(json!({ "name": "demo" })),
        )
        .await
        .expect("post should succeed");
    client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("get should succeed");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].headers["x-csrftoken"], "csrf-a");
    assert_eq!(requests[0].headers[AUTHORIZATION], "Bearer token-a");
    assert!(!requests[1].headers.contains_key("x-csrftoken"));
    assert_eq!(requests[1].headers[AUTHORIZATION], "Bearer token-a");
}

#[tokio::test(flavor = "current_thread")]
async fn bearer_token_change_applies_to_the_next_call() {
    let transport = ScriptedTransport::new(vec![respond(200, "{}"), respond(200, "{}")]);
    let client = client_with(&transport);

    client.set_bearer_token("first");
    client
        .call(Method::GET, "/me", CallOptions::new())
        .await
        .expect("first call should succeed");
    client.set_bearer_token("second");
    client
        .call(Method::GET, "/me", CallOptions::new())
        .await
        .expect("second call should succeed");

    let requests = transport.requests();
    assert_eq!(requests[0].headers[AUTHORIZATION], "Bearer first");
    assert_eq!(requests[1].headers[AUTHORIZATION], "Bearer second");
}

#[tokio::test(flavor = "current_thread")]
async fn request_carries_url_query_and_json_body() {
    let transport = ScriptedTransport::new(vec![respond(200, r#"{"id":7}"#)]);
    let client = client_with(&transport);

    let body = client
        .call(
            Method::POST,
            "items",
            CallOptions::new()
                .query("tag", vec!["a", "b"])
                .query("limit", 5)
                .body(json!({ "name": "demo" })),
        )
        .await
        .expect("call should succeed");
    assert_eq!(body, json!({ "id": 7 }));

    let requests = transport.requests();
    let request = &requests[0];
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url, "https://api.example.com/v1/items");
    assert_eq!(
        request.full_url(),
        "https://api.example.com/v1/items?tag=a&tag=b&limit=5"
    );
    assert_eq!(request.headers[CONTENT_TYPE], "application/json");
    match &request.body {
        TransportBody::Bytes(bytes) => {
            let sent: Value = serde_json::from_slice(bytes).expect("body should be json");
            assert_eq!(sent, json!({ "name": "demo" }));
        }
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn server_errors_are_retried_until_retries_run_out() {
    let transport = ScriptedTransport::new(vec![
        respond(500, r#"{"detail":"boom-1"}"#),
        respond(500, r#"{"detail":"boom-2"}"#),
        respond(500, r#"{"detail":"boom-3"}"#),
        respond(500, r#"{"detail":"boom-4"}"#),
    ]);
    let client = client_with(&transport).with_retry_policy(fast_retry(3));

    let error = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect_err("persistent 500 should fail");

    assert_eq!(transport.requests().len(), 4);
    match error {
        ApiError::Http { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, json!({ "detail": "boom-4" }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn client_errors_fail_without_retry() {
    let transport = ScriptedTransport::new(vec![respond(404, r#"{"detail":"missing"}"#)]);
    let client = client_with(&transport).with_retry_policy(fast_retry(3));

    let error = client
        .call(Method::GET, "/items/9", CallOptions::new())
        .await
        .expect_err("404 should fail");

    assert_eq!(transport.requests().len(), 1);
    assert_eq!(error.status(), Some(404));
    assert_eq!(error.uri(), Some("https://api.example.com/v1/items/9"));
    match error {
        ApiError::Http {
            status_text, body, ..
        } => {
            assert_eq!(status_text, "Not Found");
            assert_eq!(body["detail"], "missing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn connection_resets_are_retried_and_reported() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Fail(NetworkErrorKind::Read),
        Scripted::Fail(NetworkErrorKind::Read),
        respond(200, r#"{"ok":true}"#),
    ]);
    let records = Arc::new(Mutex::new(Vec::new()));
    let records_clone = Arc::clone(&records);
    let policy = fast_retry(3).on_attempt_failed(move |record| {
        records_clone.lock().expect("lock records").push((
            record.attempt,
            record.error.network_kind(),
            record.retries_remaining,
            record.next_delay,
        ));
    });
    let client = client_with(&transport).with_retry_policy(policy);

    let body = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("third attempt should succeed");

    assert_eq!(body, json!({ "ok": true }));
    assert_eq!(transport.requests().len(), 3);
    assert_eq!(
        *records.lock().expect("lock records"),
        vec![
            (1, Some(NetworkErrorKind::Read), 2, Duration::from_millis(1)),
            (2, Some(NetworkErrorKind::Read), 1, Duration::from_millis(2)),
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn backoff_delays_grow_geometrically() {
    let transport = ScriptedTransport::new(vec![
        respond(503, "{}"),
        respond(503, "{}"),
        respond(503, "{}"),
        respond(503, "{}"),
    ]);
    let delays = Arc::new(Mutex::new(Vec::new()));
    let delays_clone = Arc::clone(&delays);
    let policy = RetryPolicy::standard()
        .max_retries(3)
        .base_delay(Duration::from_millis(5))
        .backoff_multiplier(3.0)
        .jitter(false)
        .on_attempt_failed(move |record| {
            delays_clone
                .lock()
                .expect("lock delays")
                .push(record.next_delay);
        });
    let client = client_with(&transport).with_retry_policy(policy);

    let _ = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect_err("persistent 503 should fail");

    assert_eq!(
        *delays.lock().expect("lock delays"),
        vec![
            Duration::from_millis(5),
            Duration::from_millis(15),
            Duration::from_millis(45),
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn retry_after_header_sets_the_delay() {
    let transport = ScriptedTransport::new(vec![
        Scripted::Respond {
            status: 429,
            headers: vec![("retry-after", "0")],
            body: "slow down",
        },
        respond(200, "{}"),
    ]);
    let delays = Arc::new(Mutex::new(Vec::new()));
    let delays_clone = Arc::clone(&delays);
    let policy = RetryPolicy::standard()
        .max_retries(1)
        .base_delay(Duration::from_secs(5))
        .on_attempt_failed(move |record| {
            delays_clone
                .lock()
                .expect("lock delays")
                .push(record.next_delay);
        });
    let client = client_with(&transport).with_retry_policy(policy);

    client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("retry should succeed");
    assert_eq!(*delays.lock().expect("lock delays"), vec![Duration::ZERO]);
}

#[tokio::test(flavor = "current_thread")]
async fn repeated_calls_get_a_fresh_retry_budget() {
    let transport = ScriptedTransport::new(vec![
        respond(502, "{}"),
        respond(200, r#"{"n":1}"#),
        respond(502, "{}"),
        respond(200, r#"{"n":1}"#),
    ]);
    let client = client_with(&transport).with_retry_policy(fast_retry(1));

    let first = client
        .call(Method::GET, "/counter", CallOptions::new())
        .await
        .expect("first call should succeed");
    let second = client
        .call(Method::GET, "/counter", CallOptions::new())
        .await
        .expect("second call should succeed");

    assert_eq!(first, second);
    assert_eq!(transport.requests().len(), 4);
}

#[tokio::test(flavor = "current_thread")]
async fn observer_sees_events_in_order() {
    let transport = ScriptedTransport::new(vec![respond(500, "{}"), respond(200, "{}")]);
    let observer = Arc::new(RecordingObserver::default());
    let client = client_with(&transport)
        .with_retry_policy(fast_retry(2))
        .with_observer(observer.clone());
    client.set_bearer_token("secret-token");

    client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("retry should succeed");

    assert_eq!(
        observer.events(),
        vec![
            "start:1".to_owned(),
            "error:1:http".to_owned(),
            "retry:1".to_owned(),
            "start:2".to_owned(),
            "response:2:200".to_owned(),
        ]
    );
    let start_headers = observer.start_headers.lock().expect("lock start headers");
    assert!(
        start_headers
            .iter()
            .all(|headers| headers[AUTHORIZATION] == "<redacted>")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn panicking_observer_does_not_change_the_outcome() {
    let transport = ScriptedTransport::new(vec![respond(200, r#"{"ok":true}"#)]);
    let client = client_with(&transport).with_observer(Arc::new(PanickingObserver));

    let body = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("observer panic should be contained");
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test(flavor = "current_thread")]
async fn conflicting_body_fails_before_any_attempt() {
    let transport = ScriptedTransport::new(vec![]);
    let observer = Arc::new(RecordingObserver::default());
    let client = client_with(&transport).with_observer(observer.clone());

    let error = client
        .call(
            Method::POST,
            "/upload",
            CallOptions::new()
                .body(json!({ "a": 1 }))
                .multipart(MultipartForm::new().text("a", "1")),
        )
        .await
        .expect_err("conflicting payloads should be rejected");

    assert_eq!(error.code(), ApiErrorCode::ConflictingBody);
    assert!(transport.requests().is_empty());
    assert!(observer.events().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn multipart_is_passed_to_the_transport_without_content_type() {
    let transport = ScriptedTransport::new(vec![respond(201, "{}")]);
    let client = client_with(&transport);
    client.set_csrf_token("csrf-b");
    let form = MultipartForm::with_boundary("fixed").text("title", "report");

    client
        .post("/upload")
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .multipart(form.clone())
        .send()
        .await
        .expect("upload should succeed");

    let requests = transport.requests();
    assert!(!requests[0].headers.contains_key(CONTENT_TYPE));
    assert_eq!(requests[0].headers["x-csrftoken"], "csrf-b");
    match &requests[0].body {
        TransportBody::Multipart(sent) => assert_eq!(sent, &form),
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn skip_auth_sends_no_credentials() {
    let transport = ScriptedTransport::new(vec![respond(200, "{}")]);
    let client = client_with(&transport);
    client.set_bearer_token("token-a");
    client.set_csrf_token("csrf-a");

    client
        .call(Method::POST, "/login", CallOptions::new().skip_auth())
        .await
        .expect("login should succeed");

    let requests = transport.requests();
    assert!(!requests[0].headers.contains_key(AUTHORIZATION));
    assert!(!requests[0].headers.contains_key("x-csrftoken"));
}

#[tokio::test(flavor = "current_thread")]
async fn custom_classifier_can_retry_conflicts() {
    let transport = ScriptedTransport::new(vec![respond(409, "{}"), respond(200, "{}")]);
    let policy = fast_retry(2).retry_if(|error: &ApiError, _attempt| error.status() == Some(409));
    let client = client_with(&transport).with_retry_policy(policy);

    client
        .call(Method::PUT, "/items/1", CallOptions::new())
        .await
        .expect("conflict should be retried");
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn per_call_no_retry_overrides_client_policy() {
    let transport = ScriptedTransport::new(vec![respond(503, "{}"), respond(200, "{}")]);
    let client = client_with(&transport).with_retry_policy(fast_retry(3));

    let error = client
        .call(Method::GET, "/items", CallOptions::new().no_retry())
        .await
        .expect_err("503 should fail without retry");
    assert_eq!(error.status(), Some(503));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn client_without_retry_policy_makes_one_attempt() {
    let transport = ScriptedTransport::new(vec![
        respond(500, r#"{"detail":"boom"}"#),
        Scripted::Fail(NetworkErrorKind::Connect),
    ]);
    let client = client_with(&transport);
    assert!(client.retry_policy().is_none());

    let error = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect_err("500 should fail on the only attempt");
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(error.code(), ApiErrorCode::Http);
    match error {
        ApiError::Http { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, json!({ "detail": "boom" }));
        }
        other => panic!("unexpected error: {other}"),
    }

    let error = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect_err("connect failure should surface as is");
    assert_eq!(transport.requests().len(), 2);
    assert_eq!(error.network_kind(), Some(NetworkErrorKind::Connect));
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_json_success_is_a_decode_error() {
    let transport = ScriptedTransport::new(vec![respond(200, "{not json")]);
    let client = client_with(&transport);

    let error = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect_err("malformed json should fail");
    assert_eq!(error.network_kind(), Some(NetworkErrorKind::Decode));
}

#[tokio::test(flavor = "current_thread")]
async fn total_timeout_bounds_a_hanging_call() {
    let transport = ScriptedTransport::new(vec![Scripted::Hang, Scripted::Hang]);
    let client = client_with(&transport).with_retry_policy(fast_retry(1));

    let started = std::time::Instant::now();
    let error = client
        .call(
            Method::GET,
            "/slow",
            CallOptions::new().total_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("hanging call should time out");

    assert_eq!(error.network_kind(), Some(NetworkErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "current_thread")]
async fn unrepresentable_total_timeout_means_no_deadline() {
    let transport = ScriptedTransport::new(vec![
        respond(503, "{}"),
        respond(200, r#"{"attempt":2}"#),
        respond(200, r#"{"attempt":3}"#),
        respond(200, r#"{"attempt":4}"#),
    ]);
    let client = ApiClient::builder("https://api.example.com/v1/")
        .transport_arc(transport.clone())
        .retry_policy(fast_retry(2))
        .total_timeout(Duration::MAX)
        .try_build()
        .expect("client should build");

    let body = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("client-wide budget should not overflow");
    assert_eq!(body["attempt"], 2);

    let body = client
        .call(
            Method::GET,
            "/items",
            CallOptions::new().total_timeout(Duration::MAX),
        )
        .await
        .expect("per-call budget should not overflow");
    assert_eq!(body["attempt"], 3);

    let response = client
        .get("/items")
        .total_timeout(Duration::MAX)
        .send()
        .await
        .expect("builder budget should not overflow");
    assert_eq!(response.body()["attempt"], 4);
    assert_eq!(transport.requests().len(), 4);
}

#[tokio::test(flavor = "current_thread")]
async fn typed_responses_deserialize() {
    #[derive(Debug, Deserialize)]
    struct Widget {
        id: u64,
        name: String,
    }

    let transport = ScriptedTransport::new(vec![respond(200, r#"{"id":3,"name":"gear"}"#)]);
    let client = client_with(&transport);

    let widget: Widget = client
        .get("/widgets/3")
        .send_json()
        .await
        .expect("widget should decode");
    assert_eq!(widget.id, 3);
    assert_eq!(widget.name, "gear");
}

#[tokio::test(flavor = "current_thread")]
async fn builtin_observers_leave_results_untouched() {
    let transport = ScriptedTransport::new(vec![respond(503, "{}"), respond(200, r#"{"ok":1}"#)]);
    let client = ApiClient::builder("https://api.example.com")
        .transport_arc(transport.clone())
        .observer(TracingObserver)
        .observer(NoopObserver)
        .retry_policy(fast_retry(1))
        .try_build()
        .expect("client should build");

    let body = client
        .call(Method::GET, "/items", CallOptions::new())
        .await
        .expect("retry should succeed");
    assert_eq!(body, json!({ "ok": 1 }));
}
