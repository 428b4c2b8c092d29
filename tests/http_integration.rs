use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::any,
    Router,
};
use request_orchestrator::{
    retry::NoJitter, Body, RequestConfig, RequestError, RequestOrchestrator, ReqwestTransport,
    RetryPolicy,
};
use serde_json::json;

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn text(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct SeenRequest {
    method: Method,
    content_type: Option<String>,
    body: String,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    hits: Arc<AtomicUsize>,
}

async fn handler(
    State(state): State<MockState>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .seen
        .lock()
        .expect("request log mutex must not be poisoned")
        .push(SeenRequest {
            method,
            content_type: headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            body,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::text(StatusCode::INTERNAL_SERVER_ERROR, "no mock response available")
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (response.status, response.body)
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<SeenRequest> {
        self.seen
            .lock()
            .expect("request log mutex must not be poisoned")
            .clone()
    }

    fn orchestrator(&self) -> RequestOrchestrator {
        let transport = ReqwestTransport::new()
            .with_base_url(&self.base_url)
            .expect("mock server url must parse");
        RequestOrchestrator::new(transport)
            .with_retry_policy(fast_retry(3))
            .with_jitter(Arc::new(NoJitter))
    }
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_retries(max_retries)
        .with_base_delay_ms(10)
        .with_max_delay_ms(40)
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        seen: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/items", any(handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        seen: state.seen,
        task,
    }
}

#[tokio::test]
async fn get_response_is_cached() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::OK, "[1,2,3]")]).await;
    let orchestrator = server.orchestrator();

    let first = orchestrator.get("/items").await.expect("first GET must succeed");
    let second = orchestrator.get("/items").await.expect("cached GET must succeed");

    assert_eq!(first, second);
    assert_eq!(first.json::<Vec<u32>>().expect("body must be JSON"), vec![1, 2, 3]);
    assert_eq!(server.hits(), 1);

    let stats = orchestrator.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.successful_requests, 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = spawn_server(vec![
        MockResponse::text(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
        MockResponse::text(StatusCode::SERVICE_UNAVAILABLE, "busy"),
        MockResponse::text(StatusCode::OK, "ok"),
    ])
    .await;
    let orchestrator = server.orchestrator();

    let response = orchestrator
        .execute(RequestConfig::post("/items", json!({"n": 1})))
        .await
        .expect("third attempt must succeed");

    assert_eq!(response.body, "ok");
    assert_eq!(server.hits(), 3);
    assert_eq!(orchestrator.stats().retried_requests, 2);
}

#[tokio::test]
async fn not_found_fails_without_retry() {
    let server = spawn_server(vec![
        MockResponse::text(StatusCode::NOT_FOUND, "missing"),
        MockResponse::text(StatusCode::OK, "unreachable"),
    ])
    .await;
    let orchestrator = server.orchestrator();

    let err = orchestrator
        .get("/items")
        .await
        .expect_err("404 must not be retried into success");

    assert_eq!(
        err,
        RequestError::Http {
            status: 404,
            body: "missing".to_owned()
        }
    );
    assert_eq!(server.hits(), 1);
    assert_eq!(orchestrator.stats().network_errors, 0);
}

#[tokio::test]
async fn post_sends_json_body_with_content_type() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::CREATED, "{}")]).await;
    let orchestrator = server.orchestrator();

    orchestrator
        .post("/items", Body::json(&json!({"x": 1})).expect("body must serialize"))
        .await
        .expect("POST must succeed");

    let seen = server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, Method::POST);
    assert_eq!(seen[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(seen[0].body, r#"{"x":1}"#);
}

#[tokio::test]
async fn get_never_carries_a_body() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::OK, "ok")]).await;
    let orchestrator = server.orchestrator();

    orchestrator
        .execute(RequestConfig::get("/items").with_body("ignored"))
        .await
        .expect("GET must succeed");

    let seen = server.seen();
    assert_eq!(seen[0].method, Method::GET);
    assert!(seen[0].body.is_empty());
}

#[tokio::test]
async fn concurrent_identical_gets_share_one_exchange() {
    let server = spawn_server(vec![
        MockResponse::text(StatusCode::OK, "shared").with_delay(Duration::from_millis(100)),
    ])
    .await;
    let orchestrator = server.orchestrator();

    let (a, b, c) = tokio::join!(
        orchestrator.get("/items"),
        orchestrator.get("/items"),
        orchestrator.get("/items"),
    );

    for response in [a, b, c] {
        assert_eq!(response.expect("shared GET must succeed").body, "shared");
    }
    assert_eq!(server.hits(), 1);
    assert_eq!(orchestrator.stats().duplicate_requests, 2);
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = spawn_server(vec![
        MockResponse::text(StatusCode::OK, "late").with_delay(Duration::from_millis(500)),
    ])
    .await;
    let orchestrator = server.orchestrator();

    let err = orchestrator
        .execute(
            RequestConfig::get("/items")
                .with_timeout_ms(50)
                .with_retry(RetryPolicy::disabled()),
        )
        .await
        .expect_err("request must time out");

    assert_eq!(err, RequestError::Timeout { timeout_ms: 50 });
    assert_eq!(orchestrator.pending_request_count(), 0);
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind probe listener");
    let address = listener.local_addr().expect("must have local addr");
    drop(listener);

    let orchestrator = RequestOrchestrator::new(ReqwestTransport::new())
        .with_retry_policy(RetryPolicy::disabled());
    let err = orchestrator
        .get(format!("http://{address}/items"))
        .await
        .expect_err("closed port must fail");

    assert!(err.is_transport(), "unexpected error: {err:?}");
    let stats = orchestrator.stats();
    assert_eq!(stats.network_errors, 1);
    assert_eq!(stats.failed_requests, 1);
}
