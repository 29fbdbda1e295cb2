use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get as get_route;
use axum::{Json, Router};
use futures::stream;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tower::ServiceExt;

use keygate::backend::BackendResolver;
use keygate::credentials::{ApiKeyRecord, MemoryCredentialStore};
use keygate::forwarder::HttpForwarder;
use keygate::metrics::{PrometheusMetrics, UNMATCHED_ROUTE};
use keygate::rate_limiter::RateLimiter;
use keygate::{create_app, AppState, Gateway};

const PROXY_ROUTE: &str = "/auth/:apikey";

/// Upstream that echoes what it received. `x-want-status` picks the status.
async fn echo(request: Request) -> Response {
    let status = request
        .headers()
        .get("x-want-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|v| StatusCode::from_u16(v).ok())
        .unwrap_or(StatusCode::OK);
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let forwarded_for = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_length = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap();

    (
        status,
        [("x-upstream", "echo")],
        Json(json!({
            "method": method,
            "path": path,
            "query": query,
            "forwarded_for": forwarded_for,
            "content_length": content_length,
            "body": String::from_utf8_lossy(&body),
        })),
    )
        .into_response()
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new().fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Upstream that sends `first;`, then holds the response open until
/// `release` fires before sending `second`.
async fn stream_chunks(State(release): State<Arc<Notify>>) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        let _ = tx.send(Ok(Bytes::from_static(b"first;"))).await;
        release.notified().await;
        let _ = tx.send(Ok(Bytes::from_static(b"second"))).await;
    });

    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Response::new(Body::from_stream(chunks))
}

async fn spawn_streaming_upstream() -> (SocketAddr, Arc<Notify>) {
    let release = Arc::new(Notify::new());
    let app = Router::new()
        .route("/stream", get_route(stream_chunks))
        .with_state(release.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, release)
}

async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn build_app(upstream: SocketAddr, capacity: u32, refill: f64) -> (Router, Arc<PrometheusMetrics>) {
    let metrics = Arc::new(PrometheusMetrics::new().unwrap());
    let resolver = BackendResolver::parse(&format!("8545=http://{}", upstream)).unwrap();
    let store = MemoryCredentialStore::with_records([ApiKeyRecord::new("K1", "alice", "ethereum")]);

    let gateway = Gateway::new(
        Arc::new(RateLimiter::new(capacity, refill)),
        Arc::new(store),
        Arc::new(resolver),
        Arc::new(HttpForwarder::new(Duration::from_secs(2)).unwrap()),
        metrics.clone(),
    );

    let state = AppState::new(Arc::new(gateway), metrics.clone());
    (create_app(state), metrics)
}

fn get(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_valid_key_forwards_to_upstream() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    let request = Request::builder()
        .method("POST")
        .uri("/auth/K1?backend=8545&path=data")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"jsonrpc":"2.0","method":"eth_blockNumber"}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "echo");

    let echoed = body_json(response).await;
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/data");
    assert_eq!(echoed["query"], Value::Null);
    assert_eq!(
        echoed["body"],
        r#"{"jsonrpc":"2.0","method":"eth_blockNumber"}"#
    );
}

#[tokio::test]
async fn test_upstream_status_is_relayed() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    for status in [201u16, 404, 418, 503] {
        let request = Request::builder()
            .uri("/auth/K1?backend=8545&path=/eth_call")
            .header("x-want-status", status.to_string())
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status().as_u16(), status);
    }
}

#[tokio::test]
async fn test_empty_path_targets_upstream_root() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    let response = app.oneshot(get("/auth/K1?backend=8545")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["path"], "/");
}

#[tokio::test]
async fn test_extra_query_params_are_forwarded() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    let response = app
        .oneshot(get("/auth/K1?backend=8545&path=/eth/v1/node&state=head&path2=x"))
        .await
        .unwrap();

    let echoed = body_json(response).await;
    assert_eq!(echoed["path"], "/eth/v1/node");
    assert_eq!(echoed["query"], "state=head&path2=x");
}

#[tokio::test]
async fn test_client_address_is_appended_to_forwarded_for() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    let mut request = Request::builder()
        .uri("/auth/K1?backend=8545&path=/")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 5555))));

    let echoed = body_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(echoed["forwarded_for"], "203.0.113.9, 10.1.2.3");
}

#[tokio::test]
async fn test_unknown_key_is_unauthorized() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    for uri in ["/auth/K2?backend=8545&path=/", "/auth/?backend=8545", "/auth/K2?backend=nope"] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);

        let body = body_json(response).await;
        assert_eq!(body["error"], "unauthorized");
        assert_eq!(body["code"], 401);
    }
}

#[tokio::test]
async fn test_unknown_backend_is_bad_request() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    for uri in ["/auth/K1?backend=9999&path=/", "/auth/K1?path=/x", "/auth/K1"] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body_json(response).await["error"], "bad_request");
    }
}

#[tokio::test]
async fn test_rate_limit_rejects_second_request() {
    let upstream = spawn_upstream().await;
    let (app, metrics) = build_app(upstream, 1, 0.0);

    let first = app.clone().oneshot(get("/auth/K1?backend=8545")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/auth/K1?backend=8545")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().get(header::RETRY_AFTER).is_none());

    let body = body_json(second).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["code"], 429);
    assert_eq!(metrics.rate_limited_count(), 1);
}

#[tokio::test]
async fn test_rate_limited_response_has_retry_after() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 1, 1.0);

    app.clone().oneshot(get("/auth/K1?backend=8545")).await.unwrap();
    let response = app.oneshot(get("/auth/K1?backend=8545")).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
}

#[tokio::test]
async fn test_unreachable_upstream_is_internal_error() {
    let upstream = closed_port().await;
    let (app, metrics) = build_app(upstream, 100, 0.0);

    let response = app.oneshot(get("/auth/K1?backend=8545&path=/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = body_json(response).await;
    assert_eq!(body["error"], "upstream_unreachable");
    assert!(!body["message"].as_str().unwrap().contains("127.0.0.1"));
    assert_eq!(metrics.upstream_error_count("8545"), 1);
}

#[tokio::test]
async fn test_health_check_does_not_consume_tokens() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 1, 0.0);

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    let response = app.oneshot(get("/auth/K1?backend=8545")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_each_request_is_forwarded_and_counted() {
    let upstream = spawn_upstream().await;
    let (app, metrics) = build_app(upstream, 100, 0.0);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get("/auth/K1?backend=8545&path=/eth_call"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await;
    }
    app.clone().oneshot(get("/auth/bad?backend=8545")).await.unwrap();

    assert_eq!(metrics.request_count("GET", PROXY_ROUTE, 200), 2);
    assert_eq!(metrics.request_count("GET", PROXY_ROUTE, 401), 1);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_counters() {
    let upstream = spawn_upstream().await;
    let (app, metrics) = build_app(upstream, 100, 0.0);

    app.clone().oneshot(get("/no/such/route")).await.unwrap();
    assert_eq!(metrics.request_count("GET", UNMATCHED_ROUTE, 404), 1);

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text
        .lines()
        .any(|line| line.starts_with("http_requests_total{")));
    assert!(text.contains("endpoint=\"unmatched\""));
    assert!(text.contains("http_request_duration_seconds_bucket"));
}

#[tokio::test]
async fn test_response_chunks_are_relayed_as_they_arrive() {
    let (upstream, release) = spawn_streaming_upstream().await;
    let (app, metrics) = build_app(upstream, 100, 0.0);

    let response = app
        .oneshot(get("/auth/K1?backend=8545&path=/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    // The upstream is still holding the response open here.
    let first = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("first chunk should arrive before the upstream finishes")
        .unwrap()
        .unwrap()
        .into_data()
        .unwrap();
    assert_eq!(&first[..], b"first;");
    assert_eq!(metrics.request_count("GET", PROXY_ROUTE, 200), 0);

    release.notify_one();
    let rest = body.collect().await.unwrap().to_bytes();
    assert_eq!(&rest[..], b"second");
    assert_eq!(metrics.request_count("GET", PROXY_ROUTE, 200), 1);
}

#[tokio::test]
async fn test_streamed_request_body_is_forwarded() {
    let upstream = spawn_upstream().await;
    let (app, _) = build_app(upstream, 100, 0.0);

    let chunks = stream::iter(
        ["{\"jsonrpc\":", "\"2.0\",", "\"id\":1}"]
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))),
    );
    let request = Request::builder()
        .method("POST")
        .uri("/auth/K1?backend=8545&path=/")
        .body(Body::from_stream(chunks))
        .unwrap();

    let echoed = body_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(echoed["body"], r#"{"jsonrpc":"2.0","id":1}"#);
    assert_eq!(echoed["content_length"], Value::Null);
}
