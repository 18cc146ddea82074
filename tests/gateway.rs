use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use throttle_gateway::clock::ManualClock;
use throttle_gateway::config::{Args, Settings};
use throttle_gateway::error::StoreError;
use throttle_gateway::models::CheckResponse;
use throttle_gateway::state::AppState;
use throttle_gateway::store::{CounterStore, Increment, MemoryStore, WindowRecord};
use tokio::net::TcpListener;
use tower::ServiceExt;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ))
}

fn gateway_with_store(
    extra: &[&str],
    clock: Arc<ManualClock>,
    store: Arc<dyn CounterStore>,
) -> Router {
    let argv = std::iter::once("throttle-gateway").chain(extra.iter().copied());
    let settings = Settings::from_args(&Args::try_parse_from(argv).unwrap()).unwrap();
    let state = AppState::new(settings, store, clock).unwrap();
    throttle_gateway::router(Arc::new(state))
}

fn gateway(extra: &[&str], clock: Arc<ManualClock>) -> (Router, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (gateway_with_store(extra, clock, store.clone()), store)
}

// Counting store that is always down
struct BrokenStore;

#[async_trait]
impl CounterStore for BrokenStore {
    async fn get(&self, _: &str, _: DateTime<Utc>) -> Result<Option<WindowRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn increment_or_init(
        &self,
        _: &str,
        _: u32,
        _: Duration,
        _: DateTime<Utc>,
    ) -> Result<Increment, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

// Upstream that echoes the path it was asked for
async fn spawn_upstream() -> String {
    let app = Router::new()
        .fallback(|req: Request<Body>| async move { format!("upstream saw {}", req.uri()) });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn from_ip(uri: &str, ip: &str) -> Request<Body> {
    let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::new(ip.parse().unwrap(), 40_000)));
    req
}

fn check(scope: &str, identity: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/throttle/check")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "scope": scope, "identity": identity }).to_string(),
        ))
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn health_and_scope_listing() {
    let (app, _) = gateway(&[], clock());

    let response = app.clone().oneshot(from_ip("/health", "127.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    let response = app.oneshot(from_ip("/v1/scopes", "127.0.0.1")).await.unwrap();
    let scopes = body_json(response).await;
    let scopes = scopes.as_array().unwrap();
    assert_eq!(scopes.len(), 10);
    let login = scopes.iter().find(|s| s["name"] == "login").unwrap();
    assert_eq!(login["limit"], 5);
    assert_eq!(login["window_secs"], 900);
    assert_eq!(login["rate"], "5/15min");
}

#[tokio::test]
async fn decision_api_enforces_login_scope() {
    let clock = clock();
    let (app, _) = gateway(&[], clock.clone());

    for remaining in (0..5).rev() {
        let response = app.clone().oneshot(check("login", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let decision: CheckResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, remaining);
        assert_eq!(decision.retry_after_secs, None);
    }

    clock.advance(Duration::from_secs(100));
    let response = app.clone().oneshot(check("login", "1.2.3.4")).await.unwrap();
    let decision: CheckResponse = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.retry_after_secs, Some(800));

    clock.advance(Duration::from_secs(800));
    let response = app.clone().oneshot(check("login", "1.2.3.4")).await.unwrap();
    let decision: CheckResponse = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 4);

    let status = Request::builder()
        .uri("/v1/throttle/status?scope=login&identity=1.2.3.4")
        .body(Body::empty())
        .unwrap();
    let window = body_json(app.oneshot(status).await.unwrap()).await;
    assert_eq!(window["window"]["count"], 1);
    assert_eq!(window["window"]["limit"], 5);
}

#[tokio::test]
async fn decision_api_rejects_unknown_scope_without_recording() {
    let (app, store) = gateway(&[], clock());

    let response = app.clone().oneshot(check("nope", "u")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let response = app.oneshot(check("login", "")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.is_empty());
}

#[tokio::test]
async fn proxy_throttles_route_scope_per_address() {
    let upstream = spawn_upstream().await;
    let (app, _) = gateway(
        &["--upstream", upstream.as_str(), "--route", "/api/auth/login=login"],
        clock(),
    );

    for remaining in (0..5).rev() {
        let response = app
            .clone()
            .oneshot(from_ip("/api/auth/login?next=/home", "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(
            response.headers()["x-ratelimit-remaining"],
            remaining.to_string().as_str()
        );
        assert_eq!(body_text(response).await, "upstream saw /api/auth/login?next=/home");
    }

    let response = app
        .clone()
        .oneshot(from_ip("/api/auth/login", "1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "900");
    assert_eq!(
        body_json(response).await["detail"],
        "Request was throttled. Expected available in 900 seconds."
    );

    let response = app
        .oneshot(from_ip("/api/auth/login", "5.6.7.8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn default_scopes_split_anonymous_and_authenticated() {
    let upstream = spawn_upstream().await;
    let (app, _) = gateway(
        &["--upstream", upstream.as_str(), "--scope", "anon=2/min", "--scope", "user=3/min"],
        clock(),
    );

    for _ in 0..2 {
        let response = app.clone().oneshot(from_ip("/surveys", "9.9.9.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(from_ip("/surveys", "9.9.9.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // same address, but authenticated: counted against the user budget
    for expected in [StatusCode::OK, StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS] {
        let mut req = from_ip("/surveys", "9.9.9.9");
        req.headers_mut()
            .insert("x-authenticated-user", "17".parse().unwrap());
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), expected);
    }
}

#[tokio::test]
async fn gateway_endpoints_are_not_throttled() {
    let (app, _) = gateway(&["--scope", "anon=1/min"], clock());
    for _ in 0..5 {
        let response = app.clone().oneshot(from_ip("/health", "9.9.9.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn request_without_identity_is_rejected() {
    let (app, store) = gateway(&[], clock());
    let req = Request::builder().uri("/anything").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.is_empty());
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    // grab a free port, then close it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let (app, _) = gateway(&["--upstream", upstream.as_str()], clock());
    let response = app.oneshot(from_ip("/surveys", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn longest_wait_wins_when_several_scopes_deny() {
    let upstream = spawn_upstream().await;

    // anon (second scope checked) has the longer wait
    let clock_a = clock();
    let (app, _) = gateway(
        &["--upstream", upstream.as_str(), "--route", "/x=login", "--scope", "anon=1/hour"],
        clock_a.clone(),
    );
    let response = app.clone().oneshot(from_ip("/x", "4.4.4.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    for _ in 0..4 {
        // login keeps counting while anon refuses
        let response = app.clone().oneshot(from_ip("/x", "4.4.4.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
    clock_a.advance(Duration::from_secs(60));
    let response = app.oneshot(from_ip("/x", "4.4.4.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "3540");

    // route scope (first scope checked) has the longer wait
    let clock_b = clock();
    let (app, _) = gateway(
        &["--upstream", upstream.as_str(), "--route", "/x=login", "--scope", "anon=1/min"],
        clock_b.clone(),
    );
    for _ in 0..5 {
        app.clone().oneshot(from_ip("/x", "4.4.4.4")).await.unwrap();
    }
    clock_b.advance(Duration::from_secs(30));
    let response = app.oneshot(from_ip("/x", "4.4.4.4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "870");
    assert_eq!(
        body_json(response).await["detail"],
        "Request was throttled. Expected available in 870 seconds."
    );
}

#[tokio::test]
async fn store_outage_behind_the_proxy_follows_failure_policy() {
    let upstream = spawn_upstream().await;

    let app = gateway_with_store(
        &["--upstream", upstream.as_str(), "--failure-policy", "closed"],
        clock(),
        Arc::new(BrokenStore),
    );
    let response = app.oneshot(from_ip("/surveys", "3.3.3.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_none());
    assert_eq!(body_json(response).await["detail"], "Request was throttled.");

    let app = gateway_with_store(&["--upstream", upstream.as_str()], clock(), Arc::new(BrokenStore));
    let response = app.oneshot(from_ip("/surveys", "3.3.3.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "upstream saw /surveys");
}
