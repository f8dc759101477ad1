use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use devpulse::cache::{
    CacheConfig, CacheEngine, DisabledWarmLoader, MemoryBackend, StoreBackend, StoreError,
    WarmingConfig,
};
use devpulse::infra::http::{HttpState, REQUEST_ID_HEADER, build_router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

/// In-process backend that counts every command it receives.
#[derive(Default)]
struct CountingBackend {
    inner: MemoryBackend,
    calls: AtomicUsize,
}

impl CountingBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }
    async fn ping(&self) -> Result<(), StoreError> {
        self.hit();
        self.inner.ping().await
    }
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.hit();
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), StoreError> {
        self.hit();
        self.inner.set(key, value, ttl).await
    }
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<bool, StoreError> {
        self.hit();
        self.inner.set_nx(key, value, ttl).await
    }
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.hit();
        self.inner.del(keys).await
    }
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.hit();
        self.inner.exists(key).await
    }
    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        self.hit();
        self.inner.ttl(key).await
    }
    async fn expire(&self, key: &str, ttl: u64) -> Result<bool, StoreError> {
        self.hit();
        self.inner.expire(key, ttl).await
    }
    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        self.hit();
        self.inner.persist(key).await
    }
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.hit();
        self.inner.scan(cursor, pattern, count).await
    }
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.hit();
        self.inner.sadd(key, members).await
    }
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.hit();
        self.inner.smembers(key).await
    }
    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.hit();
        self.inner.srem(key, members).await
    }
}

/// Backend whose every command fails.
struct DownBackend;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[async_trait]
impl StoreBackend for DownBackend {
    fn name(&self) -> &'static str {
        "down"
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Err(down())
    }
    async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(down())
    }
    async fn set(&self, _: &str, _: &str, _: Option<u64>) -> Result<(), StoreError> {
        Err(down())
    }
    async fn set_nx(&self, _: &str, _: &str, _: Option<u64>) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn del(&self, _: &[String]) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn ttl(&self, _: &str) -> Result<i64, StoreError> {
        Err(down())
    }
    async fn expire(&self, _: &str, _: u64) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn persist(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }
    async fn scan(&self, _: u64, _: &str, _: usize) -> Result<(u64, Vec<String>), StoreError> {
        Err(down())
    }
    async fn sadd(&self, _: &str, _: &[String]) -> Result<u64, StoreError> {
        Err(down())
    }
    async fn smembers(&self, _: &str) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
    async fn srem(&self, _: &str, _: &[String]) -> Result<u64, StoreError> {
        Err(down())
    }
}

fn engine(backend: Arc<dyn StoreBackend>) -> CacheEngine {
    CacheEngine::new(
        backend,
        CacheConfig::default(),
        WarmingConfig::default(),
        Arc::new(DisabledWarmLoader),
    )
    .expect("engine should build")
}

fn app(engine: &CacheEngine) -> Router {
    build_router(HttpState::new(engine.clone()))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

async fn post(app: &Router, body: Value) -> (StatusCode, Value) {
    send(app, Method::POST, "/api/cache", Some(body)).await
}

#[tokio::test]
async fn invalidate_user_without_user_id_never_touches_the_store() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend.clone());
    let app = app(&engine);

    let (status, body) = post(&app, json!({"action": "invalidate_user"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");
    assert_eq!(body["error"]["hint"], "userId is required");
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn blank_user_id_is_rejected_like_a_missing_one() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend.clone());
    let app = app(&engine);

    let (status, _) = post(&app, json!({"action": "invalidate_github", "userId": "  "})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn set_then_get_uses_category_ttl() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);

    let (status, body) = post(
        &app,
        json!({"action": "set", "key": "dashboard:u1", "value": {"widgets": 3}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send(&app, Method::GET, "/api/cache?key=dashboard:u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["key"], "devpulse:dashboard:u1");
    assert_eq!(body["value"], json!({"widgets": 3}));
    let ttl = body["ttl"].as_i64().expect("ttl");
    assert!(ttl > 0 && ttl <= 300, "dashboard ttl was {ttl}");
}

#[tokio::test]
async fn missing_entry_reads_as_null() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);

    let (status, body) = send(&app, Method::GET, "/api/cache?key=session:nobody", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], Value::Null);
    assert_eq!(body["ttl"], 0);
}

#[tokio::test]
async fn get_without_key_or_pattern_is_rejected() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let (status, _) = send(&app(&engine), Method::GET, "/api/cache", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pattern_lookup_lists_keys_inside_the_namespace() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);
    for key in ["github:u1", "github:u1:api", "slack:u1"] {
        post(&app, json!({"action": "set", "key": key, "value": 1})).await;
    }

    let (status, body) = send(&app, Method::GET, "/api/cache?pattern=github:*", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pattern"], "devpulse:github:*");
    let mut keys: Vec<String> = serde_json::from_value(body["keys"].clone()).expect("keys");
    keys.sort();
    assert_eq!(keys, vec!["devpulse:github:u1", "devpulse:github:u1:api"]);
}

#[tokio::test]
async fn invalidate_github_leaves_other_providers() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);
    for key in ["github:u1", "github:u1:api", "github:u10", "slack:u1"] {
        post(&app, json!({"action": "set", "key": key, "value": 1})).await;
    }

    let (status, body) = post(&app, json!({"action": "invalidate_github", "userId": "u1"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated_entries"], 2);

    let store = engine.store();
    assert!(store.exists("devpulse:github:u10").await);
    assert!(store.exists("devpulse:slack:u1").await);
}

#[tokio::test]
async fn delete_by_tag_removes_every_member() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);
    for key in ["api:repos:1", "api:repos:2"] {
        post(
            &app,
            json!({"action": "set", "key": key, "value": "x", "ttl": 60, "tags": ["team"]}),
        )
        .await;
    }

    let (status, body) = send(&app, Method::DELETE, "/api/cache?tag=team", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated_entries"], 2);
    assert!(!engine.store().exists("devpulse:api:repos:1").await);
}

#[tokio::test]
async fn delete_by_tag_spares_entries_rewritten_without_it() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);
    post(
        &app,
        json!({"action": "set", "key": "api:repos:1", "value": 1, "tags": ["team"]}),
    )
    .await;
    post(&app, json!({"action": "set", "key": "api:repos:1", "value": 2})).await;

    let (status, body) = send(&app, Method::DELETE, "/api/cache?tag=team", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated_entries"], 0);
    assert!(engine.store().exists("devpulse:api:repos:1").await);
}

#[tokio::test]
async fn delete_without_selector_is_rejected() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let (status, _) = send(&app(&engine), Method::DELETE, "/api/cache", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_reports_partial_failures() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);
    post(&app, json!({"action": "set", "key": "session:u1", "value": 1})).await;

    let (status, body) = post(
        &app,
        json!({
            "action": "batch_invalidation",
            "operations": [
                {"type": "user", "userId": "u1"},
                {"type": "github"}
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated_entries"], 1);
    assert_eq!(body["data"]["succeeded"], 1);
    assert_eq!(body["data"]["failed"][0]["index"], 1);
}

#[tokio::test]
async fn batch_without_operations_is_rejected() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let (status, _) = post(&app(&engine), json!({"action": "batch_invalidation"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn trigger_event_fires_inline_or_queues() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let app = app(&engine);
    for key in ["github:u1", "dashboard:u1"] {
        post(&app, json!({"action": "set", "key": key, "value": 1})).await;
    }

    let (status, body) = post(
        &app,
        json!({
            "action": "trigger_event",
            "eventType": "push",
            "dataType": "github",
            "context": {"userId": "u1"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invalidated_entries"], 2);
    assert_eq!(body["data"]["matched_triggers"], 1);
    assert_eq!(body["data"]["failed_actions"], 0);

    let (status, body) = post(
        &app,
        json!({
            "action": "trigger_event",
            "eventType": "push",
            "dataType": "github",
            "context": {"userId": "u1"},
            "deferred": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "event queued");
    assert_eq!(engine.triggers().queue().len(), 1);
}

#[tokio::test]
async fn flush_rejects_unknown_category() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let (status, body) = post(
        &app(&engine),
        json!({"action": "flush_namespace", "category": "jira"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["hint"], "unknown category `jira`");
}

#[tokio::test]
async fn unknown_action_is_a_bad_request() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let (status, body) = post(&app(&engine), json!({"action": "explode"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn health_is_ok_while_the_store_answers() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let request = Request::builder()
        .uri("/api/cache/health")
        .body(Body::empty())
        .expect("request should build");
    let response = app(&engine)
        .oneshot(request)
        .await
        .expect("router should respond");

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));

    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["set"], true);
    assert_eq!(body["triggers"]["total"], 7);
}

#[tokio::test]
async fn health_is_unavailable_when_the_store_is_down() {
    let engine = engine(Arc::new(DownBackend));
    let (status, body) = send(&app(&engine), Method::GET, "/api/cache/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["store"]["reachable"], false);
}

#[tokio::test]
async fn store_outage_reads_as_a_miss() {
    let engine = engine(Arc::new(DownBackend));
    let app = app(&engine);

    let (status, body) = send(&app, Method::GET, "/api/cache?key=session:u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], Value::Null);

    let (_, stats) = send(&app, Method::GET, "/api/cache/stats", None).await;
    assert_eq!(stats["misses"], 1);
}

#[tokio::test]
async fn preload_requires_user_and_mode_fields() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend.clone());
    let app = app(&engine);

    let cases = [
        json!({"action": "critical"}),
        json!({"action": "intelligent", "userId": "u1"}),
        json!({"action": "provider-specific", "userId": "u1"}),
        json!({"action": "provider-specific", "userId": "u1", "provider": "jira"}),
    ];
    for case in cases {
        let (status, _) = send(&app, Method::POST, "/api/preload", Some(case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {case}");
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn preload_rejects_paths_outside_the_origin() {
    let backend = Arc::new(CountingBackend::default());
    let engine = engine(backend.clone());
    let app = app(&engine);

    let cases = [
        json!({
            "action": "intelligent",
            "userId": "u1",
            "navigationPatterns": [{"path": "http://127.0.0.1:9/steal", "frequency": 5}]
        }),
        json!({
            "action": "time-based",
            "userId": "u1",
            "timeBasedPaths": ["//evil.test/x"]
        }),
        json!({
            "action": "time-based",
            "userId": "u1",
            "timeBasedPaths": ["/api/../admin"]
        }),
    ];
    for case in cases {
        let (status, body) = send(&app, Method::POST, "/api/preload", Some(case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {case}");
        assert_eq!(body["error"]["code"], "invalid_input");
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn preload_without_origin_skips_every_target() {
    let engine = engine(Arc::new(MemoryBackend::new()));
    let (status, body) = send(
        &app(&engine),
        Method::POST,
        "/api/preload",
        Some(json!({
            "action": "intelligent",
            "userId": "u1",
            "navigationPatterns": [
                {"path": "/github", "frequency": 5},
                {"path": "/slack", "frequency": 2}
            ]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["skipped"], 2);
    assert_eq!(body["data"]["warmed"], 0);
}
