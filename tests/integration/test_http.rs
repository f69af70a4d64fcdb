//! HTTP round-trip tests for Tutorloop
//!
//! Runs the event API and a stand-in LLM proxy on ephemeral ports and talks
//! to both over real sockets, so the `reqwest` client, the wire formats and
//! the time-budget forwarding are exercised together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tutorloop_orchestrator::{
    create_router, AppState, ButtonAction, ChatId, ChatState, Config, EventResponse,
    HealthResponse, HttpLlmProxy, InMemoryRepository, InboundEvent, PhotoPayload,
    SessionOrchestrator, TemplateRegistry,
};

const CHAT: ChatId = 9100;

/// One request as seen by the stand-in proxy.
#[derive(Debug, Clone)]
struct SeenCall {
    path: String,
    header_budget: Option<u64>,
    query_budget: Option<u64>,
    engine_name: Option<String>,
    body: Value,
}

#[derive(Default)]
struct FakeProxy {
    calls: Mutex<Vec<SeenCall>>,
    hint_down: AtomicBool,
}

impl FakeProxy {
    fn paths(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.path.clone()).collect()
    }
}

async fn fake_stage(
    State(proxy): State<Arc<FakeProxy>>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let path = uri.path().to_string();
    proxy.calls.lock().push(SeenCall {
        path: path.clone(),
        header_budget: headers
            .get("x-timeout-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        query_budget: query.get("timeout_ms").and_then(|v| v.parse().ok()),
        engine_name: body
            .get("engine_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        body,
    });

    match path.as_str() {
        "/v1/detect" => Json(json!({"has_task": true, "subject": "math"})).into_response(),
        "/v1/parse" => Json(json!({
            "subject": "math",
            "grade": 7,
            "task_text": "Solve 2x + 4 = 12",
            "items": [{"text": "2x + 4 = 12", "task_type": "equation", "format": "number"}]
        }))
        .into_response(),
        "/v1/hint" if proxy.hint_down.load(Ordering::SeqCst) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"message": "model overloaded"}})),
        )
            .into_response(),
        "/v1/hint" => Json(json!({"hint_text": "What is 2x equal to?"})).into_response(),
        _ => (StatusCode::NOT_FOUND, "no such stage").into_response(),
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

struct Stack {
    api: SocketAddr,
    proxy: Arc<FakeProxy>,
    client: reqwest::Client,
}

impl Stack {
    async fn start() -> Self {
        let proxy = Arc::new(FakeProxy::default());
        let proxy_router = Router::new()
            .route("/v1/:stage", post(fake_stage))
            .with_state(Arc::clone(&proxy));
        let proxy_addr = serve(proxy_router).await;

        let config = Config {
            proxy_base_url: format!("http://{proxy_addr}/"),
            engine: "vision-test".to_string(),
            ..Config::default()
        };
        let registry = TemplateRegistry::from_json(
            r#"{"version":"http-test",
                "profiles":[{"id":"eq","hint_style":"socratic"}],
                "templates":[{"code":"EQ","subject":"math","profile":"eq",
                              "routing":[{"id":"solve","must_have":{"text":["solve"]}}]}]}"#,
        )
        .expect("Failed to build test catalog");
        let orchestrator = SessionOrchestrator::new(
            config.clone(),
            Arc::new(registry),
            Arc::new(InMemoryRepository::new()),
            Arc::new(HttpLlmProxy::new(&config.proxy_base_url, &config.engine)),
        );
        let api = serve(create_router(AppState::new(orchestrator))).await;

        Self {
            api,
            proxy,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, event: &InboundEvent, budget_ms: Option<u64>) -> EventResponse {
        let mut request = self
            .client
            .post(format!("http://{}/api/events", self.api))
            .json(event);
        if let Some(ms) = budget_ms {
            request = request.header("X-Timeout-Ms", ms.to_string());
        }
        let response = request.send().await.expect("event request failed");
        assert!(response.status().is_success());
        response.json().await.expect("invalid event response")
    }
}

#[tokio::test]
async fn test_health_reports_engine_and_catalog() {
    let stack = Stack::start().await;
    let health: HealthResponse = stack
        .client
        .get(format!("http://{}/api/health", stack.api))
        .send()
        .await
        .expect("health request failed")
        .json()
        .await
        .expect("invalid health response");

    assert_eq!(health.status, "ok");
    assert_eq!(health.engine, "vision-test");
    assert_eq!(health.templates, 1);
    assert_eq!(health.catalog_versions, vec!["http-test".to_string()]);
}

#[tokio::test]
async fn test_photo_to_hint_over_http() {
    let stack = Stack::start().await;

    let reply = stack
        .post(&InboundEvent::button(CHAT, ButtonAction::Grade(7)), None)
        .await;
    assert_eq!(reply.state, Some(ChatState::AwaitingTask));

    let reply = stack
        .post(
            &InboundEvent::photo(CHAT, PhotoPayload::jpeg(b"page".to_vec())),
            Some(5_000),
        )
        .await;
    assert_eq!(reply.state, Some(ChatState::Hints));
    assert!(reply.messages[0].text.contains("Solve 2x + 4 = 12"));
    assert_eq!(stack.proxy.paths(), vec!["/v1/detect", "/v1/parse"]);

    let reply = stack
        .post(&InboundEvent::button(CHAT, ButtonAction::Hint), Some(5_000))
        .await;
    assert!(reply.messages[0].text.contains("What is 2x equal to?"));

    let calls = stack.proxy.calls.lock().clone();
    for call in &calls {
        assert_eq!(call.engine_name.as_deref(), Some("vision-test"));
        let budget = call.header_budget.expect("budget header missing");
        assert!(budget > 0 && budget <= 5_000, "budget {budget} out of range");
        assert_eq!(call.query_budget, Some(budget));
    }

    let detect = &calls[0];
    let image = &detect.body["images"][0];
    assert_eq!(image["mime"], "image/jpeg");
    assert_eq!(image["data"], "cGFnZQ==");

    let hint = &calls[2];
    assert_eq!(hint.body["level"], 1);
    assert_eq!(hint.body["profile"]["template_code"], "EQ");
}

#[tokio::test]
async fn test_proxy_error_keeps_chat_usable() {
    let stack = Stack::start().await;
    stack
        .post(&InboundEvent::button(CHAT, ButtonAction::Grade(7)), None)
        .await;
    stack
        .post(
            &InboundEvent::photo(CHAT, PhotoPayload::jpeg(b"page".to_vec())),
            None,
        )
        .await;

    stack.proxy.hint_down.store(true, Ordering::SeqCst);
    let reply = stack
        .post(&InboundEvent::button(CHAT, ButtonAction::Hint), None)
        .await;
    assert_eq!(reply.state, Some(ChatState::Hints));
    assert!(reply.messages[0].offers(ButtonAction::Hint));
    assert!(reply.messages[0].offers(ButtonAction::Report));

    stack.proxy.hint_down.store(false, Ordering::SeqCst);
    let reply = stack
        .post(&InboundEvent::button(CHAT, ButtonAction::Hint), None)
        .await;
    assert!(reply.messages[0].text.starts_with("Hint 1/3"));
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let stack = Stack::start().await;
    let response = stack
        .client
        .get(format!("http://{}/api/sessions/424242", stack.api))
        .send()
        .await
        .expect("session request failed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
