//! HTTP API in front of the session orchestrator.
//!
//! The messaging transport posts every inbound event here and delivers the
//! returned messages to the chat.
//!
//! # Endpoints
//!
//! - `POST /api/events` - Handle one inbound event
//! - `GET /api/sessions/:chat_id` - Inspect a chat's session
//! - `GET /api/health` - Liveness and catalog summary
//!
//! A transport with its own time budget may send it in the `X-Timeout-Ms`
//! header; it then bounds every proxy call made for the event.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::event::{ChatId, InboundEvent, OutboundMessage};
use crate::fsm::ChatState;
use crate::llm::{Deadline, TIMEOUT_HEADER};
use crate::orchestrator::SessionOrchestrator;
use crate::session::ChatSession;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response body for the events endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    /// Messages to deliver, in order.
    pub messages: Vec<OutboundMessage>,
    /// State of the chat after the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ChatState>,
}

/// Public view of a chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Chat identity.
    pub chat_id: ChatId,
    /// Current FSM state.
    pub state: ChatState,
    /// Active session id.
    pub session_id: String,
    /// Grade on record.
    pub grade: Option<u8>,
    /// Subject of the last parsed task.
    pub subject: Option<String>,
    /// Task type of the last parsed task.
    pub task_type: Option<String>,
    /// Level of the next hint.
    pub next_hint_level: u8,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl From<ChatSession> for SessionView {
    fn from(session: ChatSession) -> Self {
        Self {
            chat_id: session.chat_id,
            state: session.state,
            session_id: session.session_id,
            grade: session.grade,
            subject: session.subject,
            task_type: session.task_type,
            next_hint_level: session.pipeline.next_hint_level,
            updated_at: session.updated_at,
        }
    }
}

/// Response body for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `ok` while the server is up.
    pub status: String,
    /// Proxy engine name.
    pub engine: String,
    /// Number of loaded templates.
    pub templates: usize,
    /// Loaded catalog versions.
    pub catalog_versions: Vec<String>,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The orchestrator every event is handed to.
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl AppState {
    /// Creates a new `AppState` around an orchestrator.
    #[must_use]
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all API endpoints, CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/events", post(handle_event))
        .route("/sessions/:chat_id", get(handle_session))
        .route("/health", get(handle_health));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

fn deadline_from(headers: &HeaderMap) -> Option<Deadline> {
    let raw = headers.get(TIMEOUT_HEADER)?;
    match raw.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(ms) => Some(Deadline::after(Duration::from_millis(ms))),
        None => {
            warn!(header = TIMEOUT_HEADER, "Ignoring malformed timeout header");
            None
        }
    }
}

/// Handler for `POST /api/events`.
async fn handle_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<InboundEvent>,
) -> Json<EventResponse> {
    let chat_id = event.chat_id;
    info!(chat_id, kind = event.kind.label(), "Received event");

    let messages = state
        .orchestrator
        .handle_with_deadline(event, deadline_from(&headers))
        .await;
    let chat_state = match state.orchestrator.session(chat_id) {
        Ok(session) => session.map(|s| s.state),
        Err(e) => {
            warn!(chat_id, error = %e, "Failed to read session after event");
            None
        }
    };

    Json(EventResponse {
        messages,
        state: chat_state,
    })
}

/// Handler for `GET /api/sessions/:chat_id`.
async fn handle_session(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<SessionView>, ApiError> {
    match state.orchestrator.session(chat_id) {
        Ok(Some(session)) => Ok(Json(SessionView::from(session))),
        Ok(None) => Err(ApiError::NotFound(format!("no session for chat {chat_id}"))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// Handler for `GET /api/health`.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.orchestrator.registry();
    Json(HealthResponse {
        status: "ok".to_string(),
        engine: state.orchestrator.engine().to_string(),
        templates: registry.templates().len(),
        catalog_versions: registry.versions().to_vec(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::error::{ExternalErrorKind, Result, TutorError};
    use crate::event::ButtonAction;
    use crate::llm::{
        AnalogueRequest, AnalogueResult, CheckRequest, CheckResult, DetectRequest, DetectResult,
        HintRequest, HintResult, LlmProxy, NormalizeRequest, NormalizeResult, OcrRequest,
        OcrResult, ParseRequest, ParsedTask, Stage,
    };
    use crate::store::InMemoryRepository;
    use crate::templates::TemplateRegistry;

    /// A proxy that is always unreachable.
    struct OfflineProxy;

    fn offline<T>(stage: Stage) -> Result<T> {
        Err(TutorError::external(stage, ExternalErrorKind::Network, "offline"))
    }

    #[async_trait]
    impl LlmProxy for OfflineProxy {
        fn engine(&self) -> &str {
            "offline"
        }
        async fn detect(&self, _: &DetectRequest, _: Deadline) -> Result<DetectResult> {
            offline(Stage::Detect)
        }
        async fn parse(&self, _: &ParseRequest, _: Deadline) -> Result<ParsedTask> {
            offline(Stage::Parse)
        }
        async fn hint(&self, _: &HintRequest, _: Deadline) -> Result<HintResult> {
            offline(Stage::Hint)
        }
        async fn normalize(&self, _: &NormalizeRequest, _: Deadline) -> Result<NormalizeResult> {
            offline(Stage::Normalize)
        }
        async fn check(&self, _: &CheckRequest, _: Deadline) -> Result<CheckResult> {
            offline(Stage::Check)
        }
        async fn analogue(&self, _: &AnalogueRequest, _: Deadline) -> Result<AnalogueResult> {
            offline(Stage::Analogue)
        }
        async fn ocr(&self, _: &OcrRequest, _: Deadline) -> Result<OcrResult> {
            offline(Stage::Ocr)
        }
    }

    fn test_state() -> AppState {
        let registry = TemplateRegistry::from_json(
            r#"{"version":"v1","profiles":[{"id":"p"}],
                "templates":[{"code":"A","subject":"math","profile":"p"}]}"#,
        )
        .unwrap();
        AppState::new(SessionOrchestrator::new(
            Config::default(),
            Arc::new(registry),
            Arc::new(InMemoryRepository::new()),
            Arc::new(OfflineProxy),
        ))
    }

    fn post_event(event: &InboundEvent) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/events")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(event).unwrap()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_catalog() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.engine, "offline");
        assert_eq!(health.templates, 1);
        assert_eq!(health.catalog_versions, vec!["v1"]);
    }

    #[tokio::test]
    async fn test_event_returns_messages_and_state() {
        let router = create_router(test_state());
        let response = router
            .oneshot(post_event(&InboundEvent::button(7, ButtonAction::Grade(5))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: EventResponse = body_json(response).await;
        assert_eq!(body.state, Some(ChatState::AwaitingTask));
        assert!(body.messages[0].text.contains("Grade 5 saved"));
    }

    #[tokio::test]
    async fn test_event_accepts_wire_format() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/events")
                    .header("content-type", "application/json")
                    .header(TIMEOUT_HEADER, "5000")
                    .body(Body::from(r#"{"chat_id":3,"type":"command","command":"help"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: EventResponse = body_json(response).await;
        assert_eq!(body.state, Some(ChatState::AwaitGrade));
        assert!(body.messages[0].text.contains("/new"));
    }

    #[tokio::test]
    async fn test_proxy_failure_still_answers() {
        let state = test_state();
        let router = create_router(state.clone());
        router
            .clone()
            .oneshot(post_event(&InboundEvent::button(9, ButtonAction::Grade(5))))
            .await
            .unwrap();
        let response = router
            .oneshot(post_event(&InboundEvent::photo(
                9,
                crate::event::PhotoPayload::jpeg(vec![1, 2, 3]),
            )))
            .await
            .unwrap();

        let body: EventResponse = body_json(response).await;
        assert_eq!(body.state, Some(ChatState::Detect));
        assert!(body.messages[0].offers(ButtonAction::Report));
    }

    #[tokio::test]
    async fn test_session_view_and_not_found() {
        let state = test_state();
        let router = create_router(state);
        router
            .clone()
            .oneshot(post_event(&InboundEvent::button(11, ButtonAction::Grade(8))))
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/11")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: SessionView = body_json(response).await;
        assert_eq!(view.grade, Some(8));
        assert_eq!(view.next_hint_level, 1);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/404")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
