//! Tutorloop Orchestrator
//!
//! Drives the tutoring conversation: the per-chat state machine, the
//! accept-before-use parse cache with leveled hints, template routing for
//! hint requests, and the HTTP surface the messaging transport talks to.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod fsm;
pub mod llm;
pub mod orchestrator;
pub mod routing;
pub mod session;
pub mod store;
pub mod templates;

pub use api::{create_router, AppState, ErrorResponse, EventResponse, HealthResponse, SessionView};
pub use cache::{fingerprint, PipelineCache};
pub use config::{Config, CONFIG_FILE_NAME};
pub use error::{ExternalErrorKind, Result, TutorError};
pub use event::{
    Button, ButtonAction, ChatId, Command, EventKind, InboundEvent, OutboundMessage, PhotoPayload,
};
pub use fsm::{can_transition, evaluate, explain_denial, infer_next_state, ChatState, Gate};
pub use llm::{
    AnalogueRequest, AnalogueResult, CheckRequest, CheckResult, Deadline, DetectRequest,
    DetectResult, HintRequest, HintResult, HttpLlmProxy, ImageInput, LlmProxy, NormalizeRequest,
    NormalizeResult, OcrRequest, OcrResult, ParseRequest, ParsedTask, PreviousHint, Stage,
    TaskItem, Verdict, VisualFact, MAX_BUDGET,
};
pub use orchestrator::{SessionOrchestrator, ACCEPT_AUTO, ACCEPT_USER_FIX, ACCEPT_USER_YES};
pub use routing::{
    normalize_text, select_template, ProfileCore, RoutingContext, RoutingEngine,
    TemplateCandidate,
};
pub use session::{
    ChatSession, PendingImage, PipelineContext, SessionStore, MAX_ALBUM_PAGES, MAX_HINT_LEVEL,
};
pub use store::{
    HintCacheEntry, InMemoryRepository, MetricEvent, ParseRecord, Repository, TimelineEvent,
    DEFAULT_LOG_CAPACITY,
};
pub use templates::{TeachingProfile, Template, TemplateRegistry};
