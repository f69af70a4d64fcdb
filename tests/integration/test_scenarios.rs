//! End-to-end conversation tests for Tutorloop
//!
//! These tests drive `SessionOrchestrator::handle` the way the transport
//! does, against the sample catalog shipped in `catalog/` and a scripted
//! proxy that counts every external call.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tutorloop_orchestrator::{
    AnalogueRequest, AnalogueResult, ButtonAction, ChatId, ChatState, CheckRequest, CheckResult,
    Command, Config, Deadline, DetectRequest, DetectResult, HintRequest, HintResult,
    InMemoryRepository, InboundEvent, LlmProxy, NormalizeRequest, NormalizeResult, OcrRequest,
    OcrResult, OutboundMessage, ParseRequest, ParsedTask, PhotoPayload, Repository, Result,
    RoutingContext, RoutingEngine, SessionOrchestrator, Stage, TaskItem, TemplateRegistry,
    Verdict, ACCEPT_AUTO, ACCEPT_USER_FIX,
};

const CHAT: ChatId = 7001;
const ENGINE: &str = "scripted";

/// Path to the sample catalog at the workspace root.
fn catalog_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|p| p.parent())
        .map(|p| p.join("catalog"))
        .expect("Failed to find catalog path")
}

fn sample_registry() -> Arc<TemplateRegistry> {
    Arc::new(TemplateRegistry::load_dir(catalog_path()).expect("Failed to load sample catalog"))
}

fn equation(text: &str, grade: u8) -> ParsedTask {
    ParsedTask {
        subject: "math".to_string(),
        grade,
        task_text: text.to_string(),
        items: vec![TaskItem {
            text: text.to_string(),
            task_type: Some("equation".to_string()),
            format: Some("number".to_string()),
            ..TaskItem::default()
        }],
        ..ParsedTask::default()
    }
}

/// A proxy that answers from a fixed script and records every call.
struct CountingProxy {
    task: ParsedTask,
    calls: Mutex<Vec<Stage>>,
    hints: Mutex<Vec<HintRequest>>,
}

impl CountingProxy {
    fn new(task: ParsedTask) -> Self {
        Self {
            task,
            calls: Mutex::new(Vec::new()),
            hints: Mutex::new(Vec::new()),
        }
    }

    fn count(&self, stage: Stage) -> usize {
        self.calls.lock().iter().filter(|s| **s == stage).count()
    }

    fn last_hint(&self) -> HintRequest {
        self.hints.lock().last().cloned().expect("no hint was requested")
    }
}

#[async_trait]
impl LlmProxy for CountingProxy {
    fn engine(&self) -> &str {
        ENGINE
    }

    async fn detect(&self, _: &DetectRequest, _: Deadline) -> Result<DetectResult> {
        self.calls.lock().push(Stage::Detect);
        Ok(DetectResult {
            has_task: true,
            subject: Some("math".to_string()),
            ..DetectResult::default()
        })
    }

    async fn parse(&self, _: &ParseRequest, _: Deadline) -> Result<ParsedTask> {
        self.calls.lock().push(Stage::Parse);
        Ok(self.task.clone())
    }

    async fn hint(&self, request: &HintRequest, _: Deadline) -> Result<HintResult> {
        self.calls.lock().push(Stage::Hint);
        self.hints.lock().push(request.clone());
        Ok(HintResult {
            hint_text: format!("Think about step {}.", request.level),
        })
    }

    async fn normalize(&self, request: &NormalizeRequest, _: Deadline) -> Result<NormalizeResult> {
        self.calls.lock().push(Stage::Normalize);
        Ok(NormalizeResult {
            normalized: request.solution_text.clone(),
            answer: None,
        })
    }

    async fn check(&self, _: &CheckRequest, _: Deadline) -> Result<CheckResult> {
        self.calls.lock().push(Stage::Check);
        Ok(CheckResult {
            verdict: Verdict::Correct,
            feedback: None,
        })
    }

    async fn analogue(&self, _: &AnalogueRequest, _: Deadline) -> Result<AnalogueResult> {
        self.calls.lock().push(Stage::Analogue);
        Ok(AnalogueResult::default())
    }

    async fn ocr(&self, _: &OcrRequest, _: Deadline) -> Result<OcrResult> {
        self.calls.lock().push(Stage::Ocr);
        Ok(OcrResult::default())
    }
}

struct Harness {
    orchestrator: SessionOrchestrator,
    proxy: Arc<CountingProxy>,
    repository: Arc<InMemoryRepository>,
}

impl Harness {
    fn new(task: ParsedTask) -> Self {
        let proxy = Arc::new(CountingProxy::new(task));
        let repository = Arc::new(InMemoryRepository::new());
        let orchestrator = SessionOrchestrator::new(
            Config::default(),
            sample_registry(),
            Arc::clone(&repository) as Arc<dyn Repository>,
            Arc::clone(&proxy) as Arc<dyn LlmProxy>,
        );
        Self {
            orchestrator,
            proxy,
            repository,
        }
    }

    async fn send(&self, event: InboundEvent) -> Vec<OutboundMessage> {
        let out = self.orchestrator.handle(event).await;
        assert!(!out.is_empty(), "every event must be answered");
        out
    }

    async fn press(&self, action: ButtonAction) -> Vec<OutboundMessage> {
        self.send(InboundEvent::button(CHAT, action)).await
    }

    async fn photo(&self, bytes: &[u8]) -> Vec<OutboundMessage> {
        self.send(InboundEvent::photo(CHAT, PhotoPayload::jpeg(bytes.to_vec())))
            .await
    }

    fn state(&self) -> ChatState {
        self.orchestrator
            .session(CHAT)
            .expect("session lookup failed")
            .expect("no session")
            .state
    }

    fn transitions(&self) -> Vec<String> {
        self.repository
            .timeline()
            .into_iter()
            .filter(|e| e.kind == "transition")
            .map(|e| e.detail)
            .collect()
    }
}

/// Tests that the sample catalog and config shipped with the repo load.
#[test]
fn test_sample_catalog_and_config_load() {
    let registry = sample_registry();
    assert!(registry.templates().len() >= 4);
    assert!(registry.versions().iter().any(|v| v == "math-2026.10"));
    assert!(registry.profile("equations").is_some());

    let root = catalog_path().parent().map(PathBuf::from).expect("no root");
    let config = Config::load_from_dir(&root).expect("Failed to load sample config");
    assert_eq!(config.catalog_dir, "catalog");
    assert_eq!(config.routing_subject, "math");
}

/// A photo before any grade is denied; after the grade it runs detection.
#[tokio::test]
async fn test_grade_is_required_before_the_first_task() {
    let h = Harness::new(equation("Solve 2x + 4 = 12", 7));

    let out = h.photo(b"page-1").await;
    assert_eq!(h.state(), ChatState::AwaitGrade);
    assert!(out[0].offers(ButtonAction::Grade(7)));
    assert_eq!(h.proxy.calls.lock().len(), 0);
    assert!(h.repository.timeline().iter().any(|e| e.kind == "denied"));

    h.press(ButtonAction::Grade(7)).await;
    assert_eq!(h.state(), ChatState::AwaitingTask);

    h.photo(b"page-1").await;
    assert_eq!(h.state(), ChatState::Hints);
    let transitions = h.transitions();
    for step in [
        "await_grade -> awaiting_task",
        "awaiting_task -> collecting_pages",
        "collecting_pages -> detect",
        "detect -> parse",
        "parse -> hints",
    ] {
        assert!(
            transitions.iter().any(|t| t == step),
            "missing transition {step} in {transitions:?}"
        );
    }
    assert_eq!(h.proxy.count(Stage::Detect), 1);
    assert_eq!(h.proxy.count(Stage::Parse), 1);
}

/// An unconfirmed parse cannot feed hints; a typed correction accepts it.
#[tokio::test]
async fn test_unconfirmed_parse_is_corrected_by_the_student() {
    let h = Harness::new(ParsedTask {
        needs_user_confirmation: true,
        ..equation("So1ve 2x + 4 = l2", 7)
    });
    h.press(ButtonAction::Grade(7)).await;
    h.photo(b"blurry").await;
    assert_eq!(h.state(), ChatState::Confirm);

    let out = h.press(ButtonAction::Hint).await;
    assert!(out[0].text.contains("confirm the task first"));
    assert_eq!(h.proxy.count(Stage::Hint), 0);

    h.send(InboundEvent::text(CHAT, "Solve 2x + 4 = 12")).await;
    assert_eq!(h.state(), ChatState::Hints);

    let session = h.orchestrator.session(CHAT).expect("lookup").expect("session");
    let record = h
        .repository
        .find_accepted_parse(&session.task_key(), ENGINE)
        .expect("lookup")
        .expect("accepted parse");
    assert_eq!(record.accepted_reason.as_deref(), Some(ACCEPT_USER_FIX));
    assert_eq!(record.task.task_text, "Solve 2x + 4 = 12");

    h.press(ButtonAction::Hint).await;
    assert_eq!(h.proxy.count(Stage::Hint), 1);
    assert_eq!(h.proxy.last_hint().task.task_text, "Solve 2x + 4 = 12");
}

/// Resending the same page reuses the accepted parse and the cached hint.
#[tokio::test]
async fn test_same_page_and_level_hit_the_cache() {
    let h = Harness::new(equation("Solve 2x + 4 = 12", 7));
    h.press(ButtonAction::Grade(7)).await;
    h.photo(b"page-1").await;

    let first = h.press(ButtonAction::Hint).await;
    assert_eq!(h.proxy.count(Stage::Hint), 1);

    h.send(InboundEvent::command(CHAT, Command::NewTask)).await;
    h.photo(b"page-1").await;
    assert_eq!(h.state(), ChatState::Hints);
    assert_eq!(h.proxy.count(Stage::Detect), 1);
    assert_eq!(h.proxy.count(Stage::Parse), 1);

    let second = h.press(ButtonAction::Hint).await;
    assert_eq!(h.proxy.count(Stage::Hint), 1);
    assert_eq!(first[0].text, second[0].text);
    assert!(h
        .repository
        .metrics()
        .iter()
        .any(|m| m.stage == Stage::Hint && m.cache_hit));

    let session = h.orchestrator.session(CHAT).expect("lookup").expect("session");
    let record = h
        .repository
        .find_accepted_parse(&session.task_key(), ENGINE)
        .expect("lookup")
        .expect("accepted parse");
    assert_eq!(record.accepted_reason.as_deref(), Some(ACCEPT_AUTO));
}

/// A different page is a different task and asks the proxy again.
#[tokio::test]
async fn test_different_page_misses_the_cache() {
    let h = Harness::new(equation("Solve 2x + 4 = 12", 7));
    h.press(ButtonAction::Grade(7)).await;
    h.photo(b"page-1").await;
    h.press(ButtonAction::Hint).await;

    h.send(InboundEvent::command(CHAT, Command::NewTask)).await;
    h.photo(b"page-2").await;
    h.press(ButtonAction::Hint).await;

    assert_eq!(h.proxy.count(Stage::Parse), 2);
    assert_eq!(h.proxy.count(Stage::Hint), 2);
}

/// The hint profile comes from the template whose rules hold.
#[tokio::test]
async fn test_hint_uses_the_routed_profile() {
    let h = Harness::new(equation("Solve 2x + 4 = 12", 7));
    h.press(ButtonAction::Grade(7)).await;
    h.photo(b"page-1").await;
    h.press(ButtonAction::Hint).await;

    let profile = h.proxy.last_hint().profile.expect("no profile routed");
    assert_eq!(profile.template_code, "EQ-LINEAR");
    assert_eq!(profile.profile_id, "equations");
    assert_eq!(profile.hint_style, "socratic");
    assert!(profile.forbidden.iter().any(|f| f == "the numeric answer"));
}

/// A template is never picked while its exclusion pattern is in the text.
#[tokio::test]
async fn test_excluded_template_is_never_selected() {
    let h = Harness::new(equation("Solve the inequality 2x + 4 > 12", 8));
    h.press(ButtonAction::Grade(8)).await;
    h.photo(b"inequality").await;
    h.press(ButtonAction::Hint).await;

    let profile = h.proxy.last_hint().profile.expect("no profile routed");
    assert_ne!(profile.template_code, "EQ-LINEAR");
    assert_eq!(profile.template_code, "INEQ-LINEAR");

    let engine = RoutingEngine::new(sample_registry(), "math");
    for text in [
        "Solve the inequality 2x + 4 > 12",
        "Find x in the inequality x - 3 < 5",
        "Решите неравенство 3x - 1 > 2",
    ] {
        let context = RoutingContext::from_task(&equation(text, 8), Some(8));
        let picked = engine.select(&context).map(|c| c.code);
        assert_ne!(picked.as_deref(), Some("EQ-LINEAR"), "picked for {text:?}");
    }

    let plain = RoutingContext::from_task(&equation("Solve 2x + 4 = 12", 8), Some(8));
    assert_eq!(
        engine.select(&plain).map(|c| c.code).as_deref(),
        Some("EQ-LINEAR")
    );
}
