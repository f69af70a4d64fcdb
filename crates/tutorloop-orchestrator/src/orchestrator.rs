//! The session orchestrator: the single entry point for inbound events.
//!
//! Every event runs the same sequence while holding the chat's session
//! exclusively:
//!
//! 1. infer the successor state the event asks for;
//! 2. gate it against the transition table, explaining a denial and nudging
//!    when there is no proposal;
//! 3. commit the new state before running the stage it implies;
//! 4. run the stage: cache lookup, routing for hints, and on a miss one
//!    deadline-bounded proxy call whose result is cached.
//!
//! A failing stage does not roll the state back. The user always receives a
//! message with a concrete next action.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, PipelineCache};
use crate::config::Config;
use crate::error::{ExternalErrorKind, Result, TutorError};
use crate::event::{ButtonAction, ChatId, Command, EventKind, InboundEvent, OutboundMessage, PhotoPayload};
use crate::fsm::{can_transition, evaluate, explain_denial, infer_next_state, parse_grade, ChatState, Gate};
use crate::llm::{
    AnalogueRequest, CheckRequest, Deadline, DetectRequest, HintRequest, ImageInput, LlmProxy,
    NormalizeRequest, OcrRequest, ParseRequest, ParsedTask, Stage, Verdict,
};
use crate::routing::{RoutingContext, RoutingEngine};
use crate::session::{ChatSession, PendingImage, SessionStore, MAX_ALBUM_PAGES, MAX_HINT_LEVEL};
use crate::store::{HintCacheEntry, MetricEvent, ParseRecord, Repository, TimelineEvent};
use crate::templates::TemplateRegistry;

/// Acceptance reason when the parser did not ask for confirmation.
pub const ACCEPT_AUTO: &str = "auto";
/// Acceptance reason when the student confirmed the parse.
pub const ACCEPT_USER_YES: &str = "user_yes";
/// Acceptance reason when the student typed a correction.
pub const ACCEPT_USER_FIX: &str = "user_fix";

const INTERNAL_ERROR_TEXT: &str =
    "Something went wrong on my side. Please try again, or report the problem.";

/// Drives one chat conversation per inbound event.
pub struct SessionOrchestrator {
    config: Config,
    sessions: SessionStore,
    cache: PipelineCache,
    repository: Arc<dyn Repository>,
    routing: RoutingEngine,
    proxy: Arc<dyn LlmProxy>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("engine", &self.proxy.engine())
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    /// Wires the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        registry: Arc<TemplateRegistry>,
        repository: Arc<dyn Repository>,
        proxy: Arc<dyn LlmProxy>,
    ) -> Self {
        let routing = RoutingEngine::new(registry, config.routing_subject.clone());
        Self {
            sessions: SessionStore::new(Arc::clone(&repository)),
            cache: PipelineCache::new(Arc::clone(&repository)),
            repository,
            routing,
            proxy,
            config,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The template catalog routed against.
    #[must_use]
    pub fn registry(&self) -> &TemplateRegistry {
        self.routing.registry()
    }

    /// Engine name used for proxy calls and cache keys.
    #[must_use]
    pub fn engine(&self) -> &str {
        self.proxy.engine()
    }

    /// The session store.
    #[must_use]
    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Drops sessions idle longer than the configured limit from memory.
    pub fn evict_idle_sessions(&self) -> usize {
        self.sessions.evict_idle(self.config.session_idle())
    }

    /// Current view of a chat's session: the in-memory copy when one is
    /// loaded and idle, otherwise the persisted one.
    pub fn session(&self, chat_id: ChatId) -> Result<Option<ChatSession>> {
        if let Some(session) = self.sessions.snapshot(chat_id) {
            return Ok(Some(session));
        }
        self.repository.find_session(chat_id)
    }

    /// Handles one inbound event with the configured time budget.
    pub async fn handle(&self, event: InboundEvent) -> Vec<OutboundMessage> {
        self.handle_with_deadline(event, None).await
    }

    /// Handles one inbound event.
    ///
    /// `deadline` bounds every proxy call made for this event; without one the
    /// configured request budget applies. Never returns an empty list.
    pub async fn handle_with_deadline(
        &self,
        event: InboundEvent,
        deadline: Option<Deadline>,
    ) -> Vec<OutboundMessage> {
        let deadline = Deadline::or_default(deadline, self.config.request_budget());
        let chat_id = event.chat_id;
        let mut session = self.sessions.checkout(chat_id).await;
        debug!(chat_id, kind = event.kind.label(), state = %session.state, "Handling event");

        let mut out = Vec::new();
        if let Err(e) = self.step(&mut session, &event.kind, deadline, &mut out).await {
            error!(chat_id, state = %session.state, error = %e, "Event handling failed");
            self.timeline(&session, "error", None, e.to_string());
            out.push(
                OutboundMessage::text(chat_id, INTERNAL_ERROR_TEXT)
                    .with_button("Report a problem", ButtonAction::Report),
            );
        }
        if out.is_empty() {
            out.push(prompt_for(chat_id, session.state));
        }

        session.touch();
        self.sessions.persist(&session);
        out
    }

    // ========================================================================
    // Gating
    // ========================================================================

    async fn step(
        &self,
        session: &mut ChatSession,
        event: &EventKind,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let current = session.state;
        match evaluate(current, propose(session, event)) {
            Gate::Deny { proposed, allowed } => {
                info!(chat_id = session.chat_id, %current, %proposed, "Transition denied");
                self.timeline(session, "denied", None, format!("{current} -> {proposed}"));
                let mut message = prompt_for(session.chat_id, current);
                message.text = explain_denial(current, &allowed);
                out.push(message);
                Ok(())
            }
            Gate::NoProposal => {
                out.push(nudge(session, event));
                Ok(())
            }
            Gate::Allow(next) => {
                if next == ChatState::Report && current != ChatState::Report {
                    session.report_return = Some(if can_transition(ChatState::Report, current) {
                        current
                    } else {
                        ChatState::AwaitingTask
                    });
                }
                self.advance(session, next)?;
                self.dispatch(session, event, current, deadline, out).await
            }
        }
    }

    /// Commits a transition, refusing anything the table does not list.
    fn advance(&self, session: &mut ChatSession, to: ChatState) -> Result<()> {
        let from = session.state;
        if !can_transition(from, to) {
            return Err(TutorError::illegal_transition(from, to));
        }
        session.state = to;
        session.touch();
        debug!(chat_id = session.chat_id, %from, %to, "Transition committed");
        self.timeline(session, "transition", None, format!("{from} -> {to}"));
        Ok(())
    }

    async fn dispatch(
        &self,
        session: &mut ChatSession,
        event: &EventKind,
        previous: ChatState,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let chat_id = session.chat_id;
        match (session.state, event) {
            (
                state,
                EventKind::Button {
                    action: ButtonAction::Back,
                },
            ) => {
                session.report_return = None;
                out.push(prompt_for(chat_id, state));
            }
            (ChatState::AwaitGrade, _) => out.push(grade_prompt(chat_id, session.grade)),
            (ChatState::AwaitingTask, _) => self.enter_awaiting_task(session, event, out)?,
            (ChatState::CollectingPages, EventKind::Photo { photo }) => {
                self.collect_page(session, photo, previous, deadline, out).await?;
            }
            (ChatState::Detect, _) => self.process_task(session, deadline, out).await?,
            (ChatState::Confirm, _) => {
                session.pipeline.awaiting_correction = true;
                out.push(OutboundMessage::text(
                    chat_id,
                    "Please type the task exactly as it should read.",
                ));
            }
            (ChatState::Hints, EventKind::Text { text }) => {
                self.apply_correction(session, text, out)?;
            }
            (
                ChatState::Hints,
                EventKind::Button {
                    action: ButtonAction::ParseYes,
                },
            ) => self.accept_parse(session, out)?,
            (
                ChatState::Hints,
                EventKind::Button {
                    action: ButtonAction::Hint,
                },
            ) => self.deliver_hint(session, deadline, out).await?,
            (ChatState::Hints, _) => self.show_task(session, out)?,
            (ChatState::Ocr, EventKind::Photo { photo }) => {
                self.read_solution_photo(session, photo, deadline, out).await?;
            }
            (ChatState::Normalize, EventKind::Text { text }) => {
                self.check_solution(session, text.trim().to_string(), deadline, out)
                    .await?;
            }
            (ChatState::Analogue, _) => self.offer_analogue(session, deadline, out).await?,
            (ChatState::Report, EventKind::Text { text }) => {
                info!(chat_id, "Problem report received");
                self.timeline(session, "report", None, text.trim());
                out.push(
                    OutboundMessage::text(chat_id, "Thanks, your report has been saved.")
                        .with_button("Back", ButtonAction::Back),
                );
            }
            (ChatState::Report, _) => out.push(
                OutboundMessage::text(
                    chat_id,
                    "What went wrong? Describe the problem in one message.",
                )
                .with_button("Back", ButtonAction::Back),
            ),
            (state, _) => out.push(prompt_for(chat_id, state)),
        }
        Ok(())
    }

    // ========================================================================
    // Task intake
    // ========================================================================

    fn enter_awaiting_task(
        &self,
        session: &mut ChatSession,
        event: &EventKind,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let chat_id = session.chat_id;
        let chosen = match event {
            EventKind::Button {
                action: ButtonAction::Grade(grade),
            } => Some(*grade),
            EventKind::Text { text } => parse_grade(text),
            _ => None,
        }
        .filter(|grade| (1..=11).contains(grade));

        if let Some(grade) = chosen {
            info!(chat_id, grade, "Grade saved");
            session.grade = Some(grade);
        }
        if session.grade.is_none() {
            self.advance(session, ChatState::AwaitGrade)?;
            out.push(grade_prompt(chat_id, None));
            return Ok(());
        }

        session.begin_new_task();
        let text = match chosen {
            Some(grade) => format!("Grade {grade} saved. Send me a photo of your task."),
            None => "Send me a photo of your task.".to_string(),
        };
        out.push(OutboundMessage::text(chat_id, text));
        Ok(())
    }

    async fn collect_page(
        &self,
        session: &mut ChatSession,
        photo: &PhotoPayload,
        previous: ChatState,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let continues_album = previous == ChatState::CollectingPages
            && photo.media_group_id.is_some()
            && session.pipeline.media_group_id == photo.media_group_id;
        if !continues_album {
            session.begin_new_task();
            session.pipeline.media_group_id.clone_from(&photo.media_group_id);
            debug!(chat_id = session.chat_id, session_id = %session.session_id, "New task started");
        } else if session.pipeline.images.len() >= MAX_ALBUM_PAGES {
            warn!(chat_id = session.chat_id, pages = MAX_ALBUM_PAGES, "Album page limit reached, page ignored");
            out.push(
                OutboundMessage::text(
                    session.chat_id,
                    format!(
                        "I can take at most {MAX_ALBUM_PAGES} pages per task. \
                         Press Done to continue with the pages I have."
                    ),
                )
                .with_button("Done", ButtonAction::PagesDone),
            );
            return Ok(());
        }
        session.pipeline.images.push(PendingImage::from(photo));

        if photo.media_group_id.is_none() {
            self.advance(session, ChatState::Detect)?;
            return self.process_task(session, deadline, out).await;
        }

        let pages = session.pipeline.images.len();
        out.push(
            OutboundMessage::text(
                session.chat_id,
                format!("Page {pages} received. Send the remaining pages, then press Done."),
            )
            .with_button("Done", ButtonAction::PagesDone),
        );
        Ok(())
    }

    /// Detect and parse the collected pages, skipping both for a task whose
    /// parse was already accepted.
    async fn process_task(
        &self,
        session: &mut ChatSession,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let chat_id = session.chat_id;
        if session.pipeline.images.is_empty() {
            self.advance(session, ChatState::AwaitingTask)?;
            out.push(OutboundMessage::text(
                chat_id,
                "I haven't received any pages yet. Please send a photo of the task.",
            ));
            return Ok(());
        }

        let engine = self.proxy.engine().to_string();
        let key = fingerprint(&session.pipeline.images);
        session.pipeline.fingerprint = Some(key.clone());

        if let Some(record) = self.cache.find_accepted(&key, &engine)? {
            info!(chat_id, fingerprint = %key, "Known task, skipping detect and parse");
            self.metric(session, Stage::Parse, true, true, Duration::ZERO);
            self.advance(session, ChatState::Parse)?;
            self.advance(session, ChatState::Hints)?;
            remember_task(session, &record.task);
            session.pipeline.images.clear();
            out.push(task_ready(chat_id, &record.task, "I already know this task."));
            return Ok(());
        }

        let images: Vec<ImageInput> = session.pipeline.images.iter().map(ImageInput::from).collect();
        let request = DetectRequest {
            images: images.clone(),
            grade: session.grade,
        };
        let detected = match self
            .call(session, Stage::Detect, deadline, self.proxy.detect(&request, deadline))
            .await
        {
            Ok(detected) => detected,
            Err(e) => {
                out.push(stage_failure(chat_id, Stage::Detect, &e));
                return Ok(());
            }
        };

        if !detected.has_task {
            self.advance(session, ChatState::AwaitingTask)?;
            session.pipeline.images.clear();
            let reason = detected
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            out.push(OutboundMessage::text(
                chat_id,
                format!("I couldn't find a task in this photo{reason}. Please send another photo."),
            ));
            return Ok(());
        }

        self.advance(session, ChatState::Parse)?;
        let request = ParseRequest {
            images,
            grade: session.grade,
            subject_hint: detected.subject,
        };
        let task = match self
            .call(session, Stage::Parse, deadline, self.proxy.parse(&request, deadline))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                out.push(stage_failure(chat_id, Stage::Parse, &e));
                return Ok(());
            }
        };
        session.pipeline.images.clear();

        let record = ParseRecord::draft(&key, &engine, &session.session_id, task.clone());
        self.cache.upsert_draft(&record)?;
        remember_task(session, &task);

        if task.needs_user_confirmation || task.display_text().is_empty() {
            session.pipeline.pending_parse = Some(task.clone());
            self.advance(session, ChatState::Confirm)?;
            out.push(confirm_prompt(chat_id, &task));
        } else {
            self.cache.mark_accepted(&key, &engine, ACCEPT_AUTO)?;
            self.advance(session, ChatState::Hints)?;
            out.push(task_ready(chat_id, &task, "Here's your task."));
        }
        Ok(())
    }

    // ========================================================================
    // Confirmation
    // ========================================================================

    /// The authoritative parse of the current task, if accepted.
    fn accepted_task(&self, session: &ChatSession) -> Result<Option<ParseRecord>> {
        if let Some(record) = self
            .cache
            .find_accepted(&session.task_key(), self.proxy.engine())?
        {
            return Ok(Some(record));
        }
        self.cache.find_accepted_for_session(&session.session_id)
    }

    fn accept_parse(&self, session: &mut ChatSession, out: &mut Vec<OutboundMessage>) -> Result<()> {
        if session.pipeline.pending_parse.take().is_none() {
            return self.show_task(session, out);
        }
        let record =
            self.cache
                .mark_accepted(&session.task_key(), self.proxy.engine(), ACCEPT_USER_YES)?;
        session.pipeline.awaiting_correction = false;
        out.push(task_ready(session.chat_id, &record.task, "Great, the task is confirmed."));
        Ok(())
    }

    /// Replaces the task text with the student's correction and accepts it.
    fn apply_correction(
        &self,
        session: &mut ChatSession,
        text: &str,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        if session.pipeline.pending_parse.is_none() && !session.pipeline.awaiting_correction {
            return self.show_task(session, out);
        }
        let key = session.task_key();
        let engine = self.proxy.engine();
        let base = match session.pipeline.pending_parse.take() {
            Some(task) => Some(task),
            None => self.repository.find_parse(&key, engine)?.map(|r| r.task),
        };
        let mut task = base.unwrap_or_default();
        task.task_text = text.trim().to_string();

        let record = ParseRecord::draft(&key, engine, &session.session_id, task);
        self.cache.upsert_draft(&record)?;
        let accepted = self.cache.mark_accepted(&key, engine, ACCEPT_USER_FIX)?;
        session.pipeline.awaiting_correction = false;
        info!(chat_id = session.chat_id, "Task corrected by the student");
        out.push(task_ready(session.chat_id, &accepted.task, "Thanks, I've updated the task."));
        Ok(())
    }

    fn show_task(&self, session: &ChatSession, out: &mut Vec<OutboundMessage>) -> Result<()> {
        match self.accepted_task(session)? {
            Some(record) => out.push(task_ready(session.chat_id, &record.task, "Here's your task.")),
            None => out.push(confirm_first(session)),
        }
        Ok(())
    }

    // ========================================================================
    // Hints
    // ========================================================================

    async fn deliver_hint(
        &self,
        session: &mut ChatSession,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let chat_id = session.chat_id;
        let level = session.pipeline.next_hint_level;
        if level > MAX_HINT_LEVEL {
            out.push(
                OutboundMessage::text(
                    chat_id,
                    "That was the last hint for this task. Try solving it now, or practice on a similar task.",
                )
                .with_button("I'm ready to solve", ButtonAction::ReadyToSolve)
                .with_button("Similar task", ButtonAction::Analogue),
            );
            return Ok(());
        }

        let Some(record) = self.accepted_task(session)? else {
            out.push(confirm_first(session));
            return Ok(());
        };
        let key = session.task_key();
        let engine = self.proxy.engine().to_string();
        let max_age = self.config.hint_max_age();

        let hint_text = if let Some(entry) = self.cache.find_hint(&key, &engine, level, max_age)? {
            debug!(chat_id, level, "Hint served from cache");
            self.metric(session, Stage::Hint, true, true, Duration::ZERO);
            entry.hint_text
        } else {
            let previous_hints = self.cache.previous_hints(&key, &engine, level, max_age)?;
            let context = RoutingContext::from_task(&record.task, session.grade);
            let request = HintRequest {
                task: record.task,
                level,
                previous_hints,
                profile: self.routing.profile_core(&context, level),
            };
            let result = match self
                .call(session, Stage::Hint, deadline, self.proxy.hint(&request, deadline))
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    out.push(stage_failure(chat_id, Stage::Hint, &e));
                    return Ok(());
                }
            };

            let text = result.hint_text.trim().to_string();
            if text.is_empty() {
                out.push(
                    OutboundMessage::text(
                        chat_id,
                        "I couldn't come up with a useful hint this time. Ask again, or try solving.",
                    )
                    .with_button("Get a hint", ButtonAction::Hint)
                    .with_button("I'm ready to solve", ButtonAction::ReadyToSolve),
                );
                return Ok(());
            }

            let entry = HintCacheEntry {
                fingerprint: key,
                engine,
                level,
                payload: serde_json::to_value(&result).unwrap_or_default(),
                hint_text: text.clone(),
                created_at: Utc::now(),
            };
            if let Err(e) = self.cache.upsert_hint(&entry) {
                warn!(chat_id, level, error = %e, "Failed to cache hint");
            }
            text
        };

        session.pipeline.next_hint_level = level + 1;
        out.push(hint_message(chat_id, level, &hint_text));
        Ok(())
    }

    // ========================================================================
    // Solutions
    // ========================================================================

    async fn read_solution_photo(
        &self,
        session: &mut ChatSession,
        photo: &PhotoPayload,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let request = OcrRequest {
            images: vec![ImageInput::from(&PendingImage::from(photo))],
        };
        let result = match self
            .call(session, Stage::Ocr, deadline, self.proxy.ocr(&request, deadline))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                out.push(stage_failure(session.chat_id, Stage::Ocr, &e));
                return Ok(());
            }
        };

        let text = result.text.trim();
        if text.is_empty() {
            self.advance(session, ChatState::AwaitSolution)?;
            out.push(OutboundMessage::text(
                session.chat_id,
                "I couldn't read the solution in this photo. Send a clearer photo or type it.",
            ));
            return Ok(());
        }
        self.advance(session, ChatState::Normalize)?;
        self.check_solution(session, text.to_string(), deadline, out).await
    }

    /// Normalizes and grades a solution; the session must be in `Normalize`.
    async fn check_solution(
        &self,
        session: &mut ChatSession,
        solution: String,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let chat_id = session.chat_id;
        let Some(record) = self.accepted_task(session)? else {
            out.push(confirm_first(session));
            return Ok(());
        };

        let request = NormalizeRequest {
            task_text: record.task.display_text(),
            solution_text: solution.clone(),
            grade: session.grade,
        };
        let normalized = match self
            .call(session, Stage::Normalize, deadline, self.proxy.normalize(&request, deadline))
            .await
        {
            Ok(normalized) => normalized,
            Err(e) => {
                out.push(stage_failure(chat_id, Stage::Normalize, &e));
                return Ok(());
            }
        };
        let solution = match normalized.normalized.trim() {
            "" => solution,
            text => text.to_string(),
        };
        session.pipeline.last_solution = Some(solution.clone());

        self.advance(session, ChatState::Check)?;
        let request = CheckRequest {
            task: record.task,
            solution,
            answer: normalized.answer,
        };
        let checked = match self
            .call(session, Stage::Check, deadline, self.proxy.check(&request, deadline))
            .await
        {
            Ok(checked) => checked,
            Err(e) => {
                out.push(stage_failure(chat_id, Stage::Check, &e));
                return Ok(());
            }
        };

        let feedback = checked
            .feedback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        if checked.verdict == Verdict::Correct {
            self.advance(session, ChatState::Correct)?;
            let text = feedback.map_or_else(
                || "Correct, well done!".to_string(),
                |f| format!("Correct, well done! {f}"),
            );
            out.push(
                OutboundMessage::text(chat_id, text)
                    .with_button("Similar task", ButtonAction::Analogue)
                    .with_button("New task", ButtonAction::NewTask),
            );
            return Ok(());
        }

        self.advance(session, ChatState::Incorrect)?;
        let text = match (checked.verdict, feedback) {
            (_, Some(f)) => format!("Not quite. {f}"),
            (Verdict::Unknown, None) => {
                "I couldn't verify this solution. Look through your steps once more and send it again."
                    .to_string()
            }
            _ => "Not quite. Check your work and try again.".to_string(),
        };
        let mut message = OutboundMessage::text(chat_id, text);
        if session.pipeline.next_hint_level <= MAX_HINT_LEVEL {
            message = message.with_button("Get a hint", ButtonAction::Hint);
        }
        out.push(
            message
                .with_button("Similar task", ButtonAction::Analogue)
                .with_button("New task", ButtonAction::NewTask),
        );
        Ok(())
    }

    // ========================================================================
    // Analogue
    // ========================================================================

    async fn offer_analogue(
        &self,
        session: &mut ChatSession,
        deadline: Deadline,
        out: &mut Vec<OutboundMessage>,
    ) -> Result<()> {
        let chat_id = session.chat_id;
        let Some(record) = self.accepted_task(session)? else {
            out.push(confirm_first(session));
            return Ok(());
        };
        let request = AnalogueRequest {
            task: record.task,
            grade: session.grade,
            student_solution: session.pipeline.last_solution.clone(),
        };
        let result = match self
            .call(session, Stage::Analogue, deadline, self.proxy.analogue(&request, deadline))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                out.push(stage_failure(chat_id, Stage::Analogue, &e));
                return Ok(());
            }
        };

        let task_text = result.task_text.trim();
        if task_text.is_empty() {
            out.push(OutboundMessage::text(
                chat_id,
                "I couldn't come up with a similar task right now.",
            ));
        } else {
            let mut text = format!("Here's a similar task to practice on:\n\n{task_text}");
            if let Some(solution) = result.solution.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                text.push_str("\n\nSolution:\n");
                text.push_str(solution);
            }
            out.push(OutboundMessage::text(chat_id, text));
        }

        self.advance(session, ChatState::AwaitingTask)?;
        out.push(OutboundMessage::text(
            chat_id,
            "When you're ready, send a photo of your next task.",
        ));
        Ok(())
    }

    // ========================================================================
    // Telemetry
    // ========================================================================

    /// Runs one proxy call and records its outcome.
    async fn call<T>(
        &self,
        session: &ChatSession,
        stage: Stage,
        deadline: Deadline,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        let started = Instant::now();
        let result = if deadline.is_expired() {
            Err(TutorError::external(
                stage,
                ExternalErrorKind::Timeout,
                "request budget spent before the call",
            ))
        } else {
            call.await
        };
        let elapsed = started.elapsed();
        self.metric(session, stage, result.is_ok(), false, elapsed);
        match &result {
            Ok(_) => {
                let latency_ms = millis(elapsed);
                debug!(chat_id = session.chat_id, %stage, latency_ms, "Stage call succeeded");
                self.timeline(session, "stage_ok", Some(stage), format!("{latency_ms} ms"));
            }
            Err(e) => {
                warn!(chat_id = session.chat_id, %stage, error = %e, "Stage call failed");
                self.timeline(session, "stage_failed", Some(stage), e.to_string());
            }
        }
        result
    }

    fn metric(&self, session: &ChatSession, stage: Stage, ok: bool, cache_hit: bool, latency: Duration) {
        let event = MetricEvent {
            chat_id: session.chat_id,
            stage,
            ok,
            cache_hit,
            latency_ms: millis(latency),
            at: Utc::now(),
        };
        if let Err(e) = self.repository.insert_metric_event(&event) {
            warn!(chat_id = session.chat_id, error = %e, "Failed to record metric");
        }
    }

    fn timeline(&self, session: &ChatSession, kind: &str, stage: Option<Stage>, detail: impl Into<String>) {
        let event = TimelineEvent::new(session.chat_id, &session.session_id, kind, stage, detail);
        if let Err(e) = self.repository.insert_timeline_event(&event) {
            warn!(chat_id = session.chat_id, error = %e, "Failed to record timeline event");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// The successor an event asks for. `Back` is resolved from the session.
fn propose(session: &ChatSession, event: &EventKind) -> Option<ChatState> {
    match event {
        EventKind::Button {
            action: ButtonAction::Back,
        } => (session.state == ChatState::Report)
            .then(|| session.report_return.unwrap_or(ChatState::AwaitingTask)),
        _ if session.pipeline.pending_parse.is_some() => pending_confirmation(session.state, event),
        _ => infer_next_state(event, session.state),
    }
}

/// While a parse waits for confirmation, text is a correction and the task
/// buttons stay closed until the student answers.
fn pending_confirmation(state: ChatState, event: &EventKind) -> Option<ChatState> {
    match event {
        EventKind::Button {
            action: ButtonAction::Hint | ButtonAction::ReadyToSolve | ButtonAction::Analogue,
        } => None,
        EventKind::Button {
            action: ButtonAction::ParseYes,
        } => Some(ChatState::Hints),
        EventKind::Button {
            action: ButtonAction::ParseNo,
        } => Some(ChatState::Confirm),
        EventKind::Text { .. } if matches!(state, ChatState::Confirm | ChatState::Hints) => {
            Some(ChatState::Hints)
        }
        _ => infer_next_state(event, state),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn remember_task(session: &mut ChatSession, task: &ParsedTask) {
    if !task.subject.trim().is_empty() {
        session.subject = Some(task.subject.trim().to_string());
    }
    session.task_type = task.dominant_task_type();
    if session.grade.is_none() && (1..=11).contains(&task.grade) {
        session.grade = Some(task.grade);
    }
}

fn nudge(session: &ChatSession, event: &EventKind) -> OutboundMessage {
    let mut message = prompt_for(session.chat_id, session.state);
    match event {
        EventKind::Command {
            command: Command::Help,
        } => {
            message.text = format!(
                "Send me a photo of a homework task and I'll guide you with hints instead of answers. \
                 Commands: /new for a new task, /grade to change your grade, /report to report a problem.\n\n{}",
                message.text
            );
        }
        EventKind::Text { .. } if session.state == ChatState::AwaitGrade => {
            message.text = "Please choose your grade, a number from 1 to 11.".to_string();
        }
        _ if session.pipeline.pending_parse.is_some() => return confirm_first(session),
        _ => {}
    }
    message
}

fn grade_prompt(chat_id: ChatId, current: Option<u8>) -> OutboundMessage {
    let text = match current {
        Some(grade) => format!("You're in grade {grade}. Which grade should I use?"),
        None => "Hi! Which grade are you in?".to_string(),
    };
    (1..=11).fold(OutboundMessage::text(chat_id, text), |message, grade| {
        message.with_button(grade.to_string(), ButtonAction::Grade(grade))
    })
}

/// A reminder of what the student can do in `state`, with matching buttons.
fn prompt_for(chat_id: ChatId, state: ChatState) -> OutboundMessage {
    let message = OutboundMessage::text(chat_id, format!("Please {}.", state.describe()));
    match state {
        ChatState::AwaitGrade => (1..=11).fold(message, |message, grade| {
            message.with_button(grade.to_string(), ButtonAction::Grade(grade))
        }),
        ChatState::AwaitingTask => message,
        ChatState::CollectingPages => message.with_button("Done", ButtonAction::PagesDone),
        ChatState::Confirm => message
            .with_button("Yes, that's right", ButtonAction::ParseYes)
            .with_button("No, let me fix it", ButtonAction::ParseNo),
        ChatState::Hints => message
            .with_button("Get a hint", ButtonAction::Hint)
            .with_button("I'm ready to solve", ButtonAction::ReadyToSolve),
        ChatState::AwaitSolution | ChatState::Incorrect => message
            .with_button("Get a hint", ButtonAction::Hint)
            .with_button("Similar task", ButtonAction::Analogue),
        ChatState::Correct => message
            .with_button("Similar task", ButtonAction::Analogue)
            .with_button("New task", ButtonAction::NewTask),
        ChatState::Report => message.with_button("Back", ButtonAction::Back),
        _ => message.with_button("Report a problem", ButtonAction::Report),
    }
}

fn task_text_or_placeholder(task: &ParsedTask) -> String {
    let text = task.display_text();
    if text.is_empty() {
        "(I couldn't make out the task text.)".to_string()
    } else {
        text
    }
}

fn task_ready(chat_id: ChatId, task: &ParsedTask, lead: &str) -> OutboundMessage {
    OutboundMessage::text(
        chat_id,
        format!(
            "{lead}\n\n{}\n\nAsk for a hint whenever you're stuck.",
            task_text_or_placeholder(task)
        ),
    )
    .with_button("Get a hint", ButtonAction::Hint)
    .with_button("I'm ready to solve", ButtonAction::ReadyToSolve)
}

fn confirm_prompt(chat_id: ChatId, task: &ParsedTask) -> OutboundMessage {
    OutboundMessage::text(
        chat_id,
        format!(
            "Here's what I read:\n\n{}\n\nIs that right?",
            task_text_or_placeholder(task)
        ),
    )
    .with_button("Yes, that's right", ButtonAction::ParseYes)
    .with_button("No, let me fix it", ButtonAction::ParseNo)
}

fn confirm_first(session: &ChatSession) -> OutboundMessage {
    match &session.pipeline.pending_parse {
        Some(task) if session.pipeline.awaiting_correction => OutboundMessage::text(
            session.chat_id,
            format!(
                "Please type the corrected task first, or keep it as it is:\n\n{}",
                task_text_or_placeholder(task)
            ),
        )
        .with_button("Keep it", ButtonAction::ParseYes),
        Some(task) => OutboundMessage::text(
            session.chat_id,
            format!(
                "Please confirm the task first:\n\n{}",
                task_text_or_placeholder(task)
            ),
        )
        .with_button("Yes, that's right", ButtonAction::ParseYes)
        .with_button("No, let me fix it", ButtonAction::ParseNo),
        None => OutboundMessage::text(
            session.chat_id,
            "I don't have a confirmed task yet. Please send a photo of the task.",
        )
        .with_button("New task", ButtonAction::NewTask),
    }
}

fn hint_message(chat_id: ChatId, level: u8, hint: &str) -> OutboundMessage {
    let message = OutboundMessage::text(chat_id, format!("Hint {level}/{MAX_HINT_LEVEL}:\n\n{hint}"));
    let message = if level < MAX_HINT_LEVEL {
        message.with_button("Another hint", ButtonAction::Hint)
    } else {
        message
    };
    message.with_button("I'm ready to solve", ButtonAction::ReadyToSolve)
}

/// Stage-specific failure text with a retry action the table allows from
/// the stage's state.
fn stage_failure(chat_id: ChatId, stage: Stage, error: &TutorError) -> OutboundMessage {
    let cause = match error {
        TutorError::ExternalCall {
            kind: ExternalErrorKind::Timeout,
            ..
        } => " It took too long.",
        e if e.is_transient() => " Please try again in a moment.",
        _ => " Please report it if this keeps happening.",
    };
    let (text, retry_label, retry) = match stage {
        Stage::Detect | Stage::Parse => (
            "I couldn't read the task right now. Send the photo again or start over.",
            "New task",
            ButtonAction::NewTask,
        ),
        Stage::Hint => (
            "I couldn't prepare a hint right now.",
            "Try again",
            ButtonAction::Hint,
        ),
        Stage::Ocr | Stage::Normalize | Stage::Check => (
            "I couldn't check your solution right now.",
            "Send the solution again",
            ButtonAction::ReadyToSolve,
        ),
        Stage::Analogue => (
            "I couldn't prepare a similar task right now.",
            "New task",
            ButtonAction::NewTask,
        ),
    };
    OutboundMessage::text(chat_id, format!("{text}{cause}"))
        .with_button(retry_label, retry)
        .with_button("Report a problem", ButtonAction::Report)
}
