//! Persistence collaborator: the logical records and repository operations
//! the orchestrator relies on.
//!
//! The [`Repository`] trait is synchronous and failable. Upserts are
//! last-write-wins by key; no isolation beyond that is assumed.
//! [`InMemoryRepository`] is the process-local implementation used by the
//! binary and the tests.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};
use crate::event::ChatId;
use crate::llm::{ParsedTask, Stage};
use crate::session::ChatSession;

// ============================================================================
// Records
// ============================================================================

/// One parsed task, keyed by content fingerprint and engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseRecord {
    /// Content fingerprint of the source image, or a session id.
    pub fingerprint: String,
    /// Engine that produced the parse.
    pub engine: String,
    /// Session that submitted the task.
    pub session_id: String,
    /// Raw extracted text.
    pub raw_text: String,
    /// Structured task fields.
    pub task: ParsedTask,
    /// The parser asked for the student's confirmation.
    pub needs_confirmation: bool,
    /// The parse is authoritative.
    pub accepted: bool,
    /// Why the parse was accepted (`auto`, `user_yes`, `user_fix`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_reason: Option<String>,
    /// Free-form result payload as returned by the proxy.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// First write.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// When the parse was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
}

impl ParseRecord {
    /// Creates an unaccepted draft.
    #[must_use]
    pub fn draft(
        fingerprint: impl Into<String>,
        engine: impl Into<String>,
        session_id: impl Into<String>,
        task: ParsedTask,
    ) -> Self {
        let now = Utc::now();
        let payload = serde_json::to_value(&task).unwrap_or_default();
        Self {
            fingerprint: fingerprint.into(),
            engine: engine.into(),
            session_id: session_id.into(),
            raw_text: task.task_text.clone(),
            needs_confirmation: task.needs_user_confirmation,
            task,
            accepted: false,
            accepted_reason: None,
            payload,
            created_at: now,
            updated_at: now,
            accepted_at: None,
        }
    }
}

/// A generated hint, keyed by task fingerprint, engine and level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintCacheEntry {
    /// Task fingerprint or session id.
    pub fingerprint: String,
    /// Engine that produced the hint.
    pub engine: String,
    /// Hint level, 1..=3.
    pub level: u8,
    /// Serialized hint payload.
    pub payload: serde_json::Value,
    /// Hint text.
    pub hint_text: String,
    /// When the hint was generated.
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record: one per external call or user-visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Chat the event belongs to.
    pub chat_id: ChatId,
    /// Session active at the time.
    pub session_id: String,
    /// Event kind (`transition`, `denied`, `stage_ok`, `stage_failed`, `report`).
    pub kind: String,
    /// Stage involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Free-form detail.
    pub detail: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl TimelineEvent {
    /// Creates a timeline event stamped now.
    #[must_use]
    pub fn new(
        chat_id: ChatId,
        session_id: impl Into<String>,
        kind: impl Into<String>,
        stage: Option<Stage>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            chat_id,
            session_id: session_id.into(),
            kind: kind.into(),
            stage,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Append-only observability record for one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEvent {
    /// Chat the call was made for.
    pub chat_id: ChatId,
    /// Stage executed.
    pub stage: Stage,
    /// Whether the stage produced a result.
    pub ok: bool,
    /// Served from cache without an external call.
    pub cache_hit: bool,
    /// Wall-clock duration.
    pub latency_ms: u64,
    /// When it happened.
    pub at: DateTime<Utc>,
}

// ============================================================================
// Repository
// ============================================================================

/// Repository-style persistence operations.
pub trait Repository: Send + Sync {
    /// Inserts or fully replaces the parse keyed by fingerprint and engine.
    fn upsert_parse(&self, record: &ParseRecord) -> Result<()>;

    /// Finds the parse keyed by fingerprint and engine, accepted or not.
    fn find_parse(&self, fingerprint: &str, engine: &str) -> Result<Option<ParseRecord>>;

    /// Finds an accepted parse for the fingerprint.
    fn find_accepted_parse(&self, fingerprint: &str, engine: &str) -> Result<Option<ParseRecord>>;

    /// Finds the most recently accepted parse submitted by a session.
    fn find_accepted_parse_for_session(&self, session_id: &str) -> Result<Option<ParseRecord>>;

    /// Marks a parse accepted; `NotFound` if it was never written.
    fn mark_accepted(&self, fingerprint: &str, engine: &str, reason: &str) -> Result<ParseRecord>;

    /// Inserts or replaces a hint keyed by fingerprint, engine and level.
    fn upsert_hint(&self, entry: &HintCacheEntry) -> Result<()>;

    /// Finds a hint regardless of its age.
    fn find_hint(&self, fingerprint: &str, engine: &str, level: u8)
        -> Result<Option<HintCacheEntry>>;

    /// Inserts or replaces a chat session.
    fn upsert_session(&self, session: &ChatSession) -> Result<()>;

    /// Finds a chat session.
    fn find_session(&self, chat_id: ChatId) -> Result<Option<ChatSession>>;

    /// Appends a timeline event.
    fn insert_timeline_event(&self, event: &TimelineEvent) -> Result<()>;

    /// Appends a metric event.
    fn insert_metric_event(&self, event: &MetricEvent) -> Result<()>;
}

type ParseKey = (String, String);
type HintKey = (String, String, u8);

/// Timeline and metric events kept by default; older ones are dropped first.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Process-local [`Repository`].
///
/// The timeline and metrics are rings of the most recent events.
#[derive(Debug)]
pub struct InMemoryRepository {
    parses: RwLock<HashMap<ParseKey, ParseRecord>>,
    hints: RwLock<HashMap<HintKey, HintCacheEntry>>,
    sessions: RwLock<HashMap<ChatId, ChatSession>>,
    timeline: RwLock<VecDeque<TimelineEvent>>,
    metrics: RwLock<VecDeque<MetricEvent>>,
    log_capacity: usize,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty repository keeping at most `capacity` timeline and
    /// metric events each (at least one).
    #[must_use]
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            parses: RwLock::default(),
            hints: RwLock::default(),
            sessions: RwLock::default(),
            timeline: RwLock::default(),
            metrics: RwLock::default(),
            log_capacity: capacity.max(1),
        }
    }

    /// Retained timeline events in insertion order.
    #[must_use]
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.timeline.read().iter().cloned().collect()
    }

    /// Retained metric events in insertion order.
    #[must_use]
    pub fn metrics(&self) -> Vec<MetricEvent> {
        self.metrics.read().iter().cloned().collect()
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, capacity: usize, item: T) {
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(item);
}

impl Repository for InMemoryRepository {
    fn upsert_parse(&self, record: &ParseRecord) -> Result<()> {
        let key = (record.fingerprint.clone(), record.engine.clone());
        self.parses.write().insert(key, record.clone());
        Ok(())
    }

    fn find_parse(&self, fingerprint: &str, engine: &str) -> Result<Option<ParseRecord>> {
        let key = (fingerprint.to_string(), engine.to_string());
        Ok(self.parses.read().get(&key).cloned())
    }

    fn find_accepted_parse(&self, fingerprint: &str, engine: &str) -> Result<Option<ParseRecord>> {
        Ok(self
            .find_parse(fingerprint, engine)?
            .filter(|record| record.accepted))
    }

    fn find_accepted_parse_for_session(&self, session_id: &str) -> Result<Option<ParseRecord>> {
        Ok(self
            .parses
            .read()
            .values()
            .filter(|r| r.accepted && r.session_id == session_id)
            .max_by_key(|r| r.accepted_at)
            .cloned())
    }

    fn mark_accepted(&self, fingerprint: &str, engine: &str, reason: &str) -> Result<ParseRecord> {
        let key = (fingerprint.to_string(), engine.to_string());
        let mut parses = self.parses.write();
        let record = parses
            .get_mut(&key)
            .ok_or_else(|| TutorError::not_found("parse", format!("{fingerprint}/{engine}")))?;
        let now = Utc::now();
        record.accepted = true;
        record.accepted_reason = Some(reason.to_string());
        record.accepted_at = Some(now);
        record.updated_at = now;
        Ok(record.clone())
    }

    fn upsert_hint(&self, entry: &HintCacheEntry) -> Result<()> {
        let key = (entry.fingerprint.clone(), entry.engine.clone(), entry.level);
        self.hints.write().insert(key, entry.clone());
        Ok(())
    }

    fn find_hint(
        &self,
        fingerprint: &str,
        engine: &str,
        level: u8,
    ) -> Result<Option<HintCacheEntry>> {
        let key = (fingerprint.to_string(), engine.to_string(), level);
        Ok(self.hints.read().get(&key).cloned())
    }

    fn upsert_session(&self, session: &ChatSession) -> Result<()> {
        self.sessions.write().insert(session.chat_id, session.clone());
        Ok(())
    }

    fn find_session(&self, chat_id: ChatId) -> Result<Option<ChatSession>> {
        Ok(self.sessions.read().get(&chat_id).cloned())
    }

    fn insert_timeline_event(&self, event: &TimelineEvent) -> Result<()> {
        push_bounded(&mut self.timeline.write(), self.log_capacity, event.clone());
        Ok(())
    }

    fn insert_metric_event(&self, event: &MetricEvent) -> Result<()> {
        push_bounded(&mut self.metrics.write(), self.log_capacity, event.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn task(text: &str) -> ParsedTask {
        ParsedTask {
            subject: "math".to_string(),
            task_text: text.to_string(),
            ..ParsedTask::default()
        }
    }

    #[test]
    fn test_upsert_parse_is_last_write_wins() {
        let repo = InMemoryRepository::new();
        repo.upsert_parse(&ParseRecord::draft("fp", "e", "s1", task("first")))
            .unwrap();
        repo.upsert_parse(&ParseRecord::draft("fp", "e", "s1", task("second")))
            .unwrap();

        let record = repo.find_parse("fp", "e").unwrap().unwrap();
        assert_eq!(record.raw_text, "second");
        assert!(repo.find_parse("fp", "other").unwrap().is_none());
    }

    #[test]
    fn test_mark_accepted_without_draft_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.mark_accepted("missing", "e", "auto").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_accepted_lookup_by_session() {
        let repo = InMemoryRepository::new();
        repo.upsert_parse(&ParseRecord::draft("fp", "e", "s1", task("x")))
            .unwrap();
        assert!(repo.find_accepted_parse_for_session("s1").unwrap().is_none());

        repo.mark_accepted("fp", "e", "user_yes").unwrap();
        let record = repo.find_accepted_parse_for_session("s1").unwrap().unwrap();
        assert_eq!(record.accepted_reason.as_deref(), Some("user_yes"));
        assert!(repo.find_accepted_parse_for_session("s2").unwrap().is_none());
    }

    #[test]
    fn test_append_only_logs() {
        let repo = InMemoryRepository::new();
        repo.insert_timeline_event(&TimelineEvent::new(1, "s", "transition", None, "a -> b"))
            .unwrap();
        repo.insert_timeline_event(&TimelineEvent::new(1, "s", "denied", None, "b -> c"))
            .unwrap();
        let kinds: Vec<_> = repo.timeline().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["transition", "denied"]);
    }

    #[test]
    fn test_logs_keep_only_the_most_recent_events() {
        let repo = InMemoryRepository::with_log_capacity(3);
        for i in 0..5 {
            let event = TimelineEvent::new(1, "s", "transition", None, format!("step {i}"));
            repo.insert_timeline_event(&event).unwrap();
            repo.insert_metric_event(&MetricEvent {
                chat_id: 1,
                stage: Stage::Hint,
                ok: true,
                cache_hit: false,
                latency_ms: i,
                at: Utc::now(),
            })
            .unwrap();
        }

        let details: Vec<_> = repo.timeline().into_iter().map(|e| e.detail).collect();
        assert_eq!(details, vec!["step 2", "step 3", "step 4"]);
        let latencies: Vec<_> = repo.metrics().into_iter().map(|m| m.latency_ms).collect();
        assert_eq!(latencies, vec![2, 3, 4]);
    }
}
