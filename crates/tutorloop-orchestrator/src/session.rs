//! Per-chat session state and the store that owns it.
//!
//! A [`ChatSession`] holds the chat's FSM state, the active session id and the
//! transient pipeline context of the task in progress. The [`SessionStore`]
//! hands out one owned guard per chat at a time, so two events for the same
//! chat can never interleave their writes even if the transport delivers them
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{ChatId, PhotoPayload};
use crate::fsm::ChatState;
use crate::llm::ParsedTask;
use crate::store::Repository;

/// Highest hint level the tutor will generate for one task.
pub const MAX_HINT_LEVEL: u8 = 3;

/// Most pages one album task may hold; later pages are ignored.
pub const MAX_ALBUM_PAGES: usize = 10;

// ============================================================================
// ChatSession
// ============================================================================

/// One album page (or single photo) waiting to be processed.
#[derive(Clone, PartialEq, Eq)]
pub struct PendingImage {
    /// Raw image bytes.
    pub bytes: Vec<u8>,
    /// MIME type.
    pub mime: String,
}

impl std::fmt::Debug for PendingImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingImage")
            .field("bytes", &self.bytes.len())
            .field("mime", &self.mime)
            .finish()
    }
}

impl From<&PhotoPayload> for PendingImage {
    fn from(photo: &PhotoPayload) -> Self {
        Self {
            bytes: photo.bytes.clone(),
            mime: photo.mime.clone(),
        }
    }
}

/// Transient context of the task in progress.
///
/// Cleared whenever a new task starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Pages received for the current task; not persisted.
    #[serde(skip)]
    pub images: Vec<PendingImage>,
    /// Album the pages belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
    /// Content fingerprint of the current task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Parse waiting for the student's confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_parse: Option<ParsedTask>,
    /// The student pressed "parse_no" and the next text is a correction.
    #[serde(default)]
    pub awaiting_correction: bool,
    /// Level of the next hint to deliver, starting at 1.
    #[serde(default = "first_hint_level")]
    pub next_hint_level: u8,
    /// Last normalized solution, kept for the check and analogue stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_solution: Option<String>,
}

const fn first_hint_level() -> u8 {
    1
}

impl PipelineContext {
    /// Creates an empty context with the hint cursor at level 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_hint_level: first_hint_level(),
            ..Self::default()
        }
    }
}

/// Identity and conversational state of one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    /// Chat identity.
    pub chat_id: ChatId,
    /// Current FSM state.
    pub state: ChatState,
    /// Active session id; rotated whenever a new task begins.
    pub session_id: String,
    /// Grade on record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<u8>,
    /// Subject of the last parsed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Task type of the last parsed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// State to return to when leaving the report flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_return: Option<ChatState>,
    /// Transient pipeline context.
    #[serde(default = "PipelineContext::new")]
    pub pipeline: PipelineContext,
    /// When the session was first seen.
    pub created_at: DateTime<Utc>,
    /// When the session was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    /// Creates a session for a chat seen for the first time.
    #[must_use]
    pub fn new(chat_id: ChatId) -> Self {
        let now = Utc::now();
        Self {
            chat_id,
            state: ChatState::AwaitGrade,
            session_id: new_session_id(),
            grade: None,
            subject: None,
            task_type: None,
            report_return: None,
            pipeline: PipelineContext::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Starts a new task: rotates the session id and drops every pointer into
    /// the previous task.
    pub fn begin_new_task(&mut self) {
        self.session_id = new_session_id();
        self.pipeline = PipelineContext::new();
        self.touch();
    }

    /// The cache key of the current task: its image fingerprint, or the
    /// session id when no image was involved.
    #[must_use]
    pub fn task_key(&self) -> String {
        self.pipeline
            .fingerprint
            .clone()
            .unwrap_or_else(|| self.session_id.clone())
    }

    /// Updates the `updated_at` timestamp to the current time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// SessionStore
// ============================================================================

/// Exclusive access to one chat's session.
///
/// Mutations through the guard are visible to the next checkout of the same
/// chat; the guard is released on drop.
pub type SessionGuard = OwnedMutexGuard<ChatSession>;

/// Owner of all chat sessions, with single-writer-per-chat access.
pub struct SessionStore {
    sessions: Mutex<HashMap<ChatId, Arc<AsyncMutex<ChatSession>>>>,
    repository: Arc<dyn Repository>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Creates a store backed by the given repository.
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            repository,
        }
    }

    /// Takes exclusive ownership of a chat's session, waiting for any event
    /// of the same chat still in flight.
    ///
    /// Sessions not yet in memory are restored from the repository, or
    /// created fresh in `AwaitGrade`.
    pub async fn checkout(&self, chat_id: ChatId) -> SessionGuard {
        let slot = {
            let mut sessions = self.sessions.lock();
            Arc::clone(
                sessions
                    .entry(chat_id)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(self.restore(chat_id)))),
            )
        };
        slot.lock_owned().await
    }

    /// Persists a session through the repository; failures are logged only.
    pub fn persist(&self, session: &ChatSession) {
        if let Err(e) = self.repository.upsert_session(session) {
            warn!(chat_id = session.chat_id, error = %e, "Failed to persist session");
        }
    }

    /// Returns a copy of a chat's session if one is loaded and not checked out.
    #[must_use]
    pub fn snapshot(&self, chat_id: ChatId) -> Option<ChatSession> {
        let slot = self.sessions.lock().get(&chat_id).map(Arc::clone)?;
        let session = slot.try_lock().ok()?;
        Some(session.clone())
    }

    /// Drops in-memory sessions untouched for longer than `max_idle`.
    ///
    /// Only slots nobody holds or waits on are dropped; the next checkout of
    /// such a chat restores it from the repository. Returns the number evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            slot.try_lock()
                .map_or(true, |session| session.updated_at > cutoff)
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Number of sessions held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if no sessions are held in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn restore(&self, chat_id: ChatId) -> ChatSession {
        match self.repository.find_session(chat_id) {
            Ok(Some(mut session)) => {
                debug!(chat_id, state = %session.state, "Restored session");
                // Image bytes are never persisted, so an interrupted album restarts.
                if session.state == ChatState::CollectingPages || session.state.is_transient() {
                    session.state = ChatState::AwaitingTask;
                    session.pipeline = PipelineContext::new();
                }
                session
            }
            Ok(None) => ChatSession::new(chat_id),
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to load session, starting fresh");
                ChatSession::new(chat_id)
            }
        }
    }
}
