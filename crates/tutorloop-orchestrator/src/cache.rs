//! Pipeline cache and idempotency layer.
//!
//! Keeps the orchestrator from issuing the same external call twice for the
//! same task and enforces "accept before use": downstream stages only ever
//! read a parse whose acceptance flag is set. A lookup miss is a normal
//! branch that means "call the stage", never an error.
//!
//! Two chats submitting an identical photo share cache keys; their writes are
//! resolved last-write-wins by the repository.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::llm::PreviousHint;
use crate::session::PendingImage;
use crate::store::{HintCacheEntry, ParseRecord, Repository};

/// Content fingerprint of a task made of one or more pages.
///
/// Each page is length-prefixed so that splitting the same bytes differently
/// across pages yields a different fingerprint.
#[must_use]
pub fn fingerprint(images: &[PendingImage]) -> String {
    let mut hasher = Sha256::new();
    for image in images {
        hasher.update((image.bytes.len() as u64).to_be_bytes());
        hasher.update(&image.bytes);
    }
    hex::encode(hasher.finalize())
}

/// Cache and acceptance discipline over a [`Repository`].
#[derive(Clone)]
pub struct PipelineCache {
    repository: Arc<dyn Repository>,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache").finish_non_exhaustive()
    }
}

impl PipelineCache {
    /// Creates a cache over the given repository.
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// The authoritative parse for a fingerprint, if one was accepted.
    pub fn find_accepted(&self, fingerprint: &str, engine: &str) -> Result<Option<ParseRecord>> {
        self.repository.find_accepted_parse(fingerprint, engine)
    }

    /// The authoritative parse of a session, if one was accepted.
    pub fn find_accepted_for_session(&self, session_id: &str) -> Result<Option<ParseRecord>> {
        self.repository.find_accepted_parse_for_session(session_id)
    }

    /// Writes a draft parse, replacing every field of any prior record with
    /// the same fingerprint and engine.
    pub fn upsert_draft(&self, record: &ParseRecord) -> Result<()> {
        let mut draft = record.clone();
        draft.accepted = false;
        draft.accepted_reason = None;
        draft.accepted_at = None;
        draft.updated_at = Utc::now();
        self.repository.upsert_parse(&draft)
    }

    /// Promotes a draft to accepted.
    ///
    /// Fails with `NotFound` if no draft was written for the key.
    pub fn mark_accepted(&self, fingerprint: &str, engine: &str, reason: &str) -> Result<ParseRecord> {
        let record = self.repository.mark_accepted(fingerprint, engine, reason)?;
        debug!(%fingerprint, %engine, %reason, "Parse accepted");
        Ok(record)
    }

    /// A cached hint no older than `max_age`.
    pub fn find_hint(
        &self,
        fingerprint: &str,
        engine: &str,
        level: u8,
        max_age: Duration,
    ) -> Result<Option<HintCacheEntry>> {
        self.find_hint_at(fingerprint, engine, level, max_age, Utc::now())
    }

    /// Like [`PipelineCache::find_hint`] with an explicit clock.
    ///
    /// Stale entries are ignored, not deleted.
    pub fn find_hint_at(
        &self,
        fingerprint: &str,
        engine: &str,
        level: u8,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<HintCacheEntry>> {
        let Some(entry) = self.repository.find_hint(fingerprint, engine, level)? else {
            return Ok(None);
        };
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(entry.created_at) > max_age {
            debug!(%fingerprint, level, "Ignoring stale hint");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Stores a generated hint.
    pub fn upsert_hint(&self, entry: &HintCacheEntry) -> Result<()> {
        self.repository.upsert_hint(entry)
    }

    /// Hints of every level below `level`, ascending.
    ///
    /// Levels are walked downward from `level - 1`; a missing or stale level
    /// is skipped rather than treated as a failure.
    pub fn previous_hints(
        &self,
        fingerprint: &str,
        engine: &str,
        level: u8,
        max_age: Duration,
    ) -> Result<Vec<PreviousHint>> {
        let mut hints = Vec::new();
        for lower in (1..level).rev() {
            if let Some(entry) = self.find_hint(fingerprint, engine, lower, max_age)? {
                hints.push(PreviousHint {
                    level: lower,
                    text: entry.hint_text,
                });
            }
        }
        hints.reverse();
        Ok(hints)
    }
}
