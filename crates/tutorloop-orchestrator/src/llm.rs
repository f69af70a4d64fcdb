//! Client side of the remote LLM proxy.
//!
//! Every pipeline stage maps to one JSON-over-HTTP endpoint. Requests are
//! wrapped in an envelope carrying the engine name; responses are decoded into
//! one typed result per stage at the boundary, so nothing downstream handles
//! untyped maps.
//!
//! Each call is bounded by a [`Deadline`]. The remaining budget is forwarded
//! to the proxy as the `timeout_ms` query parameter and the `X-Timeout-Ms`
//! header so the remote side can truncate its own work before the client
//! gives up.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{ExternalErrorKind, Result, TutorError};
use crate::routing::ProfileCore;
use crate::session::PendingImage;

/// Header carrying the remaining budget in milliseconds.
pub const TIMEOUT_HEADER: &str = "X-Timeout-Ms";

/// Query parameter carrying the remaining budget in milliseconds.
pub const TIMEOUT_QUERY: &str = "timeout_ms";

/// Longest budget a single deadline can carry.
pub const MAX_BUDGET: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest raw body echoed back as an error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

// ============================================================================
// Stage
// ============================================================================

/// One pipeline step, each backed by one proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Does the image contain a task?
    Detect,
    /// Structured task extraction.
    Parse,
    /// Leveled hint authoring.
    Hint,
    /// Solution normalization.
    Normalize,
    /// Solution grading.
    Check,
    /// Analogous task generation.
    Analogue,
    /// Text recognition of a photographed solution.
    Ocr,
}

impl Stage {
    /// Path of the stage endpoint relative to the proxy base URL.
    #[must_use]
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Detect => "v1/detect",
            Self::Parse => "v1/parse",
            Self::Hint => "v1/hint",
            Self::Normalize => "v1/normalize",
            Self::Check => "v1/check_solution",
            Self::Analogue => "v1/analogue_solution",
            Self::Ocr => "v1/ocr",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Detect => "detect",
            Self::Parse => "parse",
            Self::Hint => "hint",
            Self::Normalize => "normalize",
            Self::Check => "check",
            Self::Analogue => "analogue",
            Self::Ocr => "ocr",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Deadline
// ============================================================================

/// Absolute time budget of one external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    /// A deadline `budget` from now, capped at [`MAX_BUDGET`].
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now
            .checked_add(budget.min(MAX_BUDGET))
            .unwrap_or(now);
        Self { expires_at }
    }

    /// Uses the caller's deadline when given, otherwise the default budget.
    #[must_use]
    pub fn or_default(deadline: Option<Self>, default_budget: Duration) -> Self {
        deadline.unwrap_or_else(|| Self::after(default_budget))
    }

    /// Time left before expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the budget is spent.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

// ============================================================================
// Stage payloads
// ============================================================================

/// An image as sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    /// MIME type.
    pub mime: String,
    /// Base64-encoded bytes.
    pub data: String,
}

impl From<&PendingImage> for ImageInput {
    fn from(image: &PendingImage) -> Self {
        Self {
            mime: image.mime.clone(),
            data: STANDARD.encode(&image.bytes),
        }
    }
}

/// Input of the detect stage.
#[derive(Debug, Clone, Serialize)]
pub struct DetectRequest {
    /// Task pages.
    pub images: Vec<ImageInput>,
    /// Grade on record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<u8>,
}

/// Output of the detect stage.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DetectResult {
    /// Whether the image holds a task.
    #[serde(default)]
    pub has_task: bool,
    /// Subject guessed from the image.
    #[serde(default)]
    pub subject: Option<String>,
    /// Why no task was found.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Input of the parse stage.
#[derive(Debug, Clone, Serialize)]
pub struct ParseRequest {
    /// Task pages.
    pub images: Vec<ImageInput>,
    /// Grade on record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<u8>,
    /// Subject suggested by the detect stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_hint: Option<String>,
}

/// One sub-item of a parsed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Item label as printed (`"a"`, `"2)"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Item text.
    #[serde(default)]
    pub text: String,
    /// Task type classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Expected answer format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A non-textual element recognized on the page (a table, a number line).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualFact {
    /// Kind of element.
    pub kind: String,
    /// Short description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Output of the parse stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTask {
    /// Subject of the task.
    #[serde(default)]
    pub subject: String,
    /// Grade the task is aimed at, zero when unknown.
    #[serde(default)]
    pub grade: u8,
    /// Raw extracted text of the whole task.
    #[serde(default)]
    pub task_text: String,
    /// Sub-items.
    #[serde(default)]
    pub items: Vec<TaskItem>,
    /// Visual elements.
    #[serde(default)]
    pub visual_facts: Vec<VisualFact>,
    /// Sub-points were merged into one task.
    #[serde(default)]
    pub combined_subpoints: bool,
    /// The parser is unsure and wants the student to confirm.
    #[serde(default)]
    pub needs_user_confirmation: bool,
}

impl ParsedTask {
    /// Most frequent task type among sub-items.
    #[must_use]
    pub fn dominant_task_type(&self) -> Option<String> {
        most_frequent(self.items.iter().filter_map(|i| i.task_type.as_deref()))
    }

    /// Most frequent answer format among sub-items.
    #[must_use]
    pub fn dominant_format(&self) -> Option<String> {
        most_frequent(self.items.iter().filter_map(|i| i.format.as_deref()))
    }

    /// Task text for display, falling back to the items when the text is empty.
    #[must_use]
    pub fn display_text(&self) -> String {
        if !self.task_text.trim().is_empty() {
            return self.task_text.trim().to_string();
        }
        self.items
            .iter()
            .map(|i| match &i.label {
                Some(label) => format!("{label} {}", i.text.trim()),
                None => i.text.trim().to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Most frequent non-empty value; ties go to the first seen.
fn most_frequent<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for value in values.map(str::trim).filter(|v| !v.is_empty()) {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((value, n));
        }
    }
    best.map(|(v, _)| v.to_string())
}

/// A hint already delivered for the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousHint {
    /// Hint level.
    pub level: u8,
    /// Hint text.
    pub text: String,
}

/// Input of the hint stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HintRequest {
    /// The accepted task.
    pub task: ParsedTask,
    /// Requested level, 1..=3.
    pub level: u8,
    /// Hints of lower levels, ascending.
    pub previous_hints: Vec<PreviousHint>,
    /// Teaching profile selected by routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileCore>,
}

/// Output of the hint stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintResult {
    /// Hint text.
    #[serde(default)]
    pub hint_text: String,
}

/// Input of the normalize stage.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizeRequest {
    /// Task text.
    pub task_text: String,
    /// The student's solution as typed or recognized.
    pub solution_text: String,
    /// Grade on record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<u8>,
}

/// Output of the normalize stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NormalizeResult {
    /// Solution in canonical form.
    #[serde(default)]
    pub normalized: String,
    /// Final answer extracted from the solution.
    #[serde(default)]
    pub answer: Option<String>,
}

/// Input of the check stage.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRequest {
    /// The accepted task.
    pub task: ParsedTask,
    /// Normalized solution.
    pub solution: String,
    /// Extracted final answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Grading verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The solution is correct.
    Correct,
    /// The solution is wrong.
    Incorrect,
    /// The grader gave no usable verdict.
    #[default]
    Unknown,
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(match s.trim().to_lowercase().as_str() {
            "correct" | "right" | "ok" => Self::Correct,
            "incorrect" | "wrong" | "error" => Self::Incorrect,
            _ => Self::Unknown,
        })
    }
}

/// Output of the check stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CheckResult {
    /// Verdict.
    #[serde(default)]
    pub verdict: Verdict,
    /// Explanation for the student.
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Input of the analogue stage.
#[derive(Debug, Clone, Serialize)]
pub struct AnalogueRequest {
    /// The accepted task.
    pub task: ParsedTask,
    /// Grade on record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<u8>,
    /// The student's last checked solution, so the analogue can target the mistake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_solution: Option<String>,
}

/// Output of the analogue stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AnalogueResult {
    /// The analogous task.
    #[serde(default)]
    pub task_text: String,
    /// Optional worked solution of the analogous task.
    #[serde(default)]
    pub solution: Option<String>,
}

/// Input of the OCR stage.
#[derive(Debug, Clone, Serialize)]
pub struct OcrRequest {
    /// Solution pages.
    pub images: Vec<ImageInput>,
}

/// Output of the OCR stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OcrResult {
    /// Recognized text.
    #[serde(default)]
    pub text: String,
}

// ============================================================================
// LlmProxy
// ============================================================================

/// The remote LLM proxy, one method per stage.
#[async_trait]
pub trait LlmProxy: Send + Sync {
    /// Engine name used both in requests and in cache keys.
    fn engine(&self) -> &str;

    /// Runs the detect stage.
    async fn detect(&self, request: &DetectRequest, deadline: Deadline) -> Result<DetectResult>;

    /// Runs the parse stage.
    async fn parse(&self, request: &ParseRequest, deadline: Deadline) -> Result<ParsedTask>;

    /// Runs the hint stage.
    async fn hint(&self, request: &HintRequest, deadline: Deadline) -> Result<HintResult>;

    /// Runs the normalize stage.
    async fn normalize(
        &self,
        request: &NormalizeRequest,
        deadline: Deadline,
    ) -> Result<NormalizeResult>;

    /// Runs the check stage.
    async fn check(&self, request: &CheckRequest, deadline: Deadline) -> Result<CheckResult>;

    /// Runs the analogue stage.
    async fn analogue(
        &self,
        request: &AnalogueRequest,
        deadline: Deadline,
    ) -> Result<AnalogueResult>;

    /// Runs the OCR stage.
    async fn ocr(&self, request: &OcrRequest, deadline: Deadline) -> Result<OcrResult>;
}

/// Request envelope shared by every endpoint.
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    engine_name: &'a str,
    #[serde(flatten)]
    input: &'a T,
}

/// [`LlmProxy`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLlmProxy {
    client: reqwest::Client,
    base_url: String,
    engine: String,
}

impl HttpLlmProxy {
    /// Creates a client for the proxy at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, engine: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, engine)
    }

    /// Creates a client reusing an existing `reqwest::Client`.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        engine: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            engine: engine.into(),
        }
    }

    async fn call<Req, Resp>(&self, stage: Stage, input: &Req, deadline: Deadline) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(TutorError::external(
                stage,
                ExternalErrorKind::Timeout,
                "deadline expired before the call was issued",
            ));
        }
        let millis = remaining.as_millis().to_string();
        let url = format!("{}/{}", self.base_url, stage.endpoint());
        debug!(%stage, %url, budget_ms = %millis, "Calling LLM proxy");

        let response = self
            .client
            .post(&url)
            .query(&[(TIMEOUT_QUERY, millis.as_str())])
            .header(TIMEOUT_HEADER, millis.as_str())
            .timeout(remaining)
            .json(&Envelope {
                engine_name: &self.engine,
                input,
            })
            .send()
            .await
            .map_err(|e| transport_error(stage, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(stage, &e))?;

        if !status.is_success() {
            let message = extract_error_message(&body, status.as_u16());
            warn!(%stage, status = status.as_u16(), %message, "LLM proxy returned an error");
            return Err(TutorError::external(
                stage,
                ExternalErrorKind::Status(status.as_u16()),
                message,
            ));
        }

        serde_json::from_str(&body)
            .map_err(|e| TutorError::external(stage, ExternalErrorKind::Decode, e.to_string()))
    }
}

fn transport_error(stage: Stage, error: &reqwest::Error) -> TutorError {
    let kind = if error.is_timeout() {
        ExternalErrorKind::Timeout
    } else {
        ExternalErrorKind::Network
    };
    TutorError::external(stage, kind, error.to_string())
}

/// Pulls a human-readable message out of an error response.
///
/// Tries, in order: a flat `error` or `message` string, a nested
/// `error.message`, the raw body, and finally the status code.
#[must_use]
pub fn extract_error_message(body: &str, status: u16) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        let flat = map
            .get("error")
            .and_then(serde_json::Value::as_str)
            .or_else(|| map.get("message").and_then(serde_json::Value::as_str));
        if let Some(message) = flat.filter(|m| !m.trim().is_empty()) {
            return message.trim().to_string();
        }
        let nested = map
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(serde_json::Value::as_str);
        if let Some(message) = nested.filter(|m| !m.trim().is_empty()) {
            return message.trim().to_string();
        }
    }
    let raw = body.trim();
    if raw.is_empty() {
        return format!("HTTP {status}");
    }
    raw.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[async_trait]
impl LlmProxy for HttpLlmProxy {
    fn engine(&self) -> &str {
        &self.engine
    }

    async fn detect(&self, request: &DetectRequest, deadline: Deadline) -> Result<DetectResult> {
        self.call(Stage::Detect, request, deadline).await
    }

    async fn parse(&self, request: &ParseRequest, deadline: Deadline) -> Result<ParsedTask> {
        self.call(Stage::Parse, request, deadline).await
    }

    async fn hint(&self, request: &HintRequest, deadline: Deadline) -> Result<HintResult> {
        self.call(Stage::Hint, request, deadline).await
    }

    async fn normalize(
        &self,
        request: &NormalizeRequest,
        deadline: Deadline,
    ) -> Result<NormalizeResult> {
        self.call(Stage::Normalize, request, deadline).await
    }

    async fn check(&self, request: &CheckRequest, deadline: Deadline) -> Result<CheckResult> {
        self.call(Stage::Check, request, deadline).await
    }

    async fn analogue(
        &self,
        request: &AnalogueRequest,
        deadline: Deadline,
    ) -> Result<AnalogueResult> {
        self.call(Stage::Analogue, request, deadline).await
    }

    async fn ocr(&self, request: &OcrRequest, deadline: Deadline) -> Result<OcrResult> {
        self.call(Stage::Ocr, request, deadline).await
    }
}

// ============================================================================
// Tests
// ============================================================================
