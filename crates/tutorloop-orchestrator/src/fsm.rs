//! Conversation state machine for a single chat.
//!
//! The machine is table-driven: every [`ChatState`] enumerates its legal
//! successors and [`can_transition`] only consults that table. Inbound events
//! are mapped to a proposed successor by [`infer_next_state`] without touching
//! any external service; the orchestrator then gates the proposal with
//! [`evaluate`].
//!
//! The main cycle is:
//!
//! ```text
//! AwaitGrade -> AwaitingTask -> CollectingPages -> Detect -> Parse -> [Confirm]
//!     -> Hints -> AwaitSolution -> [Ocr] -> Normalize -> Check
//!     -> Correct | Incorrect -> Analogue -> AwaitingTask
//! ```
//!
//! `Report` is reachable from every state and returns to the state it was
//! entered from.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{ButtonAction, Command, EventKind};

// ============================================================================
// ChatState
// ============================================================================

/// Position of a chat in the tutoring conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    /// No grade on record; waiting for the student to pick one.
    #[default]
    AwaitGrade,
    /// Ready for a photo of a new task.
    AwaitingTask,
    /// Accumulating album pages of one task.
    CollectingPages,
    /// Checking whether the image holds a task at all.
    Detect,
    /// Extracting structured task fields from the image.
    Parse,
    /// Waiting for the student to confirm or correct the recognized task.
    Confirm,
    /// Task accepted; leveled hints are available.
    Hints,
    /// Waiting for the student's solution.
    AwaitSolution,
    /// Reading a photographed solution.
    Ocr,
    /// Bringing the solution into a comparable form.
    Normalize,
    /// Grading the solution.
    Check,
    /// The solution was graded correct.
    Correct,
    /// The solution was graded incorrect.
    Incorrect,
    /// Generating an analogous task.
    Analogue,
    /// Collecting a problem report.
    Report,
}

use ChatState::{
    Analogue, AwaitGrade, AwaitSolution, AwaitingTask, Check, CollectingPages, Confirm, Correct,
    Detect, Hints, Incorrect, Normalize, Ocr, Parse, Report,
};

impl ChatState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 15] = [
        AwaitGrade,
        AwaitingTask,
        CollectingPages,
        Detect,
        Parse,
        Confirm,
        Hints,
        AwaitSolution,
        Ocr,
        Normalize,
        Check,
        Correct,
        Incorrect,
        Analogue,
        Report,
    ];

    /// The transition table: states legally reachable from `self`.
    #[must_use]
    pub const fn successors(self) -> &'static [Self] {
        match self {
            AwaitGrade => &[AwaitGrade, AwaitingTask, Report],
            AwaitingTask => &[AwaitingTask, CollectingPages, AwaitGrade, Report],
            CollectingPages => &[CollectingPages, Detect, AwaitingTask, AwaitGrade, Report],
            Detect => &[Parse, AwaitingTask, CollectingPages, Report],
            Parse => &[Confirm, Hints, AwaitingTask, CollectingPages, Report],
            Confirm => &[Confirm, Hints, AwaitingTask, CollectingPages, AwaitGrade, Report],
            Hints => &[
                Hints,
                AwaitSolution,
                Normalize,
                Analogue,
                AwaitingTask,
                CollectingPages,
                AwaitGrade,
                Report,
            ],
            AwaitSolution => &[
                Ocr,
                Normalize,
                Hints,
                Analogue,
                AwaitingTask,
                AwaitGrade,
                Report,
            ],
            Ocr => &[Normalize, AwaitSolution, Report],
            Normalize => &[Check, AwaitSolution, Report],
            Check => &[Correct, Incorrect, AwaitSolution, Report],
            Correct => &[Analogue, AwaitingTask, CollectingPages, AwaitGrade, Report],
            Incorrect => &[
                Hints,
                Ocr,
                Normalize,
                Analogue,
                AwaitingTask,
                AwaitGrade,
                Report,
            ],
            Analogue => &[AwaitingTask, AwaitSolution, Hints, CollectingPages, Report],
            Report => &[
                Report,
                AwaitGrade,
                AwaitingTask,
                Confirm,
                Hints,
                AwaitSolution,
                Correct,
                Incorrect,
            ],
        }
    }

    /// Returns `true` while a photo would belong to the current task's solution
    /// rather than start a new task.
    #[must_use]
    pub const fn is_awaiting_solution(self) -> bool {
        matches!(self, AwaitSolution | Incorrect)
    }

    /// Returns `true` for states only held while a stage call is running.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Detect | Parse | Ocr | Normalize | Check)
    }

    /// Human-readable description of what the student can do in this state.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            AwaitGrade => "choose your grade",
            AwaitingTask => "send a photo of a new task",
            CollectingPages => "send more pages of the task",
            Detect | Parse => "let me read the task",
            Confirm => "confirm or correct the recognized task",
            Hints => "ask for a hint",
            AwaitSolution => "send your solution",
            Ocr | Normalize | Check => "let me check the solution",
            Correct | Incorrect => "see the result of the check",
            Analogue => "try an analogous task",
            Report => "report a problem",
        }
    }
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AwaitGrade => "await_grade",
            AwaitingTask => "awaiting_task",
            CollectingPages => "collecting_pages",
            Detect => "detect",
            Parse => "parse",
            Confirm => "confirm",
            Hints => "hints",
            AwaitSolution => "await_solution",
            Ocr => "ocr",
            Normalize => "normalize",
            Check => "check",
            Correct => "correct",
            Incorrect => "incorrect",
            Analogue => "analogue",
            Report => "report",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Table queries
// ============================================================================

/// Returns `true` if the table allows moving from `current` to `proposed`.
#[must_use]
pub fn can_transition(current: ChatState, proposed: ChatState) -> bool {
    current.successors().contains(&proposed)
}

/// Derives the successor an event asks for, or `None` if the event has no
/// bearing on the current state (a stray message).
///
/// `ButtonAction::Back` is not resolved here: its target is the state the
/// report flow was entered from, which only the session knows.
#[must_use]
pub fn infer_next_state(event: &EventKind, current: ChatState) -> Option<ChatState> {
    match event {
        EventKind::Command { command } => match command {
            Command::Start if current == AwaitGrade => Some(AwaitGrade),
            Command::Start | Command::NewTask => Some(AwaitingTask),
            Command::Grade => Some(AwaitGrade),
            Command::Report => Some(Report),
            Command::Help => None,
        },
        EventKind::Text { text } => match current {
            AwaitGrade => parse_grade(text).map(|_| AwaitingTask),
            Confirm => Some(Hints),
            Hints | AwaitSolution | Incorrect => Some(Normalize),
            Report => Some(Report),
            _ => None,
        },
        EventKind::Photo { .. } => {
            if current.is_awaiting_solution() {
                Some(Ocr)
            } else {
                Some(CollectingPages)
            }
        }
        EventKind::Button { action } => match action {
            ButtonAction::Grade(_) | ButtonAction::NewTask => Some(AwaitingTask),
            ButtonAction::ParseYes => Some(Hints),
            ButtonAction::ParseNo => Some(Confirm),
            ButtonAction::Hint => Some(Hints),
            ButtonAction::ReadyToSolve => Some(AwaitSolution),
            ButtonAction::Analogue => Some(Analogue),
            ButtonAction::PagesDone => Some(Detect),
            ButtonAction::Report => Some(Report),
            ButtonAction::Back => None,
        },
    }
}

/// Parses a typed grade (`"5"`, `"5 grade"`, `"grade 11"`); valid grades are 1..=11.
#[must_use]
pub fn parse_grade(text: &str) -> Option<u8> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u8>().ok().filter(|g| (1..=11).contains(g))
}

// ============================================================================
// Gate
// ============================================================================

/// Outcome of gating a proposed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// The event does not propose any transition.
    NoProposal,
    /// The proposal is legal and should be committed.
    Allow(ChatState),
    /// The proposal is not in the table.
    Deny {
        /// The proposed state.
        proposed: ChatState,
        /// States reachable from the current one.
        allowed: Vec<ChatState>,
    },
}

/// Gates a proposal against the table.
#[must_use]
pub fn evaluate(current: ChatState, proposal: Option<ChatState>) -> Gate {
    match proposal {
        None => Gate::NoProposal,
        Some(proposed) if can_transition(current, proposed) => Gate::Allow(proposed),
        Some(proposed) => Gate::Deny {
            proposed,
            allowed: current.successors().to_vec(),
        },
    }
}

/// Builds the user-facing explanation for a denied proposal.
#[must_use]
pub fn explain_denial(current: ChatState, allowed: &[ChatState]) -> String {
    let mut options: Vec<&str> = allowed
        .iter()
        .filter(|s| **s != current && !s.is_transient())
        .map(|s| s.describe())
        .collect();
    options.dedup();
    if options.is_empty() {
        format!("That isn't possible right now. Please {}.", current.describe())
    } else {
        format!(
            "That isn't possible right now. Please {}. From here you can: {}.",
            current.describe(),
            options.join("; ")
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
