//! Inbound events and outbound messages exchanged with the messaging transport.
//!
//! The transport delivers one [`InboundEvent`] per user action and renders the
//! [`OutboundMessage`]s the orchestrator returns. Button payloads travel as
//! short strings (`"parse_yes"`, `"grade:5"`) so they fit in callback data.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Chat identity as assigned by the messaging platform.
pub type ChatId = i64;

// ============================================================================
// InboundEvent
// ============================================================================

/// One event delivered by the transport for a single chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Chat the event belongs to.
    pub chat_id: ChatId,
    /// User who triggered the event, when the platform provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl InboundEvent {
    /// Creates a command event.
    #[must_use]
    pub const fn command(chat_id: ChatId, command: Command) -> Self {
        Self {
            chat_id,
            user_id: None,
            kind: EventKind::Command { command },
        }
    }

    /// Creates a free-text event.
    #[must_use]
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            user_id: None,
            kind: EventKind::Text { text: text.into() },
        }
    }

    /// Creates a photo event.
    #[must_use]
    pub const fn photo(chat_id: ChatId, photo: PhotoPayload) -> Self {
        Self {
            chat_id,
            user_id: None,
            kind: EventKind::Photo { photo },
        }
    }

    /// Creates a button-press event.
    #[must_use]
    pub const fn button(chat_id: ChatId, action: ButtonAction) -> Self {
        Self {
            chat_id,
            user_id: None,
            kind: EventKind::Button { action },
        }
    }
}

/// The kind of inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A slash command.
    Command {
        /// The parsed command.
        command: Command,
    },
    /// A free-text message.
    Text {
        /// Message body.
        text: String,
    },
    /// A photo or image attachment.
    Photo {
        /// The downloaded image.
        photo: PhotoPayload,
    },
    /// An inline button press.
    Button {
        /// The callback payload.
        action: ButtonAction,
    },
}

impl EventKind {
    /// Short label used in logs and timeline records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Text { .. } => "text",
            Self::Photo { .. } => "photo",
            Self::Button { .. } => "button",
        }
    }
}

/// An image downloaded by the transport.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoPayload {
    /// Raw image bytes; base64 on the wire.
    #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
    pub bytes: Vec<u8>,
    /// MIME type reported by the platform.
    #[serde(default = "default_mime")]
    pub mime: String,
    /// Album identifier shared by photos sent together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_group_id: Option<String>,
}

impl PhotoPayload {
    /// Creates a single JPEG photo outside any album.
    #[must_use]
    pub fn jpeg(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: default_mime(),
            media_group_id: None,
        }
    }

    /// Returns the same photo tagged with an album identifier.
    #[must_use]
    pub fn in_group(mut self, media_group_id: impl Into<String>) -> Self {
        self.media_group_id = Some(media_group_id.into());
        self
    }
}

impl fmt::Debug for PhotoPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhotoPayload")
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("mime", &self.mime)
            .field("media_group_id", &self.media_group_id)
            .finish()
    }
}

fn default_mime() -> String {
    "image/jpeg".to_string()
}

fn encode_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

// ============================================================================
// Command
// ============================================================================

/// Slash commands understood by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// `/start`: greet and ask for the grade when unknown.
    Start,
    /// `/grade`: change the grade on record.
    Grade,
    /// `/new`: abandon the current task.
    NewTask,
    /// `/help`: describe what the bot can do.
    Help,
    /// `/report`: report a problem with the last answer.
    Report,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().trim_start_matches('/');
        let name = name.split('@').next().unwrap_or(name);
        match name.to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "grade" => Ok(Self::Grade),
            "new" | "new_task" => Ok(Self::NewTask),
            "help" => Ok(Self::Help),
            "report" => Ok(Self::Report),
            other => Err(format!("unknown command '/{other}'")),
        }
    }
}

// ============================================================================
// ButtonAction
// ============================================================================

/// Callback payloads attached to inline buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonAction {
    /// Grade chosen from the keyboard.
    Grade(u8),
    /// The recognized task is correct.
    ParseYes,
    /// The recognized task needs a correction.
    ParseNo,
    /// Show the next hint.
    Hint,
    /// The student is ready to send a solution.
    ReadyToSolve,
    /// Offer an analogous task.
    Analogue,
    /// Start over with a new task.
    NewTask,
    /// All album pages have been sent.
    PagesDone,
    /// Report a problem.
    Report,
    /// Leave the report flow.
    Back,
}

impl fmt::Display for ButtonAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grade(grade) => write!(f, "grade:{grade}"),
            Self::ParseYes => write!(f, "parse_yes"),
            Self::ParseNo => write!(f, "parse_no"),
            Self::Hint => write!(f, "hint"),
            Self::ReadyToSolve => write!(f, "solve"),
            Self::Analogue => write!(f, "analogue"),
            Self::NewTask => write!(f, "new_task"),
            Self::PagesDone => write!(f, "pages_done"),
            Self::Report => write!(f, "report"),
            Self::Back => write!(f, "back"),
        }
    }
}

impl FromStr for ButtonAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(grade) = s.strip_prefix("grade:") {
            return grade
                .parse::<u8>()
                .map(Self::Grade)
                .map_err(|e| format!("invalid grade payload '{s}': {e}"));
        }
        match s {
            "parse_yes" => Ok(Self::ParseYes),
            "parse_no" => Ok(Self::ParseNo),
            "hint" => Ok(Self::Hint),
            "solve" => Ok(Self::ReadyToSolve),
            "analogue" => Ok(Self::Analogue),
            "new_task" => Ok(Self::NewTask),
            "pages_done" => Ok(Self::PagesDone),
            "report" => Ok(Self::Report),
            "back" => Ok(Self::Back),
            other => Err(format!("unknown button payload '{other}'")),
        }
    }
}

impl Serialize for ButtonAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ButtonAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// OutboundMessage
// ============================================================================

/// An inline button offered with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Visible label.
    pub label: String,
    /// Payload sent back when pressed.
    pub action: ButtonAction,
}

impl Button {
    /// Creates a button.
    #[must_use]
    pub fn new(label: impl Into<String>, action: ButtonAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}

/// A message the transport should deliver to the chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination chat.
    pub chat_id: ChatId,
    /// Message body.
    pub text: String,
    /// Inline keyboard, one button per row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

impl OutboundMessage {
    /// Creates a plain text message.
    #[must_use]
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    /// Appends a button.
    #[must_use]
    pub fn with_button(mut self, label: impl Into<String>, action: ButtonAction) -> Self {
        self.buttons.push(Button::new(label, action));
        self
    }

    /// Returns `true` if the message offers the given action.
    #[must_use]
    pub fn offers(&self, action: ButtonAction) -> bool {
        self.buttons.iter().any(|b| b.action == action)
    }
}
