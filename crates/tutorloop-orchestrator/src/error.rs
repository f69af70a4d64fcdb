//! Error types for the Tutorloop orchestrator.
//!
//! This module defines the error hierarchy for all orchestrator operations,
//! including configuration loading, template catalog loading, state machine
//! gating, and remote proxy calls.

use std::path::PathBuf;

use crate::fsm::ChatState;
use crate::llm::Stage;

/// A specialized `Result` type for Tutorloop orchestrator operations.
pub type Result<T> = std::result::Result<T, TutorError>;

/// Errors that can occur while orchestrating a tutoring conversation.
///
/// Error variants are organized by subsystem and include actionable suggestions
/// where possible to help operators resolve issues.
#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your tutorloop.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the operator.
        suggestion: String,
    },

    // ========================================================================
    // Template Catalog Errors
    // ========================================================================
    /// A catalog file could not be read or decoded.
    #[error("Failed to load template catalog '{path}': {message}\n\nSuggestion: Check the 'catalogDir' field in tutorloop.json")]
    CatalogLoadError {
        /// Path to the offending file or directory.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The catalog decoded but its contents are inconsistent.
    #[error("Invalid template catalog: {message}")]
    CatalogInvalid {
        /// Description of the inconsistency.
        message: String,
    },

    // ========================================================================
    // State Machine Errors
    // ========================================================================
    /// The proposed transition is not in the transition table.
    #[error("Illegal transition: cannot go from {from} to {to}")]
    IllegalTransition {
        /// The current state.
        from: ChatState,
        /// The proposed state.
        to: ChatState,
        /// States reachable from `from`.
        allowed: Vec<ChatState>,
    },

    // ========================================================================
    // Remote Proxy Errors
    // ========================================================================
    /// A call to the remote LLM proxy failed.
    #[error("{stage} call failed ({kind}): {message}")]
    ExternalCall {
        /// The pipeline stage whose call failed.
        stage: Stage,
        /// Failure category.
        kind: ExternalErrorKind,
        /// Best-effort message extracted from the response.
        message: String,
    },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// A record the caller expected to exist is missing.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of record.
        entity: &'static str,
        /// The lookup key.
        key: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Categories of remote proxy failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalErrorKind {
    /// The deadline expired before a response arrived.
    Timeout,
    /// Connection-level failure.
    Network,
    /// The proxy answered with a non-success HTTP status.
    Status(u16),
    /// The response body did not match the stage contract.
    Decode,
}

impl std::fmt::Display for ExternalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::Status(code) => write!(f, "status {code}"),
            Self::Decode => write!(f, "decode"),
        }
    }
}

impl TutorError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `CatalogLoadError`.
    #[must_use]
    pub fn catalog_load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CatalogLoadError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `CatalogInvalid` error.
    #[must_use]
    pub fn catalog_invalid(message: impl Into<String>) -> Self {
        Self::CatalogInvalid {
            message: message.into(),
        }
    }

    /// Creates a new `IllegalTransition` error.
    #[must_use]
    pub fn illegal_transition(from: ChatState, to: ChatState) -> Self {
        Self::IllegalTransition {
            from,
            to,
            allowed: from.successors().to_vec(),
        }
    }

    /// Creates a new `ExternalCall` error.
    #[must_use]
    pub fn external(stage: Stage, kind: ExternalErrorKind, message: impl Into<String>) -> Self {
        Self::ExternalCall {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Returns `true` if the failure may succeed when the user retries.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::ExternalCall { kind, .. } => match kind {
                ExternalErrorKind::Timeout | ExternalErrorKind::Network => true,
                ExternalErrorKind::Status(code) => *code == 429 || *code >= 500,
                ExternalErrorKind::Decode => false,
            },
            _ => false,
        }
    }

    /// Returns `true` if this is a `NotFound` error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
