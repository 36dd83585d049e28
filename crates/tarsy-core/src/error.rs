//! Error taxonomy shared across every Tarsy crate.

use thiserror::Error as ThisError;

/// The fixed set of failure categories a session or stage can end in.
///
/// Every crate's own error type carries one of these as a field rather than
/// inventing its own taxonomy, so the session/stage/interaction records can
/// store a single `kind` column regardless of which component raised it.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Duplicate,
    NoChain,
    SelectionViolation,
    ToolFailure,
    ParseMalformed,
    LlmEmpty,
    LlmTimeout,
    ToolTimeout,
    SessionTimeout,
    MaxIterationsReached,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::NoChain => "no_chain",
            ErrorKind::SelectionViolation => "selection_violation",
            ErrorKind::ToolFailure => "tool_failure",
            ErrorKind::ParseMalformed => "parse_malformed",
            ErrorKind::LlmEmpty => "llm_empty",
            ErrorKind::LlmTimeout => "llm_timeout",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::SessionTimeout => "session_timeout",
            ErrorKind::MaxIterationsReached => "max_iterations_reached",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single error carrying a [`ErrorKind`], a human message, and an optional source.
#[derive(ThisError, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, message)
    }

    pub fn no_chain(alert_type: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NoChain, format!("no chain registered for alert type '{alert_type}'"))
    }

    pub fn selection_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SelectionViolation, message)
    }

    pub fn tool_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolFailure, message)
    }

    pub fn parse_malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseMalformed, message)
    }

    pub fn llm_empty(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LlmEmpty, message)
    }

    pub fn llm_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LlmTimeout, message)
    }

    pub fn tool_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolTimeout, message)
    }

    pub fn session_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionTimeout, message)
    }

    pub fn max_iterations_reached(limit: u32) -> Self {
        Self::new(
            ErrorKind::MaxIterationsReached,
            format!("reached the {limit} iteration limit without a final answer"),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::LlmTimeout | ErrorKind::ToolTimeout)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source(ErrorKind::ParseMalformed, "json decode failed", e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::with_source(ErrorKind::Internal, "io failure", e)
    }
}
