//! Error types for the query router

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Tool Errors
    // =============================

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Tool {tool} timed out after {}ms", .after.as_millis())]
    ToolTimeout { tool: String, after: Duration },

    #[error("Tool {tool} unavailable after {attempts} attempt(s): {message}")]
    ToolUnavailable {
        tool: String,
        attempts: u32,
        message: String,
    },

    #[error("Tool {tool} failed: {message}")]
    ToolError { tool: String, message: String },

    // =============================
    // Registry / Routing Errors
    // =============================

    #[error("No handlers registered")]
    NoHandlersRegistered,

    #[error("No default handler configured")]
    NoDefaultConfigured,

    #[error("Duplicate handler: {0}")]
    DuplicateHandler(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    // =============================
    // Execution Errors
    // =============================

    #[error("Delegation loop: {handler} exceeded delegation depth {depth}")]
    DelegationLoop { handler: String, depth: u32 },

    #[error("Handler {handler} failed: {reason}")]
    HandlerFailed {
        handler: String,
        reason: String,
        tool_errors: Vec<ErrorKind>,
    },

    #[error("No handler succeeded ({})", format_attempts(.attempts))]
    NoHandlerSucceeded { attempts: Vec<HandlerAttempt> },

    #[error("Query timed out after {}ms", .0.as_millis())]
    QueryTimeout(Duration),

    #[error("Query cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure reported by a tool collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("collaborator timed out")]
    Timeout,

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Permanent(String),
}

/// Serializable classification of every error the pipeline can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidToolInput,
    ToolTimeout,
    ToolUnavailable,
    ToolError,
    NoHandlersRegistered,
    NoDefaultConfigured,
    DuplicateHandler,
    UnknownHandler,
    DelegationLoop,
    HandlerFailed,
    NoHandlerSucceeded,
    QueryTimeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidToolInput => "invalid_tool_input",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolUnavailable => "tool_unavailable",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::NoHandlersRegistered => "no_handlers_registered",
            ErrorKind::NoDefaultConfigured => "no_default_configured",
            ErrorKind::DuplicateHandler => "duplicate_handler",
            ErrorKind::UnknownHandler => "unknown_handler",
            ErrorKind::DelegationLoop => "delegation_loop",
            ErrorKind::HandlerFailed => "handler_failed",
            ErrorKind::NoHandlerSucceeded => "no_handler_succeeded",
            ErrorKind::QueryTimeout => "query_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Message safe to show an end user. Never carries internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::NoHandlerSucceeded => {
                "Sorry, none of the available analysts could answer this request right now."
            }
            ErrorKind::QueryTimeout => "Sorry, this request took too long and was stopped.",
            ErrorKind::NoHandlersRegistered
            | ErrorKind::NoDefaultConfigured
            | ErrorKind::DuplicateHandler
            | ErrorKind::UnknownHandler => {
                "The assistant is not configured correctly. Please contact the operator."
            }
            ErrorKind::Cancelled => "The request was cancelled.",
            _ => "Sorry, I encountered an error while processing your request.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed handler turn, kept so a terminal failure can name every attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerAttempt {
    pub handler: String,
    pub kind: ErrorKind,
    pub reason: String,
    #[serde(default)]
    pub tool_errors: Vec<ErrorKind>,
}

impl HandlerAttempt {
    pub fn from_error(handler: &str, error: &OrchestrationError) -> Self {
        let tool_errors = match error {
            OrchestrationError::HandlerFailed { tool_errors, .. } => tool_errors.clone(),
            _ => Vec::new(),
        };

        Self {
            handler: handler.to_string(),
            kind: error.kind(),
            reason: error.to_string(),
            tool_errors,
        }
    }
}

fn format_attempts(attempts: &[HandlerAttempt]) -> String {
    if attempts.is_empty() {
        return "no handler attempted".to_string();
    }

    attempts
        .iter()
        .map(|a| format!("{}: {}", a.handler, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Caller-facing `{kind, message}` error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.user_message().to_string(),
        }
    }
}

impl From<&OrchestrationError> for ErrorReport {
    fn from(error: &OrchestrationError) -> Self {
        Self::new(error.kind())
    }
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::InvalidToolInput(_) => ErrorKind::InvalidToolInput,
            OrchestrationError::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            OrchestrationError::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            OrchestrationError::ToolError { .. } => ErrorKind::ToolError,
            OrchestrationError::NoHandlersRegistered => ErrorKind::NoHandlersRegistered,
            OrchestrationError::NoDefaultConfigured => ErrorKind::NoDefaultConfigured,
            OrchestrationError::DuplicateHandler(_) => ErrorKind::DuplicateHandler,
            OrchestrationError::UnknownHandler(_) => ErrorKind::UnknownHandler,
            OrchestrationError::DelegationLoop { .. } => ErrorKind::DelegationLoop,
            OrchestrationError::HandlerFailed { .. } => ErrorKind::HandlerFailed,
            OrchestrationError::NoHandlerSucceeded { .. } => ErrorKind::NoHandlerSucceeded,
            OrchestrationError::QueryTimeout(_) => ErrorKind::QueryTimeout,
            OrchestrationError::Cancelled => ErrorKind::Cancelled,
            OrchestrationError::LlmError(_)
            | OrchestrationError::ConfigError(_)
            | OrchestrationError::SerializationError(_)
            | OrchestrationError::HttpError(_)
            | OrchestrationError::IoError(_) => ErrorKind::Internal,
        }
    }

    /// Configuration defects are surfaced immediately and never retried.
    pub fn is_configuration_defect(&self) -> bool {
        matches!(
            self,
            OrchestrationError::NoHandlersRegistered
                | OrchestrationError::NoDefaultConfigured
                | OrchestrationError::DuplicateHandler(_)
                | OrchestrationError::UnknownHandler(_)
                | OrchestrationError::ConfigError(_)
        )
    }

    /// Whether a failed handler turn should move on to the next fallback.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            OrchestrationError::HandlerFailed { .. }
                | OrchestrationError::DelegationLoop { .. }
                | OrchestrationError::NoHandlerSucceeded { .. }
                | OrchestrationError::LlmError(_)
                | OrchestrationError::HttpError(_)
                | OrchestrationError::SerializationError(_)
        )
    }
}
