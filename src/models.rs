//! Core data models exchanged between pipeline stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorKind, ErrorReport, HandlerAttempt};

//
// ================= Query =================
//

/// The caller's raw text plus opaque conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub query_id: Uuid,
    pub text: String,
    #[serde(default)]
    pub context: Option<Value>,
    pub submitted_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            text: text.into(),
            context: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

//
// ================= Routing =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub handler: String,
    pub score: usize,
    /// Share of the chosen handler's tags that matched, 0.0 for a default pick.
    pub confidence: f32,
    pub justification: String,
    pub matched_tags: Vec<String>,
    /// Remaining handlers, descending score, registration order on ties.
    pub fallbacks: Vec<String>,
}

//
// ================= Tool Calls =================
//

/// A tool call the handler wants made. Sequence numbers are assigned on submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRequest {
    pub tool: String,
    pub input: Value,
    #[serde(default)]
    pub essential: bool,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, input: Value) -> Self {
        Self {
            tool: tool.into(),
            input,
            essential: false,
        }
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { data: Value },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub sequence: u64,
    pub tool: String,
    pub input: Value,
    pub essential: bool,
    pub outcome: ToolOutcome,
    pub attempts: u32,
    pub execution_time_ms: u64,
}

impl ToolCall {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success { data } => Some(data),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failed { kind, .. } => Some(*kind),
            ToolOutcome::Cancelled => Some(ErrorKind::Cancelled),
        }
    }
}

//
// ================= Answer =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub query_id: Uuid,
    /// Leaf handler that produced the text.
    pub handler: String,
    pub text: String,
    /// Every call that contributed, ascending sequence number.
    pub tool_calls: Vec<ToolCall>,
    /// Sequence numbers of calls that did not succeed.
    pub failed_calls: Vec<u64>,
    /// Handlers tried and failed before this one.
    pub attempts: Vec<HandlerAttempt>,
    /// Composite handlers passed through on the way to `handler`.
    pub delegation_path: Vec<String>,
}

impl Answer {
    pub fn is_partial(&self) -> bool {
        !self.failed_calls.is_empty()
    }
}

//
// ================= Streaming =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseChunk {
    pub index: usize,
    pub text: String,
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// How the orchestrator hands answers to the streamer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Wait for the full answer, then window it.
    Buffered,
    /// Forward handler fragments as they are produced.
    Incremental,
}

//
// ================= Observability =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryOutcome {
    Answered { handler: String, partial: bool },
    Failed { kind: ErrorKind },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallSummary {
    pub sequence: u64,
    pub tool: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub execution_time_ms: u64,
}

impl From<&ToolCall> for ToolCallSummary {
    fn from(call: &ToolCall) -> Self {
        Self {
            sequence: call.sequence,
            tool: call.tool.clone(),
            succeeded: call.succeeded(),
            error: call.error_kind(),
            execution_time_ms: call.execution_time_ms,
        }
    }
}

/// Emitted once per completed query to the observability sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryEvent {
    pub query_id: Uuid,
    pub handler_chosen: Option<String>,
    /// Every call the query made, across fallbacks and delegation.
    pub tool_calls: Vec<ToolCallSummary>,
    pub outcome: QueryOutcome,
    pub latency_ms: u64,
}
