//! Fintelligence Query Router
//!
//! Routes free-text finance questions to specialized handlers and streams
//! their answers back:
//! - Scores each handler by the capabilities a query mentions
//! - Runs the handler's tool calls concurrently, with per-call timeouts and retries
//! - Falls back through the remaining handlers when one fails
//! - Delegates from composite handlers with a bounded depth
//! - Streams the answer as ordered chunks, cancellable by the consumer
//!
//! PIPELINE:
//! QUERY → ROUTE → EXECUTE (TOOLS → SYNTHESIZE) → FALLBACK? → STREAM

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod router;
pub mod streaming;
pub mod synthesis;
pub mod tools;

pub use error::{ErrorKind, ErrorReport, OrchestrationError, Result};

// Re-export common types
pub use agent::Orchestrator;
pub use config::OrchestratorConfig;
pub use handlers::{create_default_registry, HandlerLogic};
pub use models::*;
pub use registry::{Handler, HandlerRegistry};
pub use router::Router;
pub use streaming::{ResponseStream, ResponseStreamer};
pub use tools::{Tool, ToolInvoker};
