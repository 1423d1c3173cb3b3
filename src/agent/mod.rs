//! Top-level orchestrator
//!
//! QUERY → ROUTE → RUN (fallbacks, delegation) → STREAM
//!
//! The whole pipeline runs under the per-query timeout. Whatever goes wrong,
//! the caller gets a well-formed chunk stream ending in one terminal chunk.

use crate::audit::QueryObserver;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorReport, HandlerAttempt, OrchestrationError};
use crate::execution::{HandlerExecutor, RunContext};
use crate::models::{Answer, Query, QueryEvent, QueryOutcome, StreamMode};
use crate::registry::HandlerRegistry;
use crate::router::Router;
use crate::streaming::{ResponseStream, ResponseStreamer, StreamItem};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main orchestrator that coordinates routing, execution and streaming
pub struct Orchestrator {
    router: Arc<Router>,
    executor: HandlerExecutor,
    streamer: ResponseStreamer,
    config: OrchestratorConfig,
    observers: Vec<Arc<dyn QueryObserver>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<HandlerRegistry>, config: OrchestratorConfig) -> Result<Self> {
        Self::with_router(Router::new(registry), config)
    }

    pub fn with_router(router: Router, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(router);
        Ok(Self {
            executor: HandlerExecutor::from_config(router.clone(), &config),
            streamer: ResponseStreamer::new(config.chunk_chars),
            router,
            config,
            observers: Vec::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.router.registry()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn streamer(&self) -> &ResponseStreamer {
        &self.streamer
    }

    /// Answer `query` as a chunk stream. Errors arrive as one terminal chunk.
    /// Dropping or cancelling the stream stops the work behind it.
    pub fn ask(self: &Arc<Self>, query: Query) -> ResponseStream {
        let cancel = CancellationToken::new();
        let (tx, stream) = self
            .streamer
            .channel(self.config.stream_buffer, cancel.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move { this.produce(query, tx, cancel).await });

        stream
    }

    /// Answer `query` without streaming.
    pub async fn ask_answer(&self, query: &Query) -> Result<Answer> {
        self.execute(query, &RunContext::detached()).await
    }

    async fn produce(&self, query: Query, tx: mpsc::Sender<StreamItem>, cancel: CancellationToken) {
        let live = self.config.stream_mode == StreamMode::Incremental;
        // A query timeout cancels the work, not the stream that reports it.
        let ctx = RunContext::new(cancel.child_token(), live.then(|| tx.clone()));

        let last = match self.execute(&query, &ctx).await {
            Ok(answer) => {
                if !live && !deliver(&tx, &cancel, StreamItem::Fragment(answer.text)).await {
                    return;
                }
                StreamItem::Done
            }
            Err(OrchestrationError::Cancelled) => {
                debug!(query_id = %query.query_id, "consumer cancelled");
                return;
            }
            Err(error) => StreamItem::Failed(ErrorReport::from(&error)),
        };

        deliver(&tx, &cancel, last).await;
    }

    async fn execute(&self, query: &Query, ctx: &RunContext) -> Result<Answer> {
        let started = Instant::now();
        let mut handler_chosen = None;

        info!(query_id = %query.query_id, "query received");

        let result = match tokio::time::timeout(
            self.config.query_timeout,
            self.route_and_run(query, ctx, &mut handler_chosen),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                ctx.cancellation_token().cancel();
                Err(OrchestrationError::QueryTimeout(self.config.query_timeout))
            }
        };

        let result = result.map_err(|error| fold_error(error, handler_chosen.as_deref()));

        match &result {
            Ok(answer) => info!(
                query_id = %query.query_id,
                handler = %answer.handler,
                tool_calls = answer.tool_calls.len(),
                failed_calls = answer.failed_calls.len(),
                fallbacks_used = answer.attempts.len(),
                "query answered"
            ),
            Err(error) => warn!(query_id = %query.query_id, kind = %error.kind(), error = %error, "query failed"),
        }

        self.notify(query, handler_chosen, &result, ctx, started.elapsed());
        result
    }

    async fn route_and_run(
        &self,
        query: &Query,
        ctx: &RunContext,
        handler_chosen: &mut Option<String>,
    ) -> Result<Answer> {
        let decision = self.router.select(query)?;

        info!(
            query_id = %query.query_id,
            handler = %decision.handler,
            score = decision.score,
            confidence = decision.confidence,
            justification = %decision.justification,
            "routed"
        );
        *handler_chosen = Some(decision.handler.clone());

        self.executor.run(query, &decision, ctx).await
    }

    /// Fire-and-forget: observers run on their own tasks.
    fn notify(
        &self,
        query: &Query,
        handler_chosen: Option<String>,
        result: &Result<Answer>,
        ctx: &RunContext,
        latency: Duration,
    ) {
        if self.observers.is_empty() {
            return;
        }

        let outcome = match result {
            Ok(answer) => QueryOutcome::Answered {
                handler: answer.handler.clone(),
                partial: answer.is_partial(),
            },
            Err(error) => QueryOutcome::Failed { kind: error.kind() },
        };

        let event = Arc::new(QueryEvent {
            query_id: query.query_id,
            handler_chosen,
            tool_calls: ctx.tool_calls(),
            outcome,
            latency_ms: latency.as_millis() as u64,
        });
        let query = Arc::new(query.clone());

        for observer in &self.observers {
            let observer = Arc::clone(observer);
            let event = Arc::clone(&event);
            let query = Arc::clone(&query);
            tokio::spawn(async move { observer.observe(&query, &event).await });
        }
    }
}

/// Send one item unless the consumer has gone away.
async fn deliver(
    tx: &mpsc::Sender<StreamItem>,
    cancel: &CancellationToken,
    item: StreamItem,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Only configuration defects, timeouts, cancellation and exhausted fallback
/// chains cross the orchestrator boundary as themselves.
fn fold_error(error: OrchestrationError, handler_chosen: Option<&str>) -> OrchestrationError {
    match error {
        OrchestrationError::NoHandlerSucceeded { .. }
        | OrchestrationError::QueryTimeout(_)
        | OrchestrationError::Cancelled => error,
        error if error.is_configuration_defect() => error,
        error => OrchestrationError::NoHandlerSucceeded {
            attempts: vec![HandlerAttempt::from_error(
                handler_chosen.unwrap_or("router"),
                &error,
            )],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::error::{ErrorKind, ToolFailure};
    use crate::handlers::testing::{EchoLogic, ScriptedLogic};
    use crate::models::{ResponseChunk, ToolRequest};
    use crate::registry::Handler;
    use crate::tools::testing::ScriptedTool;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            tool_timeout: Duration::from_millis(50),
            query_timeout: Duration::from_secs(2),
            max_tool_retries: 1,
            retry_backoff: Duration::from_millis(1),
            chunk_chars: 5,
            stream_buffer: 1,
            max_delegation_depth: 1,
            stream_mode: StreamMode::Buffered,
            audit_capacity: 100,
        }
    }

    fn orchestrator(handlers: Vec<Handler>, config: OrchestratorConfig) -> Arc<Orchestrator> {
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        Arc::new(Orchestrator::new(registry.seal().unwrap(), config).unwrap())
    }

    /// HandlerA(price, valuation, default) and HandlerB(news, research).
    fn scenario(a_logic: ScriptedLogic, a_tools: Vec<ScriptedTool>) -> Vec<Handler> {
        let mut a = Handler::leaf("HandlerA", "analyst", Arc::new(a_logic))
            .with_capabilities(["price", "valuation"])
            .as_default();
        for tool in a_tools {
            a = a.with_tool(Arc::new(tool));
        }
        let b = Handler::leaf("HandlerB", "researcher", Arc::new(EchoLogic))
            .with_capabilities(["news", "research"]);
        vec![a, b]
    }

    fn echo_scenario() -> Vec<Handler> {
        let a = Handler::leaf("HandlerA", "analyst", Arc::new(EchoLogic))
            .with_capabilities(["price", "valuation"])
            .as_default();
        let b = Handler::leaf("HandlerB", "researcher", Arc::new(EchoLogic))
            .with_capabilities(["news", "research"]);
        vec![a, b]
    }

    fn assert_well_formed(chunks: &[ResponseChunk]) -> String {
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.terminal, i == chunks.len() - 1);
        }
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[tokio::test]
    async fn test_price_query_answered_by_handler_a() {
        let orchestrator = orchestrator(echo_scenario(), config());
        let chunks: Vec<_> = orchestrator
            .ask(Query::new("What is the current price of XYZ?"))
            .collect()
            .await;

        let text = assert_well_formed(&chunks);
        assert_eq!(text, "HandlerA: What is the current price of XYZ?");
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 5 && c.error.is_none()));
    }

    #[tokio::test]
    async fn test_headlines_query_answered_by_handler_b() {
        let orchestrator = orchestrator(echo_scenario(), config());
        let chunks: Vec<_> = orchestrator
            .ask(Query::new("Summarize the latest headlines"))
            .collect()
            .await;
        assert_eq!(
            assert_well_formed(&chunks),
            "HandlerB: Summarize the latest headlines"
        );
    }

    #[tokio::test]
    async fn test_unmatched_query_answered_by_default() {
        let orchestrator = orchestrator(echo_scenario(), config());
        let answer = orchestrator
            .ask_answer(&Query::new("good morning"))
            .await
            .unwrap();
        assert_eq!(answer.handler, "HandlerA");
    }

    #[tokio::test]
    async fn test_tool_timeout_falls_back_to_handler_b() {
        let handlers = scenario(
            ScriptedLogic::new(vec![ToolRequest::new("quote", json!({}))]),
            vec![ScriptedTool::ok("quote", json!(1)).with_delay(Duration::from_secs(1))],
        );
        let orchestrator = orchestrator(handlers, config());

        let answer = orchestrator
            .ask_answer(&Query::new("What is the current price of XYZ?"))
            .await
            .unwrap();

        assert_eq!(answer.handler, "HandlerB");
        assert_eq!(answer.attempts.len(), 1);
        assert_eq!(answer.attempts[0].handler, "HandlerA");
        assert_eq!(answer.attempts[0].tool_errors, vec![ErrorKind::ToolTimeout]);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_stops_chunks_and_abandons_tools() {
        let slow = ScriptedTool::ok("slow", json!(2)).with_delay(Duration::from_secs(10));
        let abandoned = slow.abandoned_flag();
        let handlers = scenario(
            ScriptedLogic::new(vec![
                ToolRequest::new("quick", json!({})).essential(),
                ToolRequest::new("slow", json!({})),
            ])
            .with_fragments(&["c0", "c1", "c2", "c3", "c4"]),
            vec![ScriptedTool::ok("quick", json!(1)), slow],
        );
        let mut config = config();
        config.stream_mode = StreamMode::Incremental;
        config.chunk_chars = 2;
        config.tool_timeout = Duration::from_secs(30);
        config.query_timeout = Duration::from_secs(60);
        let orchestrator = orchestrator(handlers, config);

        let mut stream = orchestrator.ask(Query::new("price of XYZ"));
        for expected in 0..=2 {
            let chunk = stream.next().await.unwrap();
            assert_eq!(chunk.index, expected);
            assert_eq!(chunk.text, format!("c{}", expected));
            assert!(!chunk.terminal);
        }

        stream.cancel();
        assert!(stream.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_incremental_stream_matches_answer() {
        let handlers = scenario(
            ScriptedLogic::new(vec![
                ToolRequest::new("quick", json!({})).essential(),
                ToolRequest::new("late", json!({})),
            ])
            .with_fragments(&["Price ", "is ", "up. "]),
            vec![
                ScriptedTool::ok("quick", json!(1)),
                ScriptedTool::ok("late", json!(2)).with_delay(Duration::from_millis(20)),
            ],
        );
        let mut config = config();
        config.stream_mode = StreamMode::Incremental;
        let orchestrator = orchestrator(handlers, config);

        let chunks: Vec<_> = orchestrator.ask(Query::new("price of XYZ")).collect().await;
        assert_eq!(assert_well_formed(&chunks), "Price is up. +late;");
    }

    #[tokio::test]
    async fn test_empty_registry_reports_configuration_defect() {
        let orchestrator = orchestrator(vec![], config());

        let err = orchestrator
            .ask_answer(&Query::new("What is the current price of XYZ?"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoHandlersRegistered));

        let chunks: Vec<_> = orchestrator.ask(Query::new("anything")).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].terminal);
        let report = chunks[0].error.as_ref().unwrap();
        assert_eq!(report.kind, ErrorKind::NoHandlersRegistered);
        assert_eq!(chunks[0].text, report.message);
    }

    #[tokio::test]
    async fn test_exhausted_fallbacks_yield_single_error_chunk() {
        let failing = |name: &str| {
            Handler::leaf(
                name,
                "h",
                Arc::new(ScriptedLogic::new(vec![ToolRequest::new("t", json!({}))])),
            )
            .with_tool(Arc::new(ScriptedTool::failing(
                "t",
                ToolFailure::Permanent("upstream stack trace".into()),
            )))
        };
        let orchestrator = orchestrator(vec![failing("a").as_default(), failing("b")], config());

        let chunks: Vec<_> = orchestrator.ask(Query::new("q")).collect().await;
        assert_eq!(chunks.len(), 1);
        let report = chunks[0].error.as_ref().unwrap();
        assert_eq!(report.kind, ErrorKind::NoHandlerSucceeded);
        assert!(!chunks[0].text.contains("stack trace"));
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let handlers = scenario(
            ScriptedLogic::new(vec![])
                .with_fragments(&["never"])
                .with_fragment_delay(Duration::from_secs(5)),
            vec![],
        );
        let mut config = config();
        config.query_timeout = Duration::from_millis(100);
        let orchestrator = orchestrator(handlers, config);

        let chunks: Vec<_> = orchestrator.ask(Query::new("price")).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, ErrorKind::QueryTimeout);
    }

    #[tokio::test]
    async fn test_observer_receives_event() {
        let audit = Arc::new(AuditLog::new());
        let mut registry = HandlerRegistry::new();
        for handler in echo_scenario() {
            registry.register(handler).unwrap();
        }
        let orchestrator = Orchestrator::new(registry.seal().unwrap(), config())
            .unwrap()
            .with_observer(audit.clone());

        let query = Query::new("latest news please");
        orchestrator.ask_answer(&query).await.unwrap();

        let mut record = None;
        for _ in 0..50 {
            record = audit.get(query.query_id).await;
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let record = record.expect("observer was not called");
        assert_eq!(record.event.handler_chosen.as_deref(), Some("HandlerB"));
        assert!(matches!(
            record.event.outcome,
            QueryOutcome::Answered { ref handler, partial: false } if handler == "HandlerB"
        ));
    }

    #[tokio::test]
    async fn test_query_timeout_abandons_outstanding_tool_calls() {
        // HandlerA fails late, so HandlerB's tool is still in flight when the
        // query budget runs out (well before its own tool timeout).
        let feed = ScriptedTool::failing("feed", ToolFailure::Permanent("down".into()))
            .with_delay(Duration::from_millis(300));
        let quote = ScriptedTool::ok("quote", json!(1)).with_delay(Duration::from_millis(350));
        let abandoned = quote.abandoned_flag();

        let a = Handler::leaf(
            "HandlerA",
            "analyst",
            Arc::new(ScriptedLogic::new(vec![ToolRequest::new("feed", json!({})).essential()])),
        )
        .with_capabilities(["price"])
        .as_default()
        .with_tool(Arc::new(feed));
        let b = Handler::leaf(
            "HandlerB",
            "researcher",
            Arc::new(ScriptedLogic::new(vec![ToolRequest::new("quote", json!({})).essential()])),
        )
        .with_tool(Arc::new(quote));

        let mut config = config();
        config.tool_timeout = Duration::from_millis(400);
        config.query_timeout = Duration::from_millis(450);
        let orchestrator = orchestrator(vec![a, b], config);

        let started = Instant::now();
        let chunks: Vec<_> = orchestrator.ask(Query::new("price of XYZ")).collect().await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].terminal);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, ErrorKind::QueryTimeout);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(650));
        assert!(abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_query_event_lists_attempted_calls() {
        let failing = |name: &str, tool: &str| {
            Handler::leaf(
                name,
                "h",
                Arc::new(ScriptedLogic::new(vec![ToolRequest::new(tool, json!({}))])),
            )
            .with_tool(Arc::new(ScriptedTool::failing(
                tool,
                ToolFailure::Permanent("down".into()),
            )))
        };

        let audit = Arc::new(AuditLog::new());
        let mut registry = HandlerRegistry::new();
        registry.register(failing("a", "ta").as_default()).unwrap();
        registry.register(failing("b", "tb")).unwrap();
        let orchestrator = Orchestrator::new(registry.seal().unwrap(), config())
            .unwrap()
            .with_observer(audit.clone());

        let query = Query::new("anything");
        assert!(orchestrator.ask_answer(&query).await.is_err());

        let mut record = None;
        for _ in 0..50 {
            record = audit.get(query.query_id).await;
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let event = record.expect("observer was not called").event;
        assert!(matches!(
            event.outcome,
            QueryOutcome::Failed { kind: ErrorKind::NoHandlerSucceeded }
        ));
        let calls: Vec<(&str, Option<ErrorKind>)> = event
            .tool_calls
            .iter()
            .map(|c| (c.tool.as_str(), c.error))
            .collect();
        assert_eq!(
            calls,
            vec![("ta", Some(ErrorKind::ToolError)), ("tb", Some(ErrorKind::ToolError))]
        );
    }

    #[test]
    fn test_fold_error() {
        let folded = fold_error(OrchestrationError::LlmError("boom".into()), Some("a"));
        match folded {
            OrchestrationError::NoHandlerSucceeded { attempts } => {
                assert_eq!(attempts[0].handler, "a");
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(matches!(
            fold_error(OrchestrationError::NoDefaultConfigured, None),
            OrchestrationError::NoDefaultConfigured
        ));
    }
}
