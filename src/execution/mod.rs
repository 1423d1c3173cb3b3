//! Handler execution
//!
//! Drives one handler turn: submit the planned tool calls concurrently, wait
//! for the ones synthesis depends on, synthesize, then fold in late results.
//! Failed turns move down the routing fallback chain; composite handlers
//! delegate through the router with bounded depth.

use crate::config::OrchestratorConfig;
use crate::error::{HandlerAttempt, OrchestrationError};
use crate::handlers::HandlerLogic;
use crate::models::{
    Answer, Query, RoutingDecision, ToolCall, ToolCallSummary, ToolOutcome, ToolRequest,
};
use crate::registry::{Handler, HandlerKind};
use crate::router::Router;
use crate::streaming::{FragmentSink, StreamItem};
use crate::synthesis::SynthesisInput;
use crate::tools::{Invocation, ToolInvoker};
use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every handler turn of one query.
pub struct RunContext {
    cancel: CancellationToken,
    fragments: Option<mpsc::Sender<StreamItem>>,
    sequence: AtomicU64,
    delivered: AtomicBool,
    attempted: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ToolCallSummary>>,
}

impl RunContext {
    /// `fragments` is set when answer text should be forwarded as it is produced.
    pub fn new(cancel: CancellationToken, fragments: Option<mpsc::Sender<StreamItem>>) -> Self {
        Self {
            cancel,
            fragments,
            sequence: AtomicU64::new(0),
            delivered: AtomicBool::new(false),
            attempted: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether any answer text already reached the consumer.
    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Marks `handler` as tried for this query. False if it already was.
    fn claim(&self, handler: &str) -> bool {
        self.attempted
            .lock()
            .map(|mut attempted| attempted.insert(handler.to_string()))
            .unwrap_or(true)
    }

    fn record_call(&self, call: &ToolCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ToolCallSummary::from(call));
        }
    }

    /// Every call resolved so far in this query, any handler, ascending sequence.
    pub fn tool_calls(&self) -> Vec<ToolCallSummary> {
        let mut calls = self.calls.lock().map(|c| c.clone()).unwrap_or_default();
        calls.sort_by_key(|c| c.sequence);
        calls
    }
}

pub struct HandlerExecutor {
    router: Arc<Router>,
    invoker: ToolInvoker,
    max_delegation_depth: u32,
}

impl HandlerExecutor {
    pub fn new(router: Arc<Router>, invoker: ToolInvoker, max_delegation_depth: u32) -> Self {
        Self {
            router,
            invoker,
            max_delegation_depth,
        }
    }

    pub fn from_config(router: Arc<Router>, config: &OrchestratorConfig) -> Self {
        Self::new(
            router,
            ToolInvoker::from_config(config),
            config.max_delegation_depth,
        )
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Run the decided handler, falling back down `decision.fallbacks` on failure.
    pub async fn run(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        ctx: &RunContext,
    ) -> Result<Answer> {
        self.run_chain(query, &decision.handler, &decision.fallbacks, 0, ctx)
            .await
    }

    fn run_chain<'a>(
        &'a self,
        query: &'a Query,
        primary: &'a str,
        fallbacks: &'a [String],
        depth: u32,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Answer>> {
        async move {
            let mut attempts: Vec<HandlerAttempt> = Vec::new();
            let chain = std::iter::once(primary).chain(fallbacks.iter().map(String::as_str));

            for name in chain {
                // Members a failed composite already tried are not run twice.
                if !ctx.claim(name) {
                    debug!(query_id = %query.query_id, handler = name, "already attempted, skipping");
                    continue;
                }

                match self.run_handler(query, name, depth, ctx).await {
                    Ok(mut answer) => {
                        attempts.append(&mut answer.attempts);
                        answer.attempts = attempts;
                        return Ok(answer);
                    }
                    Err(error) if error.triggers_fallback() => {
                        warn!(
                            query_id = %query.query_id,
                            handler = name,
                            depth,
                            error = %error,
                            "handler turn failed"
                        );
                        attempts.push(HandlerAttempt::from_error(name, &error));

                        // Delivered text cannot be retracted.
                        if ctx.delivered() {
                            return Err(OrchestrationError::NoHandlerSucceeded { attempts });
                        }
                    }
                    Err(error) => return Err(error),
                }
            }

            Err(OrchestrationError::NoHandlerSucceeded { attempts })
        }
        .boxed()
    }

    async fn run_handler(
        &self,
        query: &Query,
        name: &str,
        depth: u32,
        ctx: &RunContext,
    ) -> Result<Answer> {
        let handler = self
            .router
            .registry()
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownHandler(name.to_string()))?;

        match handler.kind() {
            HandlerKind::Leaf(logic) => self.run_leaf(query, &handler, logic.as_ref(), ctx).await,
            HandlerKind::Composite { members } => {
                if depth >= self.max_delegation_depth {
                    return Err(OrchestrationError::DelegationLoop {
                        handler: handler.name().to_string(),
                        depth: depth + 1,
                    });
                }

                let decision = self.router.select_among(query, members)?;
                info!(
                    query_id = %query.query_id,
                    team = handler.name(),
                    delegate = %decision.handler,
                    "delegating"
                );

                let mut answer = self
                    .run_chain(query, &decision.handler, &decision.fallbacks, depth + 1, ctx)
                    .await?;
                answer.delegation_path.insert(0, handler.name().to_string());
                Ok(answer)
            }
        }
    }

    async fn run_leaf(
        &self,
        query: &Query,
        handler: &Handler,
        logic: &dyn HandlerLogic,
        ctx: &RunContext,
    ) -> Result<Answer> {
        info!(query_id = %query.query_id, handler = handler.name(), "handler turn started");

        let sink = FragmentSink::new(ctx.fragments.clone(), ctx.cancel.clone());
        let result = self.drive_leaf(query, handler, logic, &sink, ctx).await;

        if sink.is_live() && sink.has_emitted() {
            ctx.delivered.store(true, Ordering::SeqCst);
        }

        let tool_calls = result?;
        let failed_calls = tool_calls
            .iter()
            .filter(|c| c.failed())
            .map(|c| c.sequence)
            .collect();

        Ok(Answer {
            query_id: query.query_id,
            handler: handler.name().to_string(),
            text: sink.into_text(),
            tool_calls,
            failed_calls,
            attempts: Vec::new(),
            delegation_path: Vec::new(),
        })
    }

    /// Returns every call the turn made, ascending sequence.
    async fn drive_leaf(
        &self,
        query: &Query,
        handler: &Handler,
        logic: &dyn HandlerLogic,
        sink: &FragmentSink,
        ctx: &RunContext,
    ) -> Result<Vec<ToolCall>> {
        let requests = logic.plan(query, handler);
        let wait_for_all = !requests.iter().any(|r| r.essential);

        let mut pending: JoinSet<ToolCall> = JoinSet::new();
        let mut outstanding: BTreeMap<u64, ToolRequest> = BTreeMap::new();
        let mut resolved: Vec<ToolCall> = Vec::with_capacity(requests.len());
        let mut essential_left = 0usize;

        for request in requests {
            let sequence = ctx.next_sequence();

            let Some(tool) = handler.tool(&request.tool).cloned() else {
                warn!(handler = handler.name(), tool = %request.tool, "planned tool is not bound");
                let error = OrchestrationError::ToolError {
                    tool: request.tool.clone(),
                    message: format!("not bound to handler {}", handler.name()),
                };
                let call = failed_call(sequence, request, &error, 0, 0);
                ctx.record_call(&call);
                resolved.push(call);
                continue;
            };

            if request.essential {
                essential_left += 1;
            }
            outstanding.insert(sequence, request.clone());

            let invoker = self.invoker.clone();
            let cancel = ctx.cancel.child_token();

            pending.spawn(async move {
                let started = Instant::now();
                let invocation = AssertUnwindSafe(invoker.invoke(tool.as_ref(), &request.input, &cancel))
                    .catch_unwind()
                    .await;
                let elapsed = started.elapsed().as_millis() as u64;

                match invocation {
                    Ok(Invocation {
                        attempts,
                        result: Ok(data),
                    }) => ToolCall {
                        sequence,
                        tool: request.tool,
                        input: request.input,
                        essential: request.essential,
                        outcome: ToolOutcome::Success { data },
                        attempts,
                        execution_time_ms: elapsed,
                    },
                    Ok(Invocation {
                        attempts,
                        result: Err(OrchestrationError::Cancelled),
                    }) => ToolCall {
                        sequence,
                        tool: request.tool,
                        input: request.input,
                        essential: request.essential,
                        outcome: ToolOutcome::Cancelled,
                        attempts,
                        execution_time_ms: elapsed,
                    },
                    Ok(Invocation {
                        attempts,
                        result: Err(error),
                    }) => failed_call(sequence, request, &error, attempts, elapsed),
                    Err(_) => {
                        let error = OrchestrationError::ToolError {
                            tool: request.tool.clone(),
                            message: "tool panicked".to_string(),
                        };
                        failed_call(sequence, request, &error, 1, elapsed)
                    }
                }
            });
        }

        // Phase 1: everything synthesis depends on.
        while essential_left > 0 || (wait_for_all && !pending.is_empty()) {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    pending.abort_all();
                    return Err(OrchestrationError::Cancelled);
                }
                joined = pending.join_next() => match joined {
                    Some(Ok(call)) => {
                        log_resolved(handler, &call);
                        ctx.record_call(&call);
                        outstanding.remove(&call.sequence);
                        if call.essential {
                            essential_left -= 1;
                        }
                        resolved.push(call);
                    }
                    Some(Err(error)) => warn!(handler = handler.name(), %error, "tool task failed to join"),
                    None => break,
                }
            }
        }

        resolved.sort_by_key(|c| c.sequence);

        if !logic.sufficient(&resolved) {
            pending.abort_all();
            for (sequence, request) in outstanding {
                ctx.record_call(&cancelled_call(sequence, request));
            }
            return Err(OrchestrationError::HandlerFailed {
                handler: handler.name().to_string(),
                reason: format!(
                    "insufficient tool results ({} of {} failed)",
                    resolved.iter().filter(|c| c.failed()).count(),
                    resolved.len()
                ),
                tool_errors: resolved.iter().filter_map(ToolCall::error_kind).collect(),
            });
        }

        let input = SynthesisInput {
            query,
            handler,
            calls: &resolved,
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                pending.abort_all();
                return Err(OrchestrationError::Cancelled);
            }
            synthesized = logic.synthesize(input, sink) => synthesized?,
        }

        // Phase 2: non-essential calls that are still running.
        let mut late: Vec<ToolCall> = Vec::new();
        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    debug!(handler = handler.name(), abandoned = pending.len(), "abandoning tool calls");
                    pending.abort_all();
                    break;
                }
                joined = pending.join_next() => match joined {
                    Some(Ok(call)) => {
                        log_resolved(handler, &call);
                        ctx.record_call(&call);
                        outstanding.remove(&call.sequence);
                        late.push(call);
                    }
                    Some(Err(error)) => warn!(handler = handler.name(), %error, "tool task failed to join"),
                    None => break,
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        if !late.is_empty() {
            late.sort_by_key(|c| c.sequence);
            if let Err(error) = logic.supplement(input, &late, sink).await {
                if matches!(error, OrchestrationError::Cancelled) {
                    return Err(error);
                }
                warn!(handler = handler.name(), %error, "late results could not be added");
            }
        }

        let mut calls = resolved;
        calls.extend(late);
        for (sequence, request) in outstanding {
            let call = cancelled_call(sequence, request);
            ctx.record_call(&call);
            calls.push(call);
        }
        calls.sort_by_key(|c| c.sequence);

        Ok(calls)
    }
}

fn failed_call(
    sequence: u64,
    request: ToolRequest,
    error: &OrchestrationError,
    attempts: u32,
    execution_time_ms: u64,
) -> ToolCall {
    ToolCall {
        sequence,
        tool: request.tool,
        input: request.input,
        essential: request.essential,
        outcome: ToolOutcome::Failed {
            kind: error.kind(),
            message: error.to_string(),
        },
        attempts,
        execution_time_ms,
    }
}

fn cancelled_call(sequence: u64, request: ToolRequest) -> ToolCall {
    ToolCall {
        sequence,
        tool: request.tool,
        input: request.input,
        essential: request.essential,
        outcome: ToolOutcome::Cancelled,
        attempts: 0,
        execution_time_ms: 0,
    }
}

fn log_resolved(handler: &Handler, call: &ToolCall) {
    debug!(
        handler = handler.name(),
        tool = %call.tool,
        sequence = call.sequence,
        succeeded = call.succeeded(),
        attempts = call.attempts,
        execution_time_ms = call.execution_time_ms,
        "tool call resolved"
    );
}
