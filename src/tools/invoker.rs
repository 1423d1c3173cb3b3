//! Single tool call execution with timeout, retry and error normalization
//!
//! The invoker holds only immutable settings, so one instance is shared by
//! every concurrent call.

use super::Tool;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, ToolFailure};
use crate::Result;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one invocation together with how many attempts it took.
#[derive(Debug)]
pub struct Invocation {
    pub attempts: u32,
    pub result: Result<Value>,
}

#[derive(Debug, Clone)]
pub struct ToolInvoker {
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl ToolInvoker {
    pub fn new(timeout: Duration, max_retries: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.tool_timeout,
            config.max_tool_retries,
            config.retry_backoff,
        )
    }

    /// Call `tool` with `input`. Input is validated against the tool schema
    /// before any attempt is made.
    pub async fn invoke(
        &self,
        tool: &dyn Tool,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Invocation {
        if let Err(reason) = tool.schema().validate(input) {
            return Invocation {
                attempts: 0,
                result: Err(OrchestrationError::InvalidToolInput(format!(
                    "{}: {}",
                    tool.name(),
                    reason
                ))),
            };
        }

        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(tool = tool.name(), attempt, "invoking tool");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Invocation { attempts: attempt, result: Err(OrchestrationError::Cancelled) };
                }
                outcome = tokio::time::timeout(self.timeout, tool.call(input)) => outcome,
            };

            let failure = match outcome {
                Err(_) => {
                    warn!(tool = tool.name(), attempt, "tool call timed out");
                    return Invocation {
                        attempts: attempt,
                        result: Err(OrchestrationError::ToolTimeout {
                            tool: tool.name().to_string(),
                            after: self.timeout,
                        }),
                    };
                }
                Ok(Ok(data)) => {
                    return Invocation {
                        attempts: attempt,
                        result: Ok(data),
                    };
                }
                Ok(Err(failure)) => failure,
            };

            let error = match failure {
                ToolFailure::Unavailable(message) => {
                    if attempt > self.max_retries {
                        OrchestrationError::ToolUnavailable {
                            tool: tool.name().to_string(),
                            attempts: attempt,
                            message,
                        }
                    } else {
                        let delay = self.backoff_for(attempt);
                        warn!(
                            tool = tool.name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "transient tool failure, backing off"
                        );

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return Invocation { attempts: attempt, result: Err(OrchestrationError::Cancelled) };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                }
                ToolFailure::Timeout => OrchestrationError::ToolTimeout {
                    tool: tool.name().to_string(),
                    after: self.timeout,
                },
                ToolFailure::InvalidInput(message) => {
                    OrchestrationError::InvalidToolInput(format!("{}: {}", tool.name(), message))
                }
                ToolFailure::Permanent(message) => OrchestrationError::ToolError {
                    tool: tool.name().to_string(),
                    message,
                },
            };

            return Invocation {
                attempts: attempt,
                result: Err(error),
            };
        }
    }

    /// Delay before the retry that follows `attempt` (1-based): backoff, 2x, 4x, ...
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }
}
