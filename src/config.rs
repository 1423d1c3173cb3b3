//! Orchestrator configuration
//!
//! Defaults apply process-wide; every value can be overridden from the
//! environment (after `.env` is loaded by the binaries).

use crate::error::OrchestrationError;
use crate::models::StreamMode;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for a single tool attempt.
    pub tool_timeout: Duration,
    /// Budget for the whole `ask` call. Must exceed `tool_timeout`.
    pub query_timeout: Duration,
    /// Retries after the first attempt when a tool reports a transient failure.
    pub max_tool_retries: u32,
    /// First retry delay; doubles on every further retry.
    pub retry_backoff: Duration,
    /// Characters per streamed chunk.
    pub chunk_chars: usize,
    /// Fragments the producer may run ahead of the consumer.
    pub stream_buffer: usize,
    pub max_delegation_depth: u32,
    pub stream_mode: StreamMode,
    /// Audit records kept before the oldest is evicted.
    pub audit_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(60),
            max_tool_retries: 3,
            retry_backoff: Duration::from_millis(250),
            chunk_chars: 5,
            stream_buffer: 1,
            max_delegation_depth: 1,
            stream_mode: StreamMode::Buffered,
            audit_capacity: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            tool_timeout: env_millis("ROUTER_TOOL_TIMEOUT_MS")?.unwrap_or(defaults.tool_timeout),
            query_timeout: env_millis("ROUTER_QUERY_TIMEOUT_MS")?
                .unwrap_or(defaults.query_timeout),
            max_tool_retries: env_parse("ROUTER_TOOL_MAX_RETRIES")?
                .unwrap_or(defaults.max_tool_retries),
            retry_backoff: env_millis("ROUTER_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.retry_backoff),
            chunk_chars: env_parse("ROUTER_CHUNK_CHARS")?.unwrap_or(defaults.chunk_chars),
            stream_buffer: env_parse("ROUTER_STREAM_BUFFER")?.unwrap_or(defaults.stream_buffer),
            max_delegation_depth: env_parse("ROUTER_MAX_DELEGATION_DEPTH")?
                .unwrap_or(defaults.max_delegation_depth),
            stream_mode: match env::var("ROUTER_STREAM_MODE").ok() {
                Some(mode) => parse_stream_mode(&mode)?,
                None => defaults.stream_mode,
            },
            audit_capacity: env_parse("ROUTER_AUDIT_CAPACITY")?.unwrap_or(defaults.audit_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_chars == 0 {
            return Err(OrchestrationError::ConfigError(
                "chunk_chars must be greater than zero".to_string(),
            ));
        }

        if self.stream_buffer == 0 {
            return Err(OrchestrationError::ConfigError(
                "stream_buffer must be greater than zero".to_string(),
            ));
        }

        if self.audit_capacity == 0 {
            return Err(OrchestrationError::ConfigError(
                "audit_capacity must be greater than zero".to_string(),
            ));
        }

        if self.tool_timeout >= self.query_timeout {
            return Err(OrchestrationError::ConfigError(format!(
                "tool timeout ({}ms) must be shorter than query timeout ({}ms)",
                self.tool_timeout.as_millis(),
                self.query_timeout.as_millis()
            )));
        }

        Ok(())
    }
}

fn parse_stream_mode(value: &str) -> Result<StreamMode> {
    match value.trim().to_lowercase().as_str() {
        "buffered" => Ok(StreamMode::Buffered),
        "incremental" => Ok(StreamMode::Incremental),
        other => Err(OrchestrationError::ConfigError(format!(
            "ROUTER_STREAM_MODE must be 'buffered' or 'incremental', got '{}'",
            other
        ))),
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has invalid value '{}'", key, raw))
        }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_chars, 5);
        assert_eq!(config.max_delegation_depth, 1);
    }

    #[test]
    fn test_tool_timeout_must_be_shorter() {
        let config = OrchestratorConfig {
            tool_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OrchestrationError::ConfigError(_))
        ));
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let config = OrchestratorConfig {
            chunk_chars: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_audit_capacity_rejected() {
        let config = OrchestratorConfig {
            audit_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_mode_parsing() {
        assert_eq!(parse_stream_mode("Incremental").unwrap(), StreamMode::Incremental);
        assert_eq!(parse_stream_mode(" buffered ").unwrap(), StreamMode::Buffered);
        assert!(parse_stream_mode("eager").is_err());
    }
}
