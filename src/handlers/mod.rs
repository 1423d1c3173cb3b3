//! Handler logic
//!
//! A leaf handler decides which tool calls to make for a query, whether the
//! results it got are enough to answer, and how to turn them into text.

pub mod finance;

pub use finance::create_default_registry;

use crate::models::{Query, ToolCall, ToolRequest};
use crate::registry::Handler;
use crate::router::{mentions, tokenize};
use crate::streaming::FragmentSink;
use crate::synthesis::{SynthesisInput, Synthesizer};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait HandlerLogic: Send + Sync {
    /// Tool calls to make for `query`, in submission order.
    fn plan(&self, query: &Query, handler: &Handler) -> Vec<ToolRequest>;

    /// Whether the resolved calls are enough to answer.
    fn sufficient(&self, calls: &[ToolCall]) -> bool {
        default_sufficiency(calls)
    }

    async fn synthesize(&self, input: SynthesisInput<'_>, sink: &FragmentSink) -> Result<()>;

    /// Non-essential results that resolved after `synthesize` returned.
    async fn supplement(
        &self,
        _input: SynthesisInput<'_>,
        _late: &[ToolCall],
        _sink: &FragmentSink,
    ) -> Result<()> {
        Ok(())
    }
}

/// No essential call failed and at least one call succeeded. A turn that
/// planned nothing is always sufficient.
pub fn default_sufficiency(calls: &[ToolCall]) -> bool {
    if calls.is_empty() {
        return true;
    }

    let essential_failed = calls.iter().any(|c| c.essential && c.failed());
    !essential_failed && calls.iter().any(ToolCall::succeeded)
}

// Upper-case words that are never tickers.
const NON_TICKERS: &[&str] = &[
    "I", "A", "AI", "CEO", "CFO", "CTO", "EPS", "ETF", "ETFS", "FED", "GDP", "IPO", "MACD", "NYSE",
    "PE", "RSI", "SEC", "US", "USA", "USD", "EU", "UK", "YOY", "QOQ", "EBIT", "ROE", "ROI", "SMA",
    "EMA", "OK", "FAQ", "ESG", "API", "CPI",
];

/// First plausible ticker in `text`: a `$TICKER` mention, else an upper-case word of 1-5 letters.
pub fn extract_symbol(text: &str) -> Option<String> {
    let words: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '?' | '!' | ';' | ':' | '(' | ')'))
        .map(|w| w.trim_end_matches(['.', '\'']))
        .filter(|w| !w.is_empty())
        .collect();

    let is_ticker = |w: &str| {
        (1..=5).contains(&w.len())
            && w.chars().all(|c| c.is_ascii_uppercase())
            && !NON_TICKERS.contains(&w)
    };

    words
        .iter()
        .filter_map(|w| w.strip_prefix('$'))
        .map(|w| w.to_ascii_uppercase())
        .find(|w| is_ticker(w.as_str()))
        .or_else(|| {
            words
                .iter()
                .map(|w| w.trim_end_matches("'s"))
                .find(|w| is_ticker(*w))
                .map(str::to_string)
        })
}

/// When to call one of the handler's tools.
#[derive(Debug, Clone)]
pub struct ToolRule {
    pub tool: String,
    /// Terms that trigger the call. Empty means every query.
    pub triggers: Vec<String>,
    pub essential: bool,
}

impl ToolRule {
    pub fn always(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            triggers: Vec::new(),
            essential: false,
        }
    }

    pub fn when<I, S>(tool: impl Into<String>, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: tool.into(),
            triggers: triggers.into_iter().map(Into::into).collect(),
            essential: false,
        }
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }

    fn applies(&self, tokens: &[String]) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| mentions(tokens, t))
    }
}

/// Rule-driven planning with a pluggable synthesizer.
pub struct StandardLogic {
    rules: Vec<ToolRule>,
    synthesizer: Arc<dyn Synthesizer>,
}

impl StandardLogic {
    pub fn new(synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            rules: Vec::new(),
            synthesizer,
        }
    }

    pub fn with_rule(mut self, rule: ToolRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[ToolRule] {
        &self.rules
    }
}

#[async_trait]
impl HandlerLogic for StandardLogic {
    fn plan(&self, query: &Query, handler: &Handler) -> Vec<ToolRequest> {
        let tokens = tokenize(&query.text);
        let symbol = extract_symbol(&query.text);
        let mut requests = Vec::new();

        for rule in self.rules.iter().filter(|r| r.applies(&tokens)) {
            let Some(tool) = handler.tool(&rule.tool) else {
                warn!(handler = handler.name(), tool = %rule.tool, "rule names an unbound tool");
                continue;
            };

            let mut input = Map::new();
            input.insert("query".to_string(), json!(query.text.trim()));
            match &symbol {
                Some(symbol) => {
                    input.insert("symbol".to_string(), json!(symbol));
                }
                None if tool.schema().requires("symbol") => {
                    debug!(tool = %rule.tool, "no ticker in query, skipping");
                    continue;
                }
                None => {}
            }

            let request = ToolRequest::new(rule.tool.clone(), Value::Object(input));
            requests.push(if rule.essential {
                request.essential()
            } else {
                request
            });
        }

        requests
    }

    async fn synthesize(&self, input: SynthesisInput<'_>, sink: &FragmentSink) -> Result<()> {
        self.synthesizer.synthesize(input, sink).await
    }

    async fn supplement(
        &self,
        input: SynthesisInput<'_>,
        late: &[ToolCall],
        sink: &FragmentSink,
    ) -> Result<()> {
        self.synthesizer.supplement(input, late, sink).await
    }
}
