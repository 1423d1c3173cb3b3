//! Answer synthesis
//!
//! A synthesizer turns the query, the handler's policy and the
//! sequence-ordered tool results into answer text, emitting it fragment by
//! fragment so incremental streaming can forward it as it is produced.

pub mod gemini;

pub use gemini::GeminiSynthesizer;

use crate::models::{Query, ToolCall, ToolOutcome};
use crate::registry::Handler;
use crate::streaming::FragmentSink;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Everything a synthesis step may look at. `calls` is in ascending sequence order.
#[derive(Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub query: &'a Query,
    pub handler: &'a Handler,
    pub calls: &'a [ToolCall],
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, input: SynthesisInput<'_>, sink: &FragmentSink) -> Result<()>;

    /// Called with non-essential results that resolved after `synthesize` returned.
    async fn supplement(
        &self,
        _input: SynthesisInput<'_>,
        _late: &[ToolCall],
        _sink: &FragmentSink,
    ) -> Result<()> {
        Ok(())
    }
}

fn output_data(output: &Value) -> &Value {
    output.get("data").unwrap_or(output)
}

fn number(data: &Value, key: &str) -> Option<f64> {
    data.get(key).and_then(Value::as_f64)
}

fn summarize_price(data: &Value) -> Option<String> {
    let price = number(data, "price").or_else(|| number(data, "current_price"))?;
    let symbol = data.get("symbol").and_then(Value::as_str).unwrap_or("The stock");

    let mut line = format!("**{}** is trading at **{:.2}**", symbol, price);
    if let Some(change) = number(data, "change_percent").or_else(|| number(data, "change_pct")) {
        line.push_str(&format!(" ({:+.2}% today)", change));
    }
    line.push('.');
    Some(line)
}

fn summarize_search(data: &Value) -> Option<String> {
    let answer = data.get("answer").and_then(Value::as_str)?.trim();
    let mut out = answer.to_string();

    if let Some(sources) = data.get("sources").and_then(Value::as_array) {
        let links: Vec<String> = sources
            .iter()
            .take(5)
            .filter_map(|s| {
                let url = s.get("url").and_then(Value::as_str)?;
                let name = s.get("name").and_then(Value::as_str).unwrap_or(url);
                Some(format!("- [{}]({})", name, url))
            })
            .collect();

        if !links.is_empty() {
            out.push_str("\n\nSources:\n");
            out.push_str(&links.join("\n"));
        }
    }

    Some(out)
}

/// Markdown section for one successful call.
pub fn summarize_tool_output(call: &ToolCall) -> Option<String> {
    let data = output_data(call.data()?);

    let body = match call.tool.as_str() {
        "stock_price" => summarize_price(data),
        "web_search" => summarize_search(data),
        _ => None,
    };

    let body = body.unwrap_or_else(|| {
        let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
        format!("```json\n{}\n```", pretty)
    });

    Some(format!("### {}\n\n{}\n\n", title(&call.tool), body))
}

/// One-line note for a call that did not succeed.
pub fn annotate_failure(call: &ToolCall) -> Option<String> {
    match &call.outcome {
        ToolOutcome::Success { .. } => None,
        ToolOutcome::Failed { kind, .. } => Some(format!(
            "_{} data unavailable ({})._\n\n",
            title(&call.tool),
            kind
        )),
        ToolOutcome::Cancelled => Some(format!(
            "_{} was not completed._\n\n",
            title(&call.tool)
        )),
    }
}

fn title(tool: &str) -> String {
    tool.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic markdown rendering of the tool results. Used when no LLM is configured.
#[derive(Debug, Default, Clone)]
pub struct TemplateSynthesizer;

impl TemplateSynthesizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Synthesizer for TemplateSynthesizer {
    async fn synthesize(&self, input: SynthesisInput<'_>, sink: &FragmentSink) -> Result<()> {
        sink.emit(format!("## {}\n\n", input.handler.role())).await?;

        if input.calls.is_empty() {
            sink.emit(format!(
                "No data sources were needed to answer \"{}\".\n",
                input.query.text.trim()
            ))
            .await?;
            return Ok(());
        }

        for call in input.calls {
            if let Some(section) = summarize_tool_output(call) {
                sink.emit(section).await?;
            }
        }

        for call in input.calls {
            if let Some(note) = annotate_failure(call) {
                sink.emit(note).await?;
            }
        }

        Ok(())
    }

    async fn supplement(
        &self,
        _input: SynthesisInput<'_>,
        late: &[ToolCall],
        sink: &FragmentSink,
    ) -> Result<()> {
        for call in late {
            if let Some(section) = summarize_tool_output(call) {
                sink.emit(section).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handlers::testing::EchoLogic;
    use serde_json::json;
    use std::sync::Arc;

    fn call(sequence: u64, tool: &str, outcome: ToolOutcome) -> ToolCall {
        ToolCall {
            sequence,
            tool: tool.into(),
            input: json!({}),
            essential: false,
            outcome,
            attempts: 1,
            execution_time_ms: 3,
        }
    }

    #[test]
    fn test_price_summary() {
        let c = call(
            0,
            "stock_price",
            ToolOutcome::Success {
                data: json!({"data": {"symbol": "XYZ", "price": 12.3, "change_percent": 1.5}}),
            },
        );
        let section = summarize_tool_output(&c).unwrap();
        assert!(section.starts_with("### Stock Price"));
        assert!(section.contains("**XYZ** is trading at **12.30** (+1.50% today)."));
    }

    #[test]
    fn test_search_summary_lists_sources() {
        let c = call(
            0,
            "web_search",
            ToolOutcome::Success {
                data: json!({
                    "answer": "Markets rallied.",
                    "sources": [{"name": "Reuters", "url": "https://reuters.com/a"}]
                }),
            },
        );
        let section = summarize_tool_output(&c).unwrap();
        assert!(section.contains("Markets rallied."));
        assert!(section.contains("- [Reuters](https://reuters.com/a)"));
    }

    #[test]
    fn test_failed_call_annotated() {
        let c = call(
            1,
            "company_news",
            ToolOutcome::Failed {
                kind: ErrorKind::ToolTimeout,
                message: "timed out".into(),
            },
        );
        assert!(summarize_tool_output(&c).is_none());
        assert_eq!(
            annotate_failure(&c).unwrap(),
            "_Company News data unavailable (tool_timeout)._\n\n"
        );
    }

    #[tokio::test]
    async fn test_template_renders_in_sequence_order() {
        let handler = Handler::leaf("analyst", "Financial Analyst", Arc::new(EchoLogic));
        let query = Query::new("price of XYZ");
        let calls = vec![
            call(0, "company_info", ToolOutcome::Success { data: json!({"name": "XYZ Corp"}) }),
            call(1, "stock_price", ToolOutcome::Cancelled),
            call(2, "key_financial_ratios", ToolOutcome::Success { data: json!({"pe": 20}) }),
        ];

        let sink = FragmentSink::detached();
        TemplateSynthesizer
            .synthesize(
                SynthesisInput {
                    query: &query,
                    handler: &handler,
                    calls: &calls,
                },
                &sink,
            )
            .await
            .unwrap();

        let text = sink.into_text();
        assert!(text.starts_with("## Financial Analyst"));
        let info = text.find("### Company Info").unwrap();
        let ratios = text.find("### Key Financial Ratios").unwrap();
        assert!(info < ratios);
        assert!(text.contains("_Stock Price was not completed._"));
    }
}
