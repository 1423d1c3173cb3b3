//! Linkup web search restricted to trusted financial sources

use super::market::{classify_status, classify_transport};
use super::{FieldType, Tool, ToolSchema};
use crate::error::ToolFailure;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

const DEFAULT_LINKUP_URL: &str = "https://api.linkup.so/v1/search";

/// Market data, financial news, research and charting sites searched by default.
pub const TRUSTED_FINANCIAL_DOMAINS: &[&str] = &[
    "finance.yahoo.com",
    "google.com/finance",
    "marketwatch.com",
    "investing.com",
    "bloomberg.com",
    "reuters.com",
    "cnbc.com",
    "wsj.com",
    "seekingalpha.com",
    "morningstar.com",
    "zacks.com",
    "tipranks.com",
    "fool.com",
    "investorplace.com",
    "tradingview.com",
    "finviz.com",
];

pub struct LinkupSearchTool {
    client: Client,
    api_key: String,
    url: String,
    schema: ToolSchema,
    result_schema: ToolSchema,
}

impl LinkupSearchTool {
    pub fn new(api_key: String, url: Option<String>) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            url: url.unwrap_or_else(|| DEFAULT_LINKUP_URL.to_string()),
            schema: ToolSchema::object()
                .required("query", FieldType::String)
                .optional("symbol", FieldType::String)
                .optional("depth", FieldType::String),
            // Linkup "sourcedAnswer" output
            result_schema: ToolSchema::object()
                .required("answer", FieldType::String)
                .optional("sources", FieldType::Array),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env::var("LINKUP_API_KEY").unwrap_or_default(),
            env::var("LINKUP_API_URL").ok(),
        )
    }

    fn request_body(input: &Value) -> Result<Value, ToolFailure> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolFailure::InvalidInput("Expected 'query'".to_string()))?;

        let q = match input.get("symbol").and_then(Value::as_str) {
            Some(symbol) if !query.contains(symbol) => format!("{} ({})", query, symbol),
            _ => query.to_string(),
        };

        let depth = match input.get("depth").and_then(Value::as_str) {
            Some("deep") => "deep",
            _ => "standard",
        };

        Ok(json!({
            "q": q,
            "depth": depth,
            "outputType": "sourcedAnswer",
            "includeDomains": TRUSTED_FINANCIAL_DOMAINS,
        }))
    }
}

#[async_trait]
impl Tool for LinkupSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search trusted financial sites for the latest information"
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn result_schema(&self) -> Option<&ToolSchema> {
        Some(&self.result_schema)
    }

    async fn call(&self, input: &Value) -> Result<Value, ToolFailure> {
        if self.api_key.is_empty() {
            return Err(ToolFailure::Permanent(
                "LINKUP_API_KEY is not configured".to_string(),
            ));
        }

        let body = Self::request_body(input)?;

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ToolFailure::Permanent(format!("Invalid JSON response: {}", e)))
    }
}
