//! HTTP-backed market data tools
//!
//! Each operation POSTs `{"symbol": ...}` to the configured market data
//! service and returns its JSON body untouched.

use super::{FieldType, Tool, ToolSchema};
use crate::error::ToolFailure;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketOperation {
    StockPrice,
    CompanyInfo,
    StockFundamentals,
    IncomeStatements,
    KeyFinancialRatios,
    AnalystRecommendations,
    HistoricalPrices,
    CompanyNews,
    TechnicalIndicators,
}

impl MarketOperation {
    pub const ALL: [MarketOperation; 9] = [
        MarketOperation::StockPrice,
        MarketOperation::CompanyInfo,
        MarketOperation::StockFundamentals,
        MarketOperation::IncomeStatements,
        MarketOperation::KeyFinancialRatios,
        MarketOperation::AnalystRecommendations,
        MarketOperation::HistoricalPrices,
        MarketOperation::CompanyNews,
        MarketOperation::TechnicalIndicators,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MarketOperation::StockPrice => "stock_price",
            MarketOperation::CompanyInfo => "company_info",
            MarketOperation::StockFundamentals => "stock_fundamentals",
            MarketOperation::IncomeStatements => "income_statements",
            MarketOperation::KeyFinancialRatios => "key_financial_ratios",
            MarketOperation::AnalystRecommendations => "analyst_recommendations",
            MarketOperation::HistoricalPrices => "historical_prices",
            MarketOperation::CompanyNews => "company_news",
            MarketOperation::TechnicalIndicators => "technical_indicators",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MarketOperation::StockPrice => "Current price and intraday change for a symbol",
            MarketOperation::CompanyInfo => "Company profile, sector and market capitalisation",
            MarketOperation::StockFundamentals => "Fundamental metrics such as P/E, P/S and margins",
            MarketOperation::IncomeStatements => "Recent income statements",
            MarketOperation::KeyFinancialRatios => "Key financial ratios",
            MarketOperation::AnalystRecommendations => "Analyst ratings and price targets",
            MarketOperation::HistoricalPrices => "Historical daily prices",
            MarketOperation::CompanyNews => "Recent company news headlines",
            MarketOperation::TechnicalIndicators => "Technical indicators such as RSI and MACD",
        }
    }

    fn path(&self) -> String {
        format!("/api/v1/market/{}", self.name())
    }
}

/// Maps an HTTP status from a collaborator onto the tool failure taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ToolFailure {
    let detail = format!("{}: {}", status, truncate(body, 200));
    match status.as_u16() {
        408 | 504 => ToolFailure::Timeout,
        429 | 502 | 503 => ToolFailure::Unavailable(detail),
        400 | 422 => ToolFailure::InvalidInput(detail),
        _ => ToolFailure::Permanent(detail),
    }
}

/// Maps a transport error onto the tool failure taxonomy.
pub(crate) fn classify_transport(error: &reqwest::Error) -> ToolFailure {
    if error.is_timeout() {
        ToolFailure::Timeout
    } else if error.is_connect() {
        ToolFailure::Unavailable(error.to_string())
    } else {
        ToolFailure::Permanent(error.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Clone)]
pub struct MarketDataClient {
    client: Client,
    base_url: String,
}

impl MarketDataClient {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env() -> Option<Self> {
        let base_url = env::var("MARKET_DATA_API_BASE_URL")
            .or_else(|_| env::var("FINANCIAL_API_BASE_URL"))
            .ok()?;

        match Self::new(&base_url) {
            Ok(client) => Some(client),
            Err(error) => {
                warn!(%base_url, %error, "market data client could not be built");
                None
            }
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ToolFailure> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "market data request");

        let response = self
            .client
            .post(url)
            .json(body)
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

pub struct MarketDataTool {
    operation: MarketOperation,
    api: Option<MarketDataClient>,
    schema: ToolSchema,
}

impl MarketDataTool {
    pub fn new(operation: MarketOperation, api: Option<MarketDataClient>) -> Self {
        let schema = ToolSchema::object()
            .required("symbol", FieldType::String)
            .optional("query", FieldType::String);

        Self {
            operation,
            api,
            schema,
        }
    }

    pub fn operation(&self) -> MarketOperation {
        self.operation
    }
}

#[async_trait]
impl Tool for MarketDataTool {
    fn name(&self) -> &str {
        self.operation.name()
    }

    fn description(&self) -> &str {
        self.operation.description()
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn call(&self, input: &Value) -> Result<Value, ToolFailure> {
        let api = self.api.as_ref().ok_or_else(|| {
            ToolFailure::Permanent(
                "MARKET_DATA_API_BASE_URL (or FINANCIAL_API_BASE_URL) is not configured"
                    .to_string(),
            )
        })?;

        let symbol = input
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolFailure::InvalidInput("Expected 'symbol'".to_string()))?;

        api.post_json(&self.operation.path(), &json!({ "symbol": symbol }))
            .await
    }
}
