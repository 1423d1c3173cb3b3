//! Default finance registry
//!
//! financial_analyst (default) answers with market data, web_researcher with
//! web search and company news, finance_team delegates between the two.

use super::{StandardLogic, ToolRule};
use crate::gemini::GeminiClient;
use crate::registry::{Handler, HandlerRegistry};
use crate::synthesis::{GeminiSynthesizer, Synthesizer, TemplateSynthesizer};
use crate::tools::{LinkupSearchTool, MarketDataClient, MarketDataTool, MarketOperation, Tool};
use crate::Result;
use std::sync::Arc;
use tracing::info;

pub const FINANCIAL_ANALYST: &str = "financial_analyst";
pub const WEB_RESEARCHER: &str = "web_researcher";
pub const FINANCE_TEAM: &str = "finance_team";

const ANALYST_POLICY: &str = "\
When a ticker or company is named, cover: current snapshot (price, market cap, key stats), \
fundamentals (growth, margins, valuation multiples), technical picture, market sentiment and \
analyst ratings, bull and bear cases, and a clear buy/sell/hold call with a 1-year price target. \
Without a specific stock, survey the market and give 3-5 picks across sectors with rationale. \
Use bold section headings, bullet points and tables for metrics. Default to moderate risk \
tolerance and a 3-5 year horizon. End recommendations with a short risk disclosure.";

const RESEARCHER_POLICY: &str = "\
Summarize the most recent, relevant developments from trusted financial sources. Lead with the \
headline facts, then context and likely market impact. Cite sources as links. Flag anything \
older than a week as dated.";

/// Trigger terms for each market data operation.
fn market_triggers(operation: MarketOperation) -> &'static [&'static str] {
    match operation {
        MarketOperation::StockPrice => &["price", "quote", "trading", "worth", "buy", "sell", "hold"],
        MarketOperation::CompanyInfo => &["company", "profile", "sector", "market cap", "business"],
        MarketOperation::StockFundamentals => &["fundamentals", "fundamental", "valuation", "p/e", "margin"],
        MarketOperation::IncomeStatements => &["income", "revenue", "earnings", "profit"],
        MarketOperation::KeyFinancialRatios => &["ratio", "valuation", "p/e", "debt"],
        MarketOperation::AnalystRecommendations => &["analyst", "rating", "target", "recommendation", "buy", "sell", "hold"],
        MarketOperation::HistoricalPrices => &["history", "historical", "performance", "trend", "year"],
        MarketOperation::CompanyNews => &["news", "headline", "announcement"],
        MarketOperation::TechnicalIndicators => &["technical", "rsi", "macd", "moving average", "support", "resistance"],
    }
}

/// Gemini when `GEMINI_API_KEY` is set, the deterministic template otherwise.
pub fn default_synthesizer() -> Arc<dyn Synthesizer> {
    match GeminiClient::from_env() {
        Some(client) => {
            info!(model = client.model(), "using Gemini synthesis");
            Arc::new(GeminiSynthesizer::new(Arc::new(client)))
        }
        None => {
            info!("GEMINI_API_KEY not set, using template synthesis");
            Arc::new(TemplateSynthesizer::new())
        }
    }
}

/// Registry wired from the environment.
pub fn create_default_registry() -> Result<Arc<HandlerRegistry>> {
    build_registry(
        MarketDataClient::from_env(),
        Arc::new(LinkupSearchTool::from_env()),
        default_synthesizer(),
    )
}

pub fn build_registry(
    market: Option<MarketDataClient>,
    search: Arc<dyn Tool>,
    synthesizer: Arc<dyn Synthesizer>,
) -> Result<Arc<HandlerRegistry>> {
    let mut analyst_logic = StandardLogic::new(synthesizer.clone());
    for operation in MarketOperation::ALL {
        let rule = ToolRule::when(operation.name(), market_triggers(operation).iter().copied());
        analyst_logic = analyst_logic.with_rule(if operation == MarketOperation::StockPrice {
            rule.essential()
        } else {
            rule
        });
    }
    analyst_logic = analyst_logic.with_rule(ToolRule::always(search.name()));

    let mut analyst = Handler::leaf(
        FINANCIAL_ANALYST,
        "Expert in financial analysis and market research",
        Arc::new(analyst_logic),
    )
    .with_capabilities(["price", "valuation", "fundamentals", "technical", "recommendation", "analyst"])
    .with_policy(ANALYST_POLICY)
    .as_default();
    for operation in MarketOperation::ALL {
        analyst = analyst.with_tool(Arc::new(MarketDataTool::new(operation, market.clone())));
    }
    let analyst = analyst.with_tool(search.clone());

    let researcher_logic = StandardLogic::new(synthesizer)
        .with_rule(ToolRule::always(search.name()).essential())
        .with_rule(ToolRule::when(
            MarketOperation::CompanyNews.name(),
            market_triggers(MarketOperation::CompanyNews).iter().copied(),
        ));

    let researcher = Handler::leaf(
        WEB_RESEARCHER,
        "Researches the latest news and sentiment from trusted financial sources",
        Arc::new(researcher_logic),
    )
    .with_capabilities(["news", "research", "sentiment", "macro"])
    .with_policy(RESEARCHER_POLICY)
    .with_tool(search.clone())
    .with_tool(Arc::new(MarketDataTool::new(MarketOperation::CompanyNews, market)));

    let team = Handler::composite(
        FINANCE_TEAM,
        "Routes portfolio questions to the analyst or the researcher",
        [FINANCIAL_ANALYST, WEB_RESEARCHER],
    )
    .with_capabilities(["portfolio", "picks"]);

    let mut registry = HandlerRegistry::new();
    registry.register(analyst)?;
    registry.register(researcher)?;
    registry.register(team)?;
    registry.seal()
}
