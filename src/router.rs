//! Capability router
//!
//! Scores each handler by how many of its capability tags the query mentions,
//! directly or through a synonym. Highest score wins, registration order
//! breaks ties, and a zero score everywhere falls back to the default handler.

use crate::error::OrchestrationError;
use crate::models::{Query, RoutingDecision};
use crate::registry::{Handler, HandlerRegistry};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Static synonym table, tag → terms that count as mentioning it
const DEFAULT_SYNONYMS: &[(&str, &[&str])] = &[
    ("price", &["prices", "quote", "share price", "stock price", "trading at", "cost"]),
    ("valuation", &["valued", "fair value", "p/e", "pe ratio", "undervalued", "overvalued", "multiple", "worth"]),
    ("fundamentals", &["fundamental", "earnings", "revenue", "income statement", "margins", "balance sheet", "financials", "ratios"]),
    ("technical", &["technicals", "rsi", "macd", "moving average", "support", "resistance", "chart", "indicator", "indicators"]),
    ("recommendation", &["recommend", "buy", "sell", "hold", "suggest", "pick", "picks"]),
    ("analyst", &["analysts", "rating", "ratings", "price target", "upgrade", "downgrade"]),
    ("news", &["headline", "headlines", "breaking", "announcement", "announcements", "press release"]),
    ("research", &["investigate", "look up", "sources", "report", "reports"]),
    ("sentiment", &["mood", "bullish", "bearish", "opinion"]),
    ("macro", &["economy", "inflation", "interest rates", "fed", "gdp", "recession"]),
    ("portfolio", &["portfolios", "allocation", "allocate", "diversify", "rebalance", "holdings"]),
];

/// Lower-cased alphanumeric words; `/` is kept inside a word so "p/e" survives.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '/'))
        .map(|w| w.trim_matches('/'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn word_matches(token: &str, word: &str) -> bool {
    token == word || token.strip_suffix('s') == Some(word)
}

/// Whether `term` (one or more words) occurs as a contiguous word run in `tokens`.
pub(crate) fn mentions(tokens: &[String], term: &str) -> bool {
    let words = tokenize(term);
    if words.is_empty() || words.len() > tokens.len() {
        return false;
    }

    tokens
        .windows(words.len())
        .any(|window| window.iter().zip(&words).all(|(t, w)| word_matches(t, w)))
}

/// Tag synonyms used during scoring.
#[derive(Debug, Clone, Default)]
pub struct SynonymLexicon {
    entries: HashMap<String, Vec<String>>,
}

impl SynonymLexicon {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn finance() -> Self {
        let mut lexicon = Self::empty();
        for (tag, terms) in DEFAULT_SYNONYMS {
            lexicon = lexicon.with_synonyms(tag, terms.iter().copied());
        }
        lexicon
    }

    pub fn with_synonyms<I, S>(mut self, tag: &str, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.entries.entry(tag.to_lowercase()).or_default();
        for term in terms {
            let term = term.into().to_lowercase();
            if !entry.contains(&term) {
                entry.push(term);
            }
        }
        self
    }

    pub fn synonyms(&self, tag: &str) -> &[String] {
        self.entries.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    fn tag_mentioned(&self, tokens: &[String], tag: &str) -> bool {
        mentions(tokens, tag) || self.synonyms(tag).iter().any(|s| mentions(tokens, s))
    }
}

#[derive(Debug, Clone)]
struct Scored<'a> {
    handler: &'a Arc<Handler>,
    matched: Vec<String>,
}

#[derive(Clone)]
pub struct Router {
    registry: Arc<HandlerRegistry>,
    lexicon: SynonymLexicon,
}

impl Router {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            lexicon: SynonymLexicon::finance(),
        }
    }

    pub fn with_lexicon(mut self, lexicon: SynonymLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Route a query across every registered handler.
    pub fn select(&self, query: &Query) -> Result<RoutingDecision> {
        if self.registry.is_empty() {
            return Err(OrchestrationError::NoHandlersRegistered);
        }

        let candidates: Vec<&Arc<Handler>> = self.registry.all().iter().collect();
        let scored = self.score(&candidates, &query.text);

        let decision = match best(&scored) {
            Some(winner) => decide(winner, &scored),
            None => {
                let default = self.registry.default_handler()?;
                default_decision(default.name(), &scored)
            }
        };

        debug!(
            query_id = %query.query_id,
            handler = %decision.handler,
            score = decision.score,
            fallbacks = ?decision.fallbacks,
            "routing decision"
        );

        Ok(decision)
    }

    /// Route among a composite's members. With no match the registry default
    /// wins if it is a member, otherwise the first member.
    pub fn select_among(&self, query: &Query, members: &[String]) -> Result<RoutingDecision> {
        let candidates: Vec<&Arc<Handler>> = members
            .iter()
            .map(|name| {
                self.registry
                    .get(name)
                    .ok_or_else(|| OrchestrationError::UnknownHandler(name.clone()))
            })
            .collect::<Result<_>>()?;

        if candidates.is_empty() {
            return Err(OrchestrationError::NoHandlersRegistered);
        }

        let scored = self.score(&candidates, &query.text);

        Ok(match best(&scored) {
            Some(winner) => decide(winner, &scored),
            None => {
                let fallback = candidates
                    .iter()
                    .find(|h| h.is_default())
                    .unwrap_or(&candidates[0]);
                default_decision(fallback.name(), &scored)
            }
        })
    }

    fn score<'a>(&self, candidates: &[&'a Arc<Handler>], text: &str) -> Vec<Scored<'a>> {
        let tokens = tokenize(text);
        candidates
            .iter()
            .map(|&handler| Scored {
                handler,
                matched: handler
                    .capabilities()
                    .iter()
                    .filter(|tag| self.lexicon.tag_mentioned(&tokens, tag))
                    .cloned()
                    .collect(),
            })
            .collect()
    }
}

/// First handler with the strictly highest non-zero score.
fn best<'s, 'a>(scored: &'s [Scored<'a>]) -> Option<&'s Scored<'a>> {
    let mut winner: Option<&Scored> = None;
    for candidate in scored {
        if candidate.matched.is_empty() {
            continue;
        }
        match winner {
            Some(w) if w.matched.len() >= candidate.matched.len() => {}
            _ => winner = Some(candidate),
        }
    }
    winner
}

/// Everyone except `chosen`, descending score, stable on registration order.
fn fallbacks(chosen: &str, scored: &[Scored]) -> Vec<String> {
    let mut rest: Vec<&Scored> = scored
        .iter()
        .filter(|s| s.handler.name() != chosen)
        .collect();
    rest.sort_by(|a, b| b.matched.len().cmp(&a.matched.len()));
    rest.into_iter().map(|s| s.handler.name().to_string()).collect()
}

fn decide(winner: &Scored, scored: &[Scored]) -> RoutingDecision {
    let total = winner.handler.capabilities().len().max(1);
    RoutingDecision {
        handler: winner.handler.name().to_string(),
        score: winner.matched.len(),
        confidence: winner.matched.len() as f32 / total as f32,
        justification: format!("matched capabilities: {}", winner.matched.join(", ")),
        matched_tags: winner.matched.clone(),
        fallbacks: fallbacks(winner.handler.name(), scored),
    }
}

fn default_decision(name: &str, scored: &[Scored]) -> RoutingDecision {
    RoutingDecision {
        handler: name.to_string(),
        score: 0,
        confidence: 0.0,
        justification: "no capability matched; using default handler".to_string(),
        matched_tags: Vec::new(),
        fallbacks: fallbacks(name, scored),
    }
}
