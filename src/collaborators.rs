// =============================================================================
// Collaborator seams — narrow interfaces to the subsystems the core excludes
// =============================================================================
//
// Strategy scoring/indicators, universe selection, and news ingestion/
// classification are developed and owned as separate collaborators. What
// belongs here is the seam: a trait narrow enough that the orchestrator's
// loops can drive it without knowing whether the real implementation is a
// subprocess bridge, an HTTP call to a sibling service, or (in tests) a
// fixed, deterministic double.
//
// Each loop drives its collaborator the same way: `universe_loop` calls a
// universe provider and only publishes `UNIVERSE_UPDATED`; `news_loop` calls
// a news source then `llm.classify`; `strategy_loop` calls a signal
// generator per symbol. Each becomes one `async_trait`.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::types::{NewsRiskLevel, Side};

/// A single OHLCV candle, the minimal market-data unit collaborators and
/// the orchestrator's strategy loop exchange.
#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time_ms: i64,
}

/// Provides the tradable symbol universe. Refreshed on a slow cadence
/// (original runtime: once per day) — intentionally coarse-grained, not a
/// per-tick concern.
#[async_trait]
pub trait UniverseCollaborator: Send + Sync {
    async fn refresh_universe(&self) -> Result<Vec<String>, EngineError>;
}

/// A raw news item before classification.
#[derive(Debug, Clone)]
pub struct RawNewsItem {
    pub symbol: Option<String>,
    pub headline: String,
    pub published_at: DateTime<Utc>,
}

/// Polls for fresh news items.
#[async_trait]
pub trait NewsCollaborator: Send + Sync {
    async fn poll(&self) -> Result<Vec<RawNewsItem>, EngineError>;
}

/// Classifies a news item's risk level. Kept separate from
/// `NewsCollaborator` because the original runtime treats ingestion and
/// classification as independently-failing steps: a classifier outage
/// should not stop ingestion, it should fall back to `LOW` per-item (see
/// `EngineError::LLMFailure`'s documented caller behavior).
#[async_trait]
pub trait LlmCollaborator: Send + Sync {
    async fn classify(&self, item: &RawNewsItem) -> Result<NewsRiskLevel, EngineError>;
}

/// A strategy's decision about a single symbol for the current evaluation
/// cycle.
#[derive(Debug, Clone)]
pub enum SignalDecision {
    Enter {
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        take_profit: Option<f64>,
        leverage: f64,
        /// Average true range at signal time, carried through so the risk
        /// engine's sizing gate doesn't have to re-derive it from candles.
        atr: f64,
        /// Strategy confidence/strength score, opaque to the core — kept
        /// for the trade journal, not consulted by any risk gate.
        score: f64,
        /// Latest funding rate for the symbol, informational only.
        funding_rate: f64,
    },
    Exit {
        trade_id: String,
        reason: String,
    },
    Hold,
}

/// Produces a trading signal for one symbol given its recent candles.
#[async_trait]
pub trait StrategyCollaborator: Send + Sync {
    async fn evaluate_symbol(&self, symbol: &str, candles: &[Candle]) -> Result<SignalDecision, EngineError>;
}

// ---------------------------------------------------------------------------
// Deterministic test doubles
// ---------------------------------------------------------------------------

/// Always reports the same fixed universe. Used in integration tests and as
/// a safe degenerate default when no universe service is configured.
pub struct StaticUniverse(pub Vec<String>);

#[async_trait]
impl UniverseCollaborator for StaticUniverse {
    async fn refresh_universe(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.0.clone())
    }
}

/// Reports no news, ever. Used when the news subsystem is not configured
/// (`news.enabled = false`) or in deterministic tests.
pub struct NoNews;

#[async_trait]
impl NewsCollaborator for NoNews {
    async fn poll(&self) -> Result<Vec<RawNewsItem>, EngineError> {
        Ok(Vec::new())
    }
}

/// Classifies every item as `LOW` risk without inspecting it. The fallback
/// behavior for a failed/unavailable classifier, reused here as the
/// deterministic test double.
pub struct AlwaysLowRisk;

#[async_trait]
impl LlmCollaborator for AlwaysLowRisk {
    async fn classify(&self, _item: &RawNewsItem) -> Result<NewsRiskLevel, EngineError> {
        Ok(NewsRiskLevel::Low)
    }
}

/// Never signals. A safe default/test double for the strategy seam — a
/// deployment wires in the real scoring collaborator in its place.
pub struct NeverTrade;

#[async_trait]
impl StrategyCollaborator for NeverTrade {
    async fn evaluate_symbol(&self, _symbol: &str, _candles: &[Candle]) -> Result<SignalDecision, EngineError> {
        Ok(SignalDecision::Hold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_universe_returns_fixed_list() {
        let universe = StaticUniverse(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        let result = universe.refresh_universe().await.unwrap();
        assert_eq!(result, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn no_news_always_empty() {
        let news = NoNews;
        assert!(news.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn always_low_risk_ignores_item_content() {
        let item = RawNewsItem {
            symbol: Some("BTCUSDT".into()),
            headline: "exchange hacked, billions lost".into(),
            published_at: Utc::now(),
        };
        let level = AlwaysLowRisk.classify(&item).await.unwrap();
        assert_eq!(level, NewsRiskLevel::Low);
    }

    #[tokio::test]
    async fn never_trade_always_holds() {
        let decision = NeverTrade.evaluate_symbol("BTCUSDT", &[]).await.unwrap();
        assert!(matches!(decision, SignalDecision::Hold));
    }
}
