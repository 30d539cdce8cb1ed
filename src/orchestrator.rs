// =============================================================================
// Orchestrator — wires every component together and runs the concurrent loops
// =============================================================================
//
// Four concurrent loops (universe, news, strategy, reconciliation) run
// alongside an axum API server, with a reconciliation pass forced once
// before the loops start. The kill switch cancels every open order, then
// exits every open position with reason "KILL_SWITCH".
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{error, warn};

use crate::collaborators::{Candle, LlmCollaborator, NewsCollaborator, SignalDecision, StrategyCollaborator, UniverseCollaborator};
use crate::config::Settings;
use crate::error::EngineError;
use crate::exchange::{ExchangeClient, RateLimitTracker};
use crate::execution::{ExecutionEngine, UserStreamConsumer};
use crate::ledger::{Event, EventBus, EventLedger, EventType, StateManager};
use crate::reconcile;
use crate::risk::{RiskEngine, TradeProposal};
use crate::types::SymbolFilters;

const STRATEGY_INTERVAL: Duration = Duration::from_secs(60);
const UNIVERSE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a loop or an API handler needs, bundled so `Arc<AppCore>` is
/// the one thing that gets cloned into every spawned task.
pub struct AppCore {
    pub settings: RwLock<Settings>,
    pub event_bus: Arc<EventBus>,
    pub ledger: Arc<EventLedger>,
    pub state: Arc<StateManager>,
    pub risk_engine: Arc<RiskEngine>,
    pub execution: Arc<ExecutionEngine>,
    pub exchange: ExchangeClient,
    pub rate_limiter: Arc<RateLimitTracker>,
    pub symbol_filters: RwLock<HashMap<String, SymbolFilters>>,
    pub universe: Arc<dyn UniverseCollaborator>,
    pub news: Arc<dyn NewsCollaborator>,
    pub llm: Arc<dyn LlmCollaborator>,
    pub strategy: Arc<dyn StrategyCollaborator>,
    pub kill_switch_engaged: AtomicBool,
}

impl AppCore {
    pub fn is_killed(&self) -> bool {
        self.kill_switch_engaged.load(Ordering::SeqCst)
    }
}

/// Run the engine until a shutdown signal arrives. Spawns the four
/// concurrent loops plus reconciliation, and returns once any of them
/// exits (which, for loops that run forever, only happens on process
/// shutdown).
pub async fn run(core: Arc<AppCore>) {
    core.event_bus
        .publish(Event::new(EventType::SystemStarted, json!({})))
        .await
        .ok();

    if core.settings.read().run_mode != crate::types::RunMode::Simulate {
        if let Err(e) = reconcile::reconcile_once(&core.exchange, &core.state, &core.event_bus).await {
            warn!(error = %e, "startup reconciliation failed");
        }
    }

    let user_stream = Arc::new(UserStreamConsumer::new(
        "wss://fstream.binance.com/ws".to_string(),
        core.exchange.clone(),
        core.execution.clone(),
        core.state.clone(),
        core.event_bus.clone(),
    ));

    tokio::select! {
        _ = universe_loop(core.clone()) => {}
        _ = news_loop(core.clone()) => {}
        _ = strategy_loop(core.clone()) => {}
        _ = user_stream_loop(user_stream) => {}
        _ = reconciliation_loop(core.clone()) => {}
    }
}

async fn user_stream_loop(consumer: Arc<UserStreamConsumer>) {
    consumer.run().await;
}

async fn universe_loop(core: Arc<AppCore>) {
    loop {
        match core.universe.refresh_universe().await {
            Ok(symbols) => {
                let mut settings = core.settings.write();
                settings.symbols = symbols.clone();
                drop(settings);
                core.event_bus
                    .publish(Event::new(EventType::UniverseUpdated, json!({"symbols": symbols})))
                    .await
                    .ok();
            }
            Err(e) => warn!(error = %e, "universe refresh failed"),
        }
        tokio::time::sleep(UNIVERSE_INTERVAL).await;
    }
}

async fn news_loop(core: Arc<AppCore>) {
    loop {
        let poll_interval = Duration::from_secs(core.settings.read().news.poll_interval_minutes * 60);
        if !core.settings.read().news.enabled {
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        match core.news.poll().await {
            Ok(items) => {
                for item in items {
                    core.event_bus
                        .publish(Event::new(
                            EventType::NewsIngested,
                            json!({"symbol": item.symbol, "headline": item.headline}),
                        ))
                        .await
                        .ok();

                    let level = match core.llm.classify(&item).await {
                        Ok(level) => level,
                        Err(e) => {
                            warn!(error = %e, "news classification failed, defaulting to LOW");
                            crate::types::NewsRiskLevel::Low
                        }
                    };
                    let ttl = chrono::Duration::minutes(core.settings.read().news.ttl_minutes);
                    core.event_bus
                        .publish(Event::new(
                            EventType::NewsClassified,
                            json!({
                                "symbol": item.symbol,
                                "level": format!("{:?}", level).to_uppercase(),
                                "expires_at": (Utc::now() + ttl).to_rfc3339(),
                            }),
                        ))
                        .await
                        .ok();
                }
            }
            Err(e) => warn!(error = %e, "news poll failed"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn strategy_loop(core: Arc<AppCore>) {
    let mut interval = tokio::time::interval(STRATEGY_INTERVAL);
    loop {
        interval.tick().await;
        if core.is_killed() {
            continue;
        }

        let symbols = core.settings.read().symbols.clone();
        for symbol in symbols {
            if let Err(e) = evaluate_symbol(&core, &symbol).await {
                error!(symbol = %symbol, error = %e, "strategy evaluation failed");
            }
        }
    }
}

async fn evaluate_symbol(core: &Arc<AppCore>, symbol: &str) -> Result<(), EngineError> {
    let raw_klines = core.exchange.get_klines(symbol, "5m", 100).await?;
    let candles: Vec<Candle> = raw_klines
        .iter()
        .filter_map(parse_kline)
        .collect();

    let Some(last) = candles.last() else {
        return Ok(());
    };

    let already_seen = core
        .state
        .snapshot()
        .last_processed_candles
        .get(&format!("{symbol}:5m"))
        .map(|&t| t >= last.close_time_ms)
        .unwrap_or(false);
    if already_seen {
        return Ok(());
    }
    core.state.note_processed_candle(symbol, "5m", last.close_time_ms);

    let decision = core.strategy.evaluate_symbol(symbol, &candles).await?;

    core.event_bus
        .publish(Event::new(
            EventType::SignalComputed,
            json!({"symbol": symbol, "decision": format!("{decision:?}")}),
        ))
        .await?;

    match decision {
        SignalDecision::Hold => Ok(()),
        SignalDecision::Exit { trade_id, reason } => {
            core.execution.execute_exit(&trade_id, &reason).await;
            Ok(())
        }
        SignalDecision::Enter { side, entry_price, stop_loss, take_profit, leverage, atr, score, funding_rate } => {
            let filters = core
                .symbol_filters
                .read()
                .get(symbol)
                .copied()
                .unwrap_or(SymbolFilters { tick_size: 0.01, step_size: 0.001, min_qty: 0.001, min_notional: 5.0 });

            let state = core.state.snapshot();
            let now = Utc::now();
            let news_risk = state.get_news_risk(symbol, now);
            let trade_id = uuid::Uuid::new_v4().to_string();

            let proposal = TradeProposal {
                trade_id: trade_id.clone(),
                symbol: symbol.to_string(),
                side,
                entry_price,
                stop_price: stop_loss,
                take_profit,
                atr,
                leverage,
                score,
                funding_rate,
                news_risk,
                created_at: now,
            };

            core.event_bus
                .publish(Event::new(
                    EventType::TradeProposed,
                    json!({"trade_id": trade_id, "symbol": symbol, "side": format!("{side}")}),
                ))
                .await?;

            let result = core.risk_engine.evaluate(&state, &proposal, &filters, now);

            if result.circuit_breaker {
                core.event_bus
                    .publish(Event::new(
                        EventType::CircuitBreakerTriggered,
                        json!({"reason": result.primary_reason().map(|r| r.to_string())}),
                    ))
                    .await?;
                kill_switch(core).await;
                return Ok(());
            }

            if !result.approved {
                core.event_bus
                    .publish(Event::new(
                        EventType::RiskRejected,
                        json!({
                            "trade_id": trade_id,
                            "symbol": symbol,
                            "reasons": result.reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
                        }),
                    ))
                    .await?;
                return Ok(());
            }

            core.event_bus
                .publish(Event::new(EventType::RiskApproved, json!({"trade_id": trade_id, "symbol": symbol})))
                .await?;

            core.execution.execute_entry(&proposal, &result, &filters).await;
            Ok(())
        }
    }
}

fn parse_kline(raw: &serde_json::Value) -> Option<Candle> {
    let arr = raw.as_array()?;
    if arr.len() < 7 {
        return None;
    }
    let parse_f64 = |v: &serde_json::Value| -> f64 {
        v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()).unwrap_or(0.0)
    };
    Some(Candle {
        open_time_ms: arr[0].as_i64().unwrap_or(0),
        open: parse_f64(&arr[1]),
        high: parse_f64(&arr[2]),
        low: parse_f64(&arr[3]),
        close: parse_f64(&arr[4]),
        volume: parse_f64(&arr[5]),
        close_time_ms: arr[6].as_i64().unwrap_or(0),
    })
}

async fn reconciliation_loop(core: Arc<AppCore>) {
    let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        interval.tick().await;
        if core.settings.read().run_mode == crate::types::RunMode::Simulate {
            continue;
        }
        if let Err(e) = reconcile::reconcile_once(&core.exchange, &core.state, &core.event_bus).await {
            warn!(error = %e, "periodic reconciliation failed");
        }
    }
}

/// Cancel every open order, exit every open position, and latch the
/// kill switch so the strategy loop stops proposing new entries. Cancel
/// first, then flatten, in that order, so a stop/take-profit order can't
/// fire and partially fill while the position is also being closed at
/// market.
pub async fn kill_switch(core: &Arc<AppCore>) {
    warn!("kill switch engaged");
    core.kill_switch_engaged.store(true, Ordering::SeqCst);

    let snapshot = core.state.snapshot();
    for order in snapshot.open_orders.values() {
        if let Err(e) = core.execution.cancel_order(&order.symbol, &order.client_order_id).await {
            error!(client_order_id = %order.client_order_id, error = %e, "failed to cancel order during kill switch");
        }
    }
    for position in snapshot.positions.values() {
        core.execution.execute_exit(&position.trade_id, "KILL_SWITCH").await;
    }

    core.event_bus
        .publish(Event::new(EventType::KillSwitchTriggered, json!({})))
        .await
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_extracts_ohlcv() {
        let raw = json!([1620000000000i64, "100.0", "110.0", "95.0", "105.0", "10.0", 1620000300000i64]);
        let candle = parse_kline(&raw).unwrap();
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 105.0);
        assert_eq!(candle.close_time_ms, 1620000300000);
    }

    #[test]
    fn parse_kline_rejects_short_array() {
        let raw = json!([1, 2, 3]);
        assert!(parse_kline(&raw).is_none());
    }
}
