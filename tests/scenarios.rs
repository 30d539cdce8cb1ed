// Literal end-to-end scenarios, each driven purely through the event bus and
// re-derived state — no network, no exchange, matching `run_mode: Simulate`.

use std::sync::Arc;

use aurora_ledger::config::RiskConfig;
use aurora_ledger::ledger::{Event, EventBus, EventLedger, EventType, StateManager};
use aurora_ledger::risk::{RiskEngine, TradeProposal};
use aurora_ledger::types::{NewsRiskLevel, Side, SymbolFilters};
use chrono::Utc;
use serde_json::json;

fn filters() -> SymbolFilters {
    SymbolFilters { tick_size: 0.01, step_size: 0.001, min_qty: 0.001, min_notional: 5.0 }
}

async fn harness() -> (Arc<EventBus>, Arc<StateManager>) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(EventLedger::open(dir.path().join("l.log")).unwrap());
    let bus = Arc::new(EventBus::new(ledger));
    let state = Arc::new(StateManager::new(100.0));
    bus.register_many(aurora_ledger::ledger::ALL_EVENT_TYPES, state.clone());
    (bus, state)
}

#[tokio::test]
async fn scenario_1_simple_long_entry_take_profit_fill() {
    let (bus, state) = harness().await;
    let engine = RiskEngine::new(RiskConfig::default());

    let proposal = TradeProposal {
        trade_id: "t1".into(),
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        entry_price: 100.0,
        stop_price: 98.0,
        take_profit: Some(104.0),
        atr: 2.0,
        leverage: 3.0,
        score: 0.9,
        funding_rate: 0.0001,
        news_risk: NewsRiskLevel::Low,
        created_at: Utc::now(),
    };

    let result = engine.evaluate(&state.snapshot(), &proposal, &filters(), Utc::now());
    assert!(result.approved);
    assert!((result.sized_quantity - 0.500).abs() < 1e-9);

    bus.publish(Event::new(
        EventType::PositionOpened,
        json!({
            "trade_id": "t1", "symbol": "BTCUSDT", "side": "LONG",
            "entry_price": result.rounded_entry, "quantity": result.sized_quantity,
            "leverage": 3.0, "stop_loss": result.rounded_stop, "take_profit": result.rounded_take_profit,
        }),
    ))
    .await
    .unwrap();

    bus.publish(Event::new(
        EventType::PositionClosed,
        json!({"trade_id": "t1", "realized_pnl": 2.0, "reason": "tp"}),
    ))
    .await
    .unwrap();

    let snap = state.snapshot();
    assert!(snap.positions.is_empty());
    assert_eq!(snap.equity, 102.0);
    assert_eq!(snap.peak_equity, 102.0);
}

#[tokio::test]
async fn scenario_2_drawdown_trips_circuit_breaker() {
    let (bus, state) = harness().await;
    let engine = RiskEngine::new(RiskConfig::default());

    bus.publish(Event::new(
        EventType::PositionOpened,
        json!({"trade_id": "seed", "symbol": "ETHUSDT", "side": "LONG", "entry_price": 2000.0, "quantity": 1.0}),
    ))
    .await
    .unwrap();
    bus.publish(Event::new(
        EventType::PositionClosed,
        json!({"trade_id": "seed", "realized_pnl": 50.0}),
    ))
    .await
    .unwrap();
    assert_eq!(state.snapshot().peak_equity, 150.0);

    bus.publish(Event::new(
        EventType::PositionOpened,
        json!({"trade_id": "drain", "symbol": "ETHUSDT", "side": "LONG", "entry_price": 2000.0, "quantity": 1.0}),
    ))
    .await
    .unwrap();
    bus.publish(Event::new(
        EventType::PositionClosed,
        json!({"trade_id": "drain", "realized_pnl": -100.0}),
    ))
    .await
    .unwrap();
    let snap = state.snapshot();
    assert_eq!(snap.equity, 100.0);
    assert_eq!(snap.peak_equity, 150.0);

    let proposal = TradeProposal {
        trade_id: "t2".into(),
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        entry_price: 100.0,
        stop_price: 98.0,
        take_profit: None,
        atr: 2.0,
        leverage: 1.0,
        score: 0.5,
        funding_rate: 0.0,
        news_risk: NewsRiskLevel::Low,
        created_at: Utc::now(),
    };
    let result = engine.evaluate(&snap, &proposal, &filters(), Utc::now());
    assert!(result.circuit_breaker, "drawdown of 1/3 exceeds the default 20% breaker");

    bus.publish(Event::new(EventType::CircuitBreakerTriggered, json!({})))
        .await
        .unwrap();
    let snap = state.snapshot();
    assert!(snap.circuit_breaker_active);
    assert!(snap.requires_manual_review);
}

#[tokio::test]
async fn scenario_4_news_block_is_symbol_scoped() {
    let (bus, state) = harness().await;
    let engine = RiskEngine::new(RiskConfig::default());

    bus.publish(Event::new(
        EventType::NewsClassified,
        json!({
            "symbol": "ETHUSDT", "level": "HIGH",
            "expires_at": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        }),
    ))
    .await
    .unwrap();

    let snap = state.snapshot();
    let eth_proposal = TradeProposal {
        trade_id: "eth".into(),
        symbol: "ETHUSDT".into(),
        side: Side::Long,
        entry_price: 2000.0,
        stop_price: 1960.0,
        take_profit: None,
        atr: 20.0,
        leverage: 1.0,
        score: 0.5,
        funding_rate: 0.0,
        news_risk: NewsRiskLevel::Low,
        created_at: Utc::now(),
    };
    let result = engine.evaluate(&snap, &eth_proposal, &filters(), Utc::now());
    assert!(result.reasons.contains(&aurora_ledger::error::RiskRejectReason::NewsRiskBlock));

    let btc_proposal = TradeProposal { symbol: "BTCUSDT".into(), trade_id: "btc".into(), ..eth_proposal };
    let result = engine.evaluate(&snap, &btc_proposal, &filters(), Utc::now());
    assert!(result.approved, "{:?}", result.reasons);
}

#[tokio::test]
async fn scenario_5_crash_recovery_keeps_a_placed_order_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("l.log");

    {
        let ledger = Arc::new(EventLedger::open(&path).unwrap());
        let bus = EventBus::new(ledger);
        bus.publish(Event::new(
            EventType::OrderPlaced,
            json!({"client_order_id": "t1-entry", "symbol": "BTCUSDT", "side": "LONG", "order_type": "MARKET", "quantity": 0.5}),
        ))
        .await
        .unwrap();
        // Process "crashes" here, before a fill or cancel is ever recorded.
    }

    let ledger = Arc::new(EventLedger::open(&path).unwrap());
    let events = ledger.load_all().unwrap();
    let state = StateManager::new(100.0);
    state.rebuild(&events);

    let snap = state.snapshot();
    assert!(snap.open_orders.contains_key("t1-entry"));
}

#[tokio::test]
async fn scenario_6_operator_pause_then_resume() {
    let (bus, state) = harness().await;
    let engine = RiskEngine::new(RiskConfig::default());
    let until = Utc::now() + chrono::Duration::hours(4);

    bus.publish(Event::new(
        EventType::ManualIntervention,
        json!({"kind": "OPERATOR_PAUSE", "cooldown_until": until.to_rfc3339()}),
    ))
    .await
    .unwrap();

    let proposal = TradeProposal {
        trade_id: "t1".into(),
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        entry_price: 100.0,
        stop_price: 98.0,
        take_profit: None,
        atr: 2.0,
        leverage: 1.0,
        score: 0.5,
        funding_rate: 0.0,
        news_risk: NewsRiskLevel::Low,
        created_at: Utc::now(),
    };

    let snap = state.snapshot();
    let result = engine.evaluate(&snap, &proposal, &filters(), Utc::now());
    assert_eq!(result.reasons, vec![aurora_ledger::error::RiskRejectReason::CooldownActive]);

    bus.publish(Event::new(EventType::ManualIntervention, json!({"kind": "OPERATOR_RESUME"})))
        .await
        .unwrap();
    let snap = state.snapshot();
    let result = engine.evaluate(&snap, &proposal, &filters(), Utc::now());
    assert!(result.approved, "{:?}", result.reasons);
}
