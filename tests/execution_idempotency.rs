// Duplicate-delivery and idempotent-cancel properties of the execution
// engine, exercised in `Simulate` mode so no network calls are involved.

use std::sync::Arc;

use aurora_ledger::config::RiskConfig;
use aurora_ledger::exchange::{ExchangeClient, RateLimitTracker};
use aurora_ledger::execution::{coid, ExecutionEngine};
use aurora_ledger::ledger::{Event, EventBus, EventLedger, EventType, StateManager};
use aurora_ledger::risk::{RiskEngine, TradeProposal};
use aurora_ledger::types::{NewsRiskLevel, RunMode, Side, SymbolFilters};
use chrono::Utc;
use serde_json::json;

async fn engine() -> (Arc<EventBus>, Arc<EventLedger>, Arc<StateManager>, ExecutionEngine) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(EventLedger::open(dir.path().join("l.log")).unwrap());
    let bus = Arc::new(EventBus::new(ledger.clone()));
    let state = Arc::new(StateManager::new(100.0));
    bus.register_many(aurora_ledger::ledger::ALL_EVENT_TYPES, state.clone());

    let client = ExchangeClient::new("key", "secret", true);
    let rate_limiter = Arc::new(RateLimitTracker::new());
    let risk_engine = Arc::new(RiskEngine::new(RiskConfig::default()));
    let exec = ExecutionEngine::new(client, rate_limiter, bus.clone(), state.clone(), risk_engine, RunMode::Simulate);
    (bus, ledger, state, exec)
}

fn filters() -> SymbolFilters {
    SymbolFilters { tick_size: 0.01, step_size: 0.001, min_qty: 0.001, min_notional: 5.0 }
}

fn proposal() -> TradeProposal {
    TradeProposal {
        trade_id: "t1".into(),
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        entry_price: 100.0,
        stop_price: 98.0,
        take_profit: Some(104.0),
        atr: 2.0,
        leverage: 3.0,
        score: 0.9,
        funding_rate: 0.0,
        news_risk: NewsRiskLevel::Low,
        created_at: Utc::now(),
    }
}

#[test]
fn client_order_ids_carry_trade_id_and_leg() {
    assert_eq!(coid::build("abc-123", coid::ENTRY), "abc-123-entry");
    assert_eq!(coid::parse("abc-123-entry"), Some(("abc-123", "entry")));
    assert_eq!(coid::parse("no-dash-here-stop"), Some(("no-dash-here", "stop")));
    assert_eq!(coid::parse("nodash"), None);
}

#[tokio::test]
async fn duplicate_fill_notifications_commit_exactly_one_order_filled() {
    let (bus, ledger, _state, exec) = engine().await;
    let coid_entry = coid::build("t1", coid::ENTRY);
    bus.publish(Event::new(
        EventType::OrderPlaced,
        json!({"client_order_id": coid_entry, "symbol": "BTCUSDT", "side": "LONG", "order_type": "MARKET", "quantity": 0.5}),
    ))
    .await
    .unwrap();

    // Both the REST response and the user-data-stream push report the same
    // fill; only the first should be committed to the ledger.
    exec.handle_order_filled(&coid_entry, "exch-fill-1", 100.0, 0.5).await.unwrap();
    exec.handle_order_filled(&coid_entry, "exch-fill-1", 100.0, 0.5).await.unwrap();

    let events = ledger.load_all().unwrap();
    let filled_count = events.iter().filter(|e| e.event_type == EventType::OrderFilled).count();
    assert_eq!(filled_count, 1, "duplicate fill notifications must dedup to a single committed event");
}

#[tokio::test]
async fn a_simulated_entry_opens_a_position_via_the_same_fill_path_as_a_live_order() {
    let (_bus, ledger, state, exec) = engine().await;
    let risk_engine = RiskEngine::new(RiskConfig::default());
    let result = risk_engine.evaluate(&state.snapshot(), &proposal(), &filters(), Utc::now());
    assert!(result.approved);

    exec.execute_entry(&proposal(), &result, &filters()).await;

    let snap = state.snapshot();
    let position = snap.positions.get("t1").expect("simulated entry must open a position");
    assert_eq!(position.symbol, "BTCUSDT");
    assert_eq!(position.entry_price, result.rounded_entry);

    let events = ledger.load_all().unwrap();
    assert_eq!(events.iter().filter(|e| e.event_type == EventType::OrderPlaced).count(), 1);
    assert_eq!(events.iter().filter(|e| e.event_type == EventType::OrderFilled).count(), 1);
    assert_eq!(events.iter().filter(|e| e.event_type == EventType::PositionOpened).count(), 1);
}

#[tokio::test]
async fn cancelling_an_unknown_order_is_a_harmless_no_op() {
    let (_bus, _ledger, _state, exec) = engine().await;
    let result = exec.cancel_order("BTCUSDT", "never-placed-entry").await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn cancelling_a_known_order_twice_is_idempotent() {
    let (bus, _ledger, state, exec) = engine().await;
    let coid_entry = coid::build("t1", coid::ENTRY);
    bus.publish(Event::new(
        EventType::OrderPlaced,
        json!({"client_order_id": coid_entry, "symbol": "BTCUSDT", "side": "LONG", "order_type": "MARKET", "quantity": 0.5}),
    ))
    .await
    .unwrap();
    assert!(state.snapshot().open_orders.contains_key(&coid_entry));

    exec.cancel_order("BTCUSDT", &coid_entry).await.unwrap();
    assert!(!state.snapshot().open_orders.contains_key(&coid_entry));

    // The order is gone from the book now; a second cancel must not error.
    let second = exec.cancel_order("BTCUSDT", &coid_entry).await;
    assert!(second.is_ok());
}
