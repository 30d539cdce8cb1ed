// =============================================================================
// StateManager — derives current TradingState by folding the event stream
// =============================================================================
//
// `apply_event` is the single place every event type's effect on state is
// defined; `rebuild` replays the whole ledger through it from an empty
// `TradingState`, and must be deterministic — same event stream in,
// byte-identical state out, every time.
//
// Every counter a risk decision reads (`equity`, `peak_equity`,
// `consecutive_losses`, `circuit_breaker_active`, `requires_manual_review`)
// lives here, not in the risk engine, so a crash-and-restart rebuild from
// the ledger reconstructs it exactly rather than resetting it to whatever
// the engine was constructed with. The risk engine (`risk::engine`) reads
// these fields but never owns or mutates them.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::ledger::bus::EventHandler;
use crate::ledger::event::{Event, EventType};
use crate::types::{NewsRiskLevel, OrderStatus, OrderType, RunMode, Side};

/// Cap on the number of tracked news items, evicted LRU-by-`received_at`
/// once exceeded, generous enough that a realistically-sized universe
/// never trims a still-relevant entry under normal `news.ttl` expiry.
const NEWS_FLAG_CAP: usize = 512;

/// An open or recently-closed position, as derived from the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

/// An order the engine believes is still live at the exchange, keyed by
/// `client_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub placed_at: DateTime<Utc>,
}

/// A news risk flag; `symbol = None` represents the reserved global flag
/// (`*` on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub symbol: Option<String>,
    pub level: NewsRiskLevel,
    pub reason: String,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Everything downstream components (risk engine, execution engine,
/// operator API) read to make a decision. Produced and mutated only by
/// `StateManager::apply_event` — nothing else should construct one by hand
/// outside of tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingState {
    pub run_mode: RunModeState,
    pub last_event_sequence: Option<u64>,

    pub equity: f64,
    pub peak_equity: f64,
    pub realized_pnl_today: f64,
    pub trading_day: Option<NaiveDate>,
    pub consecutive_losses: u32,
    pub last_loss_at: Option<DateTime<Utc>>,

    /// Set by an operator `OPERATOR_PAUSE` action; an independent cooldown
    /// source from the one the risk engine derives from consecutive losses.
    pub operator_cooldown_until: Option<DateTime<Utc>>,
    pub circuit_breaker_active: bool,
    pub requires_manual_review: bool,

    pub universe: Vec<String>,
    pub positions: HashMap<String, Position>,
    pub closed_positions: Vec<Position>,
    pub open_orders: HashMap<String, OpenOrder>,
    pub balances: HashMap<String, f64>,

    pub news: Vec<NewsItem>,

    pub last_reconciliation: Option<DateTime<Utc>>,

    /// `"{symbol}:{timeframe}" -> last processed candle close-time millis`,
    /// used by the strategy loop to avoid re-evaluating the same closed
    /// candle twice after a restart. Keyed by a joined string rather than a
    /// tuple so the map round-trips through `serde_json` (map keys must
    /// serialize as strings) when the API layer serializes a snapshot.
    pub last_processed_candles: HashMap<String, i64>,

    pub kill_switch_triggered: bool,
}

/// Wrapper so `TradingState` derives `Default` while defaulting to
/// `Simulate` the same way `RunMode`'s own `Default` impl does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunModeState(pub RunMode);

impl Default for RunModeState {
    fn default() -> Self {
        Self(RunMode::default())
    }
}

impl Default for TradingState {
    fn default() -> Self {
        Self::fresh(0.0)
    }
}

impl TradingState {
    fn fresh(initial_equity: f64) -> Self {
        Self {
            run_mode: RunModeState::default(),
            last_event_sequence: None,
            equity: initial_equity,
            peak_equity: initial_equity,
            realized_pnl_today: 0.0,
            trading_day: None,
            consecutive_losses: 0,
            last_loss_at: None,
            operator_cooldown_until: None,
            circuit_breaker_active: false,
            requires_manual_review: false,
            universe: Vec::new(),
            positions: HashMap::new(),
            closed_positions: Vec::new(),
            open_orders: HashMap::new(),
            balances: HashMap::new(),
            news: Vec::new(),
            last_reconciliation: None,
            last_processed_candles: HashMap::new(),
            kill_switch_triggered: false,
        }
    }

    /// Positions currently open for `symbol`. The risk engine's
    /// duplicate-position gate and max-positions gate both read this.
    pub fn open_position_for(&self, symbol: &str) -> Option<&Position> {
        self.positions.values().find(|p| p.symbol == symbol)
    }

    /// Whether any unexpired news item at or above `level` currently blocks
    /// new entries for `symbol` (symbol-scoped items) or globally (items
    /// with no symbol — the reserved `*` flag).
    pub fn blocks_entries(&self, symbol: &str, level: NewsRiskLevel, now: DateTime<Utc>) -> bool {
        self.get_news_risk(symbol, now) >= level
    }

    /// Highest unexpired news risk level relevant to `symbol` (max of the
    /// per-symbol flag and the global `*` flag), or `Low` if neither is set.
    pub fn get_news_risk(&self, symbol: &str, now: DateTime<Utc>) -> NewsRiskLevel {
        self.news
            .iter()
            .filter(|n| {
                n.expires_at > now && n.symbol.as_deref().map(|s| s == symbol).unwrap_or(true)
            })
            .map(|n| n.level)
            .max()
            .unwrap_or(NewsRiskLevel::Low)
    }

    /// Drawdown from peak, in `[0, 1]`. `0.0` when `peak_equity <= 0.0`
    /// (can't divide a meaningful drawdown by a non-positive peak).
    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }
}

/// Owns the canonical `TradingState` behind a `parking_lot::RwLock`, the
/// same synchronous-lock idiom used for every other piece of shared mutable
/// state in this crate.
pub struct StateManager {
    initial_equity: f64,
    state: RwLock<TradingState>,
}

impl StateManager {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            initial_equity,
            state: RwLock::new(TradingState::fresh(initial_equity)),
        }
    }

    /// Discard current state and fold `events` from scratch. Used at
    /// startup (`rebuild(ledger.load_all())`) and by the determinism tests.
    pub fn rebuild(&self, events: &[Event]) {
        let mut fresh = TradingState::fresh(self.initial_equity);
        for event in events {
            Self::fold(&mut fresh, event);
        }
        *self.state.write() = fresh;
    }

    /// Apply a single newly-published event to the live state. Idempotent
    /// with respect to `rebuild`: folding the same event twice in sequence
    /// order never happens because `sequence_num` is monotonic and each
    /// event is applied exactly once by the bus's dispatch.
    pub fn apply_event(&self, event: &Event) {
        let mut state = self.state.write();
        Self::fold(&mut state, event);
    }

    /// Read-only snapshot for callers that need a consistent view across
    /// several fields (API handlers, reconciliation, risk evaluation).
    pub fn snapshot(&self) -> TradingState {
        self.state.read().clone()
    }

    /// Record the close-time of the last candle processed for
    /// `(symbol, timeframe)`. Deliberately *not* routed through an event:
    /// it is a restart-time optimization hint (skip re-evaluating a candle
    /// already acted on this run), not a replay-relevant trading fact — if
    /// it's empty after a restart the strategy loop simply re-evaluates one
    /// extra candle, which the risk engine's duplicate-position gate
    /// already makes harmless.
    pub fn note_processed_candle(&self, symbol: &str, timeframe: &str, close_time_ms: i64) {
        self.state
            .write()
            .last_processed_candles
            .insert(format!("{symbol}:{timeframe}"), close_time_ms);
    }

    /// Roll `realized_pnl_today` to zero the first time an event is folded
    /// on a new UTC calendar day (Open Question a: no synthetic "day roll"
    /// event is persisted — the boundary is derived from each event's own
    /// timestamp as it is applied).
    fn maybe_roll_day(state: &mut TradingState, now: DateTime<Utc>) {
        let day = now.date_naive();
        if state.trading_day != Some(day) {
            state.trading_day = Some(day);
            state.realized_pnl_today = 0.0;
        }
    }

    fn fold(state: &mut TradingState, event: &Event) {
        if let Some(last) = state.last_event_sequence {
            if event.sequence_num <= last {
                return;
            }
        }
        state.last_event_sequence = Some(event.sequence_num);
        Self::maybe_roll_day(state, event.timestamp);

        let p = &event.payload;
        match event.event_type {
            EventType::SystemStarted | EventType::SystemStopped => {}

            EventType::KillSwitchTriggered => {
                state.kill_switch_triggered = true;
            }

            EventType::UniverseUpdated => {
                if let Some(symbols) = p.get("symbols").and_then(|v| v.as_array()) {
                    state.universe = symbols
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                }
            }

            EventType::SignalComputed | EventType::TradeProposed | EventType::ReconciliationCompleted => {
                if matches!(event.event_type, EventType::ReconciliationCompleted) {
                    state.last_reconciliation = Some(event.timestamp);
                }
            }

            EventType::NewsIngested => {}

            EventType::NewsClassified => {
                if let (Some(level), Some(expires_at)) =
                    (p.get("level").and_then(parse_news_level), p.get("expires_at").and_then(parse_ts))
                {
                    let symbol = p.get("symbol").and_then(|v| v.as_str()).map(String::from);
                    let item = NewsItem {
                        symbol: symbol.clone(),
                        level,
                        reason: p.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        confidence: p.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0),
                        last_updated: event.timestamp,
                        expires_at,
                    };
                    state.news.retain(|n| n.symbol != symbol);
                    state.news.push(item);
                    if state.news.len() > NEWS_FLAG_CAP {
                        state.news.sort_by_key(|n| n.last_updated);
                        let overflow = state.news.len() - NEWS_FLAG_CAP;
                        state.news.drain(0..overflow);
                    }
                }
            }

            EventType::RiskApproved | EventType::RiskRejected => {}

            EventType::CircuitBreakerTriggered => {
                state.circuit_breaker_active = true;
                state.requires_manual_review = true;
            }

            EventType::OrderPlaced => {
                if let Some(order) = parse_open_order(p, event.timestamp) {
                    state.open_orders.insert(order.client_order_id.clone(), order);
                }
            }

            EventType::OrderPartialFill => {
                if let Some(coid) = p.get("client_order_id").and_then(|v| v.as_str()) {
                    if let Some(order) = state.open_orders.get_mut(coid) {
                        order.status = OrderStatus::PartiallyFilled;
                        if let Some(qty) = p.get("filled_quantity").and_then(|v| v.as_f64()) {
                            order.filled_quantity = qty;
                        }
                    }
                }
            }

            EventType::OrderFilled => {
                if let Some(coid) = p.get("client_order_id").and_then(|v| v.as_str()) {
                    state.open_orders.remove(coid);
                }
            }

            EventType::OrderCancelled | EventType::OrderRejected => {
                if let Some(coid) = p.get("client_order_id").and_then(|v| v.as_str()) {
                    state.open_orders.remove(coid);
                }
            }

            EventType::PositionOpened => {
                if let Some(position) = parse_position(p, event.timestamp) {
                    state.positions.insert(position.trade_id.clone(), position);
                }
            }

            EventType::PositionClosed => {
                if let Some(trade_id) = p.get("trade_id").and_then(|v| v.as_str()) {
                    if let Some(mut position) = state.positions.remove(trade_id) {
                        position.closed_at = Some(event.timestamp);
                        position.realized_pnl =
                            p.get("realized_pnl").and_then(|v| v.as_f64()).unwrap_or(0.0);

                        state.realized_pnl_today += position.realized_pnl;
                        state.equity += position.realized_pnl;
                        if state.equity > state.peak_equity {
                            state.peak_equity = state.equity;
                        }
                        if position.realized_pnl < 0.0 {
                            state.consecutive_losses += 1;
                            state.last_loss_at = Some(event.timestamp);
                        } else {
                            state.consecutive_losses = 0;
                        }

                        state.closed_positions.push(position);
                    }
                }
            }

            EventType::ManualIntervention => {
                let kind = p.get("kind").and_then(|v| v.as_str()).unwrap_or("");
                match kind {
                    "POSITION_DRIFT" | "ORDER_DRIFT" | "BALANCE_DRIFT" => {
                        state.requires_manual_review = true;
                    }
                    "OPERATOR_PAUSE" => {
                        state.operator_cooldown_until = p.get("cooldown_until").and_then(parse_ts);
                    }
                    "OPERATOR_RESUME" => {
                        state.operator_cooldown_until = None;
                    }
                    _ => {}
                }
            }

            EventType::ManualReviewAcknowledged => {
                // Clears the manual-review flag only; `circuit_breaker_active`
                // requires a separate operator resume action (§4.3).
                state.requires_manual_review = false;
            }
        }

        if let Some(balances) = p.get("balances").and_then(|v| v.as_object()) {
            for (asset, value) in balances {
                if let Some(free) = value.get("free").and_then(|v| v.as_f64()) {
                    state.balances.insert(asset.clone(), free);
                }
            }
        }
    }
}

/// Lets `StateManager` register against the bus like any other subscriber
/// (`main.rs` registers it for every `EventType`) so state folding happens
/// exactly where every other durable side effect does — after the event is
/// already on disk — instead of via a special-cased direct call.
#[async_trait]
impl EventHandler for StateManager {
    async fn handle(&self, event: &Event) -> Result<(), EngineError> {
        self.apply_event(event);
        Ok(())
    }

    fn name(&self) -> &str {
        "state_manager"
    }
}

fn parse_ts(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_news_level(v: &serde_json::Value) -> Option<NewsRiskLevel> {
    match v.as_str()? {
        "LOW" => Some(NewsRiskLevel::Low),
        "MEDIUM" => Some(NewsRiskLevel::Medium),
        "HIGH" => Some(NewsRiskLevel::High),
        other => {
            warn!(level = other, "unrecognized news risk level in payload");
            None
        }
    }
}

fn parse_side(v: &serde_json::Value) -> Option<Side> {
    match v.as_str()? {
        "LONG" | "BUY" => Some(Side::Long),
        "SHORT" | "SELL" => Some(Side::Short),
        _ => None,
    }
}

fn parse_order_type(v: Option<&serde_json::Value>) -> OrderType {
    match v.and_then(|v| v.as_str()) {
        Some("LIMIT") => OrderType::Limit,
        Some("STOP") => OrderType::Stop,
        Some("TAKE_PROFIT") => OrderType::TakeProfit,
        _ => OrderType::Market,
    }
}

fn parse_open_order(p: &serde_json::Value, placed_at: DateTime<Utc>) -> Option<OpenOrder> {
    Some(OpenOrder {
        client_order_id: p.get("client_order_id")?.as_str()?.to_string(),
        exchange_order_id: p.get("exchange_order_id").and_then(|v| v.as_str()).map(String::from),
        symbol: p.get("symbol")?.as_str()?.to_string(),
        side: parse_side(p.get("side")?)?,
        order_type: parse_order_type(p.get("order_type")),
        status: OrderStatus::New,
        quantity: p.get("quantity")?.as_f64()?,
        filled_quantity: 0.0,
        price: p.get("price").and_then(|v| v.as_f64()),
        stop_price: p.get("stop_price").and_then(|v| v.as_f64()),
        reduce_only: p.get("reduce_only").and_then(|v| v.as_bool()).unwrap_or(false),
        placed_at,
    })
}

fn parse_position(p: &serde_json::Value, opened_at: DateTime<Utc>) -> Option<Position> {
    Some(Position {
        trade_id: p.get("trade_id")?.as_str()?.to_string(),
        symbol: p.get("symbol")?.as_str()?.to_string(),
        side: parse_side(p.get("side")?)?,
        entry_price: p.get("entry_price")?.as_f64()?,
        quantity: p.get("quantity")?.as_f64()?,
        leverage: p.get("leverage").and_then(|v| v.as_f64()).unwrap_or(1.0),
        stop_loss: p.get("stop_loss").and_then(|v| v.as_f64()).unwrap_or(0.0),
        take_profit: p.get("take_profit").and_then(|v| v.as_f64()).unwrap_or(0.0),
        opened_at,
        closed_at: None,
        unrealized_pnl: 0.0,
        realized_pnl: 0.0,
    })
}
