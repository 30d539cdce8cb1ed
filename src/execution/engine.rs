// =============================================================================
// ExecutionEngine — turns an approved proposal into orders, fills, and events
// =============================================================================
//
// The `Simulate` and `Testnet`/`Live` branches of `execute_entry` share the
// same sizing and event-publishing path, diverging only in whether an order
// actually reaches the exchange. The client-order-id lifecycle scheme
// (`{trade_id}-entry` / `-stop` / `-tp` / `-exit`) makes placement and fill
// handling idempotent; every transition is published through the
// `EventBus` instead of mutating a position manager directly.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::exchange::{ExchangeClient, RateLimitTracker};
use crate::ledger::{Event, EventBus, EventType, StateManager};
use crate::risk::{RiskEngine, RiskResult, TradeProposal};
use crate::types::{OrderType, RunMode, Side, SymbolFilters};

/// Bounded re-arm attempts for a stop/take-profit leg that gets cancelled
/// while its position is still open, before giving up and escalating.
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Base delay for the exponential backoff between re-arm attempts.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Outcome of an execution attempt. A rejected or errored attempt is not an
/// `Err` at this layer because it is an expected branch the strategy loop
/// logs and moves past, not a process fault.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Placed { trade_id: String, exchange_order_id: String },
    Simulated { trade_id: String },
    Blocked(String),
    Error(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed { trade_id, exchange_order_id } => {
                write!(f, "placed trade {trade_id} (exchange order {exchange_order_id})")
            }
            Self::Simulated { trade_id } => write!(f, "simulated trade {trade_id}"),
            Self::Blocked(reason) => write!(f, "blocked: {reason}"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Client-order-id suffixes for the three legs of a bracket order.
pub mod coid {
    pub const ENTRY: &str = "entry";
    pub const STOP: &str = "stop";
    pub const TP: &str = "tp";
    pub const EXIT: &str = "exit";

    pub fn build(trade_id: &str, leg: &str) -> String {
        format!("{trade_id}-{leg}")
    }

    /// Split a client order id back into `(trade_id, leg)`, if it matches
    /// the `{trade_id}-{leg}` scheme this engine generates.
    pub fn parse(client_order_id: &str) -> Option<(&str, &str)> {
        client_order_id.rsplit_once('-')
    }
}

/// The stop/take-profit levels a bracket was placed with, kept so a
/// cancelled leg can be re-armed at the same levels.
#[derive(Debug, Clone, Copy)]
struct BracketLevels {
    stop_price: f64,
    take_profit: Option<f64>,
    quantity: f64,
}

/// Metadata about an entry order awaiting its fill, kept because
/// `handle_order_filled` is the single place `PositionOpened` gets
/// published (§4.3: an entry fill opens a position) and at that point no
/// `Position` exists yet to read `symbol`/`side`/`leverage` back from.
#[derive(Debug, Clone)]
struct PendingEntry {
    symbol: String,
    side: Side,
    leverage: f64,
}

pub struct ExecutionEngine {
    client: ExchangeClient,
    rate_limiter: Arc<RateLimitTracker>,
    event_bus: Arc<EventBus>,
    state: Arc<StateManager>,
    run_mode: RunMode,
    retry_attempts: u32,
    /// Fill notifications already processed, keyed by
    /// `{client_order_id}:{exchange_fill_id}`, so a duplicate user-stream
    /// callback (reconnect replay, at-least-once delivery) can't double-open
    /// or double-close a position.
    seen_fills: RwLock<HashSet<String>>,
    /// Bracket levels per trade id, so a cancelled stop/TP leg can be
    /// re-armed without the caller having to resupply the levels.
    brackets: RwLock<std::collections::HashMap<String, BracketLevels>>,
    /// Per-leg re-arm attempt counters, reset once a leg is confirmed live.
    rearm_attempts: RwLock<std::collections::HashMap<String, u32>>,
    /// Entry orders awaiting their fill, consumed by `handle_order_filled`
    /// to construct the `PositionOpened` payload.
    pending_entries: RwLock<std::collections::HashMap<String, PendingEntry>>,
}

impl ExecutionEngine {
    pub fn new(
        client: ExchangeClient,
        rate_limiter: Arc<RateLimitTracker>,
        event_bus: Arc<EventBus>,
        state: Arc<StateManager>,
        _risk_engine: Arc<RiskEngine>,
        run_mode: RunMode,
    ) -> Self {
        Self {
            client,
            rate_limiter,
            event_bus,
            state,
            run_mode,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            seen_fills: RwLock::new(HashSet::new()),
            brackets: RwLock::new(std::collections::HashMap::new()),
            rearm_attempts: RwLock::new(std::collections::HashMap::new()),
            pending_entries: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Place the entry order for an already-risk-approved proposal, using
    /// the sized quantity and rounded levels `RiskResult` computed. The
    /// stop/take-profit bracket is armed once the entry fill is observed
    /// (see `handle_order_filled`).
    #[instrument(skip(self, proposal, risk, filters), fields(symbol = %proposal.symbol, trade_id = %proposal.trade_id))]
    pub async fn execute_entry(
        &self,
        proposal: &TradeProposal,
        risk: &RiskResult,
        filters: &SymbolFilters,
    ) -> ExecutionResult {
        let trade_id = proposal.trade_id.clone();
        let quantity = filters.floor_quantity(risk.sized_quantity);
        let entry_coid = coid::build(&trade_id, coid::ENTRY);

        self.brackets.write().insert(
            trade_id.clone(),
            BracketLevels {
                stop_price: risk.rounded_stop,
                take_profit: risk.rounded_take_profit,
                quantity,
            },
        );
        self.pending_entries.write().insert(
            trade_id.clone(),
            PendingEntry {
                symbol: proposal.symbol.clone(),
                side: proposal.side,
                leverage: proposal.leverage,
            },
        );

        if self.run_mode == RunMode::Simulate {
            return self.simulate_entry(&trade_id, proposal, quantity, risk).await;
        }

        if !self.rate_limiter.can_place_order() {
            return ExecutionResult::Blocked("rate limit".to_string());
        }

        if let Err(e) = self
            .event_bus
            .publish(Event::new(
                EventType::OrderPlaced,
                json!({
                    "client_order_id": entry_coid,
                    "symbol": proposal.symbol,
                    "side": proposal.side,
                    "order_type": "MARKET",
                    "quantity": quantity,
                    "reduce_only": false,
                }),
            ))
            .await
        {
            return ExecutionResult::Error(e.to_string());
        }

        match self
            .client
            .place_order(&proposal.symbol, proposal.side, OrderType::Market, quantity, None, None, &entry_coid)
            .await
        {
            Ok(resp) => {
                self.rate_limiter.record_order_sent();
                let exchange_order_id = resp["orderId"].to_string();
                info!(trade_id, exchange_order_id, "entry order placed");
                ExecutionResult::Placed { trade_id, exchange_order_id }
            }
            Err(e) => {
                warn!(error = %e, "entry order placement failed");
                if let EngineError::ExchangeRejection(_) = e {
                    self.event_bus
                        .publish(Event::new(EventType::OrderRejected, json!({"client_order_id": entry_coid})))
                        .await
                        .ok();
                    self.event_bus
                        .publish(Event::new(
                            EventType::ManualIntervention,
                            json!({"kind": "ENTRY_REJECTED", "trade_id": trade_id, "reason": e.to_string()}),
                        ))
                        .await
                        .ok();
                }
                ExecutionResult::Error(e.to_string())
            }
        }
    }

    /// Never contacts the exchange (§4.5): publishes `ORDER_PLACED` then
    /// synthesizes the terminal fill at the proposal's entry price through
    /// the same `handle_order_filled` path a live fill notification takes,
    /// so a simulated entry opens a position exactly the way a real one
    /// does rather than through a separate shortcut.
    async fn simulate_entry(
        &self,
        trade_id: &str,
        proposal: &TradeProposal,
        quantity: f64,
        risk: &RiskResult,
    ) -> ExecutionResult {
        let entry_coid = coid::build(trade_id, coid::ENTRY);
        if let Err(e) = self
            .event_bus
            .publish(Event::new(
                EventType::OrderPlaced,
                json!({
                    "client_order_id": entry_coid,
                    "symbol": proposal.symbol,
                    "side": proposal.side,
                    "order_type": "MARKET",
                    "quantity": quantity,
                    "reduce_only": false,
                }),
            ))
            .await
        {
            return ExecutionResult::Error(e.to_string());
        }

        match self
            .handle_order_filled(&entry_coid, "simulated", risk.rounded_entry, quantity)
            .await
        {
            Ok(_) => ExecutionResult::Simulated { trade_id: trade_id.to_string() },
            Err(e) => ExecutionResult::Error(e.to_string()),
        }
    }

    /// Place the stop and take-profit legs as `reduce_only` conditional
    /// orders for an entry that has just filled.
    async fn arm_bracket(&self, trade_id: &str, symbol: &str, side: Side, levels: BracketLevels) {
        if self.run_mode == RunMode::Simulate {
            return;
        }
        let exit_side = side.opposite();

        let stop_coid = coid::build(trade_id, coid::STOP);
        if let Err(e) = self
            .client
            .place_order(symbol, exit_side, OrderType::Stop, levels.quantity, None, Some(levels.stop_price), &stop_coid)
            .await
        {
            warn!(error = %e, trade_id, "stop leg placement failed");
        } else {
            self.rate_limiter.record_order_sent();
            self.event_bus
                .publish(Event::new(
                    EventType::OrderPlaced,
                    json!({
                        "client_order_id": stop_coid, "symbol": symbol, "side": exit_side,
                        "order_type": "STOP", "quantity": levels.quantity,
                        "stop_price": levels.stop_price, "reduce_only": true,
                    }),
                ))
                .await
                .ok();
        }

        if let Some(tp) = levels.take_profit {
            let tp_coid = coid::build(trade_id, coid::TP);
            if let Err(e) = self
                .client
                .place_order(symbol, exit_side, OrderType::TakeProfit, levels.quantity, Some(tp), None, &tp_coid)
                .await
            {
                warn!(error = %e, trade_id, "take-profit leg placement failed");
            } else {
                self.rate_limiter.record_order_sent();
                self.event_bus
                    .publish(Event::new(
                        EventType::OrderPlaced,
                        json!({
                            "client_order_id": tp_coid, "symbol": symbol, "side": exit_side,
                            "order_type": "TAKE_PROFIT", "quantity": levels.quantity,
                            "price": tp, "reduce_only": true,
                        }),
                    ))
                    .await
                    .ok();
            }
        }
    }

    /// Close an open position at market. Realized PnL uses `exit_price`
    /// (the caller supplies the current mark; simulate mode falls back to
    /// entry price, which yields zero PnL for a synthesized exit).
    #[instrument(skip(self), fields(%trade_id))]
    pub async fn execute_exit(&self, trade_id: &str, reason: &str) -> ExecutionResult {
        self.execute_exit_at(trade_id, reason, None).await
    }

    pub async fn execute_exit_at(&self, trade_id: &str, reason: &str, mark_price: Option<f64>) -> ExecutionResult {
        let snapshot = self.state.snapshot();
        let Some(position) = snapshot.positions.get(trade_id).cloned() else {
            return ExecutionResult::Error(format!("no open position for trade {trade_id}"));
        };

        let exit_price = mark_price.unwrap_or(position.entry_price);
        let realized_pnl = match position.side {
            Side::Long => (exit_price - position.entry_price) * position.quantity,
            Side::Short => (position.entry_price - exit_price) * position.quantity,
        };

        if self.run_mode != RunMode::Simulate {
            let exit_coid = coid::build(trade_id, coid::EXIT);
            if let Err(e) = self
                .client
                .place_order(&position.symbol, position.side.opposite(), OrderType::Market, position.quantity, None, None, &exit_coid)
                .await
            {
                warn!(error = %e, "exit order placement failed");
                return ExecutionResult::Error(e.to_string());
            }
            self.rate_limiter.record_order_sent();
        }

        let closed = self
            .event_bus
            .publish(Event::new(
                EventType::PositionClosed,
                json!({"trade_id": trade_id, "realized_pnl": realized_pnl, "reason": reason}),
            ))
            .await;

        self.brackets.write().remove(trade_id);
        match closed {
            Ok(_) => ExecutionResult::Simulated { trade_id: trade_id.to_string() },
            Err(e) => ExecutionResult::Error(e.to_string()),
        }
    }

    /// Cancel a still-open order. Idempotent: cancelling an unknown or
    /// already-terminal order is a no-op that emits no event.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), EngineError> {
        if !self.state.snapshot().open_orders.contains_key(client_order_id) {
            return Ok(());
        }
        if self.run_mode != RunMode::Simulate {
            self.client.cancel_order(symbol, client_order_id).await?;
        }
        self.event_bus
            .publish(Event::new(
                EventType::OrderCancelled,
                json!({"client_order_id": client_order_id, "symbol": symbol}),
            ))
            .await?;
        Ok(())
    }

    /// Handle a partial-fill notification from the user-data stream: the
    /// order is still live (§4.3 `ORDER_PARTIAL_FILL` updates status and
    /// remaining quantity but does not remove the order from the book), so
    /// this only records the cumulative filled quantity — it never arms a
    /// bracket or closes a position the way a terminal fill does. Distinct
    /// from `handle_order_filled` so a `PARTIALLY_FILLED` stream callback
    /// can't be mistaken for the terminal `FILLED` that triggers those.
    #[instrument(skip(self))]
    pub async fn handle_order_partial_fill(
        &self,
        client_order_id: &str,
        fill_price: f64,
        cumulative_filled_quantity: f64,
    ) -> Result<(), EngineError> {
        self.event_bus
            .publish(Event::new(
                EventType::OrderPartialFill,
                json!({
                    "client_order_id": client_order_id,
                    "fill_price": fill_price,
                    "filled_quantity": cumulative_filled_quantity,
                }),
            ))
            .await?;
        Ok(())
    }

    /// Handle a terminal fill notification, whether it arrived via a REST
    /// response or the user-data stream. Deduplicates by `(client_order_id,
    /// exchange_fill_id)` so a reconnect-triggered replay of the same fill
    /// can't be applied twice (the idempotency contract of §4.5).
    #[instrument(skip(self))]
    pub async fn handle_order_filled(
        &self,
        client_order_id: &str,
        exchange_fill_id: &str,
        fill_price: f64,
        fill_quantity: f64,
    ) -> Result<(), EngineError> {
        let dedup_key = format!("{client_order_id}:{exchange_fill_id}");
        {
            let mut seen = self.seen_fills.write();
            if !seen.insert(dedup_key) {
                warn!(client_order_id, exchange_fill_id, "duplicate fill notification ignored");
                return Ok(());
            }
        }

        let Some((trade_id, leg)) = coid::parse(client_order_id) else {
            warn!(client_order_id, "fill for unrecognized client order id");
            return Ok(());
        };

        self.event_bus
            .publish(Event::new(
                EventType::OrderFilled,
                json!({"client_order_id": client_order_id, "fill_price": fill_price, "filled_quantity": fill_quantity}),
            ))
            .await?;

        if leg == coid::ENTRY {
            self.rearm_attempts.write().remove(trade_id);
            let pending = self.pending_entries.write().remove(trade_id);
            let levels = self.brackets.read().get(trade_id).copied();
            let Some(pending) = pending else {
                warn!(trade_id, "entry fill with no pending entry metadata, position not opened");
                return Ok(());
            };

            self.event_bus
                .publish(Event::new(
                    EventType::PositionOpened,
                    json!({
                        "trade_id": trade_id,
                        "symbol": pending.symbol,
                        "side": pending.side,
                        "entry_price": fill_price,
                        "quantity": fill_quantity,
                        "leverage": pending.leverage,
                        "stop_loss": levels.map(|l| l.stop_price),
                        "take_profit": levels.and_then(|l| l.take_profit),
                    }),
                ))
                .await?;

            if let Some(levels) = levels {
                self.arm_bracket(trade_id, &pending.symbol, pending.side, levels).await;
            }
            return Ok(());
        }

        // Stop/take-profit leg filling means the position has closed; cancel
        // the sibling leg so it can't also fire against a now-flat position.
        let snapshot = self.state.snapshot();
        if let Some(position) = snapshot.positions.get(trade_id) {
            let sibling_leg = if leg == coid::STOP { coid::TP } else { coid::STOP };
            let sibling_coid = coid::build(trade_id, sibling_leg);
            self.cancel_order(&position.symbol, &sibling_coid).await.ok();

            let realized_pnl = match position.side {
                Side::Long => (fill_price - position.entry_price) * position.quantity,
                Side::Short => (position.entry_price - fill_price) * position.quantity,
            };
            self.event_bus
                .publish(Event::new(
                    EventType::PositionClosed,
                    json!({"trade_id": trade_id, "realized_pnl": realized_pnl, "reason": leg}),
                ))
                .await?;
            self.brackets.write().remove(trade_id);
        }

        Ok(())
    }

    /// Handle an order-cancelled notification from the user-data stream.
    /// A stop/TP leg cancelled while its position is still open is re-armed
    /// with exponential backoff, up to `retry_attempts`; exhaustion
    /// escalates to a `MANUAL_INTERVENTION` rather than leaving the
    /// position naked.
    pub async fn handle_order_cancelled(&self, client_order_id: &str) -> Result<(), EngineError> {
        self.event_bus
            .publish(Event::new(EventType::OrderCancelled, json!({"client_order_id": client_order_id})))
            .await?;

        let Some((trade_id, leg)) = coid::parse(client_order_id) else {
            return Ok(());
        };
        if leg != coid::STOP && leg != coid::TP {
            return Ok(());
        }

        let still_open = self.state.snapshot().positions.contains_key(trade_id);
        if !still_open {
            return Ok(());
        }
        let Some(levels) = self.brackets.read().get(trade_id).copied() else {
            return Ok(());
        };

        let attempt = {
            let mut attempts = self.rearm_attempts.write();
            let counter = attempts.entry(client_order_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        if attempt > self.retry_attempts {
            warn!(client_order_id, attempt, "re-arm attempts exhausted, escalating");
            self.event_bus
                .publish(Event::new(
                    EventType::ManualIntervention,
                    json!({"kind": "BRACKET_REARM_EXHAUSTED", "trade_id": trade_id, "leg": leg}),
                ))
                .await?;
            return Ok(());
        }

        let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1));
        tokio::time::sleep(backoff).await;

        let Some((symbol, side)) = self
            .state
            .snapshot()
            .positions
            .get(trade_id)
            .map(|p| (p.symbol.clone(), p.side))
        else {
            return Ok(());
        };

        if leg == coid::STOP {
            self.arm_single_leg(trade_id, &symbol, side, OrderType::Stop, levels.stop_price, levels.quantity).await;
        } else if let Some(tp) = levels.take_profit {
            self.arm_single_leg(trade_id, &symbol, side, OrderType::TakeProfit, tp, levels.quantity).await;
        }
        Ok(())
    }

    async fn arm_single_leg(&self, trade_id: &str, symbol: &str, side: Side, order_type: OrderType, level: f64, quantity: f64) {
        let leg = if order_type == OrderType::Stop { coid::STOP } else { coid::TP };
        let leg_coid = coid::build(trade_id, leg);
        let exit_side = side.opposite();
        let (price, stop_price) = match order_type {
            OrderType::Stop => (None, Some(level)),
            _ => (Some(level), None),
        };
        if let Err(e) = self.client.place_order(symbol, exit_side, order_type, quantity, price, stop_price, &leg_coid).await {
            warn!(error = %e, trade_id, leg, "bracket leg re-arm failed");
            return;
        }
        self.rate_limiter.record_order_sent();
        self.event_bus
            .publish(Event::new(
                EventType::OrderPlaced,
                json!({
                    "client_order_id": leg_coid, "symbol": symbol, "side": exit_side,
                    "order_type": order_type.to_string(), "quantity": quantity,
                    "price": price, "stop_price": stop_price, "reduce_only": true,
                }),
            ))
            .await
            .ok();
    }
}
