// =============================================================================
// RiskEngine — pure gate sequence over (TradingState, proposal, filters, now)
// =============================================================================
//
// The four circuit breakers (cooldown, drawdown, daily loss, consecutive
// losses) and the sizing/rounding discipline are implemented as a *pure*
// function rather than a stateful engine: every counter that would
// otherwise be mutated in-process (`peak_equity`, `consecutive_losses`,
// `last_loss_at`) lives in `TradingState` instead, reconstructed by
// replaying the ledger, so `evaluate` has no internal state to desync from
// a crash-and-restart rebuild. `evaluate` reads `config` and its four
// arguments and nothing else — no clock reads beyond `now`, no I/O. The
// caller checks `risk_result.circuit_breaker` before `risk_result.approved`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::error::RiskRejectReason;
use crate::ledger::state::TradingState;
use crate::types::{NewsRiskLevel, Side, SymbolFilters};

/// A candidate trade awaiting a risk decision, as produced by the strategy
/// collaborator (out of scope for this crate — see `collaborators.rs`).
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit: Option<f64>,
    pub atr: f64,
    pub leverage: f64,
    pub score: f64,
    pub funding_rate: f64,
    pub news_risk: NewsRiskLevel,
    pub created_at: DateTime<Utc>,
}

/// Outcome of `RiskEngine::evaluate`. `circuit_breaker` gates 1-4 each
/// short-circuit with a single reason (they represent a hard stop that
/// makes evaluating sizing meaningless); gates 5-10 all run regardless of
/// each other's outcome and contribute every reason that applies, so an
/// operator sees the full picture of why a proposal was rejected rather
/// than just the first gate it tripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResult {
    pub approved: bool,
    pub circuit_breaker: bool,
    pub reasons: Vec<RiskRejectReason>,
    pub sized_quantity: f64,
    pub rounded_entry: f64,
    pub rounded_stop: f64,
    pub rounded_take_profit: Option<f64>,
}

impl RiskResult {
    /// Convenience accessor for callers that only care about the first
    /// (highest-priority) reason, e.g. when logging a one-line summary.
    pub fn primary_reason(&self) -> Option<RiskRejectReason> {
        self.reasons.first().copied()
    }

    fn short_circuit(reason: RiskRejectReason, circuit_breaker: bool) -> Self {
        Self {
            approved: false,
            circuit_breaker,
            reasons: vec![reason],
            sized_quantity: 0.0,
            rounded_entry: 0.0,
            rounded_stop: 0.0,
            rounded_take_profit: None,
        }
    }
}

/// Dashboard-facing snapshot of breaker-relevant state. Derived entirely
/// from `TradingState` plus `RiskConfig` — no separate engine-owned
/// bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub consecutive_losses: u32,
    pub consecutive_loss_limit: u32,
    pub current_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub daily_pnl: f64,
    pub daily_loss_limit: f64,
    pub circuit_breaker_active: bool,
    pub requires_manual_review: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Stateless evaluator: holds only configuration, no mutable breaker
/// bookkeeping. Cheap to construct, trivially `Send + Sync`, and safe to
/// share across every loop without a lock around anything but `config`
/// itself (which is read-only after construction).
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// The cooldown deadline implied by `state` and `config`: the later of
    /// an operator-set pause and the automatic cooldown that engages once
    /// `consecutive_losses` reaches `consecutive_loss_limit` (Open Question
    /// c, pinned here: the automatic cooldown is keyed off the configured
    /// *streak* limit, not off any single loss, and is cleared by the first
    /// subsequent win — which `StateManager` already resets
    /// `consecutive_losses` to zero for).
    pub fn cooldown_until(&self, state: &TradingState) -> Option<DateTime<Utc>> {
        let streak_cooldown = if state.consecutive_losses >= self.config.consecutive_loss_limit {
            state.last_loss_at.map(|t| {
                t + chrono::Duration::milliseconds((self.config.cooldown_hours_after_loss * 3_600_000.0) as i64)
            })
        } else {
            None
        };

        match (streak_cooldown, state.operator_cooldown_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// The ordered gate sequence (§4.4). Gates 1-4 are hard stops that
    /// short-circuit with a single reason; gates 5-10 run independently and
    /// every failing one contributes a reason to `reasons`.
    pub fn evaluate(
        &self,
        state: &TradingState,
        proposal: &TradeProposal,
        filters: &SymbolFilters,
        now: DateTime<Utc>,
    ) -> RiskResult {
        // 1. Cooldown (operator pause or automatic post-loss-streak cooldown).
        if let Some(until) = self.cooldown_until(state) {
            if now < until {
                return RiskResult::short_circuit(RiskRejectReason::CooldownActive, false);
            }
        }

        // 2. Outstanding manual review or an already-active circuit breaker.
        if state.requires_manual_review {
            return RiskResult::short_circuit(RiskRejectReason::ManualReviewRequired, false);
        }
        if state.circuit_breaker_active {
            return RiskResult::short_circuit(RiskRejectReason::CircuitBreaker, false);
        }

        // 3. Drawdown circuit breaker: this is the one gate that *produces*
        // a new breaker trip rather than reacting to an existing one. The
        // caller is responsible for publishing `CIRCUIT_BREAKER_TRIGGERED`
        // and running the kill switch when `circuit_breaker` comes back true.
        if state.drawdown_pct() > self.config.max_drawdown_pct {
            return RiskResult::short_circuit(RiskRejectReason::CircuitBreaker, true);
        }

        // 4. Daily loss limit.
        if state.realized_pnl_today < -self.config.daily_loss_limit {
            return RiskResult::short_circuit(RiskRejectReason::DailyLossLimit, false);
        }

        // Gates 5-10 all evaluate; every failure contributes a reason.
        let mut reasons = Vec::new();

        // 5. Max concurrent positions (a same-symbol add doesn't count
        // against the cap — gate 6 handles that case instead).
        if state.positions.len() as u32 >= self.config.max_positions
            && state.open_position_for(&proposal.symbol).is_none()
        {
            reasons.push(RiskRejectReason::MaxPositions);
        }

        // 6. Duplicate position on the same symbol.
        if state.open_position_for(&proposal.symbol).is_some() {
            reasons.push(RiskRejectReason::DuplicatePosition);
        }

        // 7. News risk block.
        if state.blocks_entries(&proposal.symbol, self.config.news_block_level, now)
            || proposal.news_risk >= self.config.news_block_level
        {
            reasons.push(RiskRejectReason::NewsRiskBlock);
        }

        // 8. Sizing: risk-per-trade = risk_pct_per_trade x equity, using
        // |entry - stop| as the per-unit risk, floored/promoted against
        // exchange filters.
        let stop_distance = (proposal.entry_price - proposal.stop_price).abs();
        let sized_quantity = if stop_distance <= 0.0 {
            reasons.push(RiskRejectReason::SizingInfeasible);
            0.0
        } else {
            let risk_amount = state.equity * self.config.risk_pct_per_trade;
            let raw_quantity = risk_amount / stop_distance;
            let mut quantity = filters.floor_quantity(raw_quantity);
            if quantity < filters.min_qty {
                quantity = filters.min_qty;
            }
            let notional = quantity * proposal.entry_price;
            if notional < filters.min_notional && proposal.entry_price > 0.0 {
                quantity = filters.floor_quantity(filters.min_notional / proposal.entry_price);
                while quantity * proposal.entry_price < filters.min_notional {
                    quantity += filters.step_size.max(1e-9);
                }
            }
            let implied_risk = quantity * stop_distance;
            if quantity <= 0.0 || implied_risk > risk_amount * 3.0 {
                // Promoting quantity to clear `min_notional` would take on
                // far more risk than `risk_pct_per_trade` budgeted for —
                // the stop is too close to the entry for this account size.
                reasons.push(RiskRejectReason::SizingInfeasible);
                0.0
            } else {
                quantity
            }
        };

        // 9. Leverage ceiling.
        if proposal.leverage > self.config.max_leverage {
            reasons.push(RiskRejectReason::LeverageExceeded);
        }

        // 10. Tick/step rounding must not collapse the stop distance.
        let rounded_entry = filters.round_price(proposal.entry_price);
        let rounded_stop = filters.round_price(proposal.stop_price);
        let rounded_take_profit = proposal.take_profit.map(|tp| filters.round_price(tp));
        if (rounded_entry - rounded_stop).abs() < filters.tick_size {
            reasons.push(RiskRejectReason::RoundingInvalid);
        }

        if reasons.is_empty() {
            RiskResult {
                approved: true,
                circuit_breaker: false,
                reasons: Vec::new(),
                sized_quantity,
                rounded_entry,
                rounded_stop,
                rounded_take_profit,
            }
        } else {
            RiskResult {
                approved: false,
                circuit_breaker: false,
                reasons,
                sized_quantity,
                rounded_entry,
                rounded_stop,
                rounded_take_profit,
            }
        }
    }

    pub fn snapshot(&self, state: &TradingState) -> CircuitBreakerInfo {
        CircuitBreakerInfo {
            consecutive_losses: state.consecutive_losses,
            consecutive_loss_limit: self.config.consecutive_loss_limit,
            current_drawdown_pct: state.drawdown_pct(),
            max_drawdown_pct: self.config.max_drawdown_pct,
            daily_pnl: state.realized_pnl_today,
            daily_loss_limit: self.config.daily_loss_limit,
            circuit_breaker_active: state.circuit_breaker_active,
            requires_manual_review: state.requires_manual_review,
            cooldown_until: self.cooldown_until(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::state::TradingState;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        }
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
            score: 0.8,
            funding_rate: 0.0001,
            news_risk: NewsRiskLevel::Low,
            created_at: Utc::now(),
        }
    }

    fn state_with_equity(equity: f64) -> TradingState {
        let mut s = TradingState::default();
        s.equity = equity;
        s.peak_equity = equity;
        s
    }

    #[test]
    fn approves_a_clean_proposal_and_sizes_it() {
        let engine = RiskEngine::new(RiskConfig::default());
        let state = state_with_equity(100.0);
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert!(result.approved, "{:?}", result.reasons);
        // risk_amount = 100 * 0.01 = 1.0; stop_distance = 2.0 -> raw qty = 0.5
        assert!((result.sized_quantity - 0.5).abs() < 1e-9);
        assert_eq!(result.rounded_entry, 100.0);
        assert_eq!(result.rounded_stop, 98.0);
    }

    #[test]
    fn scenario_1_simple_long_entry_sizing() {
        // equity=100, entry=100, stop=98, risk_pct=0.01, step=0.001
        // -> quantity = 0.500.
        let engine = RiskEngine::new(RiskConfig::default());
        let state = state_with_equity(100.0);
        let p = proposal();
        let result = engine.evaluate(&state, &p, &filters(), Utc::now());
        assert!(result.approved);
        assert!((result.sized_quantity - 0.500).abs() < 1e-9);
    }

    #[test]
    fn drawdown_beyond_threshold_trips_the_breaker() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.peak_equity = 150.0; // (150-100)/150 = 0.333 > default 0.20
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert!(result.circuit_breaker);
        assert_eq!(result.reasons, vec![RiskRejectReason::CircuitBreaker]);
    }

    #[test]
    fn active_circuit_breaker_rejects_without_retripping() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.circuit_breaker_active = true;
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert!(!result.approved);
        assert!(!result.circuit_breaker);
        assert_eq!(result.reasons, vec![RiskRejectReason::CircuitBreaker]);
    }

    #[test]
    fn manual_review_pending_blocks_entries() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.requires_manual_review = true;
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert_eq!(result.reasons, vec![RiskRejectReason::ManualReviewRequired]);
    }

    #[test]
    fn cooldown_engages_after_consecutive_loss_streak_and_clears_after_duration() {
        let mut cfg = RiskConfig::default();
        cfg.consecutive_loss_limit = 2;
        cfg.cooldown_hours_after_loss = 4.0;
        let engine = RiskEngine::new(cfg);
        let mut state = state_with_equity(100.0);
        state.consecutive_losses = 2;
        let loss_at = Utc::now() - chrono::Duration::hours(1);
        state.last_loss_at = Some(loss_at);

        let result = engine.evaluate(&state, &proposal(), &filters(), loss_at + chrono::Duration::hours(1));
        assert_eq!(result.reasons, vec![RiskRejectReason::CooldownActive]);

        let result = engine.evaluate(&state, &proposal(), &filters(), loss_at + chrono::Duration::hours(5));
        assert!(result.approved, "{:?}", result.reasons);
    }

    #[test]
    fn a_single_loss_below_the_streak_limit_does_not_engage_cooldown() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.consecutive_losses = 1;
        state.last_loss_at = Some(Utc::now());
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert!(result.approved, "{:?}", result.reasons);
    }

    #[test]
    fn duplicate_position_is_reported_alongside_other_failing_gates() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.positions.insert(
            "other".into(),
            crate::ledger::state::Position {
                trade_id: "other".into(),
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                entry_price: 90.0,
                quantity: 1.0,
                leverage: 1.0,
                stop_loss: 0.0,
                take_profit: 0.0,
                opened_at: Utc::now(),
                closed_at: None,
                unrealized_pnl: 0.0,
                realized_pnl: 0.0,
            },
        );
        let mut p = proposal();
        p.leverage = 999.0; // also trips LeverageExceeded
        let result = engine.evaluate(&state, &p, &filters(), Utc::now());
        assert!(result.reasons.contains(&RiskRejectReason::DuplicatePosition));
        assert!(result.reasons.contains(&RiskRejectReason::LeverageExceeded));
    }

    #[test]
    fn news_block_rejects_high_risk_symbol() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.news.push(crate::ledger::state::NewsItem {
            symbol: Some("BTCUSDT".into()),
            level: NewsRiskLevel::High,
            reason: "exchange outage rumor".into(),
            confidence: 0.9,
            last_updated: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        });
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert!(result.reasons.contains(&RiskRejectReason::NewsRiskBlock));
    }

    #[test]
    fn daily_loss_limit_trips_as_a_breaker_reason_without_retripping_circuit() {
        let engine = RiskEngine::new(RiskConfig::default());
        let mut state = state_with_equity(100.0);
        state.realized_pnl_today = -11.0;
        let result = engine.evaluate(&state, &proposal(), &filters(), Utc::now());
        assert!(!result.circuit_breaker);
        assert_eq!(result.reasons, vec![RiskRejectReason::DailyLossLimit]);
    }

    #[test]
    fn zero_stop_distance_is_sizing_infeasible() {
        let engine = RiskEngine::new(RiskConfig::default());
        let state = state_with_equity(100.0);
        let mut p = proposal();
        p.stop_price = p.entry_price;
        let result = engine.evaluate(&state, &p, &filters(), Utc::now());
        assert!(result.reasons.contains(&RiskRejectReason::SizingInfeasible));
    }

    #[test]
    fn evaluate_is_pure_same_inputs_same_outputs() {
        let engine = RiskEngine::new(RiskConfig::default());
        let state = state_with_equity(100.0);
        let now = Utc::now();
        let r1 = engine.evaluate(&state, &proposal(), &filters(), now);
        let r2 = engine.evaluate(&state, &proposal(), &filters(), now);
        assert_eq!(serde_json::to_string(&r1).unwrap(), serde_json::to_string(&r2).unwrap());
    }
}
