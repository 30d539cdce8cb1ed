// =============================================================================
// Shared types used across the Aurora ledger engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Position / order direction. Serializes as `"LONG"`/`"SHORT"` (matching
/// `Display` and the ledger payload parser in `ledger::state::parse_side`)
/// rather than serde's default variant-name casing, since event payloads
/// embed this enum directly via `serde_json::json!` rather than through
/// `to_string()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    /// Binance-wire representation ("BUY" / "SELL").
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Order type as understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    TakeProfit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
            Self::Stop => "STOP",
            Self::TakeProfit => "TAKE_PROFIT",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of an order tracked in `open_orders`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses are the ones that remove the entry from `open_orders`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }
}

/// News risk severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NewsRiskLevel {
    Low,
    Medium,
    High,
}

impl Default for NewsRiskLevel {
    fn default() -> Self {
        Self::Low
    }
}

/// Run mode controlling whether orders reach the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// No network calls reach the exchange; fills are synthesized locally.
    Simulate,
    /// Orders are sent to the exchange testnet.
    Testnet,
    /// Orders are sent to the production exchange.
    Live,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Simulate
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Simulate => "simulate",
            Self::Testnet => "testnet",
            Self::Live => "live",
        };
        write!(f, "{s}")
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Normalized exchange trading rules for a symbol (from `exchangeInfo`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl SymbolFilters {
    /// Round a price to the nearest `tick_size`.
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.tick_size)
    }

    /// Floor a quantity to the nearest `step_size`.
    pub fn floor_quantity(&self, quantity: f64) -> f64 {
        if self.step_size <= 0.0 {
            return quantity;
        }
        (quantity / self.step_size).floor() * self.step_size
    }
}

/// Round `value` to the nearest multiple of `step` (round-half-away-from-zero).
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_wire_roundtrip() {
        assert_eq!(Side::Long.as_wire(), "BUY");
        assert_eq!(Side::Short.as_wire(), "SELL");
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn filters_round_and_floor() {
        let f = SymbolFilters {
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        };
        assert!((f.round_price(100.004) - 100.0).abs() < 1e-9);
        assert!((f.floor_quantity(0.5009) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn news_risk_ordering() {
        assert!(NewsRiskLevel::High > NewsRiskLevel::Medium);
        assert!(NewsRiskLevel::Medium > NewsRiskLevel::Low);
    }
}
