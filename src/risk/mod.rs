//! Pure risk gating: breaker bookkeeping plus the ordered evaluate sequence.

pub mod engine;

pub use engine::{CircuitBreakerInfo, RiskEngine, RiskResult, TradeProposal};
