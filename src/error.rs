// =============================================================================
// Error taxonomy — closed set of kinds, one policy each
// =============================================================================
//
// `EngineError` is the typed error surfaced by the ledger, risk engine, and
// execution engine. The orchestrator and `main` convert it to `anyhow::Error`
// at the outer boundary and decide policy (retry / log / fatal) based on the
// variant.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Ledger append/read failed at the filesystem level. Fatal: the caller
    /// must not publish to subscribers and must halt.
    #[error("ledger I/O error: {0}")]
    LedgerIOError(String),

    /// 429 / 418 / 5xx / network failure talking to the exchange. Retry with
    /// exponential backoff, bounded attempts.
    #[error("transient exchange error: {0}")]
    ExchangeTransient(String),

    /// 4xx exchange rejection of an order placement or cancel.
    #[error("exchange rejected request: {0}")]
    ExchangeRejection(String),

    /// 401 / 403 from the exchange. Fatal: triggers the kill switch.
    #[error("exchange authentication failure: {0}")]
    AuthFailure(String),

    /// Local state disagrees with exchange truth beyond tolerance.
    #[error("reconciliation drift: {0}")]
    ReconciliationDrift(String),

    /// Circuit breaker: drawdown exceeded configured threshold.
    #[error("drawdown breach: {0}")]
    DrawdownBreach(String),

    /// An event handler raised while processing an event. Logged; does not
    /// roll back the ledger write or stop other handlers.
    #[error("handler exception: {0}")]
    HandlerException(String),

    /// News classifier failed after retries; caller falls back to `LOW`.
    #[error("LLM classification failure: {0}")]
    LLMFailure(String),
}

impl EngineError {
    /// Whether this error kind should terminate the process (as opposed to
    /// being logged and continued past).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerIOError(_) | Self::AuthFailure(_))
    }
}

/// Risk-engine rejection reason codes (not an error — `RISK_REJECTED` is a
/// normal, expected outcome that does not stop the strategy loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RiskRejectReason {
    CooldownActive,
    ManualReviewRequired,
    CircuitBreaker,
    DailyLossLimit,
    MaxPositions,
    DuplicatePosition,
    NewsRiskBlock,
    SizingInfeasible,
    LeverageExceeded,
    RoundingInvalid,
}

impl std::fmt::Display for RiskRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CooldownActive => "COOLDOWN_ACTIVE",
            Self::ManualReviewRequired => "MANUAL_REVIEW_REQUIRED",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::DailyLossLimit => "DAILY_LOSS_LIMIT",
            Self::MaxPositions => "MAX_POSITIONS",
            Self::DuplicatePosition => "DUPLICATE_POSITION",
            Self::NewsRiskBlock => "NEWS_RISK_BLOCK",
            Self::SizingInfeasible => "SIZING_INFEASIBLE",
            Self::LeverageExceeded => "LEVERAGE_EXCEEDED",
            Self::RoundingInvalid => "ROUNDING_INVALID",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(EngineError::LedgerIOError("x".into()).is_fatal());
        assert!(EngineError::AuthFailure("x".into()).is_fatal());
        assert!(!EngineError::ExchangeTransient("x".into()).is_fatal());
        assert!(!EngineError::DrawdownBreach("x".into()).is_fatal());
    }

    #[test]
    fn reject_reason_display() {
        assert_eq!(RiskRejectReason::CooldownActive.to_string(), "COOLDOWN_ACTIVE");
        assert_eq!(RiskRejectReason::NewsRiskBlock.to_string(), "NEWS_RISK_BLOCK");
    }
}
