// =============================================================================
// Event — the unit the ledger persists and the bus dispatches
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of event kinds, partitioned by the subsystem that raises them.
/// Tagged variants, never bare strings, so a handler registration or a
/// replay match is exhaustive-checked by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // --- system -------------------------------------------------------
    SystemStarted,
    SystemStopped,
    KillSwitchTriggered,

    // --- universe -------------------------------------------------------
    UniverseUpdated,

    // --- news -------------------------------------------------------
    NewsIngested,
    NewsClassified,

    // --- signal -------------------------------------------------------
    SignalComputed,

    // --- risk -------------------------------------------------------
    TradeProposed,
    RiskApproved,
    RiskRejected,
    CircuitBreakerTriggered,

    // --- order -------------------------------------------------------
    OrderPlaced,
    OrderPartialFill,
    OrderFilled,
    OrderCancelled,
    OrderRejected,

    // --- position -------------------------------------------------------
    PositionOpened,
    PositionClosed,

    // --- ops -------------------------------------------------------
    ReconciliationCompleted,
    ManualIntervention,
    ManualReviewAcknowledged,
}

/// Every variant, for subscribers (like `StateManager`) that need to
/// register against the whole event stream rather than a handful of types.
pub const ALL_EVENT_TYPES: &[EventType] = &[
    EventType::SystemStarted,
    EventType::SystemStopped,
    EventType::KillSwitchTriggered,
    EventType::UniverseUpdated,
    EventType::NewsIngested,
    EventType::NewsClassified,
    EventType::SignalComputed,
    EventType::TradeProposed,
    EventType::RiskApproved,
    EventType::RiskRejected,
    EventType::CircuitBreakerTriggered,
    EventType::OrderPlaced,
    EventType::OrderPartialFill,
    EventType::OrderFilled,
    EventType::OrderCancelled,
    EventType::OrderRejected,
    EventType::PositionOpened,
    EventType::PositionClosed,
    EventType::ReconciliationCompleted,
    EventType::ManualIntervention,
    EventType::ManualReviewAcknowledged,
];

impl EventType {
    /// Shouty-snake-case wire name for this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemStarted => "SYSTEM_STARTED",
            Self::SystemStopped => "SYSTEM_STOPPED",
            Self::KillSwitchTriggered => "KILL_SWITCH_TRIGGERED",
            Self::UniverseUpdated => "UNIVERSE_UPDATED",
            Self::NewsIngested => "NEWS_INGESTED",
            Self::NewsClassified => "NEWS_CLASSIFIED",
            Self::SignalComputed => "SIGNAL_COMPUTED",
            Self::TradeProposed => "TRADE_PROPOSED",
            Self::RiskApproved => "RISK_APPROVED",
            Self::RiskRejected => "RISK_REJECTED",
            Self::CircuitBreakerTriggered => "CIRCUIT_BREAKER_TRIGGERED",
            Self::OrderPlaced => "ORDER_PLACED",
            Self::OrderPartialFill => "ORDER_PARTIAL_FILL",
            Self::OrderFilled => "ORDER_FILLED",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::OrderRejected => "ORDER_REJECTED",
            Self::PositionOpened => "POSITION_OPENED",
            Self::PositionClosed => "POSITION_CLOSED",
            Self::ReconciliationCompleted => "RECONCILIATION_COMPLETED",
            Self::ManualIntervention => "MANUAL_INTERVENTION",
            Self::ManualReviewAcknowledged => "MANUAL_REVIEW_ACKNOWLEDGED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance metadata carried alongside every event's payload. Distinct
/// from the payload itself so handlers can branch on source/correlation
/// without knowing the payload schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
}

/// One ledger record. `sequence_num` is assigned by the store at append
/// time and is monotonic within a single ledger file — it is the
/// replay order, not `timestamp` (clocks can go backwards; the ledger
/// never does).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub sequence_num: u64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    /// Construct a new event; `sequence_num` is a placeholder (0) until the
    /// store assigns the real one at append time.
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            sequence_num: 0,
            payload,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.metadata.symbol = Some(symbol.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names_are_shouty_snake_case() {
        assert_eq!(EventType::SystemStarted.as_str(), "SYSTEM_STARTED");
        assert_eq!(EventType::OrderPartialFill.as_str(), "ORDER_PARTIAL_FILL");
        assert_eq!(EventType::ManualIntervention.to_string(), "MANUAL_INTERVENTION");
    }

    #[test]
    fn new_event_has_zero_sequence_and_fresh_id() {
        let e1 = Event::new(EventType::SignalComputed, serde_json::json!({"x": 1}));
        let e2 = Event::new(EventType::SignalComputed, serde_json::json!({"x": 1}));
        assert_eq!(e1.sequence_num, 0);
        assert_ne!(e1.event_id, e2.event_id);
    }

    #[test]
    fn serde_roundtrip_preserves_event_type() {
        let e = Event::new(EventType::PositionOpened, serde_json::json!({"symbol": "BTCUSDT"}))
            .with_symbol("BTCUSDT");
        let json = serde_json::to_string(&e).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, EventType::PositionOpened);
        assert_eq!(back.metadata.symbol.as_deref(), Some("BTCUSDT"));
    }
}
