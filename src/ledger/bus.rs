// =============================================================================
// EventBus — publish-after-durable-append, dispatch to registered handlers
// =============================================================================
//
// "N listeners of possibly-different concrete types react to the same
// typed event" is a trait object behind a lock, the same shape
// `parking_lot::RwLock` guards every other piece of shared mutable state
// in this crate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, instrument};

use crate::ledger::event::{Event, EventType};
use crate::ledger::store::EventLedger;
use crate::error::EngineError;

/// A subscriber reacting to durably-appended events.
///
/// Handlers run after the event is already on disk — a handler raising
/// never rolls back the append, it only produces a `HandlerException` that
/// gets logged and does not stop the other handlers for that event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), EngineError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Registers handlers per `EventType` and dispatches durably-appended
/// events to them in registration order.
pub struct EventBus {
    ledger: Arc<EventLedger>,
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new(ledger: Arc<EventLedger>) -> Self {
        Self {
            ledger,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` to be invoked for every event of `event_type`.
    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Register `handler` against every member of `event_types`. Convenience
    /// for handlers that react to a family of events rather than just one
    /// (a logger reacting to every order event type, for instance).
    pub fn register_many(&self, event_types: &[EventType], handler: Arc<dyn EventHandler>) {
        for et in event_types {
            self.register(*et, handler.clone());
        }
    }

    /// Append `event` to the ledger, then fan it out to every handler
    /// registered for its type. Returns the durable event (with its
    /// assigned sequence number) regardless of handler outcomes.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn publish(&self, event: Event) -> Result<Event, EngineError> {
        let stored = self.ledger.append(event).await?;

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&stored.event_type)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler.handle(&stored).await {
                error!(
                    handler = handler.name(),
                    event_type = %stored.event_type,
                    error = %e,
                    "event handler failed"
                );
            }
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        name: String,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> Result<(), EngineError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Event) -> Result<(), EngineError> {
            Err(EngineError::HandlerException("boom".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn dispatches_only_to_registered_type() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(EventLedger::open(dir.path().join("l.log")).unwrap());
        let bus = EventBus::new(ledger);

        let count = Arc::new(AtomicUsize::new(0));
        bus.register(
            EventType::SignalComputed,
            Arc::new(CountingHandler {
                name: "counter".into(),
                count: count.clone(),
            }),
        );

        bus.publish(Event::new(EventType::SystemStarted, json!({})))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish(Event::new(EventType::SignalComputed, json!({})))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(EventLedger::open(dir.path().join("l.log")).unwrap());
        let bus = EventBus::new(ledger);

        let count = Arc::new(AtomicUsize::new(0));
        bus.register(EventType::OrderFilled, Arc::new(FailingHandler));
        bus.register(
            EventType::OrderFilled,
            Arc::new(CountingHandler {
                name: "counter".into(),
                count: count.clone(),
            }),
        );

        let result = bus
            .publish(Event::new(EventType::OrderFilled, json!({})))
            .await;
        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_assigns_sequence_even_with_no_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(EventLedger::open(dir.path().join("l.log")).unwrap());
        let bus = EventBus::new(ledger);

        let e = bus
            .publish(Event::new(EventType::UniverseUpdated, json!({})))
            .await
            .unwrap();
        assert_eq!(e.sequence_num, 0);
    }
}
