//! Event sourcing core: the append-only store, the typed event, the
//! publish/dispatch bus, and the folded read model derived from them.

pub mod bus;
pub mod event;
pub mod state;
pub mod store;

pub use bus::{EventBus, EventHandler};
pub use event::{Event, EventMetadata, EventType, ALL_EVENT_TYPES};
pub use state::{StateManager, TradingState};
pub use store::EventLedger;
