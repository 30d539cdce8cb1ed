//! Order placement, fill handling, and the user-data stream that feeds it.

pub mod engine;
pub mod user_stream;

pub use engine::{coid, ExecutionEngine, ExecutionResult};
pub use user_stream::UserStreamConsumer;
