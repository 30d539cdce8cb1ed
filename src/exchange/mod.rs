//! Exchange connectivity: signed REST client and rate-limit bookkeeping.

pub mod client;
pub mod rate_limit;

pub use client::ExchangeClient;
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
