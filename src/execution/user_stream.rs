// =============================================================================
// UserStreamConsumer — exchange user-data WebSocket, reconnect-on-drop
// =============================================================================
//
// Unlike a market-data stream, a user-data stream reconnect is itself an
// event worth recording: fills may have happened while the socket was
// down, and at-least-once delivery on resume means `ExecutionEngine`'s
// fill dedup is load-bearing here. So every reconnect (after the first
// connect) is followed by a reconciliation pass before new frames are
// consumed (§4.6), and the gap itself is covered by exponential backoff
// rather than a fixed delay, since a prolonged exchange-side outage
// shouldn't turn into a reconnect-storm.
//
// The stream URL is keyed off a listen key the exchange mints and expires
// after 60 minutes of silence; a background task pings it well under that
// window so a healthy connection never needs a mid-stream key rotation.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::exchange::ExchangeClient;
use crate::execution::engine::ExecutionEngine;
use crate::ledger::{EventBus, StateManager};
use crate::reconcile;

const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(60);
const LISTEN_KEY_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25 * 60);

/// Consumes the exchange's user-data WebSocket (order fills, account
/// updates) and feeds them to the `ExecutionEngine`.
pub struct UserStreamConsumer {
    stream_base_url: String,
    exchange: ExchangeClient,
    execution: Arc<ExecutionEngine>,
    state: Arc<StateManager>,
    event_bus: Arc<EventBus>,
    /// Set once the first connection attempt of this process has
    /// completed, so the very first connect doesn't trigger a
    /// reconciliation pass the caller (`orchestrator::run`) already ran.
    ever_connected: AtomicBool,
}

impl UserStreamConsumer {
    pub fn new(
        stream_base_url: impl Into<String>,
        exchange: ExchangeClient,
        execution: Arc<ExecutionEngine>,
        state: Arc<StateManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            stream_base_url: stream_base_url.into(),
            exchange,
            execution,
            state,
            event_bus,
            ever_connected: AtomicBool::new(false),
        }
    }

    /// Run forever, reconnecting on any stream error with exponential
    /// backoff capped at `RECONNECT_DELAY_MAX`. A successful connection
    /// resets the backoff back to `RECONNECT_DELAY_MIN` for the next gap.
    pub async fn run(&self) {
        let mut backoff = RECONNECT_DELAY_MIN;
        loop {
            match self.connect_and_consume().await {
                Ok(()) => backoff = RECONNECT_DELAY_MIN,
                Err(e) => {
                    warn!(error = %e, delay_secs = backoff.as_secs(), "user-data stream disconnected, reconnecting");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_DELAY_MAX);
        }
    }

    async fn connect_and_consume(&self) -> anyhow::Result<()> {
        let listen_key = self
            .exchange
            .create_listen_key()
            .await
            .map_err(|e| anyhow::anyhow!("failed to mint listen key: {e}"))?;
        let url = format!("{}/{}", self.stream_base_url, listen_key);

        let (ws_stream, _response) = connect_async(&url)
            .await
            .map_err(|e| anyhow::anyhow!("user-data stream connect failed: {e}"))?;

        info!(url = %self.stream_base_url, "user-data stream connected");

        if self.ever_connected.swap(true, Ordering::SeqCst) {
            if let Err(e) = reconcile::reconcile_once(&self.exchange, &self.state, &self.event_bus).await {
                warn!(error = %e, "post-reconnect reconciliation failed");
            }
        }

        let (_write, mut read) = ws_stream.split();
        let mut keepalive = tokio::time::interval(LISTEN_KEY_KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let msg = msg.map_err(|e| anyhow::anyhow!("user-data stream read error: {e}"))?;
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        if let Err(e) = self.handle_message(&text).await {
                            error!(error = %e, "failed to handle user-data stream message");
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.exchange.keepalive_listen_key().await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
            }
        }
    }

    async fn handle_message(&self, text: &str) -> anyhow::Result<()> {
        let value: Value = serde_json::from_str(text)?;
        let event_type = value.get("e").and_then(|v| v.as_str()).unwrap_or_default();

        match event_type {
            "ORDER_TRADE_UPDATE" => self.handle_order_trade_update(&value).await,
            _ => Ok(()),
        }
    }

    async fn handle_order_trade_update(&self, value: &Value) -> anyhow::Result<()> {
        let order = value.get("o").ok_or_else(|| anyhow::anyhow!("missing order payload"))?;
        let client_order_id = order
            .get("c")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing client order id"))?;
        let status = order.get("X").and_then(|v| v.as_str()).unwrap_or_default();

        match status {
            "FILLED" => {
                let fill_id = order
                    .get("t")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "0".to_string());
                let fill_price: f64 = order
                    .get("L")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                let fill_qty: f64 = order
                    .get("l")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                self.execution
                    .handle_order_filled(client_order_id, &fill_id, fill_price, fill_qty)
                    .await?;
            }
            "PARTIALLY_FILLED" => {
                // `L`/`z` are the last-fill price and cumulative filled
                // quantity respectively; the order is still live, so this
                // must not be routed through the terminal-fill path.
                let fill_price: f64 = order
                    .get("L")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                let cumulative_qty: f64 = order
                    .get("z")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                self.execution
                    .handle_order_partial_fill(client_order_id, fill_price, cumulative_qty)
                    .await?;
            }
            "CANCELED" | "EXPIRED" => {
                self.execution.handle_order_cancelled(client_order_id).await?;
            }
            _ => {}
        }

        Ok(())
    }

    pub fn stream_base_url(&self) -> &str {
        &self.stream_base_url
    }
}
