// =============================================================================
// Reconciliation — compare internal state against the exchange
// =============================================================================
//
// SAFETY POLICY: this module logs and publishes events for any drift it
// discovers but never automatically cancels orders or closes positions on
// the exchange. A drift
// that crosses the significance threshold publishes a `MANUAL_INTERVENTION`
// event, which the state fold turns into `requires_manual_review = true`,
// blocking new entries until an operator acknowledges it through the control
// API — it does not touch existing positions or orders.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::exchange::ExchangeClient;
use crate::ledger::{Event, EventBus, EventType, StateManager};

/// Relative balance change beyond which a drift is considered significant.
const BALANCE_DRIFT_THRESHOLD: f64 = 0.0001;

/// Summary of a single reconciliation pass, published as the payload of a
/// `RECONCILIATION_COMPLETED` event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconcileResult {
    pub positions_matched: u32,
    pub position_drifts: u32,
    pub orphan_orders: u32,
    pub balance_drift: bool,
}

/// Run one reconciliation cycle: fetch exchange truth, compare against the
/// ledger-derived `TradingState`, and publish what it finds. Never mutates
/// exchange state.
pub async fn reconcile_once(
    client: &ExchangeClient,
    state: &StateManager,
    event_bus: &Arc<EventBus>,
) -> Result<ReconcileResult, EngineError> {
    info!("reconciliation cycle started");

    let exchange_positions = client.get_position_risk(None).await?;
    let exchange_orders = client.get_open_orders(None).await?;

    let snapshot = state.snapshot();

    let exchange_symbols_with_position: HashSet<String> = exchange_positions
        .iter()
        .filter(|p| p["positionAmt"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0).abs() > 0.0)
        .filter_map(|p| p["symbol"].as_str().map(String::from))
        .collect();

    let mut matched = 0u32;
    let mut drifted = Vec::new();
    for position in snapshot.positions.values() {
        if exchange_symbols_with_position.contains(&position.symbol) {
            matched += 1;
        } else {
            warn!(trade_id = %position.trade_id, symbol = %position.symbol, "internal position has no matching exchange position");
            drifted.push(position.trade_id.clone());
        }
    }

    let internal_symbols: HashSet<&str> = snapshot.positions.values().map(|p| p.symbol.as_str()).collect();
    let mut orphan_count = 0u32;
    for order in &exchange_orders {
        if let Some(sym) = order["symbol"].as_str() {
            if !internal_symbols.contains(sym) {
                orphan_count += 1;
                warn!(symbol = sym, "orphan exchange order with no matching internal position");
            }
        }
    }

    let balance_drift = refresh_balances(client, state, event_bus).await?;

    if !drifted.is_empty() || orphan_count > 0 {
        for trade_id in &drifted {
            event_bus
                .publish(Event::new(
                    EventType::ManualIntervention,
                    json!({"kind": "POSITION_DRIFT", "trade_id": trade_id}),
                ))
                .await?;
        }
        if orphan_count > 0 {
            event_bus
                .publish(Event::new(
                    EventType::ManualIntervention,
                    json!({"kind": "ORDER_DRIFT", "orphan_orders": orphan_count}),
                ))
                .await?;
        }
    }

    let result = ReconcileResult {
        positions_matched: matched,
        position_drifts: drifted.len() as u32,
        orphan_orders: orphan_count,
        balance_drift,
    };

    event_bus
        .publish(Event::new(
            EventType::ReconciliationCompleted,
            serde_json::to_value(&result).unwrap_or(json!({})),
        ))
        .await?;

    info!(
        positions_matched = matched,
        position_drifts = result.position_drifts,
        orphan_orders = orphan_count,
        balance_drift,
        "reconciliation cycle completed"
    );

    Ok(result)
}

async fn refresh_balances(
    client: &ExchangeClient,
    state: &StateManager,
    event_bus: &Arc<EventBus>,
) -> Result<bool, EngineError> {
    let account = client.get_account().await?;
    let raw_balances = account["assets"].as_array().cloned().unwrap_or_default();

    let mut new_balances: HashMap<String, f64> = HashMap::new();
    for b in &raw_balances {
        let asset = b["asset"].as_str().unwrap_or("").to_string();
        let free: f64 = b["availableBalance"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);
        if free.abs() > 0.0 {
            new_balances.insert(asset, free);
        }
    }

    let old_balances = state.snapshot().balances;
    let drift = detect_balance_drift(&old_balances, &new_balances);
    if drift {
        warn!("balance drift detected during reconciliation");
    } else {
        debug!("balances refreshed — no significant drift");
    }

    let balances_payload: serde_json::Map<String, serde_json::Value> = new_balances
        .iter()
        .map(|(k, v)| (k.clone(), json!({"free": v})))
        .collect();
    let kind = if drift { "BALANCE_DRIFT" } else { "BALANCE_REFRESH" };
    event_bus
        .publish(Event::new(
            EventType::ManualIntervention,
            json!({"kind": kind, "balances": balances_payload}),
        ))
        .await
        .ok();

    Ok(drift)
}

fn detect_balance_drift(old: &HashMap<String, f64>, new: &HashMap<String, f64>) -> bool {
    if old.is_empty() {
        return false;
    }

    for (asset, new_value) in new {
        match old.get(asset) {
            Some(old_value) if old_value.abs() > 0.0 => {
                let pct_change = ((new_value - old_value) / old_value).abs();
                if pct_change > BALANCE_DRIFT_THRESHOLD {
                    return true;
                }
            }
            Some(_) => {
                if new_value.abs() > 0.0 {
                    return true;
                }
            }
            None => return true,
        }
    }

    for asset in old.keys() {
        if !new.contains_key(asset) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_drift_on_first_run() {
        let old = HashMap::new();
        let new = HashMap::from([("USDT".to_string(), 100.0)]);
        assert!(!detect_balance_drift(&old, &new));
    }

    #[test]
    fn small_change_is_not_drift() {
        let old = HashMap::from([("USDT".to_string(), 100.0)]);
        let new = HashMap::from([("USDT".to_string(), 100.0001)]);
        assert!(!detect_balance_drift(&old, &new));
    }

    #[test]
    fn large_change_is_drift() {
        let old = HashMap::from([("USDT".to_string(), 100.0)]);
        let new = HashMap::from([("USDT".to_string(), 90.0)]);
        assert!(detect_balance_drift(&old, &new));
    }

    #[test]
    fn disappeared_asset_is_drift() {
        let old = HashMap::from([("USDT".to_string(), 100.0), ("BNB".to_string(), 5.0)]);
        let new = HashMap::from([("USDT".to_string(), 100.0)]);
        assert!(detect_balance_drift(&old, &new));
    }
}
