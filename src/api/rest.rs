// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// Control endpoints never mutate `TradingState` directly: pause/resume flip
// an ambient `Settings` flag (not a replay-relevant trading fact, so no
// event) and publish an audit event, kill drives `orchestrator::kill_switch`,
// and acknowledge-manual-review publishes a `MANUAL_REVIEW_ACKNOWLEDGED`
// event — the state fold, not this handler, clears `requires_manual_review`,
// so the ledger (not an in-process method call) is the sole source of truth.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::ledger::{Event, EventType};
use crate::orchestrator::{self, AppCore};

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(core: Arc<AppCore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/events", get(recent_events))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/risk", get(risk_snapshot))
        .route("/api/v1/trade-journal", get(trade_journal))
        .route("/api/v1/trade-journal/stats", get(trade_journal_stats))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route(
            "/api/v1/control/acknowledge-manual-review",
            post(control_acknowledge_manual_review),
        )
        .layer(cors)
        .with_state(core)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    run_mode: String,
    server_time: i64,
}

async fn health(State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        run_mode: core.settings.read().run_mode.to_string(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

async fn full_state(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    Json(core.state.snapshot())
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    since: Option<u64>,
}

/// Ledger events with `sequence_num >= since` (default 0, i.e. everything).
/// Reads straight off the durable log rather than an in-memory tail, so it
/// reflects exactly what a replay would see — at the cost of a full scan per
/// call, acceptable for an operator-facing endpoint rather than a hot path.
async fn recent_events(
    _auth: AuthBearer,
    State(core): State<Arc<AppCore>>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let since = query.since.unwrap_or(0);
    let events = core.ledger.load_all().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
    })?;
    let tail: Vec<_> = events.into_iter().filter(|e| e.sequence_num >= since).collect();
    Ok(Json(tail))
}

async fn positions(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    let snapshot = core.state.snapshot();
    let open: Vec<_> = snapshot.positions.values().cloned().collect();
    Json(open)
}

async fn risk_snapshot(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    Json(core.risk_engine.snapshot(&core.state.snapshot()))
}

async fn trade_journal(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    let snapshot = core.state.snapshot();
    Json(snapshot.closed_positions)
}

async fn trade_journal_stats(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    let closed = core.state.snapshot().closed_positions;
    let total_trades = closed.len();
    if total_trades == 0 {
        return Json(json!({
            "total_trades": 0,
            "win_rate": 0.0,
            "total_net_pnl": 0.0,
            "profit_factor": 0.0,
        }));
    }

    let wins = closed.iter().filter(|p| p.realized_pnl > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let total_net_pnl: f64 = closed.iter().map(|p| p.realized_pnl).sum();
    let gross_profit: f64 = closed.iter().filter(|p| p.realized_pnl > 0.0).map(|p| p.realized_pnl).sum();
    let gross_loss: f64 = closed.iter().filter(|p| p.realized_pnl < 0.0).map(|p| p.realized_pnl.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    Json(json!({
        "total_trades": total_trades,
        "win_rate": win_rate,
        "total_net_pnl": total_net_pnl,
        "profit_factor": profit_factor,
    }))
}

#[derive(Serialize)]
struct ControlResponse {
    message: String,
}

/// Request body for `/control/pause`. Every field carries a serde default
/// (same discipline as `Settings`) so an empty `{}` body — or, via the
/// `Default` impl, an absent body read as `{}` — pauses for the configured
/// `cooldown_hours_after_loss`.
#[derive(Debug, Deserialize, Default)]
struct PauseRequest {
    cooldown_hours: Option<f64>,
}

/// Publishes `MANUAL_INTERVENTION{kind:"OPERATOR_PAUSE", cooldown_until}`
/// (§6: operator actions), which the state fold turns into
/// `operator_cooldown_until` — the same field gate 1 of `RiskEngine::evaluate`
/// reads. `enable_trading` is flipped too so a restart before resume doesn't
/// silently re-enable trading from stale settings on disk.
async fn control_pause(
    _auth: AuthBearer,
    State(core): State<Arc<AppCore>>,
    Json(body): Json<PauseRequest>,
) -> impl IntoResponse {
    let hours = body.cooldown_hours.unwrap_or(core.risk_engine.config().cooldown_hours_after_loss);
    let cooldown_until = chrono::Utc::now() + chrono::Duration::milliseconds((hours * 3_600_000.0) as i64);

    core.settings.write().enable_trading = false;
    info!(cooldown_until = %cooldown_until, "trading paused via API");
    core.event_bus
        .publish(Event::new(
            EventType::ManualIntervention,
            json!({"kind": "OPERATOR_PAUSE", "cooldown_until": cooldown_until.to_rfc3339()}),
        ))
        .await
        .ok();
    Json(ControlResponse { message: format!("trading paused until {cooldown_until}") })
}

/// Publishes `MANUAL_INTERVENTION{kind:"OPERATOR_RESUME"}`, clearing
/// `operator_cooldown_until` through the same fold path `control_pause` set
/// it through — an operator resume is never a direct field write.
async fn control_resume(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    core.settings.write().enable_trading = true;
    info!("trading resumed via API");
    core.event_bus
        .publish(Event::new(EventType::ManualIntervention, json!({"kind": "OPERATOR_RESUME"})))
        .await
        .ok();
    Json(ControlResponse { message: "trading resumed".to_string() })
}

/// The operator's kill-switch action is the `SYSTEM_STOPPED` event shape
/// (spec's operator-injected event set), distinct from `KILL_SWITCH_TRIGGERED`
/// which `orchestrator::kill_switch` publishes as the consequence of
/// flattening every order/position — the same consequence fires whether the
/// trigger was this operator action or an internal circuit-breaker trip.
async fn control_kill(_auth: AuthBearer, State(core): State<Arc<AppCore>>) -> impl IntoResponse {
    warn!("kill switch triggered via API");
    core.event_bus
        .publish(Event::new(EventType::SystemStopped, json!({"reason": "OPERATOR_KILL_SWITCH"})))
        .await
        .ok();
    orchestrator::kill_switch(&core).await;
    Json(ControlResponse { message: "kill switch engaged — all positions flattened".to_string() })
}

async fn control_acknowledge_manual_review(
    _auth: AuthBearer,
    State(core): State<Arc<AppCore>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    info!("manual review acknowledged via API");
    core.event_bus
        .publish(Event::new(EventType::ManualReviewAcknowledged, json!({})))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        })?;
    Ok(Json(ControlResponse { message: "manual review acknowledged".to_string() }))
}
