// =============================================================================
// aurora-ledger — Main Entry Point
// =============================================================================
//
// Startup sequence: load settings, take the single-instance lock, open the
// ledger and replay it into a fresh `StateManager`, build every component,
// then hand them to the orchestrator's concurrent loops and the API server.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_ledger::api;
use aurora_ledger::collaborators::{AlwaysLowRisk, NeverTrade, NoNews, StaticUniverse};
use aurora_ledger::config::Settings;
use aurora_ledger::exchange::{ExchangeClient, RateLimitTracker};
use aurora_ledger::execution::ExecutionEngine;
use aurora_ledger::ledger::{Event, EventBus, EventLedger, EventType, StateManager, ALL_EVENT_TYPES};
use aurora_ledger::orchestrator::{self, AppCore};
use aurora_ledger::risk::RiskEngine;
use aurora_ledger::single_instance::SingleInstanceLock;
use aurora_ledger::types;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-ledger starting up");

    let mut settings = Settings::load("settings.json");
    settings.risk.news_block_level = settings.news.block_level;
    info!(run_mode = %settings.run_mode, symbols = ?settings.symbols, "settings loaded");

    let logs_dir = std::path::PathBuf::from(&settings.storage.logs_path);
    let mut instance_lock = SingleInstanceLock::new(logs_dir.join("aurora.pid"));
    if let Err(e) = instance_lock.acquire() {
        error!(error = %e, "another instance is already running — exiting");
        anyhow::bail!("single-instance lock held: {e}");
    }

    let ledger = Arc::new(EventLedger::open(&settings.storage.ledger_path)?);
    let existing_events = ledger.load_all()?;
    info!(count = existing_events.len(), "replaying ledger");

    let event_bus = Arc::new(EventBus::new(ledger.clone()));
    let state = Arc::new(StateManager::new(settings.initial_equity));
    state.rebuild(&existing_events);
    event_bus.register_many(ALL_EVENT_TYPES, state.clone());

    if settings.run_mode != types::RunMode::Simulate {
        let errors = settings.validate_for_trading();
        if !errors.is_empty() {
            for e in &errors {
                error!(reason = e, "settings not trade-ready");
            }
            anyhow::bail!("refusing to start in {} mode with invalid settings", settings.run_mode);
        }
    }

    let risk_engine = Arc::new(RiskEngine::new(settings.risk.clone()));

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let testnet = settings.run_mode == types::RunMode::Testnet;
    let exchange_client = ExchangeClient::new(api_key, api_secret, testnet);
    let rate_limiter = Arc::new(RateLimitTracker::new());

    let execution_engine = Arc::new(ExecutionEngine::new(
        exchange_client.clone(),
        rate_limiter.clone(),
        event_bus.clone(),
        state.clone(),
        risk_engine.clone(),
        settings.run_mode,
    ));

    if settings.run_mode == types::RunMode::Simulate {
        info!("no strategy/universe/news collaborators configured — running with deterministic no-op doubles");
    } else {
        warn!("no real universe/news/strategy collaborators wired in this build — falling back to no-op doubles even in non-simulate mode");
    }

    let core = Arc::new(AppCore {
        settings: RwLock::new(settings.clone()),
        event_bus: event_bus.clone(),
        ledger: ledger.clone(),
        state: state.clone(),
        risk_engine: risk_engine.clone(),
        execution: execution_engine,
        exchange: exchange_client,
        rate_limiter,
        symbol_filters: RwLock::new(HashMap::new()),
        universe: Arc::new(StaticUniverse(settings.symbols.clone())),
        news: Arc::new(NoNews),
        llm: Arc::new(AlwaysLowRisk),
        strategy: Arc::new(NeverTrade),
        kill_switch_engaged: AtomicBool::new(false),
    });

    let api_core = core.clone();
    let bind_addr = format!("0.0.0.0:{}", settings.monitoring.api_port);
    tokio::spawn(async move {
        let app = api::rest::router(api_core);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, addr = %bind_addr, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server exited");
        }
    });

    let orchestrator_core = core.clone();
    let orchestrator_handle = tokio::spawn(async move {
        orchestrator::run(orchestrator_core).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = orchestrator_handle => {
            warn!("orchestrator loops exited unexpectedly");
        }
    }

    event_bus
        .publish(Event::new(EventType::SystemStopped, serde_json::json!({})))
        .await
        .ok();
    instance_lock.release();
    info!("aurora-ledger shut down cleanly");

    Ok(())
}
