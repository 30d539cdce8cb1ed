// =============================================================================
// Settings — every tunable the core consults, with atomic persisted save
// =============================================================================
//
// Every field carries a serde default so that adding a field never breaks
// loading an older config file on disk. Persistence uses an atomic
// tmp-then-rename pattern. Secrets (API key/secret) are read from the
// environment only, never persisted to the config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::RunMode;

fn default_true() -> bool {
    true
}

fn default_initial_equity() -> f64 {
    100.0
}

fn default_max_drawdown_pct() -> f64 {
    0.20
}

fn default_daily_loss_limit() -> f64 {
    10.0
}

fn default_risk_pct_per_trade() -> f64 {
    0.01
}

fn default_max_positions() -> u32 {
    5
}

fn default_max_leverage() -> f64 {
    10.0
}

fn default_default_leverage() -> f64 {
    3.0
}

fn default_cooldown_hours_after_loss() -> f64 {
    4.0
}

fn default_consecutive_loss_limit() -> u32 {
    3
}

fn default_poll_interval_minutes() -> u64 {
    15
}

fn default_news_ttl_minutes() -> i64 {
    180
}

fn default_block_level() -> crate::types::NewsRiskLevel {
    crate::types::NewsRiskLevel::High
}

fn default_rate_limit_per_minute() -> u32 {
    20
}

fn default_request_timeout_sec() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_backoff_sec() -> u64 {
    2
}

fn default_ledger_path() -> String {
    "data/ledger.log".to_string()
}

fn default_logs_path() -> String {
    "logs".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_port() -> u16 {
    3001
}

/// Risk-engine tunables (§6 Configuration: risk parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_risk_pct_per_trade")]
    pub risk_pct_per_trade: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_default_leverage")]
    pub default_leverage: f64,
    #[serde(default = "default_cooldown_hours_after_loss")]
    pub cooldown_hours_after_loss: f64,
    #[serde(default = "default_consecutive_loss_limit")]
    pub consecutive_loss_limit: u32,
    /// Mirrors `news.block_level`; duplicated here (rather than having the
    /// risk engine reach into `NewsConfig`) so `RiskEngine::evaluate` only
    /// ever depends on one config type.
    #[serde(default = "default_block_level")]
    pub news_block_level: crate::types::NewsRiskLevel,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown_pct(),
            daily_loss_limit: default_daily_loss_limit(),
            risk_pct_per_trade: default_risk_pct_per_trade(),
            max_positions: default_max_positions(),
            max_leverage: default_max_leverage(),
            default_leverage: default_default_leverage(),
            cooldown_hours_after_loss: default_cooldown_hours_after_loss(),
            consecutive_loss_limit: default_consecutive_loss_limit(),
            news_block_level: default_block_level(),
        }
    }
}

/// News ingestion tunables (§6 Configuration: news parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: u64,
    #[serde(default = "default_news_ttl_minutes")]
    pub ttl_minutes: i64,
    #[serde(default = "default_block_level")]
    pub block_level: crate::types::NewsRiskLevel,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_minutes: default_poll_interval_minutes(),
            ttl_minutes: default_news_ttl_minutes(),
            block_level: default_block_level(),
        }
    }
}

/// LLM classifier tunables (§6 Configuration: LLM parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_sec")]
    pub retry_backoff_sec: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-haiku".to_string(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            request_timeout_sec: default_request_timeout_sec(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_sec: default_retry_backoff_sec(),
        }
    }
}

/// Storage paths (§6 Configuration: ledger/logs paths).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,
    #[serde(default = "default_logs_path")]
    pub logs_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            logs_path: default_logs_path(),
        }
    }
}

/// Monitoring ports (§6 Configuration: monitoring ports).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            api_port: default_api_port(),
        }
    }
}

/// Top-level settings for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// `simulate | testnet | live`.
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default = "default_true")]
    pub enable_trading: bool,
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub news: NewsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Simulate,
            enable_trading: true,
            initial_equity: default_initial_equity(),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            risk: RiskConfig::default(),
            news: NewsConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`, falling back to defaults
    /// (with a logged warning) if the file is missing or malformed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(settings) => {
                    info!(path = %path.display(), "settings loaded");
                    settings
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse settings, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!(path = %path.display(), "settings file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Persist settings to `path` using an atomic tmp+rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;
        Ok(())
    }

    /// Validate preconditions for trading; returns a list of human-readable
    /// errors (empty if the settings are trade-ready).
    pub fn validate_for_trading(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.symbols.is_empty() {
            errors.push("no symbols configured".to_string());
        }
        if self.risk.max_drawdown_pct <= 0.0 || self.risk.max_drawdown_pct >= 1.0 {
            errors.push("risk.max_drawdown_pct must be in (0, 1)".to_string());
        }
        if self.risk.risk_pct_per_trade <= 0.0 {
            errors.push("risk.risk_pct_per_trade must be positive".to_string());
        }
        if self.run_mode == RunMode::Live && !self.enable_trading {
            errors.push("live run_mode requires enable_trading = true".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_valid() {
        let s = Settings::default();
        assert!(s.validate_for_trading().is_empty());
        assert_eq!(s.run_mode, RunMode::Simulate);
    }

    #[test]
    fn empty_symbols_fails_validation() {
        let mut s = Settings::default();
        s.symbols.clear();
        assert!(!s.validate_for_trading().is_empty());
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["BTCUSDT"] }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.symbols, vec!["BTCUSDT"]);
        assert_eq!(s.risk.max_positions, 5);
        assert!(s.news.enabled);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let s = Settings::default();
        s.save(&path).unwrap();
        let loaded = Settings::load(&path);
        assert_eq!(loaded.symbols, s.symbols);
        assert_eq!(loaded.risk.max_positions, s.risk.max_positions);
    }
}
