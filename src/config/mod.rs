//! Configuration Module - TOML-based Agent Configuration
//!
//! Loads and validates configuration from `config.toml`.
//! Every threshold the decision core uses is externalized here -
//! nothing is hardcoded in the domain layer.

pub mod loader;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::kelly::SizingRules;
use crate::domain::signal::ScoringRules;
use crate::usecases::ledger::HistoryRetention;
use crate::usecases::risk_gate::RiskLimits;

/// Top-level agent configuration.
///
/// Loaded from `config.toml` at startup. All fields are validated
/// before the first decision cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Agent identity and loop cadence.
  pub agent: AgentConfig,
  /// Signal scoring thresholds.
  pub signal: ScoringRules,
  /// Kelly multiplier and exposure caps.
  #[serde(default)]
  pub sizing: SizingRules,
  /// Drawdown thresholds for the risk gate.
  #[serde(default)]
  pub risk: RiskLimits,
  /// Transport timeouts.
  #[serde(default)]
  pub execution: ExecutionConfig,
  /// Starting capital.
  pub ledger: LedgerConfig,
  /// State snapshot and trade log location.
  #[serde(default)]
  pub persistence: PersistenceConfig,
  /// Metrics and monitoring.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Paper trading adapters.
  #[serde(default)]
  pub paper: PaperConfig,
}

/// Agent identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
  /// Human-readable agent name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Seconds between decision cycles.
  #[serde(default = "default_scan_interval")]
  pub scan_interval_secs: u64,
  /// Concurrent probability estimations per cycle.
  #[serde(default = "default_estimator_concurrency")]
  pub estimator_concurrency: usize,
}

/// Execution transport timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
  /// Submission timeout (milliseconds).
  #[serde(default = "default_submit_timeout")]
  pub submit_timeout_ms: u64,
  /// Reconciliation query timeout (milliseconds).
  #[serde(default = "default_query_timeout")]
  pub query_timeout_ms: u64,
}

impl Default for ExecutionConfig {
  fn default() -> Self {
    Self {
      submit_timeout_ms: default_submit_timeout(),
      query_timeout_ms: default_query_timeout(),
    }
  }
}

/// Ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
  /// Cash at first start; ignored once a snapshot exists.
  pub initial_bankroll: rust_decimal::Decimal,
  /// Closed positions and realized P&L entries kept in the snapshot.
  #[serde(default = "default_history_limit")]
  pub history_limit: usize,
  /// Hours an applied idempotency token is remembered.
  #[serde(default = "default_token_retention")]
  pub applied_token_retention_hours: u64,
}

impl LedgerConfig {
  pub fn retention(&self) -> HistoryRetention {
    HistoryRetention {
      history_limit: self.history_limit,
      applied_token_retention_hours: self.applied_token_retention_hours,
    }
  }
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Directory for `state.json` and JSONL trade logs.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

/// Paper trading configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaperConfig {
  /// JSONL file of recorded opportunities and estimates.
  #[serde(default)]
  pub replay_file: Option<String>,
  /// Adverse slippage applied to paper fills (basis points).
  #[serde(default)]
  pub slippage_bps: u32,
  /// Restart the replay from the top once exhausted.
  #[serde(default)]
  pub loop_replay: bool,
}

/// Configuration errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config: {0}")]
  Parse(#[source] toml::de::Error),

  #[error("invalid value for {field}: {reason}")]
  Invalid { field: &'static str, reason: String },
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_scan_interval() -> u64 {
  10
}

fn default_estimator_concurrency() -> usize {
  8
}

fn default_submit_timeout() -> u64 {
  5_000
}

fn default_query_timeout() -> u64 {
  5_000
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}

fn default_history_limit() -> usize {
  HistoryRetention::default().history_limit
}

fn default_token_retention() -> u64 {
  HistoryRetention::default().applied_token_retention_hours
}

fn default_data_dir() -> String {
  "data".to_string()
}
