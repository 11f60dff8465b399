//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.
//! A configuration error is fatal before any cycle runs.

use std::path::Path;

use rust_decimal::Decimal;
use tracing::info;

use super::{AppConfig, ConfigError};

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns `ConfigError` if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
  let content = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Read {
    path: path.to_string(),
    source,
  })?;

  let config = parse_config(&content)?;

  info!(
    agent = %config.agent.name,
    bankroll = %config.ledger.initial_bankroll,
    kelly = %config.sizing.kelly_fraction_multiplier,
    halt = %config.risk.halt_drawdown,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
  let config: AppConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
  validate_config(&config)?;
  Ok(config)
}

fn ensure(condition: bool, field: &'static str, reason: impl FnOnce() -> String) -> Result<(), ConfigError> {
  if condition {
    Ok(())
  } else {
    Err(ConfigError::Invalid {
      field,
      reason: reason(),
    })
  }
}

fn in_unit_interval(value: Decimal) -> bool {
  value > Decimal::ZERO && value <= Decimal::ONE
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Fractions in (0, 1]
/// - Per-market cap not above the aggregate cap
/// - Ordered drawdown thresholds: 0 < recovery < restrict <= halt < 1
/// - Positive bankroll and timeouts
fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
  // Signal validation
  let signal = &config.signal;
  ensure(
    signal.min_confidence >= Decimal::ZERO && signal.min_confidence <= Decimal::ONE,
    "signal.min_confidence",
    || format!("must be in [0, 1], got {}", signal.min_confidence),
  )?;
  ensure(signal.min_liquidity >= Decimal::ZERO, "signal.min_liquidity", || {
    format!("must not be negative, got {}", signal.min_liquidity)
  })?;
  ensure(
    signal.min_edge >= Decimal::ZERO && signal.min_edge < Decimal::ONE,
    "signal.min_edge",
    || format!("must be in [0, 1), got {}", signal.min_edge),
  )?;
  ensure(signal.signal_ttl_secs > 0, "signal.signal_ttl_secs", || {
    "must be positive".to_string()
  })?;

  // Sizing validation
  let sizing = &config.sizing;
  ensure(
    in_unit_interval(sizing.kelly_fraction_multiplier),
    "sizing.kelly_fraction_multiplier",
    || format!("must be in (0, 1], got {}", sizing.kelly_fraction_multiplier),
  )?;
  ensure(
    in_unit_interval(sizing.max_per_market_fraction),
    "sizing.max_per_market_fraction",
    || format!("must be in (0, 1], got {}", sizing.max_per_market_fraction),
  )?;
  ensure(
    in_unit_interval(sizing.max_aggregate_exposure_fraction),
    "sizing.max_aggregate_exposure_fraction",
    || format!("must be in (0, 1], got {}", sizing.max_aggregate_exposure_fraction),
  )?;
  ensure(
    sizing.max_per_market_fraction <= sizing.max_aggregate_exposure_fraction,
    "sizing.max_per_market_fraction",
    || "must not exceed max_aggregate_exposure_fraction".to_string(),
  )?;
  ensure(sizing.min_stake >= Decimal::ZERO, "sizing.min_stake", || {
    format!("must not be negative, got {}", sizing.min_stake)
  })?;

  // Risk validation
  let risk = &config.risk;
  ensure(
    risk.recovery_drawdown > Decimal::ZERO
      && risk.recovery_drawdown < risk.restrict_drawdown
      && risk.restrict_drawdown <= risk.halt_drawdown
      && risk.halt_drawdown < Decimal::ONE,
    "risk",
    || {
      format!(
        "thresholds must satisfy 0 < recovery ({}) < restrict ({}) <= halt ({}) < 1",
        risk.recovery_drawdown, risk.restrict_drawdown, risk.halt_drawdown
      )
    },
  )?;
  ensure(
    in_unit_interval(risk.restricted_cap_multiplier),
    "risk.restricted_cap_multiplier",
    || format!("must be in (0, 1], got {}", risk.restricted_cap_multiplier),
  )?;

  // Execution and loop validation
  ensure(config.execution.submit_timeout_ms > 0, "execution.submit_timeout_ms", || {
    "must be positive".to_string()
  })?;
  ensure(config.execution.query_timeout_ms > 0, "execution.query_timeout_ms", || {
    "must be positive".to_string()
  })?;
  ensure(config.agent.scan_interval_secs > 0, "agent.scan_interval_secs", || {
    "must be positive".to_string()
  })?;
  ensure(config.agent.estimator_concurrency > 0, "agent.estimator_concurrency", || {
    "must be positive".to_string()
  })?;

  ensure(
    config.ledger.initial_bankroll > Decimal::ZERO,
    "ledger.initial_bankroll",
    || format!("must be positive, got {}", config.ledger.initial_bankroll),
  )?;
  ensure(config.ledger.history_limit > 0, "ledger.history_limit", || {
    "must be positive".to_string()
  })?;
  ensure(
    config.ledger.applied_token_retention_hours > 0,
    "ledger.applied_token_retention_hours",
    || "must be positive".to_string(),
  )?;
  ensure(!config.persistence.data_dir.is_empty(), "persistence.data_dir", || {
    "must not be empty".to_string()
  })?;

  Ok(())
}
