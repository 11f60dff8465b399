//! Repository Port - State Persistence Interface
//!
//! Defines traits for persisting agent state so a restart resumes with
//! the correct bankroll, exposure, drawdown and risk state instead of a
//! fresh start. No database dependency - the reference adapter uses an
//! atomic JSON snapshot plus append-only JSONL trade logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::trade::{Direction, IdempotencyToken, MarketId};
use crate::ports::execution::ExecutionStatus;
use crate::usecases::ledger::LedgerSnapshot;
use crate::usecases::risk_gate::GateSnapshot;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: &str = "2";

/// A single applied fill for persistence and auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
  /// Idempotency token of the request that filled.
  pub token: IdempotencyToken,
  /// Market traded.
  pub market: MarketId,
  pub direction: Direction,
  /// "open" or "close".
  pub action: String,
  pub status: ExecutionStatus,
  /// Fill price.
  pub price: Decimal,
  /// Units filled.
  pub quantity: Decimal,
  /// Currency value of the fill.
  pub notional: Decimal,
  /// Edge of the signal that opened the trade.
  pub edge: Option<Decimal>,
  /// Full-Kelly fraction used for sizing.
  pub kelly_fraction: Option<Decimal>,
  /// Realized P&L (closes only).
  pub realized_pnl: Option<Decimal>,
  pub timestamp: DateTime<Utc>,
}

/// Agent state snapshot for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
  /// Version of the state format.
  pub version: String,
  pub saved_at: DateTime<Utc>,
  /// Positions, cash, reservations, drawdown history.
  pub ledger: LedgerSnapshot,
  /// Risk gate state (a halt survives restarts).
  pub gate: GateSnapshot,
  /// Completed decision cycles.
  pub cycles: u64,
  /// Fills applied since inception.
  pub total_trades: u64,
}

/// Trait for state persistence providers.
#[async_trait]
pub trait StateRepository: Send + Sync + 'static {
  /// Append a trade record to the trade log.
  async fn save_trade(&self, record: &TradeRecord) -> anyhow::Result<()>;

  /// Load all trade records (for recovery/analysis).
  async fn load_trades(&self) -> anyhow::Result<Vec<TradeRecord>>;

  /// Save an agent state snapshot.
  async fn save_state(&self, state: &AgentSnapshot) -> anyhow::Result<()>;

  /// Load the most recent snapshot, `None` on first start.
  async fn load_latest_state(&self) -> anyhow::Result<Option<AgentSnapshot>>;

  /// Check if the repository is healthy (disk space, permissions).
  async fn is_healthy(&self) -> bool;
}
