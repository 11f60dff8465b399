//! Snapshot Provider Port - Market Observation Interface
//!
//! Supplies the tradable opportunities of the current cycle. A failed
//! fetch degrades the cycle to a no-op; it is never fatal.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::trade::Opportunity;

/// Failure to obtain a market snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
  #[error("network error: {0}")]
  Network(String),

  #[error("snapshot request timed out")]
  Timeout,

  #[error("malformed snapshot: {0}")]
  Malformed(String),
}

/// Trait for market snapshot providers (DEX scanner, order book, replay).
#[async_trait]
pub trait SnapshotProvider: Send + Sync + 'static {
  /// Fetch the opportunities currently tradable on the venue.
  ///
  /// Each call supersedes the previous snapshot.
  async fn fetch_opportunities(&self) -> Result<Vec<Opportunity>, SnapshotError>;
}
