//! Execution Transport Port - Venue Submission Interface
//!
//! Defines the requests the core sends to the venue and the results it
//! gets back. Every request carries an idempotency token; the same token
//! is used to query its status when a submission times out.
//!
//! Key design decisions:
//! - Results are applied to the ledger at most once per token
//! - A timed-out request is reconciled with exactly one status query
//! - No automatic resubmission; the transport never sees a token twice

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::kelly::SizedOrder;
use crate::domain::trade::{Direction, IdempotencyToken, MarketId};

/// What a request asks the venue to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
  /// Open or increase a position with the order's capped stake.
  Open { order: Box<SizedOrder> },
  /// Reduce or close an existing position.
  Close {
    direction: Direction,
    quantity: Decimal,
    limit_price: Decimal,
  },
}

/// A single request to the execution transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
  /// Idempotency token; doubles as the request identifier.
  pub token: IdempotencyToken,
  /// Market the request trades.
  pub market: MarketId,
  pub kind: RequestKind,
  pub created_at: DateTime<Utc>,
}

impl ExecutionRequest {
  /// Request opening the order's capped stake.
  pub fn open(order: SizedOrder) -> Self {
    Self {
      token: IdempotencyToken::new(),
      market: order.market().clone(),
      kind: RequestKind::Open {
        order: Box::new(order),
      },
      created_at: Utc::now(),
    }
  }

  /// Request closing `quantity` units of a position.
  pub fn close(
    market: MarketId,
    direction: Direction,
    quantity: Decimal,
    limit_price: Decimal,
  ) -> Self {
    Self {
      token: IdempotencyToken::new(),
      market,
      kind: RequestKind::Close {
        direction,
        quantity,
        limit_price,
      },
      created_at: Utc::now(),
    }
  }

  pub fn direction(&self) -> Direction {
    match &self.kind {
      RequestKind::Open { order } => order.candidate.opportunity.direction,
      RequestKind::Close { direction, .. } => *direction,
    }
  }

  /// Price the request expects to trade at.
  pub fn limit_price(&self) -> Decimal {
    match &self.kind {
      RequestKind::Open { order } => order.candidate.opportunity.mark_price,
      RequestKind::Close { limit_price, .. } => *limit_price,
    }
  }

  /// Capital the request commits while in flight (zero for closes).
  pub fn reserved_amount(&self) -> Decimal {
    match &self.kind {
      RequestKind::Open { order } => order.capped_stake,
      RequestKind::Close { .. } => Decimal::ZERO,
    }
  }

  pub const fn is_close(&self) -> bool {
    matches!(self.kind, RequestKind::Close { .. })
  }
}

/// Terminal status reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Filled,
  PartiallyFilled,
  Rejected,
  Failed,
  TimedOut,
}

impl ExecutionStatus {
  pub const fn is_fill(self) -> bool {
    matches!(self, Self::Filled | Self::PartiallyFilled)
  }

  /// Stable label for metrics and trade logs.
  pub const fn label(self) -> &'static str {
    match self {
      Self::Filled => "filled",
      Self::PartiallyFilled => "partially_filled",
      Self::Rejected => "rejected",
      Self::Failed => "failed",
      Self::TimedOut => "timed_out",
    }
  }
}

/// Outcome of a submission or status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
  /// Token of the request this result belongs to.
  pub token: IdempotencyToken,
  pub status: ExecutionStatus,
  /// Average fill price (fills only).
  pub fill_price: Option<Decimal>,
  /// Units filled (zero unless filled).
  pub fill_quantity: Decimal,
  /// Venue message (rejection reason, error text).
  pub message: Option<String>,
}

impl ExecutionResult {
  pub const fn filled(token: IdempotencyToken, price: Decimal, quantity: Decimal) -> Self {
    Self {
      token,
      status: ExecutionStatus::Filled,
      fill_price: Some(price),
      fill_quantity: quantity,
      message: None,
    }
  }

  pub const fn partially_filled(
    token: IdempotencyToken,
    price: Decimal,
    quantity: Decimal,
  ) -> Self {
    Self {
      token,
      status: ExecutionStatus::PartiallyFilled,
      fill_price: Some(price),
      fill_quantity: quantity,
      message: None,
    }
  }

  /// A result without a fill (`Rejected`, `Failed`, `TimedOut`).
  pub fn unfilled(
    token: IdempotencyToken,
    status: ExecutionStatus,
    message: impl Into<String>,
  ) -> Self {
    Self {
      token,
      status,
      fill_price: None,
      fill_quantity: Decimal::ZERO,
      message: Some(message.into()),
    }
  }

  /// Currency value of the fill.
  pub fn notional(&self) -> Decimal {
    self.fill_price.unwrap_or_default() * self.fill_quantity
  }
}

/// Failure to reach the transport or obtain an answer from it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("network error: {0}")]
  Network(String),

  #[error("transport call timed out")]
  Timeout,

  #[error("unknown idempotency token {0}")]
  UnknownToken(IdempotencyToken),

  #[error("transport error: {0}")]
  Other(String),
}

/// Trait for execution transports (venue clients, paper trading).
///
/// Implementors must treat the idempotency token as a deduplication key:
/// a token seen twice refers to the same venue order.
#[async_trait]
pub trait ExecutionTransport: Send + Sync + 'static {
  /// Submit a request to the venue.
  ///
  /// # Errors
  /// Returns `TransportError` if the venue could not be reached; the
  /// coordinator then reconciles through `query_status`.
  async fn submit_execution(
    &self,
    request: &ExecutionRequest,
  ) -> Result<ExecutionResult, TransportError>;

  /// Query the outcome of a previously submitted request.
  async fn query_status(
    &self,
    token: &IdempotencyToken,
  ) -> Result<ExecutionResult, TransportError>;
}
