//! Execution Coordinator - Request Lifecycle and Reconciliation
//!
//! Turns admitted orders into venue requests and settles their results
//! against the ledger:
//! - at most one in-flight (or unresolved) request per market
//! - every request carries an idempotency token; a result is applied once
//! - rejected or failed requests are dropped, never resubmitted
//! - a timed-out submission gets exactly one status query; if that does not
//!   settle it, the request becomes Unknown and keeps its capital reserved
//!
//! `prepare` runs under the ledger lock and reserves capital; `execute`
//! awaits the transport without holding the lock, so distinct markets
//! execute concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::domain::error::{RejectReason, StateError};
use crate::domain::trade::{IdempotencyToken, MarketId};
use crate::ports::execution::{
  ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionTransport, RequestKind,
};
use crate::ports::repository::TradeRecord;

use super::ledger::{Fill, Ledger, ReservationStatus, SharedLedger};
use super::risk_gate::AdmittedOrder;

/// Timeouts applied to transport calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
  pub submit_timeout: Duration,
  pub query_timeout: Duration,
}

impl Default for ExecutionPolicy {
  fn default() -> Self {
    Self {
      submit_timeout: Duration::from_secs(5),
      query_timeout: Duration::from_secs(5),
    }
  }
}

/// A request with capital reserved, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingExecution {
  pub request: ExecutionRequest,
}

impl PendingExecution {
  pub fn market(&self) -> &MarketId {
    &self.request.market
  }
}

/// Result of preparing an admitted order.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
  Ready(PendingExecution),
  Rejected { market: MarketId, reason: RejectReason },
}

/// What happened to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
  /// A fill was applied to the ledger.
  Applied {
    request: ExecutionRequest,
    result: ExecutionResult,
    /// P&L realized by a close fill.
    realized_pnl: Option<Decimal>,
  },
  /// Rejected or failed at the venue; reservation released.
  Dropped {
    token: IdempotencyToken,
    market: MarketId,
    status: ExecutionStatus,
    message: Option<String>,
  },
  /// Outcome unconfirmed; capital stays reserved, market stays blocked.
  Unknown {
    token: IdempotencyToken,
    market: MarketId,
  },
  /// Never sent.
  Rejected { market: MarketId, reason: RejectReason },
  /// The token's result was already applied.
  Duplicate { token: IdempotencyToken },
}

impl ExecutionOutcome {
  /// Stable label for metrics.
  pub fn label(&self) -> &'static str {
    match self {
      Self::Applied { result, .. } => result.status.label(),
      Self::Dropped { status, .. } => status.label(),
      Self::Unknown { .. } => "unknown",
      Self::Rejected { .. } => "rejected_locally",
      Self::Duplicate { .. } => "duplicate",
    }
  }

  pub const fn is_applied(&self) -> bool {
    matches!(self, Self::Applied { .. })
  }

  /// Trade log entry for an applied fill.
  pub fn trade_record(&self) -> Option<TradeRecord> {
    let Self::Applied {
      request,
      result,
      realized_pnl,
    } = self
    else {
      return None;
    };
    let (action, edge, kelly_fraction) = match &request.kind {
      RequestKind::Open { order } => (
        "open",
        Some(order.candidate.edge),
        Some(order.kelly_fraction),
      ),
      RequestKind::Close { .. } => ("close", None, None),
    };
    Some(TradeRecord {
      token: request.token,
      market: request.market.clone(),
      direction: request.direction(),
      action: action.to_string(),
      status: result.status,
      price: result.fill_price.unwrap_or_default(),
      quantity: result.fill_quantity,
      notional: result.notional(),
      edge,
      kelly_fraction,
      realized_pnl: *realized_pnl,
      timestamp: Utc::now(),
    })
  }
}

/// Coordinates submission, reconciliation and ledger settlement.
pub struct ExecutionCoordinator<T: ExecutionTransport> {
  transport: Arc<T>,
  ledger: SharedLedger,
  policy: ExecutionPolicy,
}

impl<T: ExecutionTransport> ExecutionCoordinator<T> {
  pub fn new(transport: Arc<T>, ledger: SharedLedger, policy: ExecutionPolicy) -> Self {
    Self {
      transport,
      ledger,
      policy,
    }
  }

  pub fn ledger(&self) -> &SharedLedger {
    &self.ledger
  }

  /// Reserve capital for an admitted order. Caller holds the ledger lock.
  ///
  /// # Errors
  /// Returns `StateError` only for ledger inconsistencies; capacity
  /// problems come back as `Prepared::Rejected`.
  pub fn prepare(
    &self,
    ledger: &mut Ledger,
    admitted: AdmittedOrder,
    now: DateTime<Utc>,
  ) -> Result<Prepared, StateError> {
    let market = admitted.order.market().clone();
    if !admitted.order.candidate.is_valid_at(now) {
      debug!(market = %market, "Signal expired before submission");
      return Ok(Prepared::Rejected {
        market,
        reason: RejectReason::StaleSignal,
      });
    }
    if ledger.is_market_busy(&market) {
      debug!(market = %market, "Market already has a request in flight");
      return Ok(Prepared::Rejected {
        market,
        reason: RejectReason::InFlightConflict,
      });
    }

    let request = ExecutionRequest::open(admitted.order);
    match ledger.reserve(&request) {
      Ok(()) => Ok(Prepared::Ready(PendingExecution { request })),
      Err(StateError::InsufficientCapital {
        requested,
        available,
      }) => {
        warn!(
          market = %market,
          requested = %requested,
          available = %available,
          "Bankroll shrank below admitted stake"
        );
        Ok(Prepared::Rejected {
          market,
          reason: RejectReason::AggregateExposureExceeded,
        })
      }
      Err(e) => Err(e),
    }
  }

  /// Prepare and execute a single admitted order.
  pub async fn submit(&self, admitted: AdmittedOrder) -> Result<ExecutionOutcome, StateError> {
    let prepared = {
      let mut ledger = self.ledger.lock().await;
      self.prepare(&mut ledger, admitted, Utc::now())?
    };
    match prepared {
      Prepared::Ready(pending) => self.execute(pending).await,
      Prepared::Rejected { market, reason } => Ok(ExecutionOutcome::Rejected { market, reason }),
    }
  }

  /// Send a prepared request and settle its result.
  #[instrument(skip(self, pending), fields(market = %pending.request.market, token = %pending.request.token))]
  pub async fn execute(&self, pending: PendingExecution) -> Result<ExecutionOutcome, StateError> {
    let request = pending.request;
    let submitted = match timeout(
      self.policy.submit_timeout,
      self.transport.submit_execution(&request),
    )
    .await
    {
      Ok(Ok(result)) if result.status != ExecutionStatus::TimedOut => Some(result),
      Ok(Ok(_)) => {
        warn!("Venue reported timeout, reconciling");
        None
      }
      Ok(Err(e)) => {
        warn!(error = %e, "Submission failed, reconciling");
        None
      }
      Err(_) => {
        warn!(
          timeout_ms = self.policy.submit_timeout.as_millis() as u64,
          "Submission timed out, reconciling"
        );
        None
      }
    };

    let result = match submitted {
      Some(result) => Some(result),
      None => self.query_once(&request.token).await,
    };
    match result {
      Some(result) => self.apply_result(&request, result).await,
      None => self.hold_unknown(&request).await,
    }
  }

  /// Request closing the whole position in `market` at `limit_price`.
  #[instrument(skip(self))]
  pub async fn close(
    &self,
    market: &str,
    limit_price: Decimal,
  ) -> Result<ExecutionOutcome, StateError> {
    let pending = {
      let mut ledger = self.ledger.lock().await;
      let position = ledger
        .position(market)
        .ok_or_else(|| StateError::UnknownPosition(market.to_string()))?;
      if ledger.is_market_busy(market) {
        return Ok(ExecutionOutcome::Rejected {
          market: market.to_string(),
          reason: RejectReason::InFlightConflict,
        });
      }
      let request = ExecutionRequest::close(
        market.to_string(),
        position.direction,
        position.quantity,
        limit_price,
      );
      ledger.reserve(&request)?;
      PendingExecution { request }
    };
    self.execute(pending).await
  }

  /// Settle a result against the ledger. Safe to call repeatedly with the
  /// same token: only the first fill is applied.
  ///
  /// A fill is settled only against a live reservation. Once the reservation
  /// is consumed, replays report `Duplicate` even after ledger compaction has
  /// forgotten the applied token.
  pub async fn apply_result(
    &self,
    request: &ExecutionRequest,
    result: ExecutionResult,
  ) -> Result<ExecutionOutcome, StateError> {
    if result.token != request.token {
      warn!(
        expected = %request.token,
        got = %result.token,
        "Result token does not match request"
      );
      return self.hold_unknown(request).await;
    }

    match result.status {
      ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled => {
        let price = match result.fill_price {
          Some(price) if price > Decimal::ZERO && result.fill_quantity > Decimal::ZERO => price,
          _ => {
            warn!(token = %request.token, "Fill without usable price or quantity");
            return self.hold_unknown(request).await;
          }
        };
        let fill = Fill {
          market: request.market.clone(),
          direction: request.direction(),
          price,
          quantity: result.fill_quantity,
        };

        let mut ledger = self.ledger.lock().await;
        if ledger.is_applied(&request.token) || ledger.reservation(&request.token).is_none() {
          return Ok(ExecutionOutcome::Duplicate {
            token: request.token,
          });
        }
        let realized_pnl = if request.is_close() {
          ledger.reduce_or_close(request.token, &fill)?
        } else {
          ledger.open_or_increase(request.token, &fill)?;
          None
        };
        drop(ledger);

        info!(
          market = %request.market,
          status = result.status.label(),
          price = %price,
          quantity = %result.fill_quantity,
          "Execution applied"
        );
        Ok(ExecutionOutcome::Applied {
          request: request.clone(),
          result,
          realized_pnl,
        })
      }
      ExecutionStatus::Rejected | ExecutionStatus::Failed => {
        let mut ledger = self.ledger.lock().await;
        if ledger.reservation(&request.token).is_some() {
          ledger.release(&request.token)?;
        }
        drop(ledger);

        info!(
          market = %request.market,
          status = result.status.label(),
          message = result.message.as_deref().unwrap_or(""),
          "Execution dropped"
        );
        Ok(ExecutionOutcome::Dropped {
          token: request.token,
          market: request.market.clone(),
          status: result.status,
          message: result.message,
        })
      }
      ExecutionStatus::TimedOut => self.hold_unknown(request).await,
    }
  }

  /// Mark requests left in flight by a previous run as Unknown.
  pub async fn recover_orphans(&self) -> Result<usize, StateError> {
    let mut ledger = self.ledger.lock().await;
    let orphans = ledger.reservations_with(ReservationStatus::InFlight);
    for orphan in &orphans {
      ledger.mark_unknown(&orphan.token)?;
    }
    if !orphans.is_empty() {
      warn!(count = orphans.len(), "Recovered orphaned in-flight requests");
    }
    Ok(orphans.len())
  }

  /// Query each Unknown request once and settle what the venue confirms.
  #[instrument(skip(self))]
  pub async fn reconcile_unknown(&self) -> Result<Vec<ExecutionOutcome>, StateError> {
    let unknown = {
      let ledger = self.ledger.lock().await;
      ledger.reservations_with(ReservationStatus::Unknown)
    };

    let mut outcomes = Vec::with_capacity(unknown.len());
    for reservation in unknown {
      let outcome = match self.query_once(&reservation.token).await {
        Some(result) => self.apply_result(&reservation.request, result).await?,
        None => ExecutionOutcome::Unknown {
          token: reservation.token,
          market: reservation.market,
        },
      };
      outcomes.push(outcome);
    }
    Ok(outcomes)
  }

  /// Manual override: settle an Unknown request with an operator-supplied result.
  pub async fn resolve_unknown(
    &self,
    token: &IdempotencyToken,
    result: ExecutionResult,
  ) -> Result<ExecutionOutcome, StateError> {
    let request = {
      let ledger = self.ledger.lock().await;
      ledger
        .reservation(token)
        .map(|r| r.request.clone())
        .ok_or(StateError::UnknownReservation(*token))?
    };
    info!(token = %token, status = result.status.label(), "Resolving unknown request");
    self.apply_result(&request, result).await
  }

  /// Exactly one status query; `None` when it does not settle the request.
  async fn query_once(&self, token: &IdempotencyToken) -> Option<ExecutionResult> {
    match timeout(self.policy.query_timeout, self.transport.query_status(token)).await {
      Ok(Ok(result)) if result.status != ExecutionStatus::TimedOut => Some(result),
      Ok(Ok(_)) => None,
      Ok(Err(e)) => {
        warn!(token = %token, error = %e, "Status query failed");
        None
      }
      Err(_) => {
        warn!(token = %token, "Status query timed out");
        None
      }
    }
  }

  async fn hold_unknown(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, StateError> {
    let mut ledger = self.ledger.lock().await;
    if ledger.is_applied(&request.token) {
      return Ok(ExecutionOutcome::Duplicate {
        token: request.token,
      });
    }
    if ledger.reservation(&request.token).is_some() {
      ledger.mark_unknown(&request.token)?;
    }
    Ok(ExecutionOutcome::Unknown {
      token: request.token,
      market: request.market.clone(),
    })
  }
}
