//! Position Ledger - Single Source of Truth for Capital
//!
//! Owns cash, positions, in-flight reservations and the equity curve.
//! Every mutation is a small transaction: validate, apply, re-check the
//! invariants. A violated invariant surfaces as `StateError`, which the
//! agent treats as fatal.
//!
//! Invariants checked after every mutation:
//! - cash is never negative
//! - aggregate exposure equals the sum of live position stakes
//! - per-market exposure equals the stake held in that market
//! - reserved capital never exceeds cash

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::error::StateError;
use crate::domain::portfolio::{
  ClosedPosition, LedgerState, Position, PositionStatus, RealizedPnl,
};
use crate::domain::trade::{Direction, IdempotencyToken, MarketId};
use crate::ports::execution::ExecutionRequest;

/// Ledger shared between the agent and the execution coordinator.
///
/// All writes go through this one mutex; no guard is held across an await.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Lifecycle of reserved capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
  /// Submitted, awaiting a result.
  InFlight,
  /// Outcome could not be confirmed; awaiting reconciliation.
  Unknown,
}

/// Capital held back for a request that has not been settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
  pub token: IdempotencyToken,
  pub market: MarketId,
  /// Capital held back (zero for closes).
  pub amount: Decimal,
  pub status: ReservationStatus,
  /// The request, kept for reconciliation and trade records.
  pub request: ExecutionRequest,
  pub created_at: DateTime<Utc>,
}

/// A confirmed fill to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
  pub market: MarketId,
  pub direction: Direction,
  pub price: Decimal,
  pub quantity: Decimal,
}

impl Fill {
  pub fn notional(&self) -> Decimal {
    self.price * self.quantity
  }

  fn validate(&self) -> Result<(), StateError> {
    if self.price <= Decimal::ZERO {
      return Err(StateError::InvalidFill(format!(
        "non-positive price {} for {}",
        self.price, self.market
      )));
    }
    if self.quantity <= Decimal::ZERO {
      return Err(StateError::InvalidFill(format!(
        "non-positive quantity {} for {}",
        self.quantity, self.market
      )));
    }
    Ok(())
  }
}

/// Bounds on the history the ledger keeps in memory and in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRetention {
  /// Closed positions and realized P&L entries kept, newest last.
  pub history_limit: usize,
  /// Hours an applied token is remembered for duplicate detection.
  pub applied_token_retention_hours: u64,
}

impl Default for HistoryRetention {
  fn default() -> Self {
    Self {
      history_limit: 1_000,
      applied_token_retention_hours: 168,
    }
  }
}

impl HistoryRetention {
  /// Tokens applied before this instant may be forgotten.
  fn token_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    i64::try_from(self.applied_token_retention_hours)
      .ok()
      .and_then(Duration::try_hours)
      .and_then(|ttl| now.checked_sub_signed(ttl))
  }
}

/// An idempotency token whose result reached the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedToken {
  pub token: IdempotencyToken,
  pub applied_at: DateTime<Utc>,
}

/// Serializable ledger image for persistence.
///
/// Exposure figures are not stored; `Ledger::restore` recomputes them
/// from the positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
  pub initial_bankroll: Decimal,
  pub cash: Decimal,
  pub positions: Vec<Position>,
  pub closed: Vec<ClosedPosition>,
  pub reservations: Vec<Reservation>,
  pub applied: Vec<AppliedToken>,
  pub realized: Vec<RealizedPnl>,
  pub realized_total: Decimal,
  pub peak_equity: Decimal,
  pub peak_drawdown: Decimal,
  pub max_drawdown: Decimal,
}

/// The position ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
  initial_bankroll: Decimal,
  cash: Decimal,
  positions: BTreeMap<MarketId, Position>,
  closed: Vec<ClosedPosition>,
  reservations: BTreeMap<IdempotencyToken, Reservation>,
  /// Tokens whose results were already applied, with the apply time.
  applied: BTreeMap<IdempotencyToken, DateTime<Utc>>,
  aggregate_exposure: Decimal,
  per_market: HashMap<MarketId, Decimal>,
  realized: Vec<RealizedPnl>,
  realized_total: Decimal,
  equity: Decimal,
  peak_equity: Decimal,
  drawdown: Decimal,
  peak_drawdown: Decimal,
  max_drawdown: Decimal,
}

impl Ledger {
  /// Create an empty ledger holding `initial_bankroll` in cash.
  pub fn new(initial_bankroll: Decimal) -> Self {
    Self {
      initial_bankroll,
      cash: initial_bankroll,
      positions: BTreeMap::new(),
      closed: Vec::new(),
      reservations: BTreeMap::new(),
      applied: BTreeMap::new(),
      aggregate_exposure: Decimal::ZERO,
      per_market: HashMap::new(),
      realized: Vec::new(),
      realized_total: Decimal::ZERO,
      equity: initial_bankroll,
      peak_equity: initial_bankroll,
      drawdown: Decimal::ZERO,
      peak_drawdown: Decimal::ZERO,
      max_drawdown: Decimal::ZERO,
    }
  }

  /// Wrap the ledger for sharing.
  pub fn shared(self) -> SharedLedger {
    Arc::new(Mutex::new(self))
  }

  /// Rebuild a ledger from a snapshot, recomputing exposure.
  ///
  /// # Errors
  /// Returns `StateError` if the restored state violates an invariant.
  pub fn restore(snapshot: LedgerSnapshot) -> Result<Self, StateError> {
    let mut ledger = Self::new(snapshot.initial_bankroll);
    ledger.cash = snapshot.cash;
    for position in snapshot.positions {
      if position.is_live() {
        ledger.add_exposure(&position.market, position.stake);
        ledger.positions.insert(position.market.clone(), position);
      }
    }
    ledger.closed = snapshot.closed;
    ledger.reservations = snapshot
      .reservations
      .into_iter()
      .map(|r| (r.token, r))
      .collect();
    ledger.applied = snapshot
      .applied
      .into_iter()
      .map(|a| (a.token, a.applied_at))
      .collect();
    ledger.realized = snapshot.realized;
    ledger.realized_total = snapshot.realized_total;
    ledger.peak_equity = snapshot.peak_equity;
    ledger.peak_drawdown = snapshot.peak_drawdown;
    ledger.max_drawdown = snapshot.max_drawdown;
    ledger.refresh_equity();
    ledger.check_invariants()?;

    info!(
      cash = %ledger.cash,
      positions = ledger.positions.len(),
      reservations = ledger.reservations.len(),
      "Ledger restored from snapshot"
    );
    Ok(ledger)
  }

  /// Serializable image of the ledger.
  pub fn snapshot(&self) -> LedgerSnapshot {
    LedgerSnapshot {
      initial_bankroll: self.initial_bankroll,
      cash: self.cash,
      positions: self.positions.values().cloned().collect(),
      closed: self.closed.clone(),
      reservations: self.reservations.values().cloned().collect(),
      applied: self
        .applied
        .iter()
        .map(|(token, applied_at)| AppliedToken {
          token: *token,
          applied_at: *applied_at,
        })
        .collect(),
      realized: self.realized.clone(),
      realized_total: self.realized_total,
      peak_equity: self.peak_equity,
      peak_drawdown: self.peak_drawdown,
      max_drawdown: self.max_drawdown,
    }
  }

  /// Read-only view for the sizer and the risk gate.
  pub fn state(&self) -> LedgerState {
    let reserved_in_flight = self.reserved_with(ReservationStatus::InFlight);
    let reserved_unknown = self.reserved_with(ReservationStatus::Unknown);
    let mut busy_markets: Vec<MarketId> =
      self.reservations.values().map(|r| r.market.clone()).collect();
    busy_markets.sort();
    busy_markets.dedup();

    LedgerState {
      cash: self.cash,
      reserved_in_flight,
      reserved_unknown,
      bankroll: self.bankroll(),
      aggregate_exposure: self.aggregate_exposure,
      per_market_exposure: self.per_market.clone(),
      unrealized_pnl: self.positions.values().map(|p| p.unrealized_pnl).sum(),
      equity: self.equity,
      peak_equity: self.peak_equity,
      drawdown: self.drawdown,
      peak_drawdown: self.peak_drawdown,
      max_drawdown: self.max_drawdown,
      realized_pnl: self.realized_total,
      open_positions: self.positions.len(),
      busy_markets,
    }
  }

  /// Cash not held back by any reservation.
  pub fn bankroll(&self) -> Decimal {
    self.cash - self.total_reserved()
  }

  pub fn cash(&self) -> Decimal {
    self.cash
  }

  pub fn equity(&self) -> Decimal {
    self.equity
  }

  pub fn position(&self, market: &str) -> Option<&Position> {
    self.positions.get(market)
  }

  pub fn positions(&self) -> impl Iterator<Item = &Position> {
    self.positions.values()
  }

  pub fn closed_positions(&self) -> &[ClosedPosition] {
    &self.closed
  }

  pub fn realized_history(&self) -> &[RealizedPnl] {
    &self.realized
  }

  pub fn reservation(&self, token: &IdempotencyToken) -> Option<&Reservation> {
    self.reservations.get(token)
  }

  /// Reservations in a given status, oldest first.
  pub fn reservations_with(&self, status: ReservationStatus) -> Vec<Reservation> {
    let mut found: Vec<Reservation> = self
      .reservations
      .values()
      .filter(|r| r.status == status)
      .cloned()
      .collect();
    found.sort_by_key(|r| r.created_at);
    found
  }

  /// Whether a request for `market` is in flight or unresolved.
  pub fn is_market_busy(&self, market: &str) -> bool {
    self.reservations.values().any(|r| r.market == market)
  }

  /// Whether the result for `token` was already applied.
  pub fn is_applied(&self, token: &IdempotencyToken) -> bool {
    self.applied.contains_key(token)
  }

  /// Hold capital for a request before it is submitted.
  ///
  /// Close requests reserve nothing but flag the position `Closing`.
  ///
  /// # Errors
  /// `MarketBusy` if the market already has a reservation,
  /// `InsufficientCapital` if the amount exceeds the bankroll.
  pub fn reserve(&mut self, request: &ExecutionRequest) -> Result<(), StateError> {
    if self.reservations.contains_key(&request.token) || self.applied.contains_key(&request.token) {
      return Err(StateError::DuplicateReservation(request.token));
    }
    if self.is_market_busy(&request.market) {
      return Err(StateError::MarketBusy(request.market.clone()));
    }
    let amount = request.reserved_amount();
    if amount < Decimal::ZERO || amount > self.bankroll() {
      return Err(StateError::InsufficientCapital {
        requested: amount,
        available: self.bankroll(),
      });
    }
    if request.is_close() {
      let position = self
        .positions
        .get_mut(&request.market)
        .ok_or_else(|| StateError::UnknownPosition(request.market.clone()))?;
      position.status = PositionStatus::Closing;
    }

    self.reservations.insert(
      request.token,
      Reservation {
        token: request.token,
        market: request.market.clone(),
        amount,
        status: ReservationStatus::InFlight,
        request: request.clone(),
        created_at: request.created_at,
      },
    );
    debug!(token = %request.token, market = %request.market, amount = %amount, "Capital reserved");
    self.check_invariants()
  }

  /// Drop a reservation without a fill (rejected, failed, resolved empty).
  pub fn release(&mut self, token: &IdempotencyToken) -> Result<Reservation, StateError> {
    let reservation = self
      .reservations
      .remove(token)
      .ok_or(StateError::UnknownReservation(*token))?;
    self.reopen_if_closing(&reservation);
    debug!(token = %token, market = %reservation.market, "Reservation released");
    self.check_invariants()?;
    Ok(reservation)
  }

  /// Flag a reservation as unresolved. Its capital stays held.
  pub fn mark_unknown(&mut self, token: &IdempotencyToken) -> Result<(), StateError> {
    let reservation = self
      .reservations
      .get_mut(token)
      .ok_or(StateError::UnknownReservation(*token))?;
    reservation.status = ReservationStatus::Unknown;
    warn!(token = %token, market = %reservation.market, "Execution outcome unknown");
    Ok(())
  }

  /// Apply an opening fill. Returns `None` if `token` was already applied.
  ///
  /// # Errors
  /// `DirectionConflict` when the market holds the opposite direction,
  /// `NegativeCash` when the fill costs more than the cash held.
  pub fn open_or_increase(
    &mut self,
    token: IdempotencyToken,
    fill: &Fill,
  ) -> Result<Option<Position>, StateError> {
    if self.applied.contains_key(&token) {
      debug!(token = %token, "Fill already applied, skipping");
      return Ok(None);
    }
    fill.validate()?;
    self.check_reservation_market(&token, &fill.market)?;

    if self
      .positions
      .get(&fill.market)
      .is_some_and(|existing| existing.direction != fill.direction)
    {
      return Err(StateError::DirectionConflict(fill.market.clone()));
    }

    let cost = fill.notional();
    let held_elsewhere = self.total_reserved() - self.reserved_for(&token);
    let cash_after = self.cash - cost;
    if cash_after < held_elsewhere || cash_after < Decimal::ZERO {
      return Err(StateError::NegativeCash { cash: cash_after });
    }

    let now = Utc::now();
    if let Some(reservation) = self.reservations.remove(&token) {
      self.reopen_if_closing(&reservation);
    }
    self.cash = cash_after;
    let position = self
      .positions
      .entry(fill.market.clone())
      .or_insert_with(|| Position {
        market: fill.market.clone(),
        direction: fill.direction,
        quantity: Decimal::ZERO,
        stake: Decimal::ZERO,
        entry_price: fill.price,
        mark_price: fill.price,
        unrealized_pnl: Decimal::ZERO,
        status: PositionStatus::Open,
        opened_at: now,
        updated_at: now,
      });
    position.quantity += fill.quantity;
    position.stake += cost;
    position.entry_price = position.stake / position.quantity;
    position.mark(fill.price, now);
    let opened = position.clone();

    self.add_exposure(&fill.market, cost);
    self.applied.insert(token, now);
    self.refresh_equity();

    info!(
      market = %fill.market,
      direction = %fill.direction,
      quantity = %fill.quantity,
      price = %fill.price,
      stake = %opened.stake,
      "Position opened or increased"
    );
    self.check_invariants()?;
    Ok(Some(opened))
  }

  /// Apply a closing fill. Returns the realized P&L, or `None` if `token`
  /// was already applied.
  ///
  /// # Errors
  /// `UnknownPosition` when nothing is held, `OverReduction` when the fill
  /// exceeds the quantity held.
  pub fn reduce_or_close(
    &mut self,
    token: IdempotencyToken,
    fill: &Fill,
  ) -> Result<Option<Decimal>, StateError> {
    if self.applied.contains_key(&token) {
      debug!(token = %token, "Fill already applied, skipping");
      return Ok(None);
    }
    fill.validate()?;
    self.check_reservation_market(&token, &fill.market)?;

    let position = self
      .positions
      .get(&fill.market)
      .ok_or_else(|| StateError::UnknownPosition(fill.market.clone()))?;
    if position.direction != fill.direction {
      return Err(StateError::DirectionConflict(fill.market.clone()));
    }
    if fill.quantity > position.quantity {
      return Err(StateError::OverReduction {
        market: fill.market.clone(),
        held: position.quantity,
        requested: fill.quantity,
      });
    }

    let full_exit = fill.quantity == position.quantity;
    let basis = if full_exit {
      position.stake
    } else {
      position.entry_price * fill.quantity
    };
    let realized = position.direction.sign() * (fill.price - position.entry_price) * fill.quantity;
    let cash_after = self.cash + basis + realized;
    if cash_after < Decimal::ZERO {
      return Err(StateError::NegativeCash { cash: cash_after });
    }

    let now = Utc::now();
    self.reservations.remove(&token);
    self.cash = cash_after;
    self.remove_exposure(&fill.market, basis);

    if full_exit {
      if let Some(mut position) = self.positions.remove(&fill.market) {
        position.quantity = Decimal::ZERO;
        position.stake = Decimal::ZERO;
        position.status = PositionStatus::Closed;
        position.mark(fill.price, now);
        self.closed.push(ClosedPosition {
          position,
          exit_price: fill.price,
          realized_pnl: realized,
          closed_at: now,
        });
      }
    } else if let Some(position) = self.positions.get_mut(&fill.market) {
      position.quantity -= fill.quantity;
      position.stake -= basis;
      position.status = PositionStatus::Open;
      position.mark(fill.price, now);
    }

    self.push_realized(&fill.market, realized, "close fill", now);
    self.applied.insert(token, now);
    self.refresh_equity();

    info!(
      market = %fill.market,
      quantity = %fill.quantity,
      price = %fill.price,
      realized = %realized,
      closed = full_exit,
      "Position reduced"
    );
    self.check_invariants()?;
    Ok(Some(realized))
  }

  /// Re-mark live positions at current prices and refresh equity/drawdown.
  ///
  /// Markets without a price keep their last mark.
  pub fn mark_to_market(&mut self, prices: &HashMap<MarketId, Decimal>) -> Result<(), StateError> {
    let now = Utc::now();
    for position in self.positions.values_mut() {
      match prices.get(&position.market) {
        Some(price) if *price > Decimal::ZERO => position.mark(*price, now),
        Some(price) => {
          warn!(market = %position.market, price = %price, "Ignoring non-positive mark");
        }
        None => {}
      }
    }
    self.refresh_equity();
    self.check_invariants()
  }

  /// Trim audit history and forget tokens applied before the retention
  /// window. Returns the number of entries dropped.
  ///
  /// Running totals (`realized_total`, `max_drawdown`) are unaffected.
  pub fn compact(&mut self, retention: &HistoryRetention, now: DateTime<Utc>) -> usize {
    let limit = retention.history_limit;
    let mut dropped = 0;
    if self.closed.len() > limit {
      let excess = self.closed.len() - limit;
      self.closed.drain(..excess);
      dropped += excess;
    }
    if self.realized.len() > limit {
      let excess = self.realized.len() - limit;
      self.realized.drain(..excess);
      dropped += excess;
    }
    if let Some(cutoff) = retention.token_cutoff(now) {
      let before = self.applied.len();
      self.applied.retain(|_, applied_at| *applied_at >= cutoff);
      dropped += before - self.applied.len();
    }
    if dropped > 0 {
      debug!(dropped, "Ledger history compacted");
    }
    dropped
  }

  /// Restart the drawdown measurement from current equity.
  ///
  /// Used when an operator clears a halt: the loss stays in cash and in
  /// `max_drawdown`, but the new peak is the equity the reset accepted.
  pub fn rebase_peak(&mut self) {
    self.refresh_equity();
    info!(
      previous_peak = %self.peak_equity,
      equity = %self.equity,
      drawdown = %self.drawdown,
      "Drawdown reference rebased"
    );
    self.peak_equity = self.equity;
    self.drawdown = Decimal::ZERO;
    self.peak_drawdown = Decimal::ZERO;
  }

  /// Book P&L realized outside a fill (settlement payout, fee, rebate).
  pub fn record_realized_pnl(
    &mut self,
    market: &str,
    amount: Decimal,
    note: &str,
  ) -> Result<(), StateError> {
    let cash_after = self.cash + amount;
    if cash_after < self.total_reserved() || cash_after < Decimal::ZERO {
      return Err(StateError::NegativeCash { cash: cash_after });
    }
    self.cash = cash_after;
    self.push_realized(market, amount, note, Utc::now());
    self.refresh_equity();
    info!(market = %market, amount = %amount, note = %note, "Realized P&L recorded");
    self.check_invariants()
  }

  /// Verify every ledger invariant.
  pub fn check_invariants(&self) -> Result<(), StateError> {
    if self.cash < Decimal::ZERO {
      return Err(StateError::NegativeCash { cash: self.cash });
    }

    let computed: Decimal = self
      .positions
      .values()
      .filter(|p| p.is_live())
      .map(|p| p.stake)
      .sum();
    if computed != self.aggregate_exposure {
      return Err(StateError::ExposureMismatch {
        recorded: self.aggregate_exposure,
        computed,
      });
    }

    for position in self.positions.values() {
      let recorded = self
        .per_market
        .get(&position.market)
        .copied()
        .unwrap_or(Decimal::ZERO);
      if recorded != position.stake {
        return Err(StateError::MarketExposureMismatch {
          market: position.market.clone(),
          recorded,
          computed: position.stake,
        });
      }
    }
    if let Some((market, recorded)) = self
      .per_market
      .iter()
      .find(|(m, e)| !e.is_zero() && !self.positions.contains_key(*m))
    {
      return Err(StateError::MarketExposureMismatch {
        market: market.clone(),
        recorded: *recorded,
        computed: Decimal::ZERO,
      });
    }

    let reserved = self.total_reserved();
    if reserved > self.cash {
      return Err(StateError::ReservationExceedsCash {
        reserved,
        cash: self.cash,
      });
    }
    Ok(())
  }

  fn total_reserved(&self) -> Decimal {
    self.reservations.values().map(|r| r.amount).sum()
  }

  fn reserved_with(&self, status: ReservationStatus) -> Decimal {
    self
      .reservations
      .values()
      .filter(|r| r.status == status)
      .map(|r| r.amount)
      .sum()
  }

  fn reserved_for(&self, token: &IdempotencyToken) -> Decimal {
    self
      .reservations
      .get(token)
      .map_or(Decimal::ZERO, |r| r.amount)
  }

  fn check_reservation_market(
    &self,
    token: &IdempotencyToken,
    market: &str,
  ) -> Result<(), StateError> {
    match self.reservations.get(token) {
      Some(r) if r.market != market => Err(StateError::InvalidFill(format!(
        "fill for {market} does not match reservation for {}",
        r.market
      ))),
      _ => Ok(()),
    }
  }

  fn reopen_if_closing(&mut self, reservation: &Reservation) {
    if !reservation.request.is_close() {
      return;
    }
    if let Some(position) = self.positions.get_mut(&reservation.market) {
      if position.status == PositionStatus::Closing {
        position.status = PositionStatus::Open;
      }
    }
  }

  fn add_exposure(&mut self, market: &str, amount: Decimal) {
    *self.per_market.entry(market.to_string()).or_default() += amount;
    self.aggregate_exposure += amount;
  }

  fn remove_exposure(&mut self, market: &str, amount: Decimal) {
    if let Some(exposure) = self.per_market.get_mut(market) {
      *exposure -= amount;
      if exposure.is_zero() {
        self.per_market.remove(market);
      }
    }
    self.aggregate_exposure -= amount;
  }

  fn push_realized(&mut self, market: &str, amount: Decimal, note: &str, at: DateTime<Utc>) {
    self.realized_total += amount;
    self.realized.push(RealizedPnl {
      market: market.to_string(),
      amount,
      note: note.to_string(),
      at,
    });
  }

  /// Recompute equity and the drawdown figures.
  fn refresh_equity(&mut self) {
    self.equity = self.cash
      + self
        .positions
        .values()
        .filter(|p| p.is_live())
        .map(Position::market_value)
        .sum::<Decimal>();

    if self.equity >= self.peak_equity {
      self.peak_equity = self.equity;
      self.drawdown = Decimal::ZERO;
      self.peak_drawdown = Decimal::ZERO;
      return;
    }
    if self.peak_equity > Decimal::ZERO {
      self.drawdown = (self.peak_equity - self.equity) / self.peak_equity;
      self.peak_drawdown = self.peak_drawdown.max(self.drawdown);
      self.max_drawdown = self.max_drawdown.max(self.drawdown);
    }
  }
}
