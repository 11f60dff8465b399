//! Portfolio types owned by the position ledger.
//!
//! `Position` is only ever mutated through ledger transactions; everything
//! else here is a read-only view handed to the sizer and the risk gate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::{Direction, MarketId};

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Held, no close in flight.
    Open,
    /// A close request is in flight.
    Closing,
    /// Fully exited; kept in history only.
    Closed,
}

/// An open position in a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Market held.
    pub market: MarketId,
    /// Long or short.
    pub direction: Direction,
    /// Units held.
    pub quantity: Decimal,
    /// Capital committed (cost basis) in currency units.
    pub stake: Decimal,
    /// Volume-weighted average entry price.
    pub entry_price: Decimal,
    /// Last mark-to-market price.
    pub mark_price: Decimal,
    /// P&L at `mark_price`.
    pub unrealized_pnl: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// P&L of the whole position at a given price.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.direction.sign() * (price - self.entry_price) * self.quantity
    }

    /// Re-mark the position at a new price.
    pub fn mark(&mut self, price: Decimal, at: DateTime<Utc>) {
        self.mark_price = price;
        self.unrealized_pnl = self.pnl_at(price);
        self.updated_at = at;
    }

    /// Stake plus unrealized P&L: what the position contributes to equity.
    pub fn market_value(&self) -> Decimal {
        self.stake + self.unrealized_pnl
    }

    pub const fn is_live(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::Closing)
    }
}

/// A fully exited position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// One realized P&L event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub market: MarketId,
    pub amount: Decimal,
    /// What realized it (close fill, settlement, fee).
    pub note: String,
    pub at: DateTime<Utc>,
}

/// Read-only view of the ledger consumed by the sizer and the risk gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Cash held, including capital reserved for in-flight requests.
    pub cash: Decimal,
    /// Capital reserved by requests still in flight.
    pub reserved_in_flight: Decimal,
    /// Capital reserved by requests whose outcome is unknown.
    pub reserved_unknown: Decimal,
    /// Available capital: cash minus every reservation.
    pub bankroll: Decimal,
    /// Sum of live position stakes.
    pub aggregate_exposure: Decimal,
    /// Live stake per market.
    pub per_market_exposure: HashMap<MarketId, Decimal>,
    pub unrealized_pnl: Decimal,
    /// Cash plus the market value of live positions.
    pub equity: Decimal,
    pub peak_equity: Decimal,
    /// (peak equity - equity) / peak equity, right now.
    pub drawdown: Decimal,
    /// Worst drawdown since the last equity peak; resets to 0 at a new peak.
    pub peak_drawdown: Decimal,
    /// Worst drawdown ever recorded.
    pub max_drawdown: Decimal,
    /// Cumulative realized P&L.
    pub realized_pnl: Decimal,
    pub open_positions: usize,
    /// Markets blocked by an in-flight or unknown request.
    pub busy_markets: Vec<MarketId>,
}

impl LedgerState {
    pub fn market_exposure(&self, market: &str) -> Decimal {
        self.per_market_exposure
            .get(market)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_market_busy(&self, market: &str) -> bool {
        self.busy_markets.iter().any(|m| m == market)
    }
}
