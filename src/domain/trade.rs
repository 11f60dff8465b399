//! Core trading domain types.
//!
//! Defines the observation side of the agent: venue opportunities, the
//! quotes they carry, and the probability estimates attached to them.
//! These types are the foundation of the hexagonal architecture's inner ring
//! and are immutable once captured; every cycle supersedes them.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ────────────────────────────────────────────
// Identifiers consumed by ports and adapters
// ────────────────────────────────────────────

/// Venue-specific market reference (pair, condition ID, book symbol).
pub type MarketId = String;

/// Venue-specific opportunity identifier.
pub type OpportunityId = String;

/// Unique key ensuring an execution result is applied to the ledger at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(Uuid);

impl IdempotencyToken {
    /// Generates a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID (used when replaying persisted requests).
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IdempotencyToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ────────────────────────────────────────────
// Enums shared across domain and ports
// ────────────────────────────────────────────

/// Direction of a position.
///
/// The agent is long-only unless shorts are explicitly enabled in the
/// scoring rules; the ledger still accounts for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short: multiplies a price move into P&L.
    pub const fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// How a venue quotes an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Quote {
    /// Binary share price in (0, 1) paying 1 on success.
    Price { price: Decimal },
    /// Decimal odds (> 1): total return per unit staked on success.
    DecimalOdds { odds: Decimal },
    /// Continuous-payoff market (DEX trade, spread) with a breakeven
    /// return threshold per unit staked.
    ExpectedValue { breakeven: Decimal },
}

impl Quote {
    /// Market-implied win probability for odds-style quotes.
    ///
    /// Returns `None` for expected-value quotes and for quotes outside their
    /// valid range (price not in (0, 1), odds not above 1).
    pub fn implied_probability(&self) -> Option<Decimal> {
        match *self {
            Self::Price { price } if price > Decimal::ZERO && price < Decimal::ONE => Some(price),
            Self::DecimalOdds { odds } if odds > Decimal::ONE => Some(Decimal::ONE / odds),
            _ => None,
        }
    }

    /// Net odds `b`: profit per unit staked on a win.
    ///
    /// A binary share bought at `P` returns `1 / P`, so `b = (1 - P) / P`.
    pub fn net_odds(&self) -> Option<Decimal> {
        match *self {
            Self::Price { price } if price > Decimal::ZERO && price < Decimal::ONE => {
                Some((Decimal::ONE - price) / price)
            }
            Self::DecimalOdds { odds } if odds > Decimal::ONE => Some(odds - Decimal::ONE),
            _ => None,
        }
    }

    pub const fn is_expected_value(&self) -> bool {
        matches!(self, Self::ExpectedValue { .. })
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Price { price } => write!(f, "price {price}"),
            Self::DecimalOdds { odds } => write!(f, "odds {odds}"),
            Self::ExpectedValue { breakeven } => write!(f, "ev breakeven {breakeven}"),
        }
    }
}

// ────────────────────────────────────────────
// Observations
// ────────────────────────────────────────────

/// A tradable opportunity captured from the snapshot provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Venue-specific identifier.
    pub id: OpportunityId,
    /// Market this opportunity trades.
    pub market: MarketId,
    /// Side the opportunity would open.
    pub direction: Direction,
    /// Quoted price, odds or breakeven.
    pub quote: Quote,
    /// Price used to fill and to mark open positions in this market.
    pub mark_price: Decimal,
    /// Depth bound in currency units; no stake may exceed it.
    pub liquidity: Decimal,
    /// When the provider observed the opportunity.
    pub observed_at: DateTime<Utc>,
}

/// The estimator's view of an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimateValue {
    /// Estimated true probability of the outcome, in (0, 1).
    Probability { probability: Decimal },
    /// Expected return per unit staked and its variance.
    ExpectedValue { mean: Decimal, variance: Decimal },
}

/// Output of the probability estimator: one per (opportunity, cycle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityEstimate {
    /// Opportunity this estimate belongs to.
    pub opportunity_id: OpportunityId,
    /// Probability or expected value.
    pub value: EstimateValue,
    /// Confidence in [0, 1].
    pub confidence: Decimal,
    /// Which estimator produced this (model name, rule set).
    pub provenance: String,
}
