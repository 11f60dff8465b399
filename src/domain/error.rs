//! Error taxonomy of the decision core.
//!
//! - `DataError`: a bad snapshot or estimate; only that opportunity is skipped.
//! - `RejectReason`: capacity and admission rejects; the order is dropped, never retried.
//! - `StateError`: a ledger invariant no longer holds; the agent halts.
//!
//! Transport and configuration errors live next to their ports
//! (`crate::ports::execution::TransportError`, `crate::config::ConfigError`).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::trade::{IdempotencyToken, MarketId, OpportunityId};

/// Malformed or inconsistent observation data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("estimate for {estimate} does not belong to opportunity {opportunity}")]
    EstimateMismatch {
        opportunity: OpportunityId,
        estimate: OpportunityId,
    },

    #[error("estimate kind does not match quote ({quote})")]
    KindMismatch { quote: String },

    #[error("invalid quote: {0}")]
    InvalidQuote(String),

    #[error("probability {0} outside (0, 1)")]
    ProbabilityOutOfRange(Decimal),

    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(Decimal),

    #[error("variance must be positive, got {0}")]
    NonPositiveVariance(Decimal),
}

/// Why an order did not reach the execution transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("risk gate is halted")]
    HaltedState,

    #[error("aggregate exposure limit exceeded")]
    AggregateExposureExceeded,

    #[error("per-market exposure limit exceeded")]
    PerMarketExposureExceeded,

    #[error("stake capped to zero")]
    CappedToZero,

    #[error("another request for this market is still in flight")]
    InFlightConflict,

    #[error("signal expired before submission")]
    StaleSignal,
}

impl RejectReason {
    /// Stable label for metrics and reports.
    pub const fn label(self) -> &'static str {
        match self {
            Self::HaltedState => "halted_state",
            Self::AggregateExposureExceeded => "aggregate_exposure_exceeded",
            Self::PerMarketExposureExceeded => "per_market_exposure_exceeded",
            Self::CappedToZero => "capped_to_zero",
            Self::InFlightConflict => "in_flight_conflict",
            Self::StaleSignal => "stale_signal",
        }
    }
}

/// Ledger invariant violation. Fatal: requires manual reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cash would become negative: {cash}")]
    NegativeCash { cash: Decimal },

    #[error("aggregate exposure {recorded} != sum of position stakes {computed}")]
    ExposureMismatch { recorded: Decimal, computed: Decimal },

    #[error("exposure for market {market} is {recorded}, positions hold {computed}")]
    MarketExposureMismatch {
        market: MarketId,
        recorded: Decimal,
        computed: Decimal,
    },

    #[error("reserved capital {reserved} exceeds cash {cash}")]
    ReservationExceedsCash { reserved: Decimal, cash: Decimal },

    #[error("no open position in market {0}")]
    UnknownPosition(MarketId),

    #[error("cannot reduce {requested} from {held} held in market {market}")]
    OverReduction {
        market: MarketId,
        held: Decimal,
        requested: Decimal,
    },

    #[error("fill direction conflicts with open position in market {0}")]
    DirectionConflict(MarketId),

    #[error("market {0} already has a request in flight")]
    MarketBusy(MarketId),

    #[error("reservation {0} already exists")]
    DuplicateReservation(IdempotencyToken),

    #[error("no reservation for token {0}")]
    UnknownReservation(IdempotencyToken),

    #[error("reservation of {requested} exceeds available bankroll {available}")]
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },

    #[error("invalid fill: {0}")]
    InvalidFill(String),
}
