//! Domain layer - Core business logic and models.
//!
//! Pure decision logic for the trading agent: observations, signal
//! scoring, Kelly sizing and the portfolio view.
//! No I/O here (hexagonal architecture inner ring).
//! All types are serializable and testable in isolation.

pub mod error;
pub mod kelly;
pub mod portfolio;
pub mod signal;
pub mod trade;

// Re-export core types for convenience
pub use error::{DataError, RejectReason, StateError};
pub use kelly::{BindingCap, SizedOrder, SizingRule, SizingRules};
pub use portfolio::{ClosedPosition, LedgerState, Position, PositionStatus, RealizedPnl};
pub use signal::{Discard, ScoredCandidate, ScoringRules, SizingBasis};
pub use trade::{
    Direction, EstimateValue, IdempotencyToken, MarketId, Opportunity, OpportunityId,
    ProbabilityEstimate, Quote,
};
