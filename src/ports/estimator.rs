//! Probability Estimator Port - External Signal Interface
//!
//! Given an opportunity, returns the estimated true probability (or
//! expected value) and a confidence measure. Implementations may be
//! LLM-backed, rule-based or replayed; the core never fabricates a
//! default estimate when this fails.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::trade::{Opportunity, OpportunityId, ProbabilityEstimate};

/// Failure to estimate a single opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstimationError {
  #[error("estimator unavailable: {0}")]
  Unavailable(String),

  #[error("no estimate for opportunity {0}")]
  NoEstimate(OpportunityId),

  #[error("estimation timed out")]
  Timeout,
}

/// Trait for probability estimators.
///
/// Calls may take arbitrarily long; the agent runs them concurrently
/// with bounded parallelism.
#[async_trait]
pub trait ProbabilityEstimator: Send + Sync + 'static {
  /// Estimate the opportunity's true probability or expected value.
  async fn estimate_probability(
    &self,
    opportunity: &Opportunity,
  ) -> Result<ProbabilityEstimate, EstimationError>;
}
