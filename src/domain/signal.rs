//! Signal scoring.
//!
//! Turns an (opportunity, estimate) pair into a scored candidate carrying
//! its edge and expected value, or discards it. Pure: the result depends
//! only on the inputs and the scoring rules.
//!
//! Edge for odds-style quotes:
//!   edge = p - implied,  implied = price (binary) or 1 / odds (decimal odds)
//! Edge for expected-value quotes:
//!   edge = mean - breakeven

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::DataError;
use super::trade::{Direction, EstimateValue, MarketId, Opportunity, ProbabilityEstimate, Quote};

/// Thresholds applied before a candidate is allowed to carry an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringRules {
    /// Minimum estimator confidence; below it the edge is undefined.
    pub min_confidence: Decimal,
    /// Minimum opportunity depth in currency units.
    pub min_liquidity: Decimal,
    /// Edge must exceed this (and zero) to be scored.
    #[serde(default)]
    pub min_edge: Decimal,
    /// How long a scored candidate stays valid after observation.
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,
    /// Allow opening short positions.
    #[serde(default)]
    pub allow_short: bool,
}

fn default_signal_ttl_secs() -> u64 {
    30
}

/// Term the sizer divides the edge by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizingBasis {
    /// Binary / odds market: win probability and net odds `b`.
    Odds {
        probability: Decimal,
        net_odds: Decimal,
    },
    /// Continuous-payoff market: estimated variance of the return.
    Variance { variance: Decimal },
}

/// A candidate that passed scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub opportunity: Opportunity,
    pub estimate: ProbabilityEstimate,
    /// Estimated probability (or EV) minus the market-implied value.
    pub edge: Decimal,
    /// Expected profit per unit staked.
    pub expected_value: Decimal,
    pub basis: SizingBasis,
    /// The candidate must be submitted before this instant.
    pub valid_until: DateTime<Utc>,
}

impl ScoredCandidate {
    pub fn market(&self) -> &MarketId {
        &self.opportunity.market
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.valid_until
    }
}

/// Why an opportunity was not scored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Discard {
    #[error("confidence {confidence} below minimum {min}")]
    LowConfidence { confidence: Decimal, min: Decimal },

    #[error("liquidity {liquidity} below minimum {min}")]
    InsufficientLiquidity { liquidity: Decimal, min: Decimal },

    #[error("edge {edge} does not exceed threshold {threshold}")]
    NoEdge { edge: Decimal, threshold: Decimal },

    #[error("short positions are disabled")]
    ShortDisabled,

    #[error(transparent)]
    Invalid(#[from] DataError),
}

impl Discard {
    /// Stable label for metrics and reports.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::LowConfidence { .. } => "low_confidence",
            Self::InsufficientLiquidity { .. } => "insufficient_liquidity",
            Self::NoEdge { .. } => "no_edge",
            Self::ShortDisabled => "short_disabled",
            Self::Invalid(_) => "invalid_data",
        }
    }
}

/// Score a single opportunity against its estimate.
///
/// # Errors
/// Returns the `Discard` reason when the pair is inconsistent, the estimate
/// is not confident enough, the opportunity is too thin, or there is no
/// positive edge.
pub fn score(
    opportunity: &Opportunity,
    estimate: &ProbabilityEstimate,
    rules: &ScoringRules,
) -> Result<ScoredCandidate, Discard> {
    if estimate.opportunity_id != opportunity.id {
        return Err(DataError::EstimateMismatch {
            opportunity: opportunity.id.clone(),
            estimate: estimate.opportunity_id.clone(),
        }
        .into());
    }
    if estimate.confidence < Decimal::ZERO || estimate.confidence > Decimal::ONE {
        return Err(DataError::ConfidenceOutOfRange(estimate.confidence).into());
    }
    if opportunity.direction == Direction::Short && !rules.allow_short {
        return Err(Discard::ShortDisabled);
    }
    if estimate.confidence < rules.min_confidence {
        return Err(Discard::LowConfidence {
            confidence: estimate.confidence,
            min: rules.min_confidence,
        });
    }
    if opportunity.liquidity < rules.min_liquidity {
        return Err(Discard::InsufficientLiquidity {
            liquidity: opportunity.liquidity,
            min: rules.min_liquidity,
        });
    }

    let (edge, expected_value, basis) = match (opportunity.quote, estimate.value) {
        (Quote::ExpectedValue { breakeven }, EstimateValue::ExpectedValue { mean, variance }) => {
            if variance <= Decimal::ZERO {
                return Err(DataError::NonPositiveVariance(variance).into());
            }
            let edge = mean - breakeven;
            (edge, edge, SizingBasis::Variance { variance })
        }
        (quote, EstimateValue::Probability { probability }) if !quote.is_expected_value() => {
            if probability <= Decimal::ZERO || probability >= Decimal::ONE {
                return Err(DataError::ProbabilityOutOfRange(probability).into());
            }
            let (Some(implied), Some(net_odds)) = (quote.implied_probability(), quote.net_odds())
            else {
                return Err(DataError::InvalidQuote(quote.to_string()).into());
            };
            let q = Decimal::ONE - probability;
            (
                probability - implied,
                probability * net_odds - q,
                SizingBasis::Odds {
                    probability,
                    net_odds,
                },
            )
        }
        (quote, _) => {
            return Err(DataError::KindMismatch {
                quote: quote.to_string(),
            }
            .into());
        }
    };

    let threshold = rules.min_edge.max(Decimal::ZERO);
    if edge <= threshold {
        return Err(Discard::NoEdge { edge, threshold });
    }

    let valid_until = i64::try_from(rules.signal_ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| opportunity.observed_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    Ok(ScoredCandidate {
        opportunity: opportunity.clone(),
        estimate: estimate.clone(),
        edge,
        expected_value,
        basis,
        valid_until,
    })
}

/// Keep only the highest-edge candidate per market.
///
/// Redundant signals for one market in a cycle must not stack exposure.
/// Ties keep the candidate seen first. The result is ordered by edge,
/// highest first, then by market for determinism.
pub fn best_per_market(candidates: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    let mut best: HashMap<MarketId, ScoredCandidate> = HashMap::new();
    for candidate in candidates {
        match best.get(candidate.market()) {
            Some(current) if current.edge >= candidate.edge => {}
            _ => {
                best.insert(candidate.market().clone(), candidate);
            }
        }
    }

    let mut kept: Vec<_> = best.into_values().collect();
    kept.sort_by(|a, b| {
        b.edge
            .cmp(&a.edge)
            .then_with(|| a.opportunity.market.cmp(&b.opportunity.market))
    });
    kept
}
