//! Kelly Criterion / optimal-f position sizing.
//!
//! Full Kelly maximizes long-run growth but is ruin-prone under estimation
//! error, so a fractional multiplier (half-Kelly by default) is always
//! applied. Binary and odds markets use
//!   f* = (b * p - q) / b
//! where p = estimated win probability, q = 1 - p, b = net odds.
//! Continuous-payoff markets use the variance-normalized analogue
//!   f* = edge / variance
//! In both cases f* is clamped to [0, 1] before it touches the bankroll.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::portfolio::LedgerState;
use super::signal::{ScoredCandidate, SizingBasis};
use super::trade::MarketId;

/// Bankroll fractions the sizer works with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingRules {
    /// Multiplier applied to f* (0.5 = half-Kelly).
    #[serde(default = "default_kelly_multiplier")]
    pub kelly_fraction_multiplier: Decimal,
    /// Maximum stake held in one market, as a bankroll fraction.
    pub max_per_market_fraction: Decimal,
    /// Maximum aggregate exposure, as a bankroll fraction.
    pub max_aggregate_exposure_fraction: Decimal,
    /// Stakes below this are capped to zero (dust).
    #[serde(default)]
    pub min_stake: Decimal,
}

fn default_kelly_multiplier() -> Decimal {
    dec!(0.5)
}

impl SizingRules {
    /// Copy with both exposure caps scaled by `factor`.
    pub fn with_scaled_caps(&self, factor: Decimal) -> Self {
        Self {
            max_per_market_fraction: self.max_per_market_fraction * factor,
            max_aggregate_exposure_fraction: self.max_aggregate_exposure_fraction * factor,
            ..self.clone()
        }
    }

    /// Remaining stake allowed in `market` under the per-market cap.
    pub fn per_market_headroom(&self, state: &LedgerState, market: &str) -> Decimal {
        (state.bankroll.max(Decimal::ZERO) * self.max_per_market_fraction
            - state.market_exposure(market))
        .max(Decimal::ZERO)
    }

    /// Remaining stake allowed under the aggregate cap.
    ///
    /// Capital already committed to in-flight requests counts as exposure.
    pub fn aggregate_headroom(&self, state: &LedgerState) -> Decimal {
        (state.bankroll.max(Decimal::ZERO) * self.max_aggregate_exposure_fraction
            - state.aggregate_exposure
            - state.reserved_in_flight)
            .max(Decimal::ZERO)
    }
}

impl Default for SizingRules {
    /// Half-Kelly, 10% per market, 50% aggregate.
    fn default() -> Self {
        Self {
            kelly_fraction_multiplier: dec!(0.5),
            max_per_market_fraction: dec!(0.10),
            max_aggregate_exposure_fraction: dec!(0.50),
            min_stake: Decimal::ZERO,
        }
    }
}

/// Which sizing formula produced the recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingRule {
    FractionalKelly,
    OptimalF,
}

/// The limit that determined the capped stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingCap {
    /// The recommendation fit under every cap.
    None,
    PerMarket,
    AggregateExposure,
    Liquidity,
    MinStake,
}

/// A scored candidate with its stake.
///
/// Invariant: `0 <= capped_stake <= recommended_stake <= multiplier * bankroll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedOrder {
    pub candidate: ScoredCandidate,
    pub rule: SizingRule,
    /// Full-Kelly (or optimal-f) fraction, clamped to [0, 1].
    pub kelly_fraction: Decimal,
    pub recommended_stake: Decimal,
    pub capped_stake: Decimal,
    pub binding_cap: BindingCap,
}

impl SizedOrder {
    pub fn market(&self) -> &MarketId {
        self.candidate.market()
    }

    /// A zero stake is a reject, never an execution.
    pub fn is_capped_to_zero(&self) -> bool {
        self.capped_stake <= Decimal::ZERO
    }
}

/// Unscaled f* for a candidate, clamped to [0, 1].
///
/// Negative or undefined edge (non-positive odds or variance) yields zero.
/// A ratio too large for `Decimal` saturates at the clamp bound.
pub fn full_kelly_fraction(edge: Decimal, basis: &SizingBasis) -> Decimal {
    let raw = match *basis {
        SizingBasis::Odds {
            probability,
            net_odds,
        } => {
            if net_odds <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            let q = Decimal::ONE - probability;
            net_odds
                .checked_mul(probability)
                .and_then(|bp| bp.checked_sub(q))
                .and_then(|numerator| numerator.checked_div(net_odds))
        }
        SizingBasis::Variance { variance } => {
            if variance <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            edge.checked_div(variance)
        }
    };
    match raw {
        Some(raw) => raw.clamp(Decimal::ZERO, Decimal::ONE),
        None if edge > Decimal::ZERO => Decimal::ONE,
        None => Decimal::ZERO,
    }
}

fn floor_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Size a candidate against the current ledger view.
///
/// Recommended stake = bankroll * multiplier * f*. The capped stake is the
/// minimum of the recommendation, the per-market and aggregate headroom and
/// the opportunity's liquidity, rounded down to cents.
pub fn size(candidate: ScoredCandidate, state: &LedgerState, rules: &SizingRules) -> SizedOrder {
    let rule = match candidate.basis {
        SizingBasis::Odds { .. } => SizingRule::FractionalKelly,
        SizingBasis::Variance { .. } => SizingRule::OptimalF,
    };
    let kelly_fraction = full_kelly_fraction(candidate.edge, &candidate.basis);
    let bankroll = state.bankroll.max(Decimal::ZERO);
    let multiplier = rules.kelly_fraction_multiplier.clamp(Decimal::ZERO, Decimal::ONE);
    let recommended_stake = floor_cents(bankroll * multiplier * kelly_fraction);

    let caps = [
        (
            BindingCap::PerMarket,
            rules.per_market_headroom(state, candidate.market()),
        ),
        (BindingCap::AggregateExposure, rules.aggregate_headroom(state)),
        (
            BindingCap::Liquidity,
            candidate.opportunity.liquidity.max(Decimal::ZERO),
        ),
    ];

    let mut capped_stake = recommended_stake;
    let mut binding_cap = BindingCap::None;
    for (cap, limit) in caps {
        if limit < capped_stake {
            capped_stake = limit;
            binding_cap = cap;
        }
    }
    capped_stake = floor_cents(capped_stake);

    if capped_stake > Decimal::ZERO && capped_stake < rules.min_stake {
        capped_stake = Decimal::ZERO;
        binding_cap = BindingCap::MinStake;
    }

    SizedOrder {
        candidate,
        rule,
        kelly_fraction,
        recommended_stake,
        capped_stake,
        binding_cap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade::{Direction, EstimateValue, Opportunity, ProbabilityEstimate, Quote};
    use chrono::Utc;

    fn candidate(probability: Decimal, price: Decimal) -> ScoredCandidate {
        let net_odds = (Decimal::ONE - price) / price;
        ScoredCandidate {
            opportunity: Opportunity {
                id: "o1".to_string(),
                market: "MON/USDC".to_string(),
                direction: Direction::Long,
                quote: Quote::Price { price },
                mark_price: price,
                liquidity: dec!(100000),
                observed_at: Utc::now(),
            },
            estimate: ProbabilityEstimate {
                opportunity_id: "o1".to_string(),
                value: EstimateValue::Probability { probability },
                confidence: dec!(0.9),
                provenance: "test".to_string(),
            },
            edge: probability - price,
            expected_value: probability * net_odds - (Decimal::ONE - probability),
            basis: SizingBasis::Odds {
                probability,
                net_odds,
            },
            valid_until: Utc::now(),
        }
    }

    fn state(bankroll: Decimal) -> LedgerState {
        LedgerState {
            cash: bankroll,
            bankroll,
            equity: bankroll,
            peak_equity: bankroll,
            ..LedgerState::default()
        }
    }

    #[test]
    fn test_half_kelly_example_capped_per_market() {
        let rules = SizingRules {
            kelly_fraction_multiplier: dec!(0.5),
            max_per_market_fraction: dec!(0.03),
            max_aggregate_exposure_fraction: dec!(0.5),
            min_stake: Decimal::ZERO,
        };
        let sized = size(candidate(dec!(0.55), dec!(0.50)), &state(dec!(10000)), &rules);
        assert_eq!(sized.kelly_fraction, dec!(0.10));
        assert_eq!(sized.recommended_stake, dec!(500));
        assert_eq!(sized.capped_stake, dec!(300));
        assert_eq!(sized.binding_cap, BindingCap::PerMarket);
        assert_eq!(sized.rule, SizingRule::FractionalKelly);
    }

    #[test]
    fn test_negative_edge_never_sizes() {
        let f = full_kelly_fraction(
            dec!(-0.1),
            &SizingBasis::Odds {
                probability: dec!(0.3),
                net_odds: dec!(1),
            },
        );
        assert_eq!(f, Decimal::ZERO);
    }

    #[test]
    fn test_fraction_clamped_to_one() {
        let f = full_kelly_fraction(dec!(0.5), &SizingBasis::Variance { variance: dec!(0.1) });
        assert_eq!(f, Decimal::ONE);
    }

    #[test]
    fn test_overflowing_ratio_saturates() {
        let tiny = SizingBasis::Variance {
            variance: Decimal::new(1, 28),
        };
        assert_eq!(full_kelly_fraction(dec!(100), &tiny), Decimal::ONE);
        assert_eq!(full_kelly_fraction(dec!(-100), &tiny), Decimal::ZERO);

        let sized = size(
            ScoredCandidate {
                edge: dec!(100),
                basis: tiny,
                ..candidate(dec!(0.6), dec!(0.5))
            },
            &state(dec!(10000)),
            &SizingRules::default(),
        );
        assert_eq!(sized.kelly_fraction, Decimal::ONE);
        assert!(sized.capped_stake <= dec!(1000));
    }

    #[test]
    fn test_optimal_f() {
        let f = full_kelly_fraction(dec!(0.01), &SizingBasis::Variance { variance: dec!(0.04) });
        assert_eq!(f, dec!(0.25));
    }

    #[test]
    fn test_existing_market_exposure_reduces_headroom() {
        let rules = SizingRules::default();
        let mut s = state(dec!(10000));
        s.per_market_exposure.insert("MON/USDC".to_string(), dec!(900));
        s.aggregate_exposure = dec!(900);
        let sized = size(candidate(dec!(0.7), dec!(0.5)), &s, &rules);
        assert_eq!(sized.capped_stake, dec!(100));
        assert_eq!(sized.binding_cap, BindingCap::PerMarket);
    }

    #[test]
    fn test_aggregate_cap_includes_in_flight() {
        let rules = SizingRules::default();
        let mut s = state(dec!(10000));
        s.aggregate_exposure = dec!(4000);
        s.reserved_in_flight = dec!(900);
        let sized = size(candidate(dec!(0.7), dec!(0.5)), &s, &rules);
        assert_eq!(sized.capped_stake, dec!(100));
        assert_eq!(sized.binding_cap, BindingCap::AggregateExposure);
    }

    #[test]
    fn test_full_caps_force_zero() {
        let rules = SizingRules::default();
        let mut s = state(dec!(10000));
        s.aggregate_exposure = dec!(5000);
        let sized = size(candidate(dec!(0.7), dec!(0.5)), &s, &rules);
        assert!(sized.is_capped_to_zero());
    }

    #[test]
    fn test_liquidity_caps_stake() {
        let mut c = candidate(dec!(0.7), dec!(0.5));
        c.opportunity.liquidity = dec!(42.5);
        let sized = size(c, &state(dec!(10000)), &SizingRules::default());
        assert_eq!(sized.capped_stake, dec!(42.5));
        assert_eq!(sized.binding_cap, BindingCap::Liquidity);
    }

    #[test]
    fn test_dust_capped_to_zero() {
        let rules = SizingRules {
            min_stake: dec!(5),
            ..SizingRules::default()
        };
        let sized = size(candidate(dec!(0.51), dec!(0.5)), &state(dec!(100)), &rules);
        assert!(sized.is_capped_to_zero());
        assert_eq!(sized.binding_cap, BindingCap::MinStake);
    }

    #[test]
    fn test_scaled_caps() {
        let scaled = SizingRules::default().with_scaled_caps(dec!(0.5));
        assert_eq!(scaled.max_per_market_fraction, dec!(0.050));
        assert_eq!(scaled.max_aggregate_exposure_fraction, dec!(0.250));
        assert_eq!(scaled.kelly_fraction_multiplier, dec!(0.5));
    }
}
