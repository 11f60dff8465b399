//! JSONL replay of recorded opportunities and estimates.
//!
//! Each line is one `ReplayRecord`. Records sharing a `cycle` number are
//! served together by one `fetch_opportunities` call, in file order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::trade::{Opportunity, OpportunityId, ProbabilityEstimate};
use crate::ports::estimator::{EstimationError, ProbabilityEstimator};
use crate::ports::snapshot::{SnapshotError, SnapshotProvider};

/// One recorded observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub cycle: u64,
    pub opportunity: Opportunity,
    pub estimate: ProbabilityEstimate,
}

/// Replay feed acting as both snapshot provider and estimator.
pub struct ReplayFeed {
    cycles: Vec<Vec<ReplayRecord>>,
    cursor: AtomicUsize,
    loop_replay: bool,
    /// Estimates of the batch most recently served.
    estimates: RwLock<HashMap<OpportunityId, ProbabilityEstimate>>,
}

impl ReplayFeed {
    /// Group records into cycles, ordered by cycle number.
    pub fn from_records(records: Vec<ReplayRecord>, loop_replay: bool) -> Self {
        let mut grouped: BTreeMap<u64, Vec<ReplayRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.cycle).or_default().push(record);
        }
        Self {
            cycles: grouped.into_values().collect(),
            cursor: AtomicUsize::new(0),
            loop_replay,
            estimates: RwLock::new(HashMap::new()),
        }
    }

    /// Load a JSONL replay file.
    pub async fn load(path: &str, loop_replay: bool) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read replay file {path}"))?;

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(line)
                .with_context(|| format!("Malformed replay record at {path}:{}", line_no + 1))?;
            records.push(record);
        }

        let feed = Self::from_records(records, loop_replay);
        info!(path = %path, cycles = feed.cycles.len(), "Replay file loaded");
        Ok(feed)
    }

    pub fn cycle_count(&self) -> usize {
        self.cycles.len()
    }

    /// Whether a non-looping replay has served every cycle.
    pub fn is_exhausted(&self) -> bool {
        !self.loop_replay && self.cursor.load(Ordering::Relaxed) >= self.cycles.len()
    }

    fn next_batch(&self) -> Option<&[ReplayRecord]> {
        if self.cycles.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        let index = if self.loop_replay {
            index % self.cycles.len()
        } else {
            index
        };
        self.cycles.get(index).map(Vec::as_slice)
    }
}

#[async_trait]
impl SnapshotProvider for ReplayFeed {
    async fn fetch_opportunities(&self) -> Result<Vec<Opportunity>, SnapshotError> {
        let Some(batch) = self.next_batch() else {
            debug!("Replay exhausted");
            self.estimates.write().await.clear();
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let mut estimates = HashMap::with_capacity(batch.len());
        let mut opportunities = Vec::with_capacity(batch.len());
        for record in batch {
            let mut opportunity = record.opportunity.clone();
            opportunity.observed_at = now;
            estimates.insert(opportunity.id.clone(), record.estimate.clone());
            opportunities.push(opportunity);
        }
        *self.estimates.write().await = estimates;
        Ok(opportunities)
    }
}

#[async_trait]
impl ProbabilityEstimator for ReplayFeed {
    async fn estimate_probability(
        &self,
        opportunity: &Opportunity,
    ) -> Result<ProbabilityEstimate, EstimationError> {
        self.estimates
            .read()
            .await
            .get(&opportunity.id)
            .cloned()
            .ok_or_else(|| EstimationError::NoEstimate(opportunity.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade::{Direction, EstimateValue, Quote};
    use rust_decimal_macros::dec;

    fn record(cycle: u64, id: &str) -> ReplayRecord {
        ReplayRecord {
            cycle,
            opportunity: Opportunity {
                id: id.to_string(),
                market: format!("market-{id}"),
                direction: Direction::Long,
                quote: Quote::Price { price: dec!(0.5) },
                mark_price: dec!(0.5),
                liquidity: dec!(1000),
                observed_at: Utc::now(),
            },
            estimate: ProbabilityEstimate {
                opportunity_id: id.to_string(),
                value: EstimateValue::Probability {
                    probability: dec!(0.6),
                },
                confidence: dec!(0.8),
                provenance: "replay".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_batches_served_in_cycle_order() {
        let feed = ReplayFeed::from_records(vec![record(2, "b"), record(1, "a")], false);
        let first = feed.fetch_opportunities().await.unwrap();
        assert_eq!(first[0].id, "a");
        assert!(feed.estimate_probability(&first[0]).await.is_ok());

        let second = feed.fetch_opportunities().await.unwrap();
        assert_eq!(second[0].id, "b");
        assert!(matches!(
            feed.estimate_probability(&first[0]).await,
            Err(EstimationError::NoEstimate(_))
        ));

        assert!(feed.fetch_opportunities().await.unwrap().is_empty());
        assert!(feed.is_exhausted());
    }

    #[tokio::test]
    async fn test_looping_replay_wraps() {
        let feed = ReplayFeed::from_records(vec![record(1, "a")], true);
        for _ in 0..3 {
            assert_eq!(feed.fetch_opportunities().await.unwrap().len(), 1);
        }
        assert!(!feed.is_exhausted());
    }
}
