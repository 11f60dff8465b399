//! Agent - The Decision Cycle
//!
//! One cycle:
//! 1. Fetch opportunities from the SnapshotProvider
//! 2. Estimate each concurrently (bounded) via the ProbabilityEstimator
//! 3. Score, keep the best candidate per market
//! 4. Mark the ledger to market, feed the risk gate
//! 5. Size, admit and reserve each candidate under the ledger lock
//! 6. Execute reserved requests concurrently, settle results
//! 7. Log trades, snapshot state, publish status
//!
//! Per-opportunity failures never abort a cycle; a snapshot-provider
//! failure degrades the cycle to a no-op. A ledger `StateError` halts the
//! gate, saves a snapshot for manual reconciliation and stops the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::domain::error::{RejectReason, StateError};
use crate::domain::kelly;
use crate::domain::signal::{self, ScoredCandidate, ScoringRules};
use crate::domain::trade::{IdempotencyToken, MarketId, Opportunity, OpportunityId};
use crate::ports::estimator::ProbabilityEstimator;
use crate::ports::execution::{ExecutionResult, ExecutionTransport};
use crate::ports::repository::{AgentSnapshot, SNAPSHOT_VERSION, StateRepository};
use crate::ports::snapshot::SnapshotProvider;

use super::coordinator::{ExecutionCoordinator, ExecutionOutcome, ExecutionPolicy, Prepared};
use super::ledger::{HistoryRetention, Ledger, ReservationStatus, SharedLedger};
use super::risk_gate::{Admission, RiskGate, RiskState};

/// Errors that stop the agent.
#[derive(Debug, Error)]
pub enum AgentError {
  #[error("ledger invariant violated: {0}")]
  State(#[from] StateError),

  #[error(transparent)]
  Persistence(#[from] anyhow::Error),
}

/// An opportunity dropped before sizing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscardedOpportunity {
  pub opportunity: OpportunityId,
  pub reason: &'static str,
}

/// An order stopped before reaching the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedOrder {
  pub market: MarketId,
  pub reason: RejectReason,
}

/// What one decision cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
  pub cycle: u64,
  pub started_at: DateTime<Utc>,
  /// Snapshot provider failed; nothing was evaluated.
  pub degraded: bool,
  pub opportunities: usize,
  /// Candidates left after per-market selection.
  pub candidates: usize,
  pub discards: Vec<DiscardedOpportunity>,
  pub rejections: Vec<RejectedOrder>,
  pub outcomes: Vec<ExecutionOutcome>,
  pub risk_state: RiskState,
}

impl CycleReport {
  fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
    Self {
      cycle,
      started_at,
      degraded: false,
      opportunities: 0,
      candidates: 0,
      discards: Vec::new(),
      rejections: Vec::new(),
      outcomes: Vec::new(),
      risk_state: RiskState::Normal,
    }
  }

  pub fn applied(&self) -> usize {
    self.outcomes.iter().filter(|o| o.is_applied()).count()
  }
}

/// Point-in-time agent status for `--status`, health and metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentStatus {
  pub name: String,
  pub running: bool,
  pub risk_state: RiskState,
  pub halt_reason: Option<String>,
  pub cash: Decimal,
  pub bankroll: Decimal,
  pub equity: Decimal,
  pub peak_equity: Decimal,
  pub drawdown: Decimal,
  pub peak_drawdown: Decimal,
  pub max_drawdown: Decimal,
  pub aggregate_exposure: Decimal,
  pub reserved: Decimal,
  pub realized_pnl: Decimal,
  pub open_positions: usize,
  pub unknown_requests: usize,
  pub total_trades: u64,
  pub cycles: u64,
  pub last_scan: Option<DateTime<Utc>>,
}

impl AgentStatus {
  fn from_parts(name: &str, ledger: &Ledger, gate: &RiskGate) -> Self {
    let state = ledger.state();
    Self {
      name: name.to_string(),
      running: false,
      risk_state: gate.state(),
      halt_reason: gate.halt_reason().map(str::to_string),
      cash: state.cash,
      bankroll: state.bankroll,
      equity: state.equity,
      peak_equity: state.peak_equity,
      drawdown: state.drawdown,
      peak_drawdown: state.peak_drawdown,
      max_drawdown: state.max_drawdown,
      aggregate_exposure: state.aggregate_exposure,
      reserved: state.reserved_in_flight + state.reserved_unknown,
      realized_pnl: state.realized_pnl,
      open_positions: state.open_positions,
      unknown_requests: ledger.reservations_with(ReservationStatus::Unknown).len(),
      total_trades: 0,
      cycles: 0,
      last_scan: None,
    }
  }
}

/// Read the persisted status without starting an agent.
///
/// Only the repository is read: no transport query, no snapshot write.
/// Without a snapshot the status describes a fresh start.
pub async fn load_status<R: StateRepository>(
  repository: &R,
  config: &AppConfig,
) -> Result<AgentStatus, AgentError> {
  let mut gate = RiskGate::new(config.risk.clone(), config.sizing.clone());
  let Some(snapshot) = repository.load_latest_state().await? else {
    let ledger = Ledger::new(config.ledger.initial_bankroll);
    return Ok(AgentStatus::from_parts(&config.agent.name, &ledger, &gate));
  };
  let ledger = Ledger::restore(snapshot.ledger)?;
  gate.restore(snapshot.gate);
  Ok(AgentStatus {
    total_trades: snapshot.total_trades,
    cycles: snapshot.cycles,
    last_scan: Some(snapshot.saved_at),
    ..AgentStatus::from_parts(&config.agent.name, &ledger, &gate)
  })
}

/// Loop cadence and scoring settings.
#[derive(Debug, Clone)]
struct AgentSettings {
  name: String,
  scan_interval: Duration,
  estimator_concurrency: usize,
  scoring: ScoringRules,
  retention: HistoryRetention,
}

/// The autonomous trading agent.
pub struct Agent<S, P, T, R>
where
  S: SnapshotProvider,
  P: ProbabilityEstimator,
  T: ExecutionTransport,
  R: StateRepository,
{
  snapshots: Arc<S>,
  estimator: Arc<P>,
  repository: Arc<R>,
  coordinator: ExecutionCoordinator<T>,
  ledger: SharedLedger,
  gate: RiskGate,
  settings: AgentSettings,
  cycles: u64,
  total_trades: u64,
  last_scan: Option<DateTime<Utc>>,
  running: bool,
  status_tx: watch::Sender<AgentStatus>,
  report_tx: broadcast::Sender<CycleReport>,
}

impl<S, P, T, R> Agent<S, P, T, R>
where
  S: SnapshotProvider,
  P: ProbabilityEstimator,
  T: ExecutionTransport,
  R: StateRepository,
{
  /// Wire an agent with a fresh ledger; call `bootstrap` to resume
  /// persisted state.
  pub fn new(
    config: &AppConfig,
    snapshots: Arc<S>,
    estimator: Arc<P>,
    transport: Arc<T>,
    repository: Arc<R>,
  ) -> Self {
    let ledger = Ledger::new(config.ledger.initial_bankroll).shared();
    let policy = ExecutionPolicy {
      submit_timeout: Duration::from_millis(config.execution.submit_timeout_ms),
      query_timeout: Duration::from_millis(config.execution.query_timeout_ms),
    };
    let coordinator = ExecutionCoordinator::new(transport, Arc::clone(&ledger), policy);
    let gate = RiskGate::new(config.risk.clone(), config.sizing.clone());
    let (status_tx, _) = watch::channel(AgentStatus::default());
    let (report_tx, _) = broadcast::channel(16);

    Self {
      snapshots,
      estimator,
      repository,
      coordinator,
      ledger,
      gate,
      settings: AgentSettings {
        name: config.agent.name.clone(),
        scan_interval: Duration::from_secs(config.agent.scan_interval_secs),
        estimator_concurrency: config.agent.estimator_concurrency.max(1),
        scoring: config.signal.clone(),
        retention: config.ledger.retention(),
      },
      cycles: 0,
      total_trades: 0,
      last_scan: None,
      running: false,
      status_tx,
      report_tx,
    }
  }

  pub fn ledger(&self) -> &SharedLedger {
    &self.ledger
  }

  pub fn gate(&self) -> &RiskGate {
    &self.gate
  }

  pub fn coordinator(&self) -> &ExecutionCoordinator<T> {
    &self.coordinator
  }

  /// Receive status updates (one per cycle).
  pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
    self.status_tx.subscribe()
  }

  /// Receive a report after every cycle.
  pub fn subscribe_reports(&self) -> broadcast::Receiver<CycleReport> {
    self.report_tx.subscribe()
  }

  /// Restore persisted state and reconcile requests left unresolved.
  ///
  /// In-flight requests from a previous run become Unknown and are
  /// queried once each; nothing is resubmitted.
  #[instrument(skip(self), fields(agent = %self.settings.name))]
  pub async fn bootstrap(&mut self) -> Result<(), AgentError> {
    if let Some(snapshot) = self.repository.load_latest_state().await? {
      let restored = Ledger::restore(snapshot.ledger)?;
      *self.ledger.lock().await = restored;
      self.gate.restore(snapshot.gate);
      self.cycles = snapshot.cycles;
      self.total_trades = snapshot.total_trades;
      info!(
        saved_at = %snapshot.saved_at,
        cycles = self.cycles,
        risk_state = %self.gate.state(),
        "Resumed from snapshot"
      );
    } else {
      info!("No snapshot found, starting fresh");
    }

    let orphans = self.coordinator.recover_orphans().await?;
    let outcomes = self.coordinator.reconcile_unknown().await?;
    if orphans > 0 || !outcomes.is_empty() {
      let unresolved = outcomes
        .iter()
        .filter(|o| matches!(o, ExecutionOutcome::Unknown { .. }))
        .count();
      info!(
        reconciled = outcomes.len() - unresolved,
        unresolved,
        "Startup reconciliation complete"
      );
    }
    self.record_trades(&outcomes).await;
    self.persist().await?;
    self.publish_status().await;
    Ok(())
  }

  /// Run decision cycles every `scan_interval` until shutdown.
  ///
  /// A shutdown signal aborts the current cycle at its next await point;
  /// reservations it made are recovered on the next start.
  #[instrument(skip(self, shutdown_rx), name = "agent_loop", fields(agent = %self.settings.name))]
  pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), AgentError> {
    info!(
      interval_secs = self.settings.scan_interval.as_secs(),
      risk_state = %self.gate.state(),
      "Starting agent loop"
    );
    self.running = true;
    self.publish_status().await;

    let mut ticker = tokio::time::interval(self.settings.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;
        _ = shutdown_rx.recv() => {
          info!("Shutdown signal received, stopping agent");
          break;
        }
        _ = ticker.tick() => {}
      }

      let cycle = tokio::select! {
        biased;
        _ = shutdown_rx.recv() => {
          warn!("Shutdown during cycle, aborting it");
          break;
        }
        result = self.run_cycle() => result,
      };

      match cycle {
        Ok(report) => debug!(cycle = report.cycle, applied = report.applied(), "Cycle complete"),
        Err(AgentError::State(e)) => {
          self.running = false;
          self.publish_status().await;
          return Err(AgentError::State(e));
        }
        Err(e) => warn!(error = %e, "Cycle finished with persistence error"),
      }
    }

    self.running = false;
    self.persist().await?;
    self.publish_status().await;
    info!("Agent stopped cleanly");
    Ok(())
  }

  /// Run one decision cycle.
  ///
  /// # Errors
  /// `AgentError::State` when a ledger invariant breaks; the gate is
  /// halted and a snapshot saved before returning.
  #[instrument(skip(self), fields(cycle = self.cycles + 1))]
  pub async fn run_cycle(&mut self) -> Result<CycleReport, AgentError> {
    match self.decide_and_execute().await {
      Ok(report) => {
        self.record_trades(&report.outcomes).await;
        if let Err(e) = self.persist().await {
          error!(error = %e, "Failed to save state snapshot");
        }
        self.publish_status().await;
        let _ = self.report_tx.send(report.clone());
        Ok(report)
      }
      Err(e) => {
        error!(error = %e, "Ledger inconsistency, halting");
        self.gate.force_halt(e.to_string());
        if let Err(persist_err) = self.persist().await {
          error!(error = %persist_err, "Failed to save snapshot after halt");
        }
        self.publish_status().await;
        Err(AgentError::State(e))
      }
    }
  }

  /// Close the whole position in `market` at `limit_price`.
  ///
  /// Permitted in every gate state, including Halted.
  pub async fn close_position(
    &mut self,
    market: &str,
    limit_price: Decimal,
  ) -> Result<ExecutionOutcome, AgentError> {
    let outcome = self.coordinator.close(market, limit_price).await?;
    self.record_trades(std::slice::from_ref(&outcome)).await;
    self.persist().await?;
    self.publish_status().await;
    Ok(outcome)
  }

  /// Operator override for an Unknown request.
  pub async fn resolve_unknown(
    &mut self,
    token: &IdempotencyToken,
    result: ExecutionResult,
  ) -> Result<ExecutionOutcome, AgentError> {
    let outcome = self.coordinator.resolve_unknown(token, result).await?;
    self.record_trades(std::slice::from_ref(&outcome)).await;
    self.persist().await?;
    self.publish_status().await;
    Ok(outcome)
  }

  /// Clear a halt and persist the reset.
  ///
  /// Drawdown is measured from the equity at reset time onward, so the
  /// next cycle does not trip the gate again on the loss already taken.
  pub async fn reset_halt(&mut self) -> Result<(), AgentError> {
    let state = {
      let mut ledger = self.ledger.lock().await;
      ledger.rebase_peak();
      ledger.state()
    };
    self.gate.reset();
    self.gate.observe(&state);
    self.persist().await?;
    self.publish_status().await;
    Ok(())
  }

  /// Current status built from the ledger and the gate.
  pub async fn status(&self) -> AgentStatus {
    let ledger = self.ledger.lock().await;
    AgentStatus {
      running: self.running,
      total_trades: self.total_trades,
      cycles: self.cycles,
      last_scan: self.last_scan,
      ..AgentStatus::from_parts(&self.settings.name, &ledger, &self.gate)
    }
  }

  async fn decide_and_execute(&mut self) -> Result<CycleReport, StateError> {
    self.cycles += 1;
    let now = Utc::now();
    self.last_scan = Some(now);
    let mut report = CycleReport::new(self.cycles, now);

    let opportunities = match self.snapshots.fetch_opportunities().await {
      Ok(opportunities) => opportunities,
      Err(e) => {
        warn!(error = %e, "Snapshot fetch failed, skipping cycle");
        report.degraded = true;
        Vec::new()
      }
    };
    report.opportunities = opportunities.len();

    let mut prices: HashMap<MarketId, Decimal> = HashMap::new();
    for opportunity in &opportunities {
      prices
        .entry(opportunity.market.clone())
        .or_insert(opportunity.mark_price);
    }

    let candidates = self.score_all(opportunities, &mut report).await;
    report.candidates = candidates.len();

    let pending = {
      let mut ledger = self.ledger.lock().await;
      ledger.mark_to_market(&prices)?;
      self.gate.observe(&ledger.state());

      let mut pending = Vec::with_capacity(candidates.len());
      for candidate in candidates {
        let view = ledger.state();
        let market = candidate.market().clone();
        let sized = kelly::size(candidate, &view, &self.gate.effective_sizing());
        debug!(
          market = %market,
          kelly = %sized.kelly_fraction,
          recommended = %sized.recommended_stake,
          capped = %sized.capped_stake,
          binding = ?sized.binding_cap,
          "Candidate sized"
        );

        let admitted = match self.gate.admit(sized, &view) {
          Admission::Admitted(admitted) => admitted,
          Admission::Rejected(reason) => {
            debug!(market = %market, reason = reason.label(), "Order rejected by risk gate");
            report.rejections.push(RejectedOrder { market, reason });
            continue;
          }
        };
        match self.coordinator.prepare(&mut ledger, admitted, Utc::now())? {
          Prepared::Ready(execution) => pending.push(execution),
          Prepared::Rejected { market, reason } => {
            report.rejections.push(RejectedOrder { market, reason });
          }
        }
      }
      pending
    };

    if !pending.is_empty() {
      info!(orders = pending.len(), "Submitting orders");
    }
    let results = join_all(pending.into_iter().map(|p| self.coordinator.execute(p))).await;
    let mut first_error = None;
    for result in results {
      match result {
        Ok(outcome) => report.outcomes.push(outcome),
        Err(e) => {
          first_error.get_or_insert(e);
        }
      }
    }
    if let Some(e) = first_error {
      self.record_trades(&report.outcomes).await;
      return Err(e);
    }

    let state = self.ledger.lock().await.state();
    report.risk_state = self.gate.observe(&state);

    info!(
      opportunities = report.opportunities,
      candidates = report.candidates,
      discarded = report.discards.len(),
      rejected = report.rejections.len(),
      applied = report.applied(),
      equity = %state.equity,
      drawdown = %state.drawdown,
      risk_state = %report.risk_state,
      "Cycle summary"
    );
    Ok(report)
  }

  /// Estimate and score every opportunity; keep the best per market.
  async fn score_all(
    &self,
    opportunities: Vec<Opportunity>,
    report: &mut CycleReport,
  ) -> Vec<ScoredCandidate> {
    let estimator = Arc::clone(&self.estimator);
    let estimated: Vec<_> = stream::iter(opportunities)
      .map(|opportunity| {
        let estimator = Arc::clone(&estimator);
        async move {
          let estimate = estimator.estimate_probability(&opportunity).await;
          (opportunity, estimate)
        }
      })
      .buffered(self.settings.estimator_concurrency)
      .collect()
      .await;

    let mut scored = Vec::with_capacity(estimated.len());
    for (opportunity, estimate) in estimated {
      let estimate = match estimate {
        Ok(estimate) => estimate,
        Err(e) => {
          debug!(opportunity = %opportunity.id, error = %e, "Estimation failed, discarding");
          report.discards.push(DiscardedOpportunity {
            opportunity: opportunity.id,
            reason: "estimation_failed",
          });
          continue;
        }
      };
      match signal::score(&opportunity, &estimate, &self.settings.scoring) {
        Ok(candidate) => scored.push(candidate),
        Err(discard) => {
          debug!(opportunity = %opportunity.id, reason = %discard, "Opportunity discarded");
          report.discards.push(DiscardedOpportunity {
            opportunity: opportunity.id,
            reason: discard.label(),
          });
        }
      }
    }
    signal::best_per_market(scored)
  }

  async fn record_trades(&mut self, outcomes: &[ExecutionOutcome]) {
    for record in outcomes.iter().filter_map(ExecutionOutcome::trade_record) {
      self.total_trades += 1;
      if let Err(e) = self.repository.save_trade(&record).await {
        error!(error = %e, market = %record.market, "Failed to append trade record");
      }
    }
  }

  async fn persist(&self) -> Result<(), AgentError> {
    let ledger = {
      let mut ledger = self.ledger.lock().await;
      ledger.compact(&self.settings.retention, Utc::now());
      ledger.snapshot()
    };
    let snapshot = AgentSnapshot {
      version: SNAPSHOT_VERSION.to_string(),
      saved_at: Utc::now(),
      ledger,
      gate: self.gate.snapshot(),
      cycles: self.cycles,
      total_trades: self.total_trades,
    };
    self.repository.save_state(&snapshot).await?;
    Ok(())
  }

  async fn publish_status(&self) {
    let status = self.status().await;
    self.status_tx.send_replace(status);
  }
}
