//! Integration Tests - Decision Cycle End to End
//!
//! Drives the agent and the execution coordinator through mocked ports.
//! Uses mockall for trait mocking and tokio::test for async tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fred_agent::config::AppConfig;
use fred_agent::config::loader::parse_config;
use fred_agent::domain::error::RejectReason;
use fred_agent::domain::kelly::{self, SizingRules};
use fred_agent::domain::portfolio::LedgerState;
use fred_agent::domain::signal::{self, ScoringRules};
use fred_agent::domain::trade::{
    Direction, EstimateValue, IdempotencyToken, Opportunity, ProbabilityEstimate, Quote,
};
use fred_agent::ports::estimator::EstimationError;
use fred_agent::ports::execution::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutionTransport, RequestKind,
    TransportError,
};
use fred_agent::ports::repository::{AgentSnapshot, SNAPSHOT_VERSION, TradeRecord};
use fred_agent::ports::snapshot::SnapshotError;
use fred_agent::usecases::coordinator::{ExecutionCoordinator, ExecutionOutcome, ExecutionPolicy};
use fred_agent::usecases::ledger::{HistoryRetention, Ledger, ReservationStatus};
use fred_agent::usecases::risk_gate::{
    Admission, AdmittedOrder, GateSnapshot, RiskGate, RiskLimits, RiskState,
};
use fred_agent::usecases::{Agent, load_status};

// ---- Mock Definitions ----

mock! {
    pub Snapshots {}

    #[async_trait::async_trait]
    impl fred_agent::ports::snapshot::SnapshotProvider for Snapshots {
        async fn fetch_opportunities(&self) -> Result<Vec<Opportunity>, SnapshotError>;
    }
}

mock! {
    pub Estimator {}

    #[async_trait::async_trait]
    impl fred_agent::ports::estimator::ProbabilityEstimator for Estimator {
        async fn estimate_probability(
            &self,
            opportunity: &Opportunity,
        ) -> Result<ProbabilityEstimate, EstimationError>;
    }
}

mock! {
    pub Transport {}

    #[async_trait::async_trait]
    impl fred_agent::ports::execution::ExecutionTransport for Transport {
        async fn submit_execution(
            &self,
            request: &ExecutionRequest,
        ) -> Result<ExecutionResult, TransportError>;

        async fn query_status(
            &self,
            token: &IdempotencyToken,
        ) -> Result<ExecutionResult, TransportError>;
    }
}

mock! {
    pub Repo {}

    #[async_trait::async_trait]
    impl fred_agent::ports::repository::StateRepository for Repo {
        async fn save_trade(&self, record: &TradeRecord) -> anyhow::Result<()>;
        async fn load_trades(&self) -> anyhow::Result<Vec<TradeRecord>>;
        async fn save_state(&self, state: &AgentSnapshot) -> anyhow::Result<()>;
        async fn load_latest_state(&self) -> anyhow::Result<Option<AgentSnapshot>>;
        async fn is_healthy(&self) -> bool;
    }
}

// ---- Fixtures ----

const BASE_CONFIG: &str = r#"
[agent]
name = "integration"

[signal]
min_confidence = 0.6
min_liquidity = 100

[ledger]
initial_bankroll = 10000
"#;

fn config(extra: &str) -> AppConfig {
    parse_config(&format!("{BASE_CONFIG}{extra}")).unwrap()
}

fn opportunity(id: &str, market: &str, price: Decimal) -> Opportunity {
    Opportunity {
        id: id.to_string(),
        market: market.to_string(),
        direction: Direction::Long,
        quote: Quote::Price { price },
        mark_price: price,
        liquidity: dec!(50000),
        observed_at: Utc::now(),
    }
}

fn estimate(id: &str, probability: Decimal) -> ProbabilityEstimate {
    ProbabilityEstimate {
        opportunity_id: id.to_string(),
        value: EstimateValue::Probability { probability },
        confidence: dec!(0.8),
        provenance: "mock".to_string(),
    }
}

/// Snapshot provider returning `(id, market, price)` rows, re-stamped per call.
fn snapshots(rows: Vec<(&'static str, &'static str, Decimal)>) -> MockSnapshots {
    let mut mock = MockSnapshots::new();
    mock.expect_fetch_opportunities().returning(move || {
        Ok(rows
            .iter()
            .map(|(id, market, price)| opportunity(id, market, *price))
            .collect())
    });
    mock
}

/// Estimator answering from a fixed id -> probability table.
fn estimator(table: &[(&str, Decimal)]) -> MockEstimator {
    let table: HashMap<String, Decimal> = table
        .iter()
        .map(|(id, p)| ((*id).to_string(), *p))
        .collect();
    let mut mock = MockEstimator::new();
    mock.expect_estimate_probability().returning(move |opportunity| {
        table
            .get(&opportunity.id)
            .map(|p| estimate(&opportunity.id, *p))
            .ok_or_else(|| EstimationError::Unavailable("model offline".to_string()))
    });
    mock
}

/// Fill at the limit price for the full reserved stake.
fn fill_at_limit(request: &ExecutionRequest) -> Result<ExecutionResult, TransportError> {
    let price = request.limit_price();
    let quantity = match &request.kind {
        RequestKind::Open { order } => order.capped_stake / price,
        RequestKind::Close { quantity, .. } => *quantity,
    };
    Ok(ExecutionResult::filled(request.token, price, quantity))
}

fn quiet_repo() -> MockRepo {
    let mut repo = MockRepo::new();
    repo.expect_save_trade().returning(|_| Ok(()));
    repo.expect_save_state().returning(|_| Ok(()));
    repo.expect_load_latest_state().returning(|| Ok(None));
    repo.expect_load_trades().returning(|| Ok(Vec::new()));
    repo.expect_is_healthy().returning(|| true);
    repo
}

fn agent(
    config: &AppConfig,
    snapshots: MockSnapshots,
    estimator: MockEstimator,
    transport: MockTransport,
    repo: MockRepo,
) -> Agent<MockSnapshots, MockEstimator, MockTransport, MockRepo> {
    Agent::new(
        config,
        Arc::new(snapshots),
        Arc::new(estimator),
        Arc::new(transport),
        Arc::new(repo),
    )
}

fn scoring() -> ScoringRules {
    ScoringRules {
        min_confidence: dec!(0.6),
        min_liquidity: dec!(100),
        min_edge: Decimal::ZERO,
        signal_ttl_secs: 30,
        allow_short: false,
    }
}

fn fresh_state(bankroll: Decimal) -> LedgerState {
    LedgerState {
        cash: bankroll,
        bankroll,
        equity: bankroll,
        peak_equity: bankroll,
        ..LedgerState::default()
    }
}

/// Score, size and admit one long opportunity against a fresh bankroll.
fn admitted(market: &str, price: Decimal, probability: Decimal) -> AdmittedOrder {
    let opp = opportunity("o-1", market, price);
    let candidate = signal::score(&opp, &estimate("o-1", probability), &scoring()).unwrap();
    let state = fresh_state(dec!(10000));
    let sized = kelly::size(candidate, &state, &SizingRules::default());
    let gate = RiskGate::new(RiskLimits::default(), SizingRules::default());
    match gate.admit(sized, &state) {
        Admission::Admitted(order) => order,
        Admission::Rejected(reason) => panic!("unexpected rejection: {reason}"),
    }
}

/// Transport that answers submissions only after `delay`.
struct SlowTransport {
    delay: Duration,
    submissions: AtomicUsize,
    queries: AtomicUsize,
    answer: tokio::sync::Mutex<Option<ExecutionResult>>,
}

#[async_trait]
impl ExecutionTransport for SlowTransport {
    async fn submit_execution(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, TransportError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let result = fill_at_limit(request)?;
        *self.answer.lock().await = Some(result.clone());
        tokio::time::sleep(self.delay).await;
        Ok(result)
    }

    async fn query_status(
        &self,
        token: &IdempotencyToken,
    ) -> Result<ExecutionResult, TransportError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .await
            .clone()
            .ok_or(TransportError::UnknownToken(*token))
    }
}

// ---- Integration Tests ----

#[tokio::test]
async fn test_full_cycle_opens_positions_in_two_markets() {
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .times(2)
        .returning(fill_at_limit);
    transport.expect_query_status().never();

    let mut repo = MockRepo::new();
    repo.expect_save_trade().times(2).returning(|_| Ok(()));
    repo.expect_save_state().returning(|_| Ok(()));

    let mut agent = agent(
        &config(""),
        snapshots(vec![("btc", "BTC", dec!(0.50)), ("eth", "ETH", dec!(0.40))]),
        estimator(&[("btc", dec!(0.55)), ("eth", dec!(0.48))]),
        transport,
        repo,
    );

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.opportunities, 2);
    assert_eq!(report.candidates, 2);
    assert_eq!(report.applied(), 2);
    assert!(report.rejections.is_empty());
    assert_eq!(report.risk_state, RiskState::Normal);

    let ledger = agent.ledger().lock().await;
    // ETH has the larger edge and goes first: 0.5 * (0.2 / 1.5) * 10000.
    // BTC is sized net of that commitment: 0.5 * 0.10 * 9333.34, floored to cents.
    assert_eq!(ledger.position("ETH").unwrap().stake, dec!(666.66));
    assert_eq!(ledger.position("BTC").unwrap().stake, dec!(466.66));
    let state = ledger.state();
    assert_eq!(state.aggregate_exposure, dec!(1133.32));
    assert_eq!(state.cash, dec!(8866.68));
    assert_eq!(state.reserved_in_flight, Decimal::ZERO);
    ledger.check_invariants().unwrap();
}

#[tokio::test]
async fn test_same_market_keeps_largest_edge() {
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .withf(|request| match &request.kind {
            RequestKind::Open { order } => order.candidate.opportunity.id == "wide",
            RequestKind::Close { .. } => false,
        })
        .times(1)
        .returning(fill_at_limit);

    let mut agent = agent(
        &config(""),
        snapshots(vec![
            ("narrow", "FED", dec!(0.50)),
            ("wide", "FED", dec!(0.50)),
        ]),
        estimator(&[("narrow", dec!(0.52)), ("wide", dec!(0.57))]),
        transport,
        quiet_repo(),
    );

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.opportunities, 2);
    assert_eq!(report.candidates, 1);
    assert_eq!(report.applied(), 1);
}

#[tokio::test]
async fn test_snapshot_failure_degrades_cycle() {
    let mut provider = MockSnapshots::new();
    provider
        .expect_fetch_opportunities()
        .returning(|| Err(SnapshotError::Timeout));
    let mut estimator = MockEstimator::new();
    estimator.expect_estimate_probability().never();
    let mut transport = MockTransport::new();
    transport.expect_submit_execution().never();

    let mut agent = agent(&config(""), provider, estimator, transport, quiet_repo());
    let report = agent.run_cycle().await.unwrap();

    assert!(report.degraded);
    assert_eq!(report.opportunities, 0);
    assert!(report.outcomes.is_empty());
    assert_eq!(agent.status().await.cycles, 1);
}

#[tokio::test]
async fn test_estimation_failure_discards_only_that_opportunity() {
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .times(1)
        .returning(fill_at_limit);

    let mut agent = agent(
        &config(""),
        snapshots(vec![("ok", "BTC", dec!(0.50)), ("broken", "ETH", dec!(0.40))]),
        estimator(&[("ok", dec!(0.55))]),
        transport,
        quiet_repo(),
    );

    let report = agent.run_cycle().await.unwrap();
    assert_eq!(report.discards.len(), 1);
    assert_eq!(report.discards[0].opportunity, "broken");
    assert_eq!(report.discards[0].reason, "estimation_failed");
    assert_eq!(report.applied(), 1);
}

#[tokio::test]
async fn test_low_confidence_and_short_are_discarded() {
    let mut provider = MockSnapshots::new();
    provider.expect_fetch_opportunities().returning(|| {
        let mut short = opportunity("short", "SPX", dec!(0.60));
        short.direction = Direction::Short;
        Ok(vec![short, opportunity("shy", "FED", dec!(0.30))])
    });
    let mut estimator = MockEstimator::new();
    estimator.expect_estimate_probability().returning(|opportunity| {
        let mut estimate = estimate(&opportunity.id, dec!(0.45));
        if opportunity.id == "shy" {
            estimate.confidence = dec!(0.4);
        }
        Ok(estimate)
    });
    let mut transport = MockTransport::new();
    transport.expect_submit_execution().never();

    let mut agent = agent(&config(""), provider, estimator, transport, quiet_repo());
    let report = agent.run_cycle().await.unwrap();

    let mut reasons: Vec<_> = report.discards.iter().map(|d| d.reason).collect();
    reasons.sort_unstable();
    assert_eq!(reasons, vec!["low_confidence", "short_disabled"]);
    assert_eq!(report.candidates, 0);
}

#[tokio::test]
async fn test_unresolved_timeout_holds_capital_and_blocks_market() {
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .times(1)
        .returning(|_| Err(TransportError::Timeout));
    transport
        .expect_query_status()
        .times(1)
        .returning(|_| Err(TransportError::Network("connection reset".to_string())));

    let mut agent = agent(
        &config(""),
        snapshots(vec![("btc", "BTC", dec!(0.50))]),
        estimator(&[("btc", dec!(0.55))]),
        transport,
        quiet_repo(),
    );

    let first = agent.run_cycle().await.unwrap();
    assert!(matches!(
        first.outcomes.as_slice(),
        [ExecutionOutcome::Unknown { market, .. }] if market == "BTC"
    ));
    {
        let ledger = agent.ledger().lock().await;
        let state = ledger.state();
        assert_eq!(state.aggregate_exposure, Decimal::ZERO);
        assert_eq!(state.reserved_unknown, dec!(500));
        assert_eq!(state.bankroll, dec!(9500));
        assert!(ledger.position("BTC").is_none());
        assert_eq!(ledger.reservations_with(ReservationStatus::Unknown).len(), 1);
    }

    // Same market next cycle: blocked locally, never resubmitted.
    let second = agent.run_cycle().await.unwrap();
    assert!(second.outcomes.is_empty());
    assert_eq!(second.rejections.len(), 1);
    assert_eq!(second.rejections[0].reason, RejectReason::InFlightConflict);
    assert_eq!(agent.status().await.unknown_requests, 1);
}

#[tokio::test]
async fn test_drawdown_halts_and_blocks_new_orders() {
    let cfg = config(
        "\n[sizing]\nkelly_fraction_multiplier = 1.0\nmax_per_market_fraction = 0.3\nmax_aggregate_exposure_fraction = 0.9\n",
    );

    let price = Arc::new(std::sync::Mutex::new(dec!(0.50)));
    let feed_price = Arc::clone(&price);
    let mut provider = MockSnapshots::new();
    provider.expect_fetch_opportunities().returning(move || {
        let mark = *feed_price.lock().unwrap();
        Ok(vec![
            opportunity("held", "ELECTION", mark),
            opportunity("fresh", "RATES", dec!(0.50)),
        ])
    });
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .withf(|request| request.market == "ELECTION" || request.is_close())
        .returning(fill_at_limit);
    transport
        .expect_submit_execution()
        .withf(|request| request.market == "RATES")
        .times(2)
        .returning(|request| {
            Ok(ExecutionResult::unfilled(
                request.token,
                ExecutionStatus::Rejected,
                "market closed",
            ))
        });

    let mut agent = agent(
        &cfg,
        provider,
        estimator(&[("held", dec!(0.90)), ("fresh", dec!(0.55))]),
        transport,
        quiet_repo(),
    );

    // ELECTION is capped at 3000; RATES is sized against the remaining 7000
    // and reaches the venue, which turns it away.
    let first = agent.run_cycle().await.unwrap();
    assert_eq!(first.applied(), 1);
    assert_eq!(
        agent.ledger().lock().await.position("ELECTION").unwrap().stake,
        dec!(3000)
    );

    // 6000 units marked from 0.50 to 0.20: equity 8200, drawdown 18%.
    *price.lock().unwrap() = dec!(0.20);
    let second = agent.run_cycle().await.unwrap();
    assert_eq!(second.risk_state, RiskState::Halted);
    assert!(second.outcomes.is_empty());
    assert!(
        second
            .rejections
            .iter()
            .all(|r| r.reason == RejectReason::HaltedState)
    );
    assert!(agent.gate().is_halted());
    assert!(agent.status().await.halt_reason.is_some());

    // Closing is still allowed while halted.
    let closed = agent.close_position("ELECTION", dec!(0.20)).await.unwrap();
    match closed {
        ExecutionOutcome::Applied { realized_pnl, .. } => {
            assert_eq!(realized_pnl, Some(dec!(-1800)));
        }
        other => panic!("expected applied close, got {other:?}"),
    }
    assert_eq!(agent.ledger().lock().await.cash(), dec!(8200));

    // Halt survives a flat ledger until reset.
    agent.run_cycle().await.unwrap();
    assert!(agent.gate().is_halted());
    agent.reset_halt().await.unwrap();
    assert_eq!(agent.gate().state(), RiskState::Normal);

    // The reset accepts the loss: drawdown is measured from 8200 onward.
    let status = agent.status().await;
    assert_eq!(status.peak_equity, dec!(8200));
    assert_eq!(status.drawdown, Decimal::ZERO);
    assert_eq!(status.max_drawdown, dec!(0.18));

    let resumed = agent.run_cycle().await.unwrap();
    assert_eq!(resumed.risk_state, RiskState::Normal);
    assert!(
        resumed
            .rejections
            .iter()
            .all(|r| r.reason != RejectReason::HaltedState)
    );
    assert_eq!(resumed.applied(), 1);
    assert!(!agent.gate().is_halted());
}

#[tokio::test]
async fn test_duplicate_result_is_applied_once() {
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .times(1)
        .returning(fill_at_limit);

    let ledger = Ledger::new(dec!(10000)).shared();
    let coordinator =
        ExecutionCoordinator::new(Arc::new(transport), Arc::clone(&ledger), ExecutionPolicy::default());

    let outcome = coordinator
        .submit(admitted("BTC", dec!(0.50), dec!(0.55)))
        .await
        .unwrap();
    let ExecutionOutcome::Applied { request, result, .. } = outcome else {
        panic!("expected applied outcome");
    };
    let cash_after_first = ledger.lock().await.cash();

    let replay = coordinator.apply_result(&request, result).await.unwrap();
    assert_eq!(
        replay,
        ExecutionOutcome::Duplicate {
            token: request.token
        }
    );
    let ledger = ledger.lock().await;
    assert_eq!(ledger.cash(), cash_after_first);
    assert_eq!(ledger.position("BTC").unwrap().stake, dec!(500));
}

#[tokio::test]
async fn test_replay_after_token_compaction_is_still_a_duplicate() {
    let mut transport = MockTransport::new();
    transport
        .expect_submit_execution()
        .times(1)
        .returning(fill_at_limit);

    let ledger = Ledger::new(dec!(10000)).shared();
    let coordinator =
        ExecutionCoordinator::new(Arc::new(transport), Arc::clone(&ledger), ExecutionPolicy::default());

    let outcome = coordinator
        .submit(admitted("BTC", dec!(0.50), dec!(0.55)))
        .await
        .unwrap();
    let ExecutionOutcome::Applied { request, result, .. } = outcome else {
        panic!("expected applied outcome");
    };

    // Compact well past the retention window so the applied token is forgotten.
    let retention = HistoryRetention {
        history_limit: 10,
        applied_token_retention_hours: 1,
    };
    {
        let mut ledger = ledger.lock().await;
        ledger.compact(&retention, Utc::now() + chrono::Duration::hours(2));
        assert!(!ledger.is_applied(&request.token));
    }

    let replay = coordinator.apply_result(&request, result).await.unwrap();
    assert_eq!(
        replay,
        ExecutionOutcome::Duplicate {
            token: request.token
        }
    );
    let ledger = ledger.lock().await;
    assert_eq!(ledger.position("BTC").unwrap().stake, dec!(500));
    assert_eq!(ledger.state().aggregate_exposure, dec!(500));
}

#[tokio::test]
async fn test_venue_rejection_releases_reservation() {
    let mut transport = MockTransport::new();
    transport.expect_submit_execution().times(1).returning(|request| {
        Ok(ExecutionResult::unfilled(
            request.token,
            ExecutionStatus::Rejected,
            "price moved",
        ))
    });

    let ledger = Ledger::new(dec!(10000)).shared();
    let coordinator =
        ExecutionCoordinator::new(Arc::new(transport), Arc::clone(&ledger), ExecutionPolicy::default());

    let outcome = coordinator
        .submit(admitted("BTC", dec!(0.50), dec!(0.55)))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::Dropped {
            status: ExecutionStatus::Rejected,
            ..
        }
    ));
    let ledger = ledger.lock().await;
    assert_eq!(ledger.bankroll(), dec!(10000));
    assert!(!ledger.is_market_busy("BTC"));
}

#[tokio::test]
async fn test_submit_timeout_reconciles_with_single_query() {
    let transport = Arc::new(SlowTransport {
        delay: Duration::from_millis(300),
        submissions: AtomicUsize::new(0),
        queries: AtomicUsize::new(0),
        answer: tokio::sync::Mutex::new(None),
    });
    let ledger = Ledger::new(dec!(10000)).shared();
    let policy = ExecutionPolicy {
        submit_timeout: Duration::from_millis(20),
        query_timeout: Duration::from_millis(200),
    };
    let coordinator = ExecutionCoordinator::new(Arc::clone(&transport), Arc::clone(&ledger), policy);

    let outcome = coordinator
        .submit(admitted("BTC", dec!(0.50), dec!(0.55)))
        .await
        .unwrap();

    assert!(outcome.is_applied());
    assert_eq!(transport.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.lock().await.position("BTC").unwrap().stake, dec!(500));
}

#[tokio::test]
async fn test_load_status_reads_snapshot_without_side_effects() {
    let order = admitted("BTC", dec!(0.50), dec!(0.55));
    let request = ExecutionRequest::open(order.order);
    let mut previous = Ledger::new(dec!(10000));
    previous.reserve(&request).unwrap();
    previous.mark_unknown(&request.token).unwrap();
    let mut gate = RiskGate::new(RiskLimits::default(), SizingRules::default());
    gate.force_halt("drawdown breached halt threshold");

    let saved_at = Utc::now();
    let snapshot = AgentSnapshot {
        version: SNAPSHOT_VERSION.to_string(),
        saved_at,
        ledger: previous.snapshot(),
        gate: gate.snapshot(),
        cycles: 12,
        total_trades: 5,
    };

    let mut repo = MockRepo::new();
    repo.expect_load_latest_state()
        .times(1)
        .returning(move || Ok(Some(snapshot.clone())));
    repo.expect_save_state().never();
    repo.expect_save_trade().never();

    let status = load_status(&repo, &config("")).await.unwrap();
    assert!(!status.running);
    assert_eq!(status.risk_state, RiskState::Halted);
    assert_eq!(status.unknown_requests, 1);
    assert_eq!(status.reserved, dec!(500));
    assert_eq!(status.bankroll, dec!(9500));
    assert_eq!(status.cycles, 12);
    assert_eq!(status.total_trades, 5);
    assert_eq!(status.last_scan, Some(saved_at));
}

#[tokio::test]
async fn test_load_status_without_snapshot_describes_fresh_start() {
    let mut repo = MockRepo::new();
    repo.expect_load_latest_state().times(1).returning(|| Ok(None));
    repo.expect_save_state().never();

    let status = load_status(&repo, &config("")).await.unwrap();
    assert_eq!(status.equity, dec!(10000));
    assert_eq!(status.risk_state, RiskState::Normal);
    assert_eq!(status.cycles, 0);
    assert_eq!(status.last_scan, None);
}

#[tokio::test]
async fn test_bootstrap_recovers_orphaned_request() {
    let order = admitted("BTC", dec!(0.50), dec!(0.55));
    let request = ExecutionRequest::open(order.order);
    let token = request.token;

    let mut previous = Ledger::new(dec!(10000));
    previous.reserve(&request).unwrap();
    let snapshot = AgentSnapshot {
        version: SNAPSHOT_VERSION.to_string(),
        saved_at: Utc::now(),
        ledger: previous.snapshot(),
        gate: GateSnapshot::default(),
        cycles: 7,
        total_trades: 3,
    };

    let mut repo = MockRepo::new();
    repo.expect_load_latest_state()
        .times(1)
        .returning(move || Ok(Some(snapshot.clone())));
    repo.expect_save_trade().times(1).returning(|_| Ok(()));
    repo.expect_save_state().returning(|_| Ok(()));

    let mut transport = MockTransport::new();
    transport.expect_submit_execution().never();
    transport
        .expect_query_status()
        .times(1)
        .returning(|token| Ok(ExecutionResult::filled(*token, dec!(0.50), dec!(1000))));

    let mut provider = MockSnapshots::new();
    provider.expect_fetch_opportunities().never();

    let mut agent = agent(
        &config(""),
        provider,
        MockEstimator::new(),
        transport,
        repo,
    );
    agent.bootstrap().await.unwrap();

    let status = agent.status().await;
    assert_eq!(status.cycles, 7);
    assert_eq!(status.total_trades, 4);
    assert_eq!(status.unknown_requests, 0);
    let ledger = agent.ledger().lock().await;
    assert!(ledger.is_applied(&token));
    assert_eq!(ledger.position("BTC").unwrap().quantity, dec!(1000));
}
