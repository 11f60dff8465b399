//! Prometheus Metrics Registry - Agent Observability
//!
//! Registers and exposes Prometheus metrics for dashboards: cycle and
//! decision counters, execution outcomes, capital and drawdown gauges.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::usecases::agent::{AgentStatus, CycleReport};

/// Centralized Prometheus metrics for the agent.
///
/// All metrics follow the naming convention `fred_agent_*`.
pub struct MetricsRegistry {
    registry: Registry,
    /// Decision cycles run.
    pub cycles: IntCounter,
    /// Cycles skipped because the snapshot provider failed.
    pub degraded_cycles: IntCounter,
    /// Opportunities observed.
    pub opportunities: IntCounter,
    /// Opportunities discarded, by reason.
    pub discards: IntCounterVec,
    /// Orders admitted by the gate and handed to the transport.
    pub admissions: IntCounter,
    /// Orders rejected before submission, by reason.
    pub rejections: IntCounterVec,
    /// Execution outcomes, by status.
    pub executions: IntCounterVec,
    pub bankroll: Gauge,
    pub equity: Gauge,
    pub aggregate_exposure: Gauge,
    pub reserved: Gauge,
    pub realized_pnl: Gauge,
    pub drawdown: Gauge,
    pub peak_drawdown: Gauge,
    /// 0 = normal, 1 = restricted, 2 = halted.
    pub risk_state: IntGauge,
    pub open_positions: IntGauge,
    pub unknown_requests: IntGauge,
}

fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cycles = IntCounter::new("fred_agent_cycles_total", "Decision cycles run")?;
        let degraded_cycles = IntCounter::new(
            "fred_agent_degraded_cycles_total",
            "Cycles skipped because the snapshot provider failed",
        )?;
        let opportunities = IntCounter::new(
            "fred_agent_opportunities_total",
            "Opportunities observed",
        )?;
        let discards = IntCounterVec::new(
            Opts::new("fred_agent_discards_total", "Opportunities discarded before sizing"),
            &["reason"],
        )?;
        let admissions = IntCounter::new(
            "fred_agent_admissions_total",
            "Orders admitted and submitted",
        )?;
        let rejections = IntCounterVec::new(
            Opts::new("fred_agent_rejections_total", "Orders rejected before submission"),
            &["reason"],
        )?;
        let executions = IntCounterVec::new(
            Opts::new("fred_agent_executions_total", "Execution outcomes"),
            &["outcome"],
        )?;

        let bankroll = Gauge::new("fred_agent_bankroll", "Capital available for new stakes")?;
        let equity = Gauge::new("fred_agent_equity", "Cash plus marked position value")?;
        let aggregate_exposure = Gauge::new(
            "fred_agent_aggregate_exposure",
            "Sum of open position stakes",
        )?;
        let reserved = Gauge::new(
            "fred_agent_reserved",
            "Capital reserved by in-flight or unknown requests",
        )?;
        let realized_pnl = Gauge::new("fred_agent_realized_pnl", "Cumulative realized P&L")?;
        let drawdown = Gauge::new("fred_agent_drawdown", "Current drawdown from peak equity")?;
        let peak_drawdown = Gauge::new(
            "fred_agent_peak_drawdown",
            "Worst drawdown since the last equity peak",
        )?;
        let risk_state = IntGauge::new(
            "fred_agent_risk_state",
            "Risk gate state (0=normal, 1=restricted, 2=halted)",
        )?;
        let open_positions = IntGauge::new("fred_agent_open_positions", "Open positions")?;
        let unknown_requests = IntGauge::new(
            "fred_agent_unknown_requests",
            "Requests awaiting reconciliation",
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(degraded_cycles.clone()))?;
        registry.register(Box::new(opportunities.clone()))?;
        registry.register(Box::new(discards.clone()))?;
        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(bankroll.clone()))?;
        registry.register(Box::new(equity.clone()))?;
        registry.register(Box::new(aggregate_exposure.clone()))?;
        registry.register(Box::new(reserved.clone()))?;
        registry.register(Box::new(realized_pnl.clone()))?;
        registry.register(Box::new(drawdown.clone()))?;
        registry.register(Box::new(peak_drawdown.clone()))?;
        registry.register(Box::new(risk_state.clone()))?;
        registry.register(Box::new(open_positions.clone()))?;
        registry.register(Box::new(unknown_requests.clone()))?;

        Ok(Self {
            registry,
            cycles,
            degraded_cycles,
            opportunities,
            discards,
            admissions,
            rejections,
            executions,
            bankroll,
            equity,
            aggregate_exposure,
            reserved,
            realized_pnl,
            drawdown,
            peak_drawdown,
            risk_state,
            open_positions,
            unknown_requests,
        })
    }

    /// Count what a cycle did.
    pub fn observe_report(&self, report: &CycleReport) {
        self.cycles.inc();
        if report.degraded {
            self.degraded_cycles.inc();
        }
        self.opportunities.inc_by(report.opportunities as u64);
        for discard in &report.discards {
            self.discards.with_label_values(&[discard.reason]).inc();
        }
        for rejection in &report.rejections {
            self.rejections
                .with_label_values(&[rejection.reason.label()])
                .inc();
        }
        self.admissions.inc_by(report.outcomes.len() as u64);
        for outcome in &report.outcomes {
            self.executions.with_label_values(&[outcome.label()]).inc();
        }
    }

    /// Refresh gauges from the latest status.
    pub fn observe_status(&self, status: &AgentStatus) {
        self.bankroll.set(as_f64(status.bankroll));
        self.equity.set(as_f64(status.equity));
        self.aggregate_exposure.set(as_f64(status.aggregate_exposure));
        self.reserved.set(as_f64(status.reserved));
        self.realized_pnl.set(as_f64(status.realized_pnl));
        self.drawdown.set(as_f64(status.drawdown));
        self.peak_drawdown.set(as_f64(status.peak_drawdown));
        self.risk_state.set(status.risk_state.as_gauge());
        self.open_positions.set(as_i64(status.open_positions));
        self.unknown_requests.set(as_i64(status.unknown_requests));
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics = Arc::clone(&self);
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
