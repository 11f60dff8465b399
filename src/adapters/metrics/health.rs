//! Health Check Server - Liveness and Readiness Probes
//!
//! Exposes /live and /ready endpoints via axum 0.7. The agent is ready
//! while its loop runs, the risk gate is not halted and the state
//! repository can be written.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::usecases::agent::AgentStatus;
use crate::usecases::risk_gate::RiskState;

/// Shared health state polled by readiness probes.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Whether the agent loop is running.
    agent_running: AtomicBool,
    /// Whether the risk gate is halted.
    halted: AtomicBool,
    /// Set once shutdown begins.
    shutting_down: AtomicBool,
    /// Last repository health check failed.
    storage_unhealthy: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror the latest agent status.
    pub fn update(&self, status: &AgentStatus) {
        self.agent_running.store(status.running, Ordering::Relaxed);
        self.halted
            .store(status.risk_state == RiskState::Halted, Ordering::Relaxed);
    }

    /// Record the result of `StateRepository::is_healthy`.
    pub fn set_storage_healthy(&self, healthy: bool) {
        self.storage_unhealthy.store(!healthy, Ordering::Relaxed);
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Ready while running with writable storage, not halted and not
    /// shutting down.
    pub fn is_ready(&self) -> bool {
        self.agent_running.load(Ordering::Relaxed)
            && !self.halted.load(Ordering::Relaxed)
            && !self.shutting_down.load(Ordering::Relaxed)
            && !self.storage_unhealthy.load(Ordering::Relaxed)
    }
}

/// Axum-based health check HTTP server.
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve the probes until shutdown.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .with_state(Arc::clone(&self.state));

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(address = %addr, "Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Liveness probe: 200 while the process runs.
    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    /// Readiness probe: 503 while halted, shutting down or unable to persist.
    async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
        if state.is_ready() {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}
