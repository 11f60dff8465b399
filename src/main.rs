//! FRED Agent — Entry Point
//!
//! Initializes configuration, logging and the paper adapters, then
//! runs the decision loop until SIGINT.
//!
//! Wiring sequence:
//! 1. Parse CLI flags, load config.toml + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Create the file repository (state.json + JSONL trades);
//!    `--status` prints the persisted status read-only and exits here
//! 4. Create the replay feed and paper transport
//! 5. Bootstrap the agent (restore snapshot, reconcile unknown requests)
//! 6. `--reset-halt` clears the halt and exits here
//! 7. Spawn metrics (/metrics) and health (/live + /ready) servers
//! 8. Spawn the status/metrics updater and the agent loop
//! 9. Wait for SIGINT → graceful shutdown (stop loop → save → exit)

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use fred_agent::adapters::metrics::{HealthServer, HealthState, MetricsRegistry};
use fred_agent::adapters::paper::{PaperTransport, ReplayFeed};
use fred_agent::adapters::persistence::FileRepository;
use fred_agent::config::loader::load_config;
use fred_agent::ports::repository::StateRepository;
use fred_agent::usecases::agent::{Agent, AgentError, AgentStatus, load_status};

/// Autonomous Kelly-sized trading agent.
#[derive(Parser, Debug)]
#[command(name = "fred-agent")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print the persisted agent status as JSON and exit
    #[arg(long)]
    status: bool,

    /// Clear a persisted risk halt and exit
    #[arg(long)]
    reset_halt: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── 1. Load configuration ───────────────────────────────
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level)),
        )
        .json()
        .init();

    info!(
        name = %config.agent.name,
        version = env!("CARGO_PKG_VERSION"),
        scan_interval_secs = config.agent.scan_interval_secs,
        "Starting FRED agent"
    );

    // ── 3. Persistence ──────────────────────────────────────
    let repository = Arc::new(
        FileRepository::from_data_dir(&config.persistence.data_dir)
            .await
            .context("Failed to open data directory")?,
    );

    if cli.status && !cli.reset_halt {
        let status = load_status(repository.as_ref(), &config)
            .await
            .context("Failed to read persisted status")?;
        return print_status(&status);
    }

    // ── 4. Paper adapters ───────────────────────────────────
    let replay_path = config
        .paper
        .replay_file
        .clone()
        .context("paper.replay_file must be set: no live venue adapter is configured")?;
    let feed = Arc::new(
        ReplayFeed::load(&replay_path, config.paper.loop_replay)
            .await
            .context("Failed to load replay feed")?,
    );
    let transport = Arc::new(PaperTransport::new(config.paper.slippage_bps));

    // ── 5. Bootstrap ────────────────────────────────────────
    let mut agent = Agent::new(
        &config,
        Arc::clone(&feed),
        Arc::clone(&feed),
        transport,
        Arc::clone(&repository),
    );
    agent.bootstrap().await.context("Failed to bootstrap agent")?;

    // ── 6. One-shot commands ────────────────────────────────
    if cli.reset_halt {
        agent.reset_halt().await.context("Failed to reset halt")?;
        info!("Risk halt cleared");
        return print_status(&agent.status().await);
    }

    // ── 7. Shutdown channel, metrics and health servers ─────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let health = Arc::new(HealthState::new());
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to register metrics")?);

    let mut server_handles = Vec::new();
    if config.metrics.enabled {
        let metrics_server = Arc::clone(&metrics);
        let bind_address = config.metrics.bind_address.clone();
        let rx = shutdown_tx.subscribe();
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = metrics_server.serve(bind_address, rx).await {
                error!(error = %e, "Metrics server failed");
            }
        }));

        let health_server = HealthServer::new(Arc::clone(&health), config.metrics.health_port);
        let rx = shutdown_tx.subscribe();
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = health_server.run(rx).await {
                error!(error = %e, "Health server failed");
            }
        }));
    }

    // ── 8. Status/metrics updater and agent loop ────────────
    let mut status_rx = agent.subscribe_status();
    let mut report_rx = agent.subscribe_reports();
    let updater_health = Arc::clone(&health);
    let updater_metrics = Arc::clone(&metrics);
    let updater_repository = Arc::clone(&repository);
    let mut updater_shutdown = shutdown_tx.subscribe();
    let updater_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = updater_shutdown.recv() => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    updater_health.update(&status);
                    updater_health.set_storage_healthy(updater_repository.is_healthy().await);
                    updater_metrics.observe_status(&status);
                }
                report = report_rx.recv() => match report {
                    Ok(report) => updater_metrics.observe_report(&report),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics updater lagged behind cycle reports");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let agent_shutdown = shutdown_tx.subscribe();
    let mut agent_handle = tokio::spawn(async move { agent.run(agent_shutdown).await });

    info!("All tasks spawned — agent is running");

    // ── 9. Wait for SIGINT or the agent stopping on its own ─
    let agent_result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received, initiating graceful shutdown");
            health.begin_shutdown();
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(30), &mut agent_handle).await {
                Ok(joined) => joined.context("Agent task panicked")?,
                Err(_) => {
                    warn!("Agent did not stop within 30s, aborting");
                    agent_handle.abort();
                    Ok(())
                }
            }
        }
        joined = &mut agent_handle => {
            health.begin_shutdown();
            let _ = shutdown_tx.send(());
            joined.context("Agent task panicked")?
        }
    };

    let _ = tokio::time::timeout(Duration::from_secs(5), updater_handle).await;
    for handle in server_handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    match agent_result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(AgentError::State(e)) => {
            error!(error = %e, "Agent halted on ledger inconsistency; manual reconciliation required");
            Err(AgentError::State(e).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_status(status: &AgentStatus) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(status).context("Failed to serialize status")?
    );
    Ok(())
}
