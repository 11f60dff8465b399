//! File Repository - Concrete Adapter for the StateRepository Port
//!
//! Wraps `StateStore` (atomic JSON snapshots) and `TradeLogger` (JSONL
//! append-only files) into a single struct implementing
//! `StateRepository`. The use-case layer only knows the trait.

use anyhow::Result;
use async_trait::async_trait;

use super::state::StateStore;
use super::trades::TradeLogger;
use crate::ports::repository::{AgentSnapshot, StateRepository, TradeRecord};

/// Repository adapter combining state and trade persistence.
pub struct FileRepository {
    state_store: StateStore,
    trade_logger: TradeLogger,
}

impl FileRepository {
    pub fn new(state_store: StateStore, trade_logger: TradeLogger) -> Self {
        Self {
            state_store,
            trade_logger,
        }
    }

    /// Create both stores under `data_dir`, creating subdirectories as needed.
    pub async fn from_data_dir(data_dir: &str) -> Result<Self> {
        let state_store = StateStore::new(data_dir).await?;
        let trade_logger = TradeLogger::new(data_dir).await?;
        Ok(Self::new(state_store, trade_logger))
    }
}

#[async_trait]
impl StateRepository for FileRepository {
    async fn save_trade(&self, record: &TradeRecord) -> Result<()> {
        self.trade_logger.append_trade(record).await
    }

    async fn load_trades(&self) -> Result<Vec<TradeRecord>> {
        self.trade_logger.load_all_trades().await
    }

    async fn save_state(&self, state: &AgentSnapshot) -> Result<()> {
        self.state_store.save(state).await
    }

    async fn load_latest_state(&self) -> Result<Option<AgentSnapshot>> {
        self.state_store.load().await
    }

    async fn is_healthy(&self) -> bool {
        self.state_store.is_healthy().await && self.trade_logger.is_healthy().await
    }
}
