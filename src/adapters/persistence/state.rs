//! State Store - Atomic JSON Agent State Persistence
//!
//! Saves agent snapshots to `state.json` using atomic writes
//! (write to tmp file, then rename), so the file is always either
//! the previous or the new snapshot, never a partial write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::ports::repository::{AgentSnapshot, SNAPSHOT_VERSION};

/// Atomic JSON state store for crash recovery.
pub struct StateStore {
    /// Path to state.json.
    state_path: PathBuf,
    /// Temporary path for atomic writes.
    tmp_path: PathBuf,
}

impl StateStore {
    /// Create a new state store in the given data directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub async fn new(data_dir: &str) -> Result<Self> {
        let dir = Path::new(data_dir);
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

        Ok(Self {
            state_path: dir.join("state.json"),
            tmp_path: dir.join("state.json.tmp"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Save a snapshot atomically (tmp -> rename).
    #[instrument(skip(self, state), fields(cycles = state.cycles))]
    pub async fn save(&self, state: &AgentSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;

        fs::write(&self.tmp_path, &json)
            .await
            .context("Failed to write tmp state file")?;

        fs::rename(&self.tmp_path, &self.state_path)
            .await
            .context("Failed to rename state file")?;

        debug!(
            path = %self.state_path.display(),
            positions = state.ledger.positions.len(),
            reservations = state.ledger.reservations.len(),
            "State snapshot saved"
        );

        Ok(())
    }

    /// Load the most recent snapshot.
    ///
    /// Returns `None` if no state file exists (first startup).
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Option<AgentSnapshot>> {
        if !fs::try_exists(&self.state_path).await.unwrap_or(false) {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.state_path)
            .await
            .context("Failed to read state file")?;

        let state: AgentSnapshot =
            serde_json::from_str(&json).context("Failed to parse state JSON")?;

        if state.version != SNAPSHOT_VERSION {
            warn!(
                found = %state.version,
                expected = SNAPSHOT_VERSION,
                "State snapshot version differs"
            );
        }
        info!(
            saved_at = %state.saved_at,
            positions = state.ledger.positions.len(),
            risk_state = %state.gate.state,
            "State snapshot loaded"
        );

        Ok(Some(state))
    }

    /// Check that the data directory is writable.
    pub async fn is_healthy(&self) -> bool {
        let Some(dir) = self.state_path.parent() else {
            return false;
        };
        fs::metadata(dir)
            .await
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false)
    }
}
