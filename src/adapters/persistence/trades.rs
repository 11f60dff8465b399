//! Trade Logger - Append-only JSONL Trade Records
//!
//! Persists trade records to daily JSONL files in the format
//! `trades/YYYY-MM-DD.jsonl`. Each line is a self-contained JSON
//! record for easy parsing, streaming, and crash recovery.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::ports::repository::TradeRecord;

/// Append-only JSONL trade logger with daily file rotation.
pub struct TradeLogger {
    /// Base directory for trade files.
    trades_dir: PathBuf,
}

impl TradeLogger {
    /// Create a new trade logger in the given data directory.
    pub async fn new(data_dir: &str) -> Result<Self> {
        let trades_dir = Path::new(data_dir).join("trades");
        fs::create_dir_all(&trades_dir)
            .await
            .context("Failed to create trades directory")?;

        Ok(Self { trades_dir })
    }

    /// Append a trade record to the JSONL file of its day.
    #[instrument(skip(self, record), fields(token = %record.token, market = %record.market))]
    pub async fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let date = record.timestamp.format("%Y-%m-%d").to_string();
        let path = self.trades_dir.join(format!("{date}.jsonl"));

        let mut json = serde_json::to_string(record).context("Failed to serialize trade record")?;
        json.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open trade log file")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write trade record")?;

        file.flush().await.context("Failed to flush trade log")?;

        Ok(())
    }

    /// Load all trade records from all daily files, oldest first.
    #[instrument(skip(self))]
    pub async fn load_all_trades(&self) -> Result<Vec<TradeRecord>> {
        let mut trades = Vec::new();
        let mut entries = fs::read_dir(&self.trades_dir)
            .await
            .context("Failed to list trades directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                let content = fs::read_to_string(&path).await?;
                for line in content.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TradeRecord>(line) {
                        Ok(record) => trades.push(record),
                        Err(e) => {
                            warn!(
                                file = %path.display(),
                                error = %e,
                                "Skipping malformed trade record"
                            );
                        }
                    }
                }
            }
        }

        trades.sort_by_key(|t| t.timestamp);
        debug!(count = trades.len(), "Loaded trade records");
        Ok(trades)
    }

    /// Check if the trades directory is writable.
    pub async fn is_healthy(&self) -> bool {
        let test_path = self.trades_dir.join(".health_check");
        let result = fs::write(&test_path, b"ok").await;
        let _ = fs::remove_file(&test_path).await;
        result.is_ok()
    }
}
