//! Paper portfolio persistence.
//!
//! The portfolio (balance, open positions, closed trade ledger) lives in a
//! single JSON file so drawdown and daily trade counts survive a restart.
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-save leaves the previous state readable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::types::PortfolioState;

pub const DEFAULT_STATE_FILE: &str = "tradescout_portfolio.json";

#[derive(Debug, Clone)]
pub struct PortfolioStore {
    path: PathBuf,
}

impl PortfolioStore {
    /// Store at `path`, or [`DEFAULT_STATE_FILE`] in the working directory.
    pub fn new(path: Option<&str>) -> Self {
        Self {
            path: PathBuf::from(path.unwrap_or(DEFAULT_STATE_FILE)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn save(&self, state: &PortfolioState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).context("Failed to serialise portfolio state")?;
        let staging = self.staging_path();

        std::fs::write(&staging, &json)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("Failed to move portfolio into {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            balance = %state.balance,
            positions = state.positions.len(),
            "Portfolio saved"
        );
        Ok(())
    }

    /// `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<PortfolioState>> {
        let json = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No saved portfolio found");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        let state: PortfolioState = serde_json::from_slice(&json)
            .with_context(|| format!("Failed to parse portfolio from {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            balance = %state.balance,
            positions = state.positions.len(),
            trades = state.history.len(),
            "Portfolio loaded from disk"
        );
        Ok(Some(state))
    }

    /// Remove the saved portfolio and any half-written staging file.
    /// Returns whether a saved portfolio existed.
    pub fn clear(&self) -> Result<bool> {
        let staging = self.staging_path();
        if staging.exists() {
            warn!(path = %staging.display(), "Removing leftover staging file");
            std::fs::remove_file(&staging)
                .with_context(|| format!("Failed to delete {}", staging.display()))?;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Saved portfolio discarded");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", self.path.display())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
