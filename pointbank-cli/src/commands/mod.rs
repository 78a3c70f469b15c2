//! CLI command implementations

pub mod account;
pub mod admin;
pub mod balance;
pub mod bonus;
pub mod doctor;
pub mod exchange;
pub mod expiring;
pub mod history;
pub mod maintenance;
pub mod settings;
pub mod status;
pub mod transfer;

use std::path::PathBuf;

use anyhow::{Context, Result};
use pointbank_core::{AccountId, CancellationToken, PointbankContext};

/// Get the pointbank data directory from environment or default
pub fn get_pointbank_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("POINTBANK_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".pointbank"))
        .context("Could not find home directory; set POINTBANK_DIR")
}

/// Open the ledger in the data directory
pub fn get_context() -> Result<PointbankContext> {
    let dir = get_pointbank_dir()?;
    PointbankContext::new(&dir)
        .with_context(|| format!("Failed to open ledger in {}", dir.display()))
}

/// Parse an account id argument
pub fn parse_account(value: &str) -> Result<AccountId> {
    value
        .trim()
        .parse::<AccountId>()
        .with_context(|| format!("Invalid account id: {}", value))
}

/// Cancellation token for one CLI operation
///
/// The CLI runs one operation per process, so nothing cancels it; the
/// lock timeout still bounds how long it waits.
pub fn operation_token() -> CancellationToken {
    CancellationToken::new()
}
