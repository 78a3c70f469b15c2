//! Configuration management
//!
//! Settings live in `<data dir>/settings.json`:
//! ```json
//! {
//!   "ledger": { "lockTimeoutMs": 5000, "batchTtlDays": { "bonus": 30 }, ... },
//!   "dbFilename": "pointbank.duckdb"
//! }
//! ```
//! Keys this crate does not manage are preserved on save.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{LedgerError, LedgerPolicy, Result};

pub const DEFAULT_DB_FILENAME: &str = "pointbank.duckdb";

/// Raw settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    ledger: LedgerPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    db_filename: Option<String>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// pointbank configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base ledger policy; `sys_settings` rows are layered over it per operation
    pub ledger: LedgerPolicy,
    pub db_filename: String,
    // Keep the raw settings for preservation when saving
    _raw_settings: SettingsFile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerPolicy::default(),
            db_filename: DEFAULT_DB_FILENAME.to_string(),
            _raw_settings: SettingsFile::default(),
        }
    }
}

impl Config {
    /// Load config from the data directory, then apply environment overrides
    ///
    /// - `POINTBANK_LOCK_TIMEOUT_MS`: lock wait timeout in milliseconds
    /// - `POINTBANK_DEDUCT_ON_EXPIRY`: debit expired points during sweeps
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut config = Self::from_file(data_dir)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.ledger.validate()?;
        Ok(config)
    }

    /// Load config from the data directory only
    pub fn from_file(data_dir: &Path) -> Result<Self> {
        let settings_path = data_dir.join("settings.json");

        let raw: SettingsFile = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content).map_err(|e| {
                LedgerError::Config(format!("{}: {}", settings_path.display(), e))
            })?
        } else {
            SettingsFile::default()
        };

        raw.ledger.validate().map_err(|e| match e {
            LedgerError::Config(msg) => {
                LedgerError::Config(format!("{}: {}", settings_path.display(), msg))
            }
            other => other,
        })?;

        Ok(Self {
            ledger: raw.ledger.clone(),
            db_filename: raw
                .db_filename
                .clone()
                .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string()),
            _raw_settings: raw,
        })
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("POINTBANK_LOCK_TIMEOUT_MS") {
            self.ledger.lock_timeout_ms = value.trim().parse().map_err(|_| {
                LedgerError::Config(format!("POINTBANK_LOCK_TIMEOUT_MS is not a number: {}", value))
            })?;
        }

        match lookup("POINTBANK_DEDUCT_ON_EXPIRY").as_deref() {
            Some("true" | "1" | "yes" | "TRUE" | "YES") => self.ledger.deduct_on_expiry = true,
            Some("false" | "0" | "no" | "FALSE" | "NO") => self.ledger.deduct_on_expiry = false,
            Some(other) => {
                return Err(LedgerError::Config(format!(
                    "POINTBANK_DEDUCT_ON_EXPIRY must be true or false, got {}",
                    other
                )))
            }
            None => {}
        }
        Ok(())
    }

    /// Save config to the data directory
    /// Preserves other settings this crate doesn't manage
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let settings_path = data_dir.join("settings.json");

        let mut settings = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str::<SettingsFile>(&content)
                .unwrap_or_else(|_| self._raw_settings.clone())
        } else {
            self._raw_settings.clone()
        };

        settings.ledger = self.ledger.clone();
        settings.db_filename = if self.db_filename == DEFAULT_DB_FILENAME {
            None
        } else {
            Some(self.db_filename.clone())
        };

        std::fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(&settings)?;
        std::fs::write(&settings_path, content)?;
        Ok(())
    }
}
