//! Settings command - ledger policy overrides stored in the database

use anyhow::Result;
use clap::Subcommand;
use pointbank_core::LedgerPolicy;
use serde_json::json;

use super::get_context;
use crate::output;

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Show stored overrides and the effective policy
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store an override, e.g. `pb settings set bonus_enabled false`
    Set {
        key: String,
        value: String,
    },
    /// Remove an override
    Unset {
        key: String,
    },
}

pub fn run(command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::List { json } => run_list(json),
        SettingsCommands::Set { key, value } => run_set(&key, &value),
        SettingsCommands::Unset { key } => run_unset(&key),
    }
}

fn run_list(json: bool) -> Result<()> {
    let ctx = get_context()?;
    let overrides = ctx.store.get_settings()?;
    let mut effective = ctx.config.ledger.clone();
    for (key, value) in &overrides {
        if let Err(e) = effective.apply_override(key, value) {
            output::warning(&format!("Ignoring bad override: {}", e));
        }
    }

    if json {
        let overrides: serde_json::Map<String, serde_json::Value> = overrides
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        return output::json(&json!({ "overrides": overrides, "effective": effective }));
    }

    if overrides.is_empty() {
        output::info("No overrides stored");
    } else {
        let mut table = output::create_table();
        table.set_header(vec!["Setting", "Value"]);
        for (key, value) in &overrides {
            table.add_row(vec![key.as_str(), value.as_str()]);
        }
        println!("{}", table);
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

fn run_set(key: &str, value: &str) -> Result<()> {
    // Reject values the policy could not apply later
    LedgerPolicy::default().apply_override(key, value)?;

    let ctx = get_context()?;
    ctx.store.set_setting(key, value)?;
    output::success(&format!("{} = {}", key, value));
    Ok(())
}

fn run_unset(key: &str) -> Result<()> {
    let ctx = get_context()?;
    if ctx.store.delete_setting(key)? {
        output::success(&format!("Removed {}", key));
    } else {
        output::info(&format!("{} was not set", key));
    }
    Ok(())
}
