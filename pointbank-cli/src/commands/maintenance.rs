//! Maintenance commands - expiry sweep and idempotency key purge
//!
//! Meant to be run from a scheduler.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use super::{get_context, operation_token};
use crate::output;

pub fn run_sweep(limit: usize, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let report = ctx
        .ledger
        .sweep_expired_batches(Utc::now(), limit, &operation_token())?;

    if json {
        return output::json(&report);
    }

    if report.batches_expired == 0 {
        output::info("No expired batches");
        return Ok(());
    }
    output::success(&format!(
        "Expired {} batch(es) across {} account(s)",
        report.batches_expired, report.accounts_affected
    ));
    println!("  Points expired: {}", report.points_expired);
    if report.points_deducted > 0 {
        println!("  Points deducted from balances: {}", report.points_deducted);
    }
    if report.batches_expired == limit {
        output::warning("Limit reached; run again to continue");
    }
    Ok(())
}

pub fn run_purge_keys(json: bool) -> Result<()> {
    let ctx = get_context()?;
    let purged = ctx.ledger.purge_expired_keys(Utc::now())?;

    if json {
        return output::json(&json!({ "purged": purged }));
    }
    output::success(&format!("Purged {} expired idempotency key(s)", purged));
    Ok(())
}
