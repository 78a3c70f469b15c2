//! Expiring command - points that expire soon

use anyhow::{Context, Result};
use chrono::Duration;

use super::{get_context, parse_account};
use crate::output;

pub fn run(account: &str, days: Option<i64>, json: bool) -> Result<()> {
    let id = parse_account(account)?;
    let horizon = days
        .map(|d| Duration::try_days(d).with_context(|| format!("--days {} is out of range", d)))
        .transpose()?;
    let ctx = get_context()?;
    let expiring = ctx.ledger.get_expiring_points(&id, horizon)?;

    if json {
        return output::json(&expiring);
    }

    if expiring.is_empty() {
        output::info("No points expiring in this window");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Expires", "Points", "Source", "Batch"]);
    for entry in &expiring {
        table.add_row(vec![
            entry.expires_at.format("%Y-%m-%d %H:%M").to_string(),
            entry.amount.to_string(),
            entry.source.as_str().to_string(),
            entry.batch_id.to_string(),
        ]);
    }
    println!("{}", table);
    println!();
    println!(
        "{} point(s) expiring",
        expiring.iter().map(|e| e.amount).sum::<i64>()
    );
    Ok(())
}
