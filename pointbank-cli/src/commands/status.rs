//! Status command - ledger summary

use anyhow::Result;
use colored::Colorize;
use comfy_table::{ContentArrangement, Table};

use super::get_context;
use crate::output;

pub fn run(json: bool) -> Result<()> {
    let ctx = get_context()?;
    let status = ctx.status_service.get_status()?;

    if json {
        return output::json(&status);
    }

    println!("{}", "Ledger Status".bold());
    println!();

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.add_row(vec![
        "Accounts".to_string(),
        format!("{} ({} active)", status.total_accounts, status.active_accounts),
    ]);
    table.add_row(vec!["Points in circulation".to_string(), status.total_points.to_string()]);
    table.add_row(vec!["Transactions".to_string(), status.total_transactions.to_string()]);
    table.add_row(vec![
        "Open batches".to_string(),
        format!("{} ({} points)", status.open_batches, status.outstanding_batch_points),
    ]);
    if let Some(path) = &status.db_path {
        table.add_row(vec![
            "Database".to_string(),
            format!("{} ({})", path, output::format_size(status.db_size_bytes)),
        ]);
    }

    println!("{}", table);
    println!();

    if !status.transactions_by_type.is_empty() {
        println!("{}", "Transactions by type".bold());
        for (tx_type, count) in &status.transactions_by_type {
            println!("  • {}: {}", tx_type, count);
        }
        println!();
    }

    if !status.keys_by_status.is_empty() {
        println!("{}", "Idempotency keys".bold());
        for (key_status, count) in &status.keys_by_status {
            println!("  • {}: {}", key_status, count);
        }
    }

    Ok(())
}
