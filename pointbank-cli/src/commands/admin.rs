//! Grant and deduct commands - administrative balance changes

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use pointbank_core::LedgerOutcome;

use super::{get_context, operation_token, parse_account};
use crate::output;

#[derive(Args)]
pub struct AdminArgs {
    /// Administrator account ID (recorded on the transaction)
    #[arg(long)]
    admin: String,
    /// Target account ID
    #[arg(long)]
    account: String,
    /// Points to grant or deduct
    #[arg(long)]
    amount: i64,
    /// Idempotency key; pass the same one when retrying
    #[arg(long)]
    key: String,
    /// Free-text description
    #[arg(long, default_value = "")]
    description: String,
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

pub fn run_grant(args: AdminArgs) -> Result<()> {
    let admin = parse_account(&args.admin)?;
    let target = parse_account(&args.account)?;

    let ctx = get_context()?;
    let outcome = ctx.ledger.grant_points(
        admin,
        target,
        args.amount,
        &args.key,
        &args.description,
        &operation_token(),
    )?;

    report(&outcome, "Points granted", args.json)
}

pub fn run_deduct(args: AdminArgs) -> Result<()> {
    let admin = parse_account(&args.admin)?;
    let target = parse_account(&args.account)?;

    let ctx = get_context()?;
    let outcome = ctx.ledger.deduct_points(
        admin,
        target,
        args.amount,
        &args.key,
        &args.description,
        &operation_token(),
    )?;

    report(&outcome, "Points deducted", args.json)
}

/// Print a single-account ledger outcome
pub fn report(outcome: &LedgerOutcome, headline: &str, json: bool) -> Result<()> {
    if json {
        return output::json(outcome);
    }

    if outcome.replayed {
        output::info("Already processed; returning the original result");
    } else {
        output::success(headline);
    }
    output::transaction(&outcome.transaction);
    println!("  Balance: {}", outcome.account.balance.to_string().bold());

    if let Some(report) = &outcome.consumption {
        if report.shortfall > 0 {
            output::warning(&format!(
                "  {} point(s) were not covered by point batches",
                report.shortfall
            ));
        }
    }
    Ok(())
}
