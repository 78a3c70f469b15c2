//! Bonus command - award a daily bonus

use anyhow::Result;
use pointbank_core::BonusOutcome;

use super::{get_context, operation_token, parse_account};
use crate::output;

pub fn run(account: &str, amount: i64, description: &str, json: bool) -> Result<()> {
    let account = parse_account(account)?;
    let ctx = get_context()?;
    let outcome = ctx
        .ledger
        .grant_bonus(account, amount, description, &operation_token())?;

    if json {
        return output::json(&outcome);
    }

    match outcome {
        BonusOutcome::Granted { transaction, account } => {
            output::success("Bonus granted");
            output::transaction(&transaction);
            println!("  Balance: {}", account.balance);
        }
        BonusOutcome::NoOp => {
            output::info("No bonus awarded (zero amount or bonuses disabled)");
        }
    }
    Ok(())
}
