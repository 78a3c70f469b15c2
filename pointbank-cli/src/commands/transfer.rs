//! Transfer command - move points between accounts

use anyhow::Result;

use super::{get_context, operation_token, parse_account};
use crate::output;

pub fn run(
    from: &str,
    to: &str,
    amount: i64,
    key: &str,
    description: &str,
    json: bool,
) -> Result<()> {
    let from = parse_account(from)?;
    let to = parse_account(to)?;

    let ctx = get_context()?;
    let outcome = ctx
        .ledger
        .transfer(from, to, amount, key, description, &operation_token())?;

    if json {
        return output::json(&outcome);
    }

    if outcome.replayed {
        output::info("Already processed; returning the original transfer");
    } else {
        output::success("Transfer complete");
    }
    output::transaction(&outcome.transaction);
    println!("  {} balance: {}", outcome.from.name, outcome.from.balance);
    println!("  {} balance: {}", outcome.to.name, outcome.to.balance);
    Ok(())
}
