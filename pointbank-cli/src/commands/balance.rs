//! Balance command

use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use super::{get_context, parse_account};
use crate::output;

pub fn run(account: &str, json: bool) -> Result<()> {
    let id = parse_account(account)?;
    let ctx = get_context()?;
    let balance = ctx.ledger.get_balance(&id)?;

    if json {
        return output::json(&json!({ "account_id": id, "balance": balance }));
    }
    println!("{} {}", "Balance:".bold(), balance);
    Ok(())
}
