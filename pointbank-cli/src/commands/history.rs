//! History command - an account's transactions, newest first

use anyhow::Result;

use super::{get_context, parse_account};
use crate::output;

pub fn run(account: &str, limit: usize, json: bool) -> Result<()> {
    let id = parse_account(account)?;
    let ctx = get_context()?;
    let transactions = ctx.ledger.account_history(&id, limit)?;

    if json {
        return output::json(&transactions);
    }

    if transactions.is_empty() {
        output::info("No transactions");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["Time", "Type", "Amount", "Counterparty", "Transaction"]);
    for tx in &transactions {
        let net = tx.net_effect_on(&id);
        let counterparty = if net < 0 { tx.to_account } else { tx.from_account };
        table.add_row(vec![
            tx.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            tx.tx_type.to_string(),
            format!("{:+}", net),
            counterparty.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            tx.id.to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}
