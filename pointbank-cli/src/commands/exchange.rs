//! Exchange command - charge points for a redemption

use anyhow::Result;

use super::admin::report;
use super::{get_context, operation_token, parse_account};

pub fn run(account: &str, cost: i64, reference: &str, json: bool) -> Result<()> {
    let account = parse_account(account)?;
    let ctx = get_context()?;
    let outcome = ctx
        .ledger
        .consume_for_exchange(account, cost, reference, &operation_token())?;

    report(&outcome, "Exchange charged", json)
}
