//! Account command - manage the account registry

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use pointbank_core::Account;

use super::{get_context, operation_token, parse_account};
use crate::output;

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Register a new account
    Create {
        /// Display name
        name: String,
        /// Use this id instead of generating one
        #[arg(long)]
        id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one account
    Show {
        /// Account ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all accounts
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Allow the account to take part in ledger operations again
    Activate {
        /// Account ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Block the account from ledger operations
    Deactivate {
        /// Account ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(command: AccountCommands) -> Result<()> {
    match command {
        AccountCommands::Create { name, id, json } => run_create(&name, id.as_deref(), json),
        AccountCommands::Show { id, json } => run_show(&id, json),
        AccountCommands::List { json } => run_list(json),
        AccountCommands::Activate { id, json } => run_set_active(&id, true, json),
        AccountCommands::Deactivate { id, json } => run_set_active(&id, false, json),
    }
}

fn run_create(name: &str, id: Option<&str>, json: bool) -> Result<()> {
    let id = id.map(parse_account).transpose()?;
    let ctx = get_context()?;
    let account = ctx.ledger.create_account(id, name)?;

    if json {
        return output::json(&account);
    }
    output::success("Account created");
    print_account(&account);
    Ok(())
}

fn run_show(id: &str, json: bool) -> Result<()> {
    let id = parse_account(id)?;
    let ctx = get_context()?;
    let account = ctx.ledger.get_account(&id)?;

    if json {
        return output::json(&account);
    }
    print_account(&account);
    Ok(())
}

fn run_list(json: bool) -> Result<()> {
    let ctx = get_context()?;
    let accounts = ctx.ledger.list_accounts()?;

    if json {
        return output::json(&accounts);
    }

    if accounts.is_empty() {
        output::info("No accounts yet. Create one with `pb account create <name>`.");
        return Ok(());
    }

    let mut table = output::create_table();
    table.set_header(vec!["ID", "Name", "Balance", "Active", "Created"]);
    for account in &accounts {
        table.add_row(vec![
            account.id.to_string(),
            account.name.clone(),
            account.balance.to_string(),
            if account.is_active { "yes" } else { "no" }.to_string(),
            account.created_at.format("%Y-%m-%d").to_string(),
        ]);
    }
    println!("{}", table);
    println!();
    println!("{} account(s)", accounts.len());
    Ok(())
}

fn run_set_active(id: &str, active: bool, json: bool) -> Result<()> {
    let id = parse_account(id)?;
    let ctx = get_context()?;
    let account = ctx.ledger.set_account_active(id, active, &operation_token())?;

    if json {
        return output::json(&account);
    }
    if active {
        output::success("Account activated");
    } else {
        output::warning("Account deactivated");
    }
    print_account(&account);
    Ok(())
}

fn print_account(account: &Account) {
    println!("  ID: {}", account.id);
    println!("  Name: {}", account.name.bold());
    println!("  Balance: {}", account.balance);
    println!(
        "  Status: {}",
        if account.is_active { "active".green() } else { "inactive".red() }
    );
    println!("  Created: {}", account.created_at.format("%Y-%m-%d %H:%M:%S"));
}
