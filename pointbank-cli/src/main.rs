//! pointbank CLI - operate the points ledger from a terminal

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    account, admin, balance, bonus, doctor, exchange, expiring, history, maintenance, settings,
    status, transfer,
};

/// pointbank - internal points ledger
#[derive(Parser)]
#[command(name = "pb", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage accounts
    Account {
        #[command(subcommand)]
        command: account::AccountCommands,
    },

    /// Show an account's balance
    Balance {
        /// Account ID
        account: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move points between two accounts
    Transfer {
        /// Source account ID
        #[arg(long)]
        from: String,
        /// Destination account ID
        #[arg(long)]
        to: String,
        /// Points to move
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
    },

    /// Credit points to an account as an administrator
    Grant {
        #[command(flatten)]
        args: admin::AdminArgs,
    },

    /// Debit points from an account as an administrator
    Deduct {
        #[command(flatten)]
        args: admin::AdminArgs,
    },

    /// Charge points for a product exchange
    Exchange {
        /// Account ID
        #[arg(long)]
        account: String,
        /// Point cost
        #[arg(long)]
        cost: i64,
        /// Exchange reference (order id); retries with the same reference charge once
        #[arg(long)]
        reference: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Award a daily bonus
    Bonus {
        /// Account ID
        #[arg(long)]
        account: String,
        /// Bonus points (0 is a no-op)
        #[arg(long)]
        amount: i64,
        /// Free-text description
        #[arg(long, default_value = "daily bonus")]
        description: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an account's transactions, newest first
    History {
        /// Account ID
        account: String,
        /// Maximum number of transactions
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show points expiring soon
    Expiring {
        /// Account ID
        account: String,
        /// Horizon in days (policy default when omitted)
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..=pointbank_core::domain::MAX_DAYS))]
        days: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Zero out expired point batches
    Sweep {
        /// Maximum number of batches to expire
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete expired failed idempotency keys
    PurgeKeys {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage ledger policy overrides
    Settings {
        #[command(subcommand)]
        command: settings::SettingsCommands,
    },

    /// Show ledger summary
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run books consistency checks
    Doctor {
        /// Show verbose output
        #[arg(long, short)]
        verbose: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Account { command } => account::run(command),
        Commands::Balance { account, json } => balance::run(&account, json),
        Commands::Transfer { from, to, amount, key, description, json } => {
            transfer::run(&from, &to, amount, &key, &description, json)
        }
        Commands::Grant { args } => admin::run_grant(args),
        Commands::Deduct { args } => admin::run_deduct(args),
        Commands::Exchange { account, cost, reference, json } => {
            exchange::run(&account, cost, &reference, json)
        }
        Commands::Bonus { account, amount, description, json } => {
            bonus::run(&account, amount, &description, json)
        }
        Commands::History { account, limit, json } => history::run(&account, limit, json),
        Commands::Expiring { account, days, json } => expiring::run(&account, days, json),
        Commands::Sweep { limit, json } => maintenance::run_sweep(limit, json),
        Commands::PurgeKeys { json } => maintenance::run_purge_keys(json),
        Commands::Settings { command } => settings::run(command),
        Commands::Status { json } => status::run(json),
        Commands::Doctor { verbose, json } => doctor::run(verbose, json),
    }
}
