use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tabled::{Table, Tabled};
use uuid::Uuid;

use crate::domain::{ConditionalTransfer, TransferDirection};

#[derive(Parser)]
#[command(name = "ratewatch")]
#[command(version)]
#[command(about = "Conditional currency transfer execution engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus <RATEWATCH_ENV>.toml)
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the trigger consumer and the pending sweeper until SIGTERM
    Worker {
        /// Do not run the periodic pending sweep in this process
        #[arg(long)]
        no_sweeper: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Create a conditional transfer (idempotent per key)
    Create {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        from_network: String,
        #[arg(long)]
        to_network: String,
        /// Source amount
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        target_rate: Decimal,
        /// GREATER_EQUAL (>=) or LESS_EQUAL (<=)
        #[arg(long, value_parser = parse_direction)]
        direction: TransferDirection,
        /// Minutes until the order expires
        #[arg(long, default_value = "60")]
        expires_in: i64,
        /// Generated when omitted
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// List a user's orders, newest first
    List {
        #[arg(long)]
        user: i64,
        #[arg(long, default_value = "1")]
        page: u32,
    },
    /// Show one order
    Show {
        #[arg(long)]
        user: i64,
        order_id: Uuid,
    },
    /// Cancel a PENDING order
    Cancel {
        #[arg(long)]
        user: i64,
        order_id: Uuid,
    },
    /// Evaluate one order now, outside the trigger channel
    Evaluate { order_id: Uuid },
}

pub fn parse_direction(s: &str) -> Result<TransferDirection, String> {
    TransferDirection::try_from(s)
}

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct TransferRow {
    pub order_id: String,
    pub pair: String,
    pub amount: String,
    pub condition: String,
    pub status: String,
    pub expires_at: String,
    pub transaction_id: String,
}

impl From<&ConditionalTransfer> for TransferRow {
    fn from(t: &ConditionalTransfer) -> Self {
        Self {
            order_id: t.order_id.to_string(),
            pair: format!(
                "{}@{} -> {}@{}",
                t.from_currency, t.from_network, t.to_currency, t.to_network
            ),
            amount: t.amount.to_string(),
            condition: format!(
                "rate {} {}",
                if t.direction == TransferDirection::GreaterEqual { ">=" } else { "<=" },
                t.target_rate
            ),
            status: t.status.to_string(),
            expires_at: t.expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            transaction_id: t.transaction_id.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Print orders in the chosen mode.
pub fn print_transfers(transfers: &[ConditionalTransfer], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if transfers.is_empty() {
                println!("(no results)");
            } else {
                let rows: Vec<TransferRow> = transfers.iter().map(TransferRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(transfers)?);
        }
    }
    Ok(())
}

/// Print a single Serialize item as pretty JSON in either mode.
pub fn print_item<T: Serialize>(item: &T, _mode: OutputMode) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(item)?);
    Ok(())
}
