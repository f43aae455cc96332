use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `hivecore` - autonomous task-colony orchestrator.
#[derive(Parser, Debug)]
#[command(name = "hivecore")]
#[command(version)]
#[command(
    about = "Schedules a colony of units over signed state documents and an append-only ledger.",
    long_about = None
)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "hive.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the continuous scheduling loop
    Run,

    /// Execute one tick, wait for every run to settle, then exit
    Once,

    /// Show colony health: documents, quarantine, balance and runway
    Status,

    /// Force-dispatch one unit outside its schedule
    Spawn {
        /// Unit id to dispatch
        #[arg(long)]
        unit: String,

        /// Optional JSON payload handed to the unit
        #[arg(long)]
        data: Option<String>,
    },

    /// Publish an event onto the bus and process its subscribers
    Trigger {
        /// Event name
        #[arg(long)]
        event: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Re-admit a quarantined unit
    Readmit {
        /// Unit id to clear
        #[arg(long)]
        unit: String,
    },
}
