//! AutoRange CLI
//!
//! Inspects and controls the watchers running inside an autorange agent.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, watchers};

/// AutoRange CLI
#[derive(Parser)]
#[command(name = "arctl")]
#[command(author, version, about = "CLI for the AutoRange resource agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via ARCTL_API_URL env var)
    #[arg(long, env = "ARCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and control workload watchers
    #[command(subcommand)]
    Watchers(WatcherCommands),

    /// Show agent health
    Health,
}

#[derive(Subcommand)]
pub enum WatcherCommands {
    /// List all watchers
    List,

    /// Show one watcher and its learned values
    Show {
        /// Workload ID
        id: String,
    },

    /// Pause sampling for a workload
    Pause {
        /// Workload ID
        id: String,
    },

    /// Resume sampling for a paused workload
    Resume {
        /// Workload ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Watchers(cmd) => match cmd {
            WatcherCommands::List => watchers::list_watchers(&client, cli.format).await?,
            WatcherCommands::Show { id } => watchers::show_watcher(&client, &id, cli.format).await?,
            WatcherCommands::Pause { id } => watchers::pause_watcher(&client, &id, cli.format).await?,
            WatcherCommands::Resume { id } => {
                watchers::resume_watcher(&client, &id, cli.format).await?
            }
        },
        Commands::Health => health::show_health(&client, cli.format).await?,
    }

    Ok(())
}
