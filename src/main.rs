use anyhow::Result;
use clap::{Parser, Subcommand};
use fedrun::observability::LogFormat;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "fedrun")]
#[command(version, about = "Site worker for federated multi-round runs")]
pub struct Cli {
    /// Path to fedrun.toml. Defaults to ./fedrun.toml when present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Site identity. Overrides SITE_UID and [site] uid.
    #[arg(long, global = true)]
    pub site_uid: Option<String>,

    /// Router base URL. Overrides ROUTER_URL and [router] url.
    #[arg(long, global = true)]
    pub router_url: Option<String>,

    /// Directory for the status cache and default artifact root
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the site worker until interrupted
    Worker,
    /// Run one detection pass and print the runs it dispatches as JSON
    Poll {
        /// Execute one step for each dispatched run
        #[arg(long)]
        execute: bool,
        /// Run the monitor pass (stalled coordinator runs) instead of the poll pass
        #[arg(long)]
        monitor: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage the status cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Drive a coordinator and participants through a run in-process
    Simulate {
        /// Number of participant sites
        #[arg(long, default_value = "1")]
        participants: usize,

        /// Rounds of the task step
        #[arg(long, default_value = "1")]
        rounds: u64,

        /// Task model to run
        #[arg(long, default_value = "Echo")]
        model: String,

        /// Maximum detection passes per site
        #[arg(long, default_value = "50")]
        max_ticks: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report the first problem
    Validate,
    /// Write a default fedrun.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum CacheCommands {
    /// Drop every cached run snapshot
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Worker => cmd::cmd_worker(&cli).await?,
        Commands::Poll { execute, monitor } => cmd::cmd_poll(&cli, *execute, *monitor).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
        Commands::Cache { command } => cmd::cmd_cache(&cli, command.clone()).await?,
        Commands::Simulate {
            participants,
            rounds,
            model,
            max_ticks,
            json,
        } => {
            cmd::cmd_simulate(&cli, *participants, *rounds, model, *max_ticks, *json).await?;
        }
    }

    Ok(())
}
