//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tollgate_core::{config, logging};

use crate::prompt::ResolverMode;

mod commands;

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(version = "0.1")]
#[command(about = "Event router and tool approval gate for agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Replays recorded agent event feeds (JSONL), one connection per file
    Replay {
        /// Event feed files
        #[arg(value_name = "FEED", required = true)]
        feeds: Vec<PathBuf>,

        /// How permission requests are answered
        #[arg(long, value_enum, env = "TOLLGATE_DECISION", default_value = "ask")]
        decision: ResolverMode,

        /// Tool displays per scope that stay expanded (overrides config)
        #[arg(long, value_name = "N")]
        recent: Option<usize>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            feeds,
            decision,
            recent,
        } => replay(&feeds, decision, recent),

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}

fn replay(feeds: &[PathBuf], decision: ResolverMode, recent: Option<usize>) -> Result<()> {
    let mut config = config::Config::load().context("load config")?;
    if let Some(recent) = recent {
        config.transcript.recent_tools_expanded = recent;
    }
    let _log_guard = logging::init(&config.logging).context("init logging")?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    let result = rt.block_on(commands::replay::run(feeds, decision, config));
    // A pending stdin read must not keep the process alive.
    rt.shutdown_background();
    result
}
