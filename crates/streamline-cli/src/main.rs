//! Streamline CLI
//!
//! Replays recorded model streams through the content engine and prints the
//! blocks a chat UI would render.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use streamline_core::EngineConfig;
use tracing_subscriber::EnvFilter;

mod replay;

const DEFAULT_LOG_FILTER: &str = "streamline=info,streamline_core=info";

#[derive(Parser)]
#[command(name = "streamline", version, about)]
struct Cli {
    /// Config file (defaults to <config_dir>/streamline/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a recorded JSONL or SSE stream and print the final blocks
    Replay {
        /// Recorded stream, one event per line
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Session id to stream into (random when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Print a JSON summary instead of rendered blocks
        #[arg(long)]
        json: bool,

        /// Pause between events to mimic a live backend
        #[arg(long, value_name = "MS", default_value_t = 0)]
        delay_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config =
        EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Replay {
            file,
            session,
            json,
            delay_ms,
        } => {
            let options = replay::ReplayOptions {
                file,
                session,
                json,
                delay_ms,
            };
            replay::run(config, options).await
        }
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
