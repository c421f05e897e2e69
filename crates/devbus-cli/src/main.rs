//! devbus CLI
//!
//! Tools for the devbus session layer:
//! - `soak`: drive many sessions across an impaired in-process link and
//!   verify ordered, exact delivery
//! - `config`: inspect and create the configuration file

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devbus_cli::commands::{self, SoakConfig};
use devbus_cli::output::{format_report, print_error, print_success};

#[derive(Parser)]
#[command(name = "devbus")]
#[command(author, version, about = "Reliable session layer for the developer message bus")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "DEVBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sessions over a lossy loopback link and verify delivery
    Soak {
        /// Soak parameters file (TOML); flags override its values
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Number of concurrent sessions
        #[arg(short, long)]
        sessions: Option<usize>,
        /// Messages per session
        #[arg(short, long)]
        messages: Option<u64>,
        /// Payload size in bytes
        #[arg(short, long)]
        payload_size: Option<usize>,
        /// Probability that a frame is dropped
        #[arg(long)]
        drop_rate: Option<f64>,
        /// Probability that a frame is duplicated
        #[arg(long)]
        duplicate_rate: Option<f64>,
        /// Probability that a frame is reordered
        #[arg(long)]
        reorder_rate: Option<f64>,
        /// Seed for the link impairments
        #[arg(long)]
        seed: Option<u64>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Soak {
            profile,
            sessions,
            messages,
            payload_size,
            drop_rate,
            duplicate_rate,
            reorder_rate,
            seed,
            timeout_secs,
            json,
        } => {
            let mut soak = commands::load_soak_config(profile.as_ref())?;
            if let Some(sessions) = sessions {
                soak.sessions = sessions;
            }
            if let Some(messages) = messages {
                soak.messages = messages;
            }
            if let Some(payload_size) = payload_size {
                soak.payload_size = payload_size;
            }
            if let Some(rate) = drop_rate {
                soak.link.drop_rate = rate;
            }
            if let Some(rate) = duplicate_rate {
                soak.link.duplicate_rate = rate;
            }
            if let Some(rate) = reorder_rate {
                soak.link.reorder_rate = rate;
            }
            if seed.is_some() {
                soak.link.seed = seed;
            }
            if let Some(secs) = timeout_secs {
                soak.timeout = Duration::from_secs(secs);
            }

            run_soak(cli.config.as_ref(), &soak, json, cli.quiet).await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(cli.config.as_ref())?,
            ConfigAction::Init { force } => commands::config_init(cli.config.as_ref(), force)?,
            ConfigAction::Path => commands::config_path(cli.config.as_ref())?,
        },
    }

    Ok(())
}

async fn run_soak(
    config_path: Option<&PathBuf>,
    soak: &SoakConfig,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let manager_config = commands::load_manager_config(config_path)?;

    match commands::run_soak(manager_config, soak).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if !quiet {
                println!("{}", format_report(&report));
                print_success(&format!(
                    "Delivered {} messages across {} sessions",
                    report.total_messages,
                    report.sessions.len()
                ));
            }
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Soak failed: {:#}", e));
            Err(e)
        }
    }
}
