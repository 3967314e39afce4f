//! # mdsync
//!
//! CLI tool for inspecting and replaying mdsync state.
//!
//! ## Commands
//!
//! - `init`: Initialize the device data directory
//! - `status`: Show nonce and pending task counts
//! - `short-code`: Show the linking short code for a rendezvous path hash
//! - `replay`: Run reflected envelopes from a JSON file through the task manager
//!
//! ## Example
//!
//! ```bash
//! # Initialize device
//! mdsync init --label "Laptop"
//!
//! # Compare the code with the new device's screen
//! mdsync short-code 0080ff...
//!
//! # Replay captured reflections
//! mdsync replay --identity ECHOECHO reflections.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{init, replay, short_code, status};

/// CLI tool for inspecting and replaying mdsync state.
#[derive(Parser, Debug)]
#[command(name = "mdsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory holding the configuration and database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log task execution at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the device data directory
    Init {
        /// Device label shown to the other devices
        #[arg(long, short)]
        label: String,

        /// Platform hint, e.g. "desktop"
        #[arg(long)]
        platform: Option<String>,
    },

    /// Show nonce and pending task counts
    Status,

    /// Show the linking short code for a hex rendezvous path hash
    ShortCode {
        /// 32-byte rendezvous path hash, hex encoded
        rph: String,
    },

    /// Run reflected envelopes through the task manager
    Replay {
        /// Identity the envelopes were reflected to
        #[arg(long, short)]
        identity: String,

        /// JSON file containing an array of envelopes
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    match cli.command {
        Commands::Init { label, platform } => {
            init::run(&data_dir, &label, platform.as_deref()).await?;
        }
        Commands::Status => {
            status::run(&data_dir).await?;
        }
        Commands::Replay { identity, file } => {
            replay::run(&data_dir, &identity, &file).await?;
        }
        Commands::ShortCode { rph } => {
            short_code::run(&rph)?;
        }
    }

    Ok(())
}

/// Get the default data directory for mdsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "ydun", "mdsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
