//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Herd - supervise concurrent sessions with a command-line AI assistant
#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: <config dir>/herd/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Assistant executable, overriding the config file
    #[arg(long, global = true)]
    pub command: Option<String>,

    /// Maximum concurrent sessions, overriding the config file
    #[arg(long, global = true)]
    pub max_sessions: Option<usize>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub subcommand: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one prompt non-interactively, retrying on failure
    Exec {
        /// Directory to run in
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Total attempts (default: from config)
        #[arg(long)]
        attempts: Option<u32>,

        /// Delay between attempts in milliseconds (default: from config)
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Overall deadline in seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,

        /// Prompt to send
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },

    /// Open an interactive session and relay stdin lines to it
    Session {
        /// Directory to run in
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Attach the assistant to a pseudo-terminal
        #[arg(long)]
        pty: bool,
    },

    /// Print a health report as JSON
    Health,

    /// Print the effective configuration as TOML
    Config,
}
