//! Herd - supervise concurrent sessions with a command-line AI assistant.
//!
//! The binary is a thin front-end over the library:
//! - `exec` runs one prompt with retry and prints the reply
//! - `session` relays stdin lines into one interactive session
//! - `health` and `config` print diagnostics

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

fn init_tracing(verbose: bool) {
    let default = if verbose { "herd=debug" } else { "herd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    execute(cli).await
}
