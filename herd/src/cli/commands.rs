//! CLI command execution.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use herd::{HerdError, SessionRequest, SessionStatus, Supervisor, SupervisorConfig};

use super::args::{Cli, Commands};

/// How long a closing CLI waits for sessions to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.subcommand {
        Commands::Exec {
            dir,
            attempts,
            delay_ms,
            timeout_secs,
            prompt,
        } => {
            let prompt = prompt.join(" ");
            if prompt.trim().is_empty() {
                bail!("Prompt is required for exec command");
            }
            run_exec(config, &prompt, dir, attempts, delay_ms, Duration::from_secs(timeout_secs)).await
        }
        Commands::Session { dir, pty } => run_session(config, dir, pty).await,
        Commands::Health => show_health(config).await,
        Commands::Config => show_config(&config),
    }
}

/// Load the config file and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<SupervisorConfig> {
    let mut config = SupervisorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(ref command) = cli.command {
        config.command.clone_from(command);
    }
    if let Some(max_sessions) = cli.max_sessions {
        config.max_sessions = max_sessions;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_exec(
    config: SupervisorConfig,
    prompt: &str,
    dir: Option<PathBuf>,
    attempts: Option<u32>,
    delay_ms: Option<u64>,
    deadline: Duration,
) -> Result<()> {
    let mut policy = config.retry.clone();
    if let Some(attempts) = attempts {
        policy.max_attempts = attempts;
    }
    if let Some(delay_ms) = delay_ms {
        policy.delay_ms = delay_ms;
    }
    policy.validate().context("Invalid retry options")?;

    let supervisor = Supervisor::new(config)?;
    let reply = supervisor
        .execute(prompt, dir.as_deref(), &policy, deadline)
        .await
        .context("Request failed")?;
    println!("{reply}");
    Ok(())
}

async fn run_session(config: SupervisorConfig, dir: Option<PathBuf>, pty: bool) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    let mut request = SessionRequest::new().pty(pty);
    if let Some(dir) = dir {
        request = request.working_dir(dir);
    }

    let mut handle = supervisor
        .create_session(request)
        .await
        .context("Failed to open session")?;
    let id = handle.id();
    eprintln!("session {id} open (Ctrl-D or Ctrl-C to close)");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
            line = stdin.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if let Err(e) = supervisor.send_command(id, &line).await {
                        eprintln!("not sent: {e}");
                    }
                }
                None => break,
            },
            Some(event) = handle.output.recv() => println!("[{}] {}", event.kind, event.content),
            Some(change) = handle.status.recv() => {
                eprintln!("status: {} -> {}", change.from, change.to);
                if matches!(change.to, SessionStatus::Closed) {
                    break;
                }
            }
            Some(error) = handle.errors.recv() => eprintln!("error: {error}"),
            else => break,
        }
        if handle.session().is_closed() {
            break;
        }
    }

    while let Ok(event) = handle.output.try_recv() {
        println!("[{}] {}", event.kind, event.content);
    }

    match supervisor.close_session(id).await {
        Ok(()) | Err(HerdError::SessionNotFound(_)) => {}
        Err(e) => return Err(e).context("Failed to close session"),
    }
    supervisor.shutdown(SHUTDOWN_GRACE).await?;

    let status = handle.session().status();
    eprintln!("session {id} ended ({status})");
    if status == SessionStatus::Error {
        bail!("session ended with an error");
    }
    Ok(())
}

async fn show_health(config: SupervisorConfig) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    let status = supervisor.health_check().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn show_config(config: &SupervisorConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
