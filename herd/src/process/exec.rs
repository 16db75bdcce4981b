//! Non-interactive, single round-trip execution.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use super::spawn::{resolve_working_dir, spawn_process, ProcessOptions};
use crate::clock::Clock;
use crate::config::SupervisorConfig;
use crate::error::{HerdError, Result};

/// Headroom kept between the internal timeout and the caller's budget.
const MAX_MARGIN: Duration = Duration::from_secs(5);

/// Longest output kept in a [`HerdError::NonZeroExit`] message.
const ERROR_OUTPUT_LIMIT: usize = 2_000;

/// Internal timeout for one execution: shorter than `budget`, never above `cap`.
pub fn internal_timeout(cap: Duration, budget: Duration) -> Duration {
    let margin = (budget / 10).min(MAX_MARGIN);
    budget.saturating_sub(margin).min(cap)
}

/// Run the assistant once with `prompt` as its final argument.
///
/// Fails with [`HerdError::DeadlineExceeded`] if the internal timeout fires,
/// [`HerdError::NonZeroExit`] on an unsuccessful exit, and
/// [`HerdError::EmptyResponse`] when the process succeeds without printing
/// anything.
pub async fn execute_once(
    config: &SupervisorConfig,
    clock: &dyn Clock,
    prompt: &str,
    working_dir: Option<&Path>,
    budget: Duration,
) -> Result<String> {
    let dir = resolve_working_dir(working_dir, config.working_dir.as_deref())?;
    let limit = internal_timeout(config.exec_timeout(), budget);

    let options = ProcessOptions::for_command(config)
        .args(config.exec_args.iter().cloned())
        .arg(prompt)
        .working_dir(&dir)
        .timeout(limit);

    debug!(command = %config.command, dir = %dir.display(), timeout = ?limit, "executing one-shot request");
    let result = spawn_process(options, clock).await?;

    if result.timed_out {
        warn!(command = %config.command, timeout = ?limit, "one-shot request timed out");
        return Err(HerdError::DeadlineExceeded(limit));
    }

    let output = result.combined_string();
    if !result.success() {
        return Err(HerdError::NonZeroExit {
            code: result.code(),
            output: truncate(output.trim(), ERROR_OUTPUT_LIMIT),
        });
    }

    let reply = output.trim();
    if reply.is_empty() {
        return Err(HerdError::EmptyResponse);
    }
    Ok(reply.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn config(command: &str, exec_args: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            command: command.to_string(),
            exec_args: exec_args.iter().map(ToString::to_string).collect(),
            use_shell: false,
            ..SupervisorConfig::default()
        }
    }

    const BUDGET: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_returns_trimmed_reply() {
        let reply = execute_once(&config("echo", &[]), &SystemClock, "  hello there ", None, BUDGET)
            .await
            .unwrap();
        assert_eq!(reply, "hello there");
    }

    #[tokio::test]
    async fn test_empty_output_with_success_is_a_failure() {
        let err = execute_once(&config("true", &[]), &SystemClock, "anything", None, BUDGET)
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_output() {
        let err = execute_once(
            &config("sh", &["-c", "echo boom >&2; exit 7"]),
            &SystemClock,
            "ignored",
            None,
            BUDGET,
        )
        .await
        .unwrap_err();
        match err {
            HerdError::NonZeroExit { code, output } => {
                assert_eq!(code, Some(7));
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_slow_process_exceeds_deadline() {
        let err = execute_once(&config("sleep", &[]), &SystemClock, "5", None, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::DeadlineExceeded(d) if d < Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn test_runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found").unwrap();
        let reply = execute_once(&config("cat", &[]), &SystemClock, "marker.txt", Some(dir.path()), BUDGET)
            .await
            .unwrap();
        assert_eq!(reply, "found");
    }

    #[test]
    fn test_internal_timeout_is_shorter_than_budget() {
        let cap = Duration::from_secs(120);
        assert_eq!(internal_timeout(cap, Duration::from_secs(10)), Duration::from_secs(9));
        assert_eq!(internal_timeout(cap, Duration::from_secs(600)), Duration::from_secs(120));
        assert_eq!(internal_timeout(cap, Duration::from_secs(100)), Duration::from_secs(95));
        assert!(internal_timeout(cap, Duration::from_millis(300)) < Duration::from_millis(300));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
