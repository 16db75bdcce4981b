//! Supervisor configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a working configuration that drives the `claude` CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HerdError, Result};

const CONFIG_DIR: &str = "herd";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration for a [`crate::Supervisor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Executable name or path of the assistant CLI.
    pub command: String,

    /// Arguments for interactive sessions.
    pub session_args: Vec<String>,

    /// Arguments placed before the prompt for one-shot execution.
    pub exec_args: Vec<String>,

    /// Start bare command names through a shell so aliases resolve.
    pub use_shell: bool,

    /// Shell used for indirection (default: `$SHELL`, then `/bin/sh`).
    pub shell: Option<String>,

    /// Default working directory for sessions without one.
    pub working_dir: Option<PathBuf>,

    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,

    /// How long session creation may wait for a free slot.
    pub admission_timeout_ms: u64,

    /// Maximum lifetime of a session; unset means unbounded.
    pub session_timeout_ms: Option<u64>,

    /// Silence after which the health check flags a session.
    pub inactivity_timeout_ms: u64,

    /// Upper bound for a single one-shot execution.
    pub exec_timeout_ms: u64,

    /// Period of the per-session health poll.
    pub health_check_interval_ms: u64,

    /// Period of the per-session process-exit poll.
    pub liveness_interval_ms: u64,

    /// Capacity of each per-session event queue.
    pub queue_capacity: usize,

    /// Attach sessions to a pseudo-terminal instead of pipes.
    pub pty: bool,
    /// Terminal size for PTY sessions.
    pub pty_rows: u16,
    pub pty_cols: u16,

    /// Retry policy for `herd exec`.
    pub retry: RetryConfig,
    /// Limits callers pass to `Supervisor::enforce_limits`.
    pub limits: ResourceLimits,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            session_args: Vec::new(),
            exec_args: vec!["-p".to_string()],
            use_shell: true,
            shell: None,
            working_dir: None,
            max_sessions: 5,
            admission_timeout_ms: 30_000,
            session_timeout_ms: Some(60 * 60 * 1000),
            inactivity_timeout_ms: 5 * 60 * 1000,
            exec_timeout_ms: 120_000,
            health_check_interval_ms: 30_000,
            liveness_interval_ms: 1_000,
            queue_capacity: 256,
            pty: false,
            pty_rows: 24,
            pty_cols: 80,
            retry: RetryConfig::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `<config dir>/herd/config.toml`
    /// is used when present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(p) => p,
                None => {
                    debug!("no config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .map_err(|e| HerdError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| HerdError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HerdError::Config(e.to_string()))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(HerdError::Config("`command` must not be empty".into()));
        }
        if self.max_sessions == 0 {
            return Err(HerdError::Config("`max_sessions` must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(HerdError::Config("`queue_capacity` must be at least 1".into()));
        }
        if self.health_check_interval_ms == 0 || self.liveness_interval_ms == 0 {
            return Err(HerdError::Config("poll intervals must be non-zero".into()));
        }
        if self.exec_timeout_ms == 0 {
            return Err(HerdError::Config("`exec_timeout_ms` must be non-zero".into()));
        }
        self.retry.validate()
    }

    /// Default wait for an admission slot.
    pub const fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Default session lifetime, if any.
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    /// Idle time after which a session is reported inactive.
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Upper bound on a single one-shot attempt.
    pub const fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    /// Period of the per-session health poll.
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Period of the per-session exit poll.
    pub const fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Shell used for command indirection.
    pub fn shell_program(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// `<config dir>/herd/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// `delay * multiplier^(n-1)`, capped at `max_delay_ms`.
    Exponential,
}

/// Retry policy for one-shot execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay_ms: u64,
    pub backoff: Backoff,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Randomize each delay within `[d/2, d]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1_000,
            backoff: Backoff::Fixed,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Fixed-delay policy.
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: duration_ms(delay),
            backoff: Backoff::Fixed,
            multiplier: 2.0,
            max_delay_ms: duration_ms(delay),
            jitter: false,
        }
    }

    /// Exponential policy starting at `delay`, never exceeding `max_delay`.
    pub const fn exponential(max_attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: duration_ms(delay),
            backoff: Backoff::Exponential,
            multiplier: 2.0,
            max_delay_ms: duration_ms(max_delay),
            jitter: false,
        }
    }

    /// Reject policies that can never run.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HerdError::Config("`retry.max_attempts` must be at least 1".into()));
        }
        if self.backoff == Backoff::Exponential && self.multiplier < 1.0 {
            return Err(HerdError::Config("`retry.multiplier` must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Delay to wait after the `failed_attempt`-th failure (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => Duration::from_millis(self.delay_ms),
            Backoff::Exponential => {
                let exp = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                #[allow(clippy::cast_precision_loss)]
                let scaled = self.delay_ms as f64 * self.multiplier.powi(exp);
                #[allow(clippy::cast_precision_loss)]
                let capped = scaled.min(self.max_delay_ms as f64);
                Duration::from_millis(capped as u64)
            }
        };
        if self.jitter && !base.is_zero() {
            let half = base / 2;
            half + rand::rng().random_range(Duration::ZERO..=half)
        } else {
            base
        }
    }
}

/// Per-session resource ceilings. `None` disables a dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    pub max_duration_ms: Option<u64>,
    pub max_output_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    /// Whether any dimension is limited.
    pub const fn is_unbounded(&self) -> bool {
        self.max_memory_mb.is_none()
            && self.max_cpu_percent.is_none()
            && self.max_duration_ms.is_none()
            && self.max_output_bytes.is_none()
    }
}

const fn duration_ms(d: Duration) -> u64 {
    let ms = d.as_millis();
    if ms > u64::MAX as u128 {
        u64::MAX
    } else {
        ms as u64
    }
}
