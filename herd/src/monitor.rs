//! Session health and resource monitoring.
//!
//! Each session runs a short-interval liveness poll (exit detection) and a
//! longer-interval health poll (inactivity and vanished processes). Both
//! report through the session's error feed and never block on it.
//! Resource limits are checked on demand against an OS sample.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Ticker;
use crate::config::ResourceLimits;
use crate::error::HerdError;
use crate::process::{ExitInfo, ProcessInspector, ProcessSample};
use crate::session::Session;

/// The first limit a session was found to exceed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "limit", rename_all = "lowercase")]
pub enum LimitBreach {
    Memory { used_mb: u64, max_mb: u64 },
    Cpu { used_percent: f64, max_percent: f64 },
    Duration { elapsed: Duration, max: Duration },
    Output { bytes: u64, max_bytes: u64 },
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory { used_mb, max_mb } => write!(f, "memory limit ({used_mb} MB > {max_mb} MB)"),
            Self::Cpu {
                used_percent,
                max_percent,
            } => write!(f, "CPU limit ({used_percent:.1}% > {max_percent:.1}%)"),
            Self::Duration { elapsed, max } => write!(f, "duration limit ({elapsed:?} > {max:?})"),
            Self::Output { bytes, max_bytes } => {
                write!(f, "output limit ({bytes} bytes > {max_bytes} bytes)")
            }
        }
    }
}

/// What `enforce_limits` does when a limit is exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    /// Return the breach and leave the session running.
    #[default]
    Report,
    /// Return the breach and close the session.
    Close,
}

/// Compare a sample against `limits`, in the order memory, CPU, duration, output.
///
/// Dimensions without a limit or without a measurement are skipped. CPU usage
/// is accumulated CPU time relative to the session's wall-clock age.
pub fn check_limits(
    limits: &ResourceLimits,
    sample: &ProcessSample,
    age: Duration,
    output_bytes: u64,
) -> Option<LimitBreach> {
    if let (Some(max_mb), Some(used_mb)) = (limits.max_memory_mb, sample.memory_mb()) {
        if used_mb > max_mb {
            return Some(LimitBreach::Memory { used_mb, max_mb });
        }
    }

    if let (Some(max_percent), Some(cpu)) = (limits.max_cpu_percent, sample.cpu_seconds()) {
        let wall = age.as_secs_f64();
        if wall > 0.0 {
            let used_percent = cpu / wall * 100.0;
            if used_percent > max_percent {
                return Some(LimitBreach::Cpu {
                    used_percent,
                    max_percent,
                });
            }
        }
    }

    if let Some(max) = limits.max_duration() {
        if age > max {
            return Some(LimitBreach::Duration { elapsed: age, max });
        }
    }

    if let Some(max_bytes) = limits.max_output_bytes {
        if output_bytes > max_bytes {
            return Some(LimitBreach::Output {
                bytes: output_bytes,
                max_bytes,
            });
        }
    }

    None
}

/// Sample `session` and check it against `limits`.
pub fn session_limits(
    session: &Session,
    inspector: &dyn ProcessInspector,
    limits: &ResourceLimits,
) -> Option<LimitBreach> {
    let sample = session
        .pid()
        .map_or_else(ProcessSample::unmeasurable, |pid| inspector.sample(pid));
    check_limits(limits, &sample, session.age(), session.output_bytes())
}

/// Problems with a session right now: inactivity and a vanished process.
pub fn check_health(
    session: &Session,
    inspector: &dyn ProcessInspector,
    inactivity_timeout: Duration,
) -> Vec<HerdError> {
    let mut issues = Vec::new();

    let idle = session.idle_for();
    if idle > inactivity_timeout {
        issues.push(HerdError::Inactive {
            id: session.id(),
            idle,
            timeout: inactivity_timeout,
        });
    }

    if !session.is_alive(inspector) {
        issues.push(HerdError::ProcessGone { id: session.id() });
    }

    issues
}

/// Periodically report health problems on the session's error feed.
pub(crate) fn spawn_health_task(
    session: Arc<Session>,
    inspector: Arc<dyn ProcessInspector>,
    mut ticker: Ticker,
    inactivity_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = session.cancel_token().clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = ticker.tick() => {}
            }
            for issue in check_health(&session, inspector.as_ref(), inactivity_timeout) {
                warn!(session_id = %session.id(), %issue, "health check failed");
                session.report_error(issue);
            }
        }
        debug!(session_id = %session.id(), "health task finished");
    })
}

/// Poll for process exit until it happens or the session is cancelled.
///
/// On exit the status moves to `Error` (non-zero or signal) and an exit error
/// is reported. Returns `None` when cancelled first.
pub(crate) async fn watch_exit(session: &Session, mut ticker: Ticker) -> Option<ExitInfo> {
    let cancel = session.cancel_token().clone();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = ticker.tick() => {}
        }
        match session.poll_exit() {
            Ok(Some(exit)) => {
                info!(session_id = %session.id(), code = ?exit.code, "session process exited");
                if !exit.success() {
                    session.fail();
                    session.report_error(HerdError::ProcessExited {
                        id: session.id(),
                        code: exit.code,
                    });
                }
                return Some(exit);
            }
            Ok(None) => {}
            Err(error) => warn!(session_id = %session.id(), %error, "failed to poll process exit"),
        }
    }
}
