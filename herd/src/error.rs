//! Error types for the session engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::monitor::LimitBreach;
use crate::session::{SessionId, SessionStatus, StreamSource};

/// Result alias used throughout the library.
pub type Result<T, E = HerdError> = std::result::Result<T, E>;

/// Everything that can go wrong while supervising sessions.
#[derive(Debug, Error)]
pub enum HerdError {
    /// No admission slot became free before the caller's deadline.
    #[error("no session slot became available within {0:?}; close an idle session or raise max_sessions")]
    AdmissionTimeout(Duration),

    /// The external assistant binary could not be located.
    #[error("external tool `{0}` was not found on PATH; install it or set `command` in the config")]
    ToolNotFound(String),

    /// The resolved working directory does not exist.
    #[error("working directory {} does not exist or is not a directory", .0.display())]
    WorkingDir(PathBuf),

    /// The process could not be started or its pipes could not be attached.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Pseudo-terminal allocation or spawn through the PTY failed.
    #[error("failed to start `{command}` on a pseudo-terminal: {source}")]
    Pty {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// A command could not be delivered to the process input.
    #[error("failed to write to session {id}: {source}")]
    Write {
        id: SessionId,
        #[source]
        source: io::Error,
    },

    /// Reading one of the output streams failed.
    #[error("failed to read {stream} of session {id}: {source}")]
    Read {
        id: SessionId,
        stream: StreamSource,
        #[source]
        source: io::Error,
    },

    /// No open session has this id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// The operation is not allowed in the session's current status.
    #[error("session {id} is {status}; commands are accepted only while idle or waiting")]
    InvalidState { id: SessionId, status: SessionStatus },

    /// The supervised process exited with a non-zero code.
    #[error("process for session {id} exited with {}", describe_code(*.code))]
    ProcessExited { id: SessionId, code: Option<i32> },

    /// The OS no longer lists the session's process.
    #[error("process for session {id} is no longer running")]
    ProcessGone { id: SessionId },

    /// No output was seen for longer than the inactivity timeout.
    #[error("session {id} inactive for {idle:?} (timeout {timeout:?})")]
    Inactive {
        id: SessionId,
        idle: Duration,
        timeout: Duration,
    },

    /// A configured resource limit was breached.
    #[error("session {id} exceeded its {breach}")]
    LimitExceeded { id: SessionId, breach: LimitBreach },

    /// A one-shot execution or caller deadline ran out.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// A one-shot execution exited unsuccessfully.
    #[error("command exited with {}: {output}", describe_code(*.code))]
    NonZeroExit { code: Option<i32>, output: String },

    /// A one-shot execution exited cleanly but printed nothing.
    #[error("external tool returned an empty response")]
    EmptyResponse,

    /// Every retry attempt failed.
    #[error("giving up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<HerdError>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The supervisor no longer admits sessions.
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// Shutdown did not finish closing every session before its deadline.
    #[error("shutdown deadline reached with {pending} session(s) still closing")]
    ShutdownTimeout { pending: usize },

    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HerdError {
    /// Whether this error ends a retry loop instead of counting as a failed attempt.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ShuttingDown)
    }
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
}
