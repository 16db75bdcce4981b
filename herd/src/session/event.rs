//! Events published on a session's feeds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classify::OutputKind;
use super::state::SessionStatus;
use super::SessionId;

/// Which standard stream a line came from.
///
/// PTY sessions merge both streams and report everything as stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// One classified line of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub session_id: SessionId,
    /// The line as read, without its trailing newline.
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub source: StreamSource,
    pub kind: OutputKind,
}

/// A status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub session_id: SessionId,
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub at: DateTime<Utc>,
}
