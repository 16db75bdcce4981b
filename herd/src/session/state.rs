//! Session status and its transitions.
//!
//! ```text
//! Idle --send--> Running --prompt--> Waiting --send--> Running
//!                   \--result--> Idle
//! any non-terminal --fault--> Error
//! any non-terminal --close--> Closed (terminal)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classify::OutputKind;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Ready for a command.
    Idle,
    /// A command was sent and no prompt or result has been seen yet.
    Running,
    /// The process asked for input.
    Waiting,
    /// A fatal I/O or process fault occurred.
    Error,
    /// The session is gone.
    Closed,
}

impl SessionStatus {
    pub const fn accepts_commands(self) -> bool {
        matches!(self, Self::Idle | Self::Waiting)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Status implied by an output line, if it causes a transition.
    pub const fn after_output(self, kind: OutputKind) -> Option<Self> {
        match (self, kind) {
            (Self::Running, OutputKind::Prompt) => Some(Self::Waiting),
            (Self::Running, OutputKind::Result) => Some(Self::Idle),
            _ => None,
        }
    }

    /// Final status after the process exited.
    pub const fn after_exit(success: bool) -> Self {
        if success {
            Self::Closed
        } else {
            Self::Error
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Closed => "closed",
        })
    }
}

/// A `(from, to)` pair produced by a successful transition.
pub type Transition = (SessionStatus, SessionStatus);

/// Mutable per-session state, guarded by the session's lock.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    /// Set once the process exit has been observed.
    pub exit_code: Option<Option<i32>>,
}

impl SessionState {
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: SessionStatus::Idle,
            last_activity: now,
            exit_code: None,
        }
    }

    /// Enter `Running` for a new command, or report the blocking status.
    pub fn begin_command(&mut self, now: DateTime<Utc>) -> Result<Transition, SessionStatus> {
        if !self.status.accepts_commands() {
            return Err(self.status);
        }
        self.last_activity = now;
        Ok(self.set(SessionStatus::Running))
    }

    /// Record a classified line; returns the transition it caused, if any.
    pub fn apply_output(&mut self, kind: OutputKind, now: DateTime<Utc>) -> Option<Transition> {
        if self.status.is_terminal() {
            return None;
        }
        self.last_activity = now;
        self.status.after_output(kind).map(|to| self.set(to))
    }

    /// Move to `Error` unless already closed or failed.
    pub fn fail(&mut self) -> Option<Transition> {
        match self.status {
            SessionStatus::Closed | SessionStatus::Error => None,
            _ => Some(self.set(SessionStatus::Error)),
        }
    }

    /// Apply the final status of a destroyed session. Closing is idempotent.
    pub fn finish(&mut self, final_status: SessionStatus) -> Option<Transition> {
        if self.status.is_terminal() || self.status == final_status {
            return None;
        }
        Some(self.set(final_status))
    }

    fn set(&mut self, to: SessionStatus) -> Transition {
        let from = self.status;
        self.status = to;
        (from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(Utc::now())
    }

    #[test]
    fn test_commands_only_from_idle_or_waiting() {
        let mut s = state();
        assert_eq!(
            s.begin_command(Utc::now()),
            Ok((SessionStatus::Idle, SessionStatus::Running))
        );
        assert_eq!(s.begin_command(Utc::now()), Err(SessionStatus::Running));

        s.status = SessionStatus::Waiting;
        assert!(s.begin_command(Utc::now()).is_ok());

        s.status = SessionStatus::Error;
        assert_eq!(s.begin_command(Utc::now()), Err(SessionStatus::Error));
    }

    #[test]
    fn test_prompt_and_result_only_matter_while_running() {
        let mut s = state();
        assert_eq!(s.apply_output(OutputKind::Result, Utc::now()), None);

        s.begin_command(Utc::now()).unwrap();
        assert_eq!(s.apply_output(OutputKind::Text, Utc::now()), None);
        assert_eq!(
            s.apply_output(OutputKind::Prompt, Utc::now()),
            Some((SessionStatus::Running, SessionStatus::Waiting))
        );
        assert_eq!(s.apply_output(OutputKind::Result, Utc::now()), None);

        s.begin_command(Utc::now()).unwrap();
        assert_eq!(
            s.apply_output(OutputKind::Result, Utc::now()),
            Some((SessionStatus::Running, SessionStatus::Idle))
        );
        assert_eq!(s.apply_output(OutputKind::Result, Utc::now()), None);
    }

    #[test]
    fn test_output_refreshes_activity() {
        let start = Utc::now();
        let mut s = SessionState::new(start);
        let later = start + chrono::TimeDelta::seconds(5);
        s.apply_output(OutputKind::Text, later);
        assert_eq!(s.last_activity, later);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut s = state();
        assert!(s.finish(SessionStatus::Closed).is_some());
        assert_eq!(s.finish(SessionStatus::Closed), None);
        assert_eq!(s.finish(SessionStatus::Error), None);
        assert_eq!(s.fail(), None);
        assert_eq!(s.apply_output(OutputKind::Prompt, Utc::now()), None);
        assert_eq!(s.status, SessionStatus::Closed);
    }

    #[test]
    fn test_exit_keeps_error_but_close_overrides_it() {
        let mut s = state();
        s.fail();
        assert_eq!(s.finish(SessionStatus::after_exit(false)), None);
        assert_eq!(s.status, SessionStatus::Error);

        let mut s = state();
        s.fail();
        assert_eq!(
            s.finish(SessionStatus::Closed),
            Some((SessionStatus::Error, SessionStatus::Closed))
        );
    }
}
