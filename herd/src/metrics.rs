//! Process-wide session counters.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregate counters for one supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    /// Sessions that ended in `Closed`.
    pub completed_sessions: u64,
    /// Sessions that ended in `Error`.
    pub failed_sessions: u64,
    pub total_commands: u64,
    pub last_command_at: Option<DateTime<Utc>>,
}

/// [`ClientMetrics`] behind a single lock.
#[derive(Debug, Default)]
pub struct Metrics(Mutex<ClientMetrics>);

impl Metrics {
    /// Mutate the counters under the lock.
    pub fn apply(&self, f: impl FnOnce(&mut ClientMetrics)) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    pub fn snapshot(&self) -> ClientMetrics {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
