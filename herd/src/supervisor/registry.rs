//! Open sessions and the counters that track them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::metrics::Metrics;
use crate::session::{Session, SessionId, SessionStatus};

#[derive(Debug, Default)]
pub(crate) struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    pub(crate) metrics: Metrics,
}

impl Registry {
    pub(crate) async fn insert(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.id(), session);
        self.metrics.apply(|m| {
            m.total_sessions += 1;
            m.active_sessions += 1;
        });
    }

    pub(crate) async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Every open session, oldest first.
    pub(crate) async fn all(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub(crate) async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove `session` and release everything it holds.
    ///
    /// Safe to call from several paths at once; only the first call has an
    /// effect and returns `true`.
    pub(crate) async fn destroy(&self, session: &Session, final_status: SessionStatus) -> bool {
        self.sessions.write().await.remove(&session.id());
        if !session.teardown(final_status) {
            return false;
        }

        let failed = session.status() == SessionStatus::Error;
        self.metrics.apply(|m| {
            m.active_sessions = m.active_sessions.saturating_sub(1);
            if failed {
                m.failed_sessions += 1;
            } else {
                m.completed_sessions += 1;
            }
        });
        debug!(session_id = %session.id(), failed, "session destroyed");
        true
    }
}
