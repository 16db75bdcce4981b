//! The session supervisor.
//!
//! Owns the admission gate, the registry of open sessions, the shared clock
//! and process inspector, and the shutdown token every session token derives
//! from. Cloning a [`Supervisor`] is cheap and yields a handle to the same
//! engine.

mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionGate;
use crate::clock::{elapsed_since, Clock, SystemClock, Ticker};
use crate::config::{ResourceLimits, RetryConfig, SupervisorConfig};
use crate::error::{HerdError, Result};
use crate::metrics::ClientMetrics;
use crate::monitor::{self, LimitAction};
use crate::process::{
    execute_once, is_bare_name, resolve_working_dir, spawn_piped, spawn_pty, system_inspector, ChildHandle,
    ProcessInspector, ProcessOptions,
};
use crate::retry::retry;
use crate::session::{
    io, Session, SessionHandle, SessionId, SessionInfo, SessionInit, SessionRequest, SessionStatus,
    StreamSource,
};
use registry::Registry;

/// Environment variable carrying the session id into the child.
pub const SESSION_ID_ENV: &str = "HERD_SESSION_ID";
/// Environment variable carrying the session working directory into the child.
pub const WORKING_DIR_ENV: &str = "HERD_WORKING_DIR";

/// Result of [`Supervisor::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub tool_available: bool,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

struct Inner {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    inspector: Arc<dyn ProcessInspector>,
    gate: AdmissionGate,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

/// Supervises concurrent sessions with the external assistant.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.inner.config.command)
            .field("capacity", &self.inner.gate.capacity())
            .field("in_use", &self.inner.gate.in_use())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Supervisor on real time with the platform's process inspector.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(SystemClock), system_inspector())
    }

    /// Supervisor with an explicit clock and inspector.
    pub fn with_parts(
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self> {
        config.validate()?;
        let gate = AdmissionGate::new(config.max_sessions);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                inspector,
                gate,
                registry: Arc::new(Registry::default()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Free admission slots.
    pub fn available_slots(&self) -> usize {
        self.inner.gate.available()
    }

    pub fn metrics(&self) -> ClientMetrics {
        self.inner.registry.metrics.snapshot()
    }

    /// Admit, spawn and register a new session.
    ///
    /// Waits for a free slot up to the request's (or configured) admission
    /// timeout. Any failure after admission returns the slot before the
    /// error is reported, and nothing is left registered.
    pub async fn create_session(&self, request: SessionRequest) -> Result<SessionHandle> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(HerdError::ShuttingDown);
        }

        let timeout = request
            .admission_timeout
            .unwrap_or_else(|| inner.config.admission_timeout());
        let slot = inner
            .gate
            .acquire(1, timeout, &inner.shutdown)
            .await
            .map_err(|e| match e {
                HerdError::Cancelled => HerdError::ShuttingDown,
                other => other,
            })?;

        let id = SessionId::generate();
        let working_dir = resolve_working_dir(request.working_dir.as_deref(), inner.config.working_dir.as_deref())?;
        let options = ProcessOptions::for_command(&inner.config)
            .args(inner.config.session_args.iter().cloned())
            .working_dir(&working_dir)
            .env(SESSION_ID_ENV, id.to_string())
            .env(WORKING_DIR_ENV, working_dir.display().to_string());

        let use_pty = request.pty.unwrap_or(inner.config.pty);
        let cancel = inner.shutdown.child_token();
        let init = |process, master| SessionInit {
            id,
            working_dir: working_dir.clone(),
            clock: inner.clock.clone(),
            queue_capacity: inner.config.queue_capacity,
            process,
            master,
            slot,
            cancel,
        };

        let handle = if use_pty {
            let pty = spawn_pty(&options, inner.config.pty_rows, inner.config.pty_cols)?;
            let (handle, input) = Session::new(init(ChildHandle::Pty(pty.child), Some(pty.master)));
            io::spawn_pty_reader(handle.session().clone(), pty.reader);
            io::spawn_pty_writer(handle.session().clone(), pty.writer, input);
            handle
        } else {
            let piped = spawn_piped(&options)?;
            let (handle, input) = Session::new(init(ChildHandle::Piped(piped.child), None));
            let session = handle.session();
            io::spawn_reader(session.clone(), piped.stdout, StreamSource::Stdout);
            io::spawn_reader(session.clone(), piped.stderr, StreamSource::Stderr);
            io::spawn_writer(session.clone(), piped.stdin, input);
            handle
        };

        let session = handle.session().clone();
        inner.registry.insert(session.clone()).await;
        self.spawn_lifecycle(&session, request.lifetime.or_else(|| inner.config.session_timeout()));
        info!(
            session_id = %id,
            pid = ?session.pid(),
            dir = %working_dir.display(),
            pty = use_pty,
            "session created"
        );

        if inner.shutdown.is_cancelled() {
            inner.registry.destroy(&session, SessionStatus::Closed).await;
            return Err(HerdError::ShuttingDown);
        }
        Ok(handle)
    }

    /// Start the liveness, health and lifetime tasks of a session.
    fn spawn_lifecycle(&self, session: &Arc<Session>, lifetime: Option<Duration>) {
        let inner = &self.inner;

        {
            let session = session.clone();
            let registry = inner.registry.clone();
            let ticker = Ticker::new(inner.clock.clone(), inner.config.liveness_interval());
            tokio::spawn(async move {
                if let Some(exit) = monitor::watch_exit(&session, ticker).await {
                    registry
                        .destroy(&session, SessionStatus::after_exit(exit.success()))
                        .await;
                }
            });
        }

        monitor::spawn_health_task(
            session.clone(),
            inner.inspector.clone(),
            Ticker::new(inner.clock.clone(), inner.config.health_check_interval()),
            inner.config.inactivity_timeout(),
        );

        let session = session.clone();
        let registry = inner.registry.clone();
        let clock = inner.clock.clone();
        tokio::spawn(async move {
            let cancel = session.cancel_token().clone();
            match lifetime {
                Some(lifetime) => tokio::select! {
                    () = cancel.cancelled() => {}
                    () = clock.sleep(lifetime) => {
                        info!(session_id = %session.id(), ?lifetime, "session lifetime reached");
                    }
                },
                None => cancel.cancelled().await,
            }
            registry.destroy(&session, SessionStatus::Closed).await;
        });
    }

    /// Send one line of input. Allowed only while the session is idle or waiting.
    pub async fn send_command(&self, id: SessionId, text: &str) -> Result<()> {
        let session = self.get_session(id).await?;
        session.send(text).await?;
        let now = self.inner.clock.now();
        self.inner.registry.metrics.apply(|m| {
            m.total_commands += 1;
            m.last_command_at = Some(now);
        });
        debug!(session_id = %id, "command sent");
        Ok(())
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or(HerdError::SessionNotFound(id))
    }

    /// Snapshots of every open session.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .registry
            .all()
            .await
            .iter()
            .map(|s| s.info())
            .collect()
    }

    /// Close a session and return its slot.
    pub async fn close_session(&self, id: SessionId) -> Result<()> {
        let session = self.get_session(id).await?;
        self.inner.registry.destroy(&session, SessionStatus::Closed).await;
        Ok(())
    }

    /// Check a session against `limits`.
    ///
    /// Returns [`HerdError::LimitExceeded`] for the first breached dimension.
    /// With [`LimitAction::Close`] the session is closed before returning.
    pub async fn enforce_limits(&self, id: SessionId, limits: &ResourceLimits, action: LimitAction) -> Result<()> {
        let session = self.get_session(id).await?;
        let Some(breach) = monitor::session_limits(&session, self.inner.inspector.as_ref(), limits) else {
            return Ok(());
        };

        warn!(session_id = %id, %breach, ?action, "resource limit exceeded");
        if action == LimitAction::Close {
            self.inner.registry.destroy(&session, SessionStatus::Closed).await;
        }
        Err(HerdError::LimitExceeded { id, breach })
    }

    /// Check the external tool and every open session.
    pub async fn health_check(&self) -> HealthStatus {
        let inner = &self.inner;
        let sessions = inner.registry.all().await;
        let mut issues = Vec::new();

        let tool_available = tool_available(&inner.config.command);
        if !tool_available {
            issues.push(format!("external tool `{}` is not available", inner.config.command));
        }

        for session in &sessions {
            issues.extend(
                monitor::check_health(session, inner.inspector.as_ref(), inner.config.inactivity_timeout())
                    .iter()
                    .map(ToString::to_string),
            );
        }

        HealthStatus {
            healthy: issues.is_empty(),
            tool_available,
            active_sessions: sessions.len(),
            total_sessions: inner.registry.metrics.snapshot().total_sessions,
            issues,
            checked_at: inner.clock.now(),
        }
    }

    /// One-shot request with retry, bounded by `deadline` overall.
    ///
    /// Each attempt gets the time remaining before the deadline as its
    /// budget. Hitting the deadline yields [`HerdError::DeadlineExceeded`],
    /// distinct from exhausting the attempts.
    pub async fn execute(
        &self,
        prompt: &str,
        working_dir: Option<&Path>,
        policy: &RetryConfig,
        deadline: Duration,
    ) -> Result<String> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(HerdError::ShuttingDown);
        }

        let config = &inner.config;
        let clock = inner.clock.as_ref();
        let cancel = inner.shutdown.child_token();
        let started = clock.now();

        let attempts = retry(clock, policy, &cancel, move |attempt| {
            let remaining = deadline.saturating_sub(elapsed_since(clock, started));
            debug!(attempt, ?remaining, "one-shot attempt");
            async move {
                if remaining.is_zero() {
                    return Err(HerdError::DeadlineExceeded(deadline));
                }
                execute_once(config, clock, prompt, working_dir, remaining).await
            }
        });

        let outcome = tokio::select! {
            outcome = attempts => outcome,
            () = clock.sleep(deadline) => Err(HerdError::DeadlineExceeded(deadline)),
        };
        if matches!(outcome, Err(HerdError::Cancelled)) && inner.shutdown.is_cancelled() {
            return Err(HerdError::ShuttingDown);
        }
        outcome
    }

    /// Stop admitting, close every session concurrently and wait up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let inner = &self.inner;
        info!(sessions = inner.registry.len().await, "shutting down");
        inner.gate.close();
        inner.shutdown.cancel();

        let mut closing = JoinSet::new();
        for session in inner.registry.all().await {
            let registry = inner.registry.clone();
            closing.spawn(async move {
                registry.destroy(&session, SessionStatus::Closed).await;
            });
        }

        let drained = tokio::time::timeout(deadline, async {
            while closing.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => {
                info!("shutdown complete");
                Ok(())
            }
            Err(_) => {
                let pending = closing.len();
                warn!(pending, "shutdown deadline reached");
                Err(HerdError::ShutdownTimeout { pending })
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Whether `command` can be started: an existing file for paths, a PATH hit for names.
fn tool_available(command: &str) -> bool {
    if is_bare_name(command) {
        which::which(command).is_ok()
    } else {
        PathBuf::from(command).is_file()
    }
}
