//! Live sessions with the external assistant.
//!
//! A [`Session`] owns one OS process, its admission slot and the three
//! bounded event feeds. The caller side of the feeds is handed out once as a
//! [`SessionHandle`]. Producers never block: when a feed is full the event is
//! dropped and logged.

mod classify;
mod event;
pub(crate) mod io;
mod state;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portable_pty::MasterPty;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use classify::{classify, normalize, strip_ansi, OutputKind};
pub use event::{OutputEvent, StatusChange, StreamSource};
pub use state::{SessionState, SessionStatus, Transition};

use crate::admission::AdmissionSlot;
use crate::clock::{elapsed_since, Clock};
use crate::error::{HerdError, Result};
use crate::process::{ChildHandle, ExitInfo, ProcessInspector};

/// Pending writes a session buffers before `send_command` waits.
const INPUT_QUEUE: usize = 16;

/// Time-ordered unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh UUID v7 id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Options for a new session. Unset fields fall back to the supervisor config.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Directory the process starts in.
    pub working_dir: Option<PathBuf>,
    /// Maximum wait for an admission slot.
    pub admission_timeout: Option<Duration>,
    /// Session closes itself once this much time has passed.
    pub lifetime: Option<Duration>,
    /// Attach the process to a pseudo-terminal instead of pipes.
    pub pty: Option<bool>,
}

impl SessionRequest {
    /// Request with every option taken from the supervisor config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// How long to wait for a free slot.
    pub const fn admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = Some(timeout);
        self
    }

    /// Close the session automatically after `lifetime`.
    pub const fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Use a pseudo-terminal (`true`) or pipes (`false`).
    pub const fn pty(mut self, enabled: bool) -> Self {
        self.pty = Some(enabled);
        self
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub pid: Option<u32>,
    pub pty: bool,
    pub commands: u64,
    pub output_bytes: u64,
}

/// A line queued for the writer task, with a reply slot for the outcome.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub line: String,
    pub done: oneshot::Sender<std::io::Result<()>>,
}

/// Everything needed to register a freshly spawned process.
pub(crate) struct SessionInit {
    pub id: SessionId,
    pub working_dir: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub queue_capacity: usize,
    pub process: ChildHandle,
    pub master: Option<Box<dyn MasterPty + Send>>,
    pub slot: AdmissionSlot,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct Feeds {
    output: mpsc::Sender<OutputEvent>,
    errors: mpsc::Sender<HerdError>,
    status: mpsc::Sender<StatusChange>,
}

/// One supervised conversation with the external process.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    working_dir: PathBuf,
    pid: Option<u32>,
    pty: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
    commands: AtomicU64,
    output_bytes: AtomicU64,
    cancel: CancellationToken,
    feeds: Feeds,
    input: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    /// Taken at teardown and handed to the reaper.
    process: Mutex<Option<ChildHandle>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    slot: Mutex<Option<AdmissionSlot>>,
    torn_down: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("pty", &self.pty)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Build a session around a spawned process.
    ///
    /// Returns the caller's handle and the receiving end of the input queue,
    /// which the writer task must own.
    pub(crate) fn new(init: SessionInit) -> (SessionHandle, mpsc::Receiver<WriteRequest>) {
        let capacity = init.queue_capacity.max(1);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(capacity);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);

        let now = init.clock.now();
        let session = Arc::new(Self {
            id: init.id,
            created_at: now,
            working_dir: init.working_dir,
            pid: init.process.pid(),
            pty: init.master.is_some(),
            clock: init.clock,
            state: Mutex::new(SessionState::new(now)),
            commands: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            cancel: init.cancel,
            feeds: Feeds {
                output: output_tx,
                errors: errors_tx,
                status: status_tx,
            },
            input: Mutex::new(Some(input_tx)),
            process: Mutex::new(Some(init.process)),
            master: Mutex::new(init.master),
            slot: Mutex::new(Some(init.slot)),
            torn_down: AtomicBool::new(false),
        });

        let handle = SessionHandle {
            session,
            output: output_rx,
            errors: errors_rx,
            status: status_rx,
        };
        (handle, input_rx)
    }

    /// Session id.
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// When the session was registered.
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Directory the process was started in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// OS process id, if the platform reported one.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process runs on a pseudo-terminal.
    pub const fn is_pty(&self) -> bool {
        self.pty
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    /// Time of the last command or output line.
    pub fn last_activity(&self) -> DateTime<Utc> {
        lock(&self.state).last_activity
    }

    /// Exit code observed by the liveness poll, if the process has exited.
    pub fn exit_code(&self) -> Option<Option<i32>> {
        lock(&self.state).exit_code
    }

    /// Commands sent so far.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Bytes read from the process so far, line terminators included.
    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    /// Wall-clock age of the session.
    pub fn age(&self) -> Duration {
        elapsed_since(self.clock.as_ref(), self.created_at)
    }

    /// Time since the last command or output line.
    pub fn idle_for(&self) -> Duration {
        elapsed_since(self.clock.as_ref(), self.last_activity())
    }

    /// Token fired when the session is closed for any reason.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether teardown has run.
    pub fn is_closed(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        let state = lock(&self.state).clone();
        SessionInfo {
            id: self.id,
            status: state.status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            working_dir: self.working_dir.clone(),
            pid: self.pid,
            pty: self.pty,
            commands: self.command_count(),
            output_bytes: self.output_bytes(),
        }
    }

    /// Whether the OS still lists the process.
    ///
    /// Uses `inspector` when it can tell; otherwise asks the child handle.
    pub fn is_alive(&self, inspector: &dyn ProcessInspector) -> bool {
        if let Some(alive) = self.pid.and_then(|pid| inspector.sample(pid).alive) {
            return alive;
        }
        lock(&self.process)
            .as_mut()
            .is_some_and(|process| matches!(process.try_exit(), Ok(None)))
    }

    /// Non-blocking exit check. Records the exit code once seen.
    pub(crate) fn poll_exit(&self) -> std::io::Result<Option<ExitInfo>> {
        let exit = match lock(&self.process).as_mut() {
            Some(process) => process.try_exit()?,
            None => None,
        };
        if let Some(info) = exit {
            lock(&self.state).exit_code = Some(info.code);
        }
        Ok(exit)
    }

    /// Deliver `text` plus a newline to the process input.
    ///
    /// The status moves to `Running` before the write so that output
    /// produced in response is classified against the new command.
    pub(crate) async fn send(&self, text: &str) -> Result<()> {
        let input = lock(&self.input).clone().ok_or(HerdError::InvalidState {
            id: self.id,
            status: SessionStatus::Closed,
        })?;

        let transition = lock(&self.state)
            .begin_command(self.clock.now())
            .map_err(|status| HerdError::InvalidState { id: self.id, status })?;
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.publish_status(transition);

        let (done, reply) = oneshot::channel();
        let request = WriteRequest {
            line: text.to_string(),
            done,
        };
        let outcome = match input.send(request).await {
            Ok(()) => reply.await.unwrap_or_else(|_| Err(writer_gone())),
            Err(_) => Err(writer_gone()),
        };

        outcome.map_err(|source| {
            self.fail();
            HerdError::Write { id: self.id, source }
        })
    }

    /// Classify a line, update activity and status, and publish the event.
    pub(crate) fn record_output(&self, line: &str, source: StreamSource, raw_len: usize) {
        let kind = classify(line);
        let now = self.clock.now();
        self.output_bytes.fetch_add(raw_len as u64, Ordering::Relaxed);
        let transition = lock(&self.state).apply_output(kind, now);

        let event = OutputEvent {
            session_id: self.id,
            content: line.to_string(),
            timestamp: now,
            source,
            kind,
        };
        if self.feeds.output.try_send(event).is_err() {
            debug!(session_id = %self.id, %kind, "output feed full or closed, dropping event");
        }
        if let Some(transition) = transition {
            self.publish_status(transition);
        }
    }

    /// Push an error onto the error feed without blocking.
    pub(crate) fn report_error(&self, error: HerdError) {
        debug!(session_id = %self.id, %error, "session error");
        if let Err(dropped) = self.feeds.errors.try_send(error) {
            debug!(session_id = %self.id, error = %dropped.into_inner(), "error feed full or closed, dropping");
        }
    }

    /// Move to `Error` after a fatal I/O or process fault.
    pub(crate) fn fail(&self) {
        let transition = lock(&self.state).fail();
        if let Some(transition) = transition {
            self.publish_status(transition);
        }
    }

    /// Release every resource the session holds. Runs once; later calls return `false`.
    ///
    /// Each step is best-effort and independent: a failure to kill the
    /// process does not keep the slot from being returned.
    pub(crate) fn teardown(&self, final_status: SessionStatus) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }

        let transition = lock(&self.state).finish(final_status);
        if let Some(transition) = transition {
            self.publish_status(transition);
        }
        self.cancel.cancel();

        drop(lock(&self.input).take());
        drop(lock(&self.master).take());

        let process = lock(&self.process).take();
        if let Some(process) = process {
            process.kill_and_reap();
        }

        if let Some(slot) = lock(&self.slot).take() {
            slot.release();
        }
        info!(session_id = %self.id, status = %self.status(), "session closed");
        true
    }

    fn publish_status(&self, (from, to): Transition) {
        info!(session_id = %self.id, %from, %to, "status changed");
        let change = StatusChange {
            session_id: self.id,
            from,
            to,
            at: self.clock.now(),
        };
        if self.feeds.status.try_send(change).is_err() {
            debug!(session_id = %self.id, "status feed full or closed, dropping change");
        }
    }
}

fn writer_gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session input is closed")
}

/// Caller's side of a session: the shared session plus its event feeds.
#[derive(Debug)]
pub struct SessionHandle {
    session: Arc<Session>,
    /// Classified output lines.
    pub output: mpsc::Receiver<OutputEvent>,
    /// Asynchronous faults (read errors, inactivity, vanished process).
    pub errors: mpsc::Receiver<HerdError>,
    /// Status transitions, best-effort.
    pub status: mpsc::Receiver<StatusChange>,
}

impl SessionHandle {
    /// Id of the underlying session.
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// The shared session.
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::clock::SystemClock;
    use crate::process::{spawn_piped, ProcessOptions};

    fn make_session(gate: &AdmissionGate, capacity: usize) -> (SessionHandle, mpsc::Receiver<WriteRequest>) {
        let piped = spawn_piped(&ProcessOptions::new("cat")).unwrap();
        Session::new(SessionInit {
            id: SessionId::generate(),
            working_dir: std::env::temp_dir(),
            clock: Arc::new(SystemClock),
            queue_capacity: capacity,
            process: ChildHandle::Piped(piped.child),
            master: None,
            slot: gate.try_acquire(1).unwrap(),
            cancel: CancellationToken::new(),
        })
    }

    #[test]
    fn test_ids_are_time_ordered_and_parse_back() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(a < b);
        assert_eq!(a.to_string().parse::<SessionId>().unwrap(), a);
    }

    #[tokio::test]
    async fn test_full_output_feed_drops_instead_of_blocking() {
        let gate = AdmissionGate::new(1);
        let (mut handle, _input) = make_session(&gate, 2);
        let session = handle.session().clone();
        for i in 0..5 {
            session.record_output(&format!("line {i}"), StreamSource::Stdout, 7);
        }
        assert_eq!(handle.output.recv().await.unwrap().content, "line 0");
        assert_eq!(handle.output.recv().await.unwrap().content, "line 1");
        assert!(handle.output.try_recv().is_err());
        assert_eq!(session.output_bytes(), 35);
        session.teardown(SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_teardown_runs_once_and_frees_the_slot() {
        let gate = AdmissionGate::new(1);
        let (mut handle, _input) = make_session(&gate, 8);
        let session = handle.session().clone();
        assert_eq!(gate.available(), 0);

        assert!(session.teardown(SessionStatus::Closed));
        assert!(!session.teardown(SessionStatus::Closed));
        assert_eq!(gate.available(), 1);
        assert!(session.is_closed());
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(session.status(), SessionStatus::Closed);

        let change = handle.status.recv().await.unwrap();
        assert_eq!((change.from, change.to), (SessionStatus::Idle, SessionStatus::Closed));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_teardown_reaps_the_process() {
        let gate = AdmissionGate::new(1);
        let (handle, _input) = make_session(&gate, 8);
        let session = handle.session().clone();
        let proc_dir = PathBuf::from(format!("/proc/{}", session.pid().unwrap()));
        assert!(proc_dir.exists());

        session.teardown(SessionStatus::Closed);
        assert!(!session.is_alive(&crate::process::UnsupportedInspector));
        for _ in 0..200 {
            if !proc_dir.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("session process is still in the process table");
    }

    #[tokio::test]
    async fn test_send_after_teardown_is_rejected() {
        let gate = AdmissionGate::new(1);
        let (handle, _input) = make_session(&gate, 8);
        handle.session().teardown(SessionStatus::Closed);
        let err = handle.session().send("hello").await.unwrap_err();
        assert!(matches!(err, HerdError::InvalidState { status: SessionStatus::Closed, .. }));
    }

    #[tokio::test]
    async fn test_dropped_writer_is_a_write_failure() {
        let gate = AdmissionGate::new(1);
        let (handle, input) = make_session(&gate, 8);
        drop(input);
        let err = handle.session().send("hello").await.unwrap_err();
        assert!(matches!(err, HerdError::Write { .. }));
        assert_eq!(handle.session().status(), SessionStatus::Error);
        handle.session().teardown(SessionStatus::Closed);
    }
}
