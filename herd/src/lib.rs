//! Herd - supervise concurrent sessions with a command-line AI assistant.
//!
//! A [`Supervisor`] admits a bounded number of interactive sessions, spawns
//! the assistant for each (on pipes or a pseudo-terminal), classifies its
//! output into typed events that drive a per-session status machine, watches
//! session health and resource usage, and runs one-shot requests with retry.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use herd::{SessionRequest, Supervisor, SupervisorConfig};
//!
//! # async fn demo() -> herd::Result<()> {
//! let supervisor = Supervisor::new(SupervisorConfig::default())?;
//! let mut handle = supervisor.create_session(SessionRequest::new()).await?;
//! supervisor.send_command(handle.id(), "summarize README.md").await?;
//! while let Some(event) = handle.output.recv().await {
//!     println!("[{}] {}", event.kind, event.content);
//! }
//! supervisor.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod process;
pub mod retry;
pub mod session;
pub mod supervisor;

pub use admission::{AdmissionGate, AdmissionSlot};
pub use clock::{Clock, ManualClock, SystemClock, Ticker};
pub use config::{Backoff, ResourceLimits, RetryConfig, SupervisorConfig};
pub use error::{HerdError, Result};
pub use metrics::ClientMetrics;
pub use monitor::{LimitAction, LimitBreach};
pub use process::{ProcessInspector, ProcessSample};
pub use retry::retry;
pub use session::{
    OutputEvent, OutputKind, Session, SessionHandle, SessionId, SessionInfo, SessionRequest, SessionStatus,
    StatusChange, StreamSource,
};
pub use supervisor::{HealthStatus, Supervisor};
