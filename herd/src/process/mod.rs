//! Process spawning and inspection.
//!
//! Spawns the assistant either on pipes or on a pseudo-terminal, exposes a
//! uniform handle for exit checks and kills, reads OS accounting for
//! resource limits, and runs one-shot requests.

mod exec;
mod handle;
mod inspect;
mod pty;
mod spawn;

pub use exec::{execute_once, internal_timeout};
pub use handle::{ChildHandle, ExitInfo};
#[cfg(target_os = "linux")]
pub use inspect::ProcfsInspector;
pub use inspect::{system_inspector, ProcessInspector, ProcessSample, UnsupportedInspector};
pub use pty::{spawn_pty, PtyChild};
pub use spawn::{
    is_bare_name, resolve_working_dir, spawn_piped, spawn_process, PipedChild, ProcessOptions,
    ProcessOutput, ProcessResult,
};
