//! Uniform control over piped and PTY children.

use std::io;

use tracing::debug;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub const fn success(self) -> bool {
        matches!(self.code, Some(0))
    }

    fn from_pty(status: &portable_pty::ExitStatus) -> Self {
        let code = if status.signal().is_some() {
            None
        } else {
            i32::try_from(status.exit_code()).ok()
        };
        Self { code }
    }
}

/// OS process owned by a session.
#[derive(Debug)]
pub enum ChildHandle {
    Piped(tokio::process::Child),
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Piped(child) => child.id(),
            Self::Pty(child) => child.process_id(),
        }
    }

    /// Non-blocking exit check; reaps the child when it has exited.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        match self {
            Self::Piped(child) => Ok(child.try_wait()?.map(|status| ExitInfo { code: status.code() })),
            Self::Pty(child) => Ok(child.try_wait()?.map(|status| ExitInfo::from_pty(&status))),
        }
    }

    /// Send a kill signal without waiting for the process to go away.
    pub fn start_kill(&mut self) -> io::Result<()> {
        match self {
            Self::Piped(child) => child.start_kill(),
            Self::Pty(child) => child.kill(),
        }
    }

    /// Kill the process if it is still running and reap it off the caller's thread.
    ///
    /// Outside a tokio runtime the handle is simply dropped after the kill.
    pub fn kill_and_reap(mut self) {
        if matches!(self.try_exit(), Ok(Some(_))) {
            return;
        }
        let pid = self.pid();
        if let Err(error) = self.start_kill() {
            debug!(?pid, %error, "failed to kill process");
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        match self {
            Self::Piped(mut child) => {
                runtime.spawn(async move {
                    if let Err(error) = child.wait().await {
                        debug!(?pid, %error, "failed to reap process");
                    }
                });
            }
            Self::Pty(mut child) => {
                runtime.spawn_blocking(move || {
                    if let Err(error) = child.wait() {
                        debug!(?pid, %error, "failed to reap process");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::spawn::{spawn_piped, ProcessOptions};
    use std::time::Duration;

    async fn wait_exit(handle: &mut ChildHandle) -> ExitInfo {
        for _ in 0..200 {
            if let Some(exit) = handle.try_exit().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn test_reports_exit_code() {
        let piped = spawn_piped(&ProcessOptions::new("sh").arg("-c").arg("exit 3")).unwrap();
        let mut handle = ChildHandle::Piped(piped.child);
        assert!(handle.pid().is_some());
        let exit = wait_exit(&mut handle).await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_killed_process_has_no_code() {
        let piped = spawn_piped(&ProcessOptions::new("sleep").arg("30")).unwrap();
        let mut handle = ChildHandle::Piped(piped.child);
        assert!(handle.try_exit().unwrap().is_none());
        handle.start_kill().unwrap();
        let exit = wait_exit(&mut handle).await;
        assert_eq!(exit.code, None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_and_reap_leaves_no_zombie() {
        let piped = spawn_piped(&ProcessOptions::new("sleep").arg("30")).unwrap();
        let handle = ChildHandle::Piped(piped.child);
        let proc_dir = std::path::PathBuf::from(format!("/proc/{}", handle.pid().unwrap()));
        assert!(proc_dir.exists());

        handle.kill_and_reap();
        for _ in 0..200 {
            if !proc_dir.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process was not reaped");
    }
}
