//! OS-level process accounting.
//!
//! Resource checks only need three facts about a pid: whether it still
//! exists, its resident memory, and its accumulated CPU time. They sit behind
//! [`ProcessInspector`] so platforms without `/proc` can report
//! "unmeasurable" and enforcement simply skips those dimensions.

use std::fmt;
use std::sync::Arc;

/// One observation of a process. `None` means "could not be measured".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSample {
    pub alive: Option<bool>,
    pub memory_bytes: Option<u64>,
    pub cpu_ticks: Option<u64>,
    pub ticks_per_second: Option<u64>,
}

impl ProcessSample {
    /// Nothing could be measured.
    pub const fn unmeasurable() -> Self {
        Self {
            alive: None,
            memory_bytes: None,
            cpu_ticks: None,
            ticks_per_second: None,
        }
    }

    /// The process does not exist.
    pub const fn gone() -> Self {
        Self {
            alive: Some(false),
            ..Self::unmeasurable()
        }
    }

    pub fn memory_mb(&self) -> Option<u64> {
        self.memory_bytes.map(|b| b / (1024 * 1024))
    }

    /// Accumulated user + system CPU time in seconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn cpu_seconds(&self) -> Option<f64> {
        match (self.cpu_ticks, self.ticks_per_second) {
            (Some(ticks), Some(tps)) if tps > 0 => Some(ticks as f64 / tps as f64),
            _ => None,
        }
    }
}

/// Reads accounting data for a pid.
pub trait ProcessInspector: Send + Sync + fmt::Debug {
    fn sample(&self, pid: u32) -> ProcessSample;
}

/// Inspector backed by `/proc`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsInspector;

#[cfg(target_os = "linux")]
impl ProcessInspector for ProcfsInspector {
    fn sample(&self, pid: u32) -> ProcessSample {
        let Ok(pid) = i32::try_from(pid) else {
            return ProcessSample::unmeasurable();
        };
        let Ok(process) = procfs::process::Process::new(pid) else {
            return ProcessSample::gone();
        };

        let memory_bytes = process
            .statm()
            .ok()
            .map(|statm| statm.resident.saturating_mul(procfs::page_size()));
        let cpu_ticks = process.stat().ok().map(|stat| stat.utime + stat.stime);

        ProcessSample {
            alive: Some(true),
            memory_bytes,
            cpu_ticks,
            ticks_per_second: Some(procfs::ticks_per_second()),
        }
    }
}

/// Inspector for platforms without process accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedInspector;

impl ProcessInspector for UnsupportedInspector {
    fn sample(&self, _pid: u32) -> ProcessSample {
        ProcessSample::unmeasurable()
    }
}

/// The best inspector available on this platform.
pub fn system_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsInspector)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedInspector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_seconds_needs_both_values() {
        let sample = ProcessSample {
            cpu_ticks: Some(250),
            ticks_per_second: Some(100),
            ..ProcessSample::unmeasurable()
        };
        assert_eq!(sample.cpu_seconds(), Some(2.5));
        assert_eq!(ProcessSample::unmeasurable().cpu_seconds(), None);
    }

    #[test]
    fn test_unsupported_inspector_measures_nothing() {
        assert_eq!(UnsupportedInspector.sample(1), ProcessSample::unmeasurable());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_sees_current_process() {
        let sample = ProcfsInspector.sample(std::process::id());
        assert_eq!(sample.alive, Some(true));
        assert!(sample.memory_bytes.unwrap() > 0);
        assert!(sample.ticks_per_second.unwrap() > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_reports_missing_pid_as_gone() {
        // pid_max on Linux is at most 2^22.
        let sample = ProcfsInspector.sample(4_194_304 + 17);
        assert_eq!(sample.alive, Some(false));
    }
}
