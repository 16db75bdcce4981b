//! Pseudo-terminal spawning.
//!
//! Some assistant CLIs only behave interactively when attached to a
//! terminal. A PTY merges stdout and stderr into one stream and exposes
//! blocking reader/writer halves, so callers drive them from blocking tasks.

use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::debug;

use super::spawn::ProcessOptions;
use crate::error::{HerdError, Result};

/// A child attached to the slave side of a PTY.
pub struct PtyChild {
    pub child: Box<dyn Child + Send + Sync>,
    /// Keeps the terminal open; dropping it hangs up the child.
    pub master: Box<dyn MasterPty + Send>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl std::fmt::Debug for PtyChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChild")
            .field("pid", &self.child.process_id())
            .finish_non_exhaustive()
    }
}

/// Start `options` on a fresh `rows` x `cols` pseudo-terminal.
pub fn spawn_pty(options: &ProcessOptions, rows: u16, cols: u16) -> Result<PtyChild> {
    let fail = |source: anyhow::Error| HerdError::Pty {
        command: options.program.clone(),
        source,
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(fail)?;

    let (program, args) = options.invocation();
    let mut builder = CommandBuilder::new(program);
    builder.args(&args);
    if let Some(ref dir) = options.working_dir {
        builder.cwd(dir);
    }
    if !options.env.contains_key("TERM") {
        builder.env("TERM", "xterm-256color");
    }
    for (key, value) in &options.env {
        builder.env(key, value);
    }

    let mut child = pair.slave.spawn_command(builder).map_err(fail)?;
    drop(pair.slave);
    debug!(program = %options.program, pid = ?child.process_id(), "spawned on pty");

    let halves = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    match halves {
        Ok((reader, writer)) => Ok(PtyChild {
            child,
            master: pair.master,
            reader,
            writer,
        }),
        Err(source) => {
            let _ = child.kill();
            Err(fail(source))
        }
    }
}
