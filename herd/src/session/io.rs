//! Stream tasks attaching a process to its session.
//!
//! Piped sessions get one async reader per output stream and an async writer.
//! PTY handles are blocking, so their reader and writer run on the blocking
//! pool. Only the writer task touches the process input.

use std::io::{BufRead, BufReader as StdBufReader, Read, Write};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Session, StreamSource, WriteRequest};
use crate::error::HerdError;

/// `EIO`: Linux reports a hung-up terminal this way instead of EOF.
const EIO: i32 = 5;

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Drain one piped stream line by line until EOF, an error or cancellation.
pub(crate) fn spawn_reader<R>(session: Arc<Session>, stream: R, source: StreamSource) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let cancel = session.cancel_token().clone();
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let line = String::from_utf8_lossy(trim_line_ending(&buf));
                    session.record_output(&line, source, n);
                }
                Err(error) => {
                    session.report_error(HerdError::Read {
                        id: session.id(),
                        stream: source,
                        source: error,
                    });
                    break;
                }
            }
        }
        debug!(session_id = %session.id(), %source, "reader finished");
    })
}

/// Own the process stdin and apply queued writes in order.
pub(crate) fn spawn_writer(
    session: Arc<Session>,
    mut stdin: ChildStdin,
    mut requests: mpsc::Receiver<WriteRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = session.cancel_token().clone();
        loop {
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let result = async {
                stdin.write_all(request.line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            let _ = request.done.send(result);
        }
        debug!(session_id = %session.id(), "writer finished");
    })
}

/// Blocking reader for the merged PTY stream; everything is reported as stdout.
pub(crate) fn spawn_pty_reader(session: Arc<Session>, reader: Box<dyn Read + Send>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut reader = StdBufReader::new(reader);
        let mut buf = Vec::new();
        while !session.cancel_token().is_cancelled() {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let line = String::from_utf8_lossy(trim_line_ending(&buf));
                    session.record_output(&line, StreamSource::Stdout, n);
                }
                Err(error) if error.raw_os_error() == Some(EIO) => break,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    if !session.cancel_token().is_cancelled() {
                        session.report_error(HerdError::Read {
                            id: session.id(),
                            stream: StreamSource::Stdout,
                            source: error,
                        });
                    }
                    break;
                }
            }
        }
        debug!(session_id = %session.id(), "pty reader finished");
    })
}

/// Blocking writer for the PTY. Ends when the session drops its input queue.
pub(crate) fn spawn_pty_writer(
    session: Arc<Session>,
    mut writer: Box<dyn Write + Send>,
    mut requests: mpsc::Receiver<WriteRequest>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(request) = requests.blocking_recv() {
            let result = writer
                .write_all(request.line.as_bytes())
                .and_then(|()| writer.write_all(b"\n"))
                .and_then(|()| writer.flush());
            let _ = request.done.send(result);
        }
        debug!(session_id = %session.id(), "pty writer finished");
    })
}
