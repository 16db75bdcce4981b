//! Command construction and piped spawning.
//!
//! [`ProcessOptions`] describes one invocation of the assistant (arguments,
//! environment, working directory, optional shell indirection). It is turned
//! into a long-lived child with [`spawn_piped`] for sessions, or run to
//! completion with [`spawn_process`] for one-shot requests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::config::SupervisorConfig;
use crate::error::{HerdError, Result};

/// Command names that may be handed to a shell verbatim.
static BARE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.+-]*$").expect("bare-name pattern is valid"));

/// Lines buffered between the stream readers and the collector.
const COLLECT_BUFFER: usize = 1024;

/// A line from one of the child's output streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Stdout(String),
    Stderr(String),
}

/// One invocation of an external program.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Shell used to resolve bare program names.
    pub shell: Option<String>,
    /// Kill the child after this long (run-to-completion only).
    pub timeout: Option<Duration>,
}

impl ProcessOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// The configured assistant command, with shell indirection when enabled.
    pub fn for_command(config: &SupervisorConfig) -> Self {
        let options = Self::new(config.command.clone());
        if config.use_shell {
            options.via_shell(config.shell_program())
        } else {
            options
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn via_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub const fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Program and arguments actually executed.
    ///
    /// A bare name with a shell configured becomes
    /// `<shell> -c '<name> "$@"' <name> <args...>`: the shell resolves the
    /// name (aliases, functions, PATH) while the arguments travel as
    /// positional parameters and are never re-parsed.
    pub fn invocation(&self) -> (String, Vec<String>) {
        match &self.shell {
            Some(shell) if is_bare_name(&self.program) => {
                let mut args = Vec::with_capacity(self.args.len() + 3);
                args.push("-c".to_string());
                args.push(format!("{} \"$@\"", self.program));
                args.push(self.program.clone());
                args.extend(self.args.iter().cloned());
                (shell.clone(), args)
            }
            _ => (self.program.clone(), self.args.clone()),
        }
    }

    /// A tokio command with all three streams piped, killed when dropped.
    pub fn command(&self) -> Command {
        let (program, args) = self.invocation();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> HerdError {
        if source.kind() == io::ErrorKind::NotFound && self.shell.is_none() && is_bare_name(&self.program) {
            HerdError::ToolNotFound(self.program.clone())
        } else {
            HerdError::Spawn {
                command: self.program.clone(),
                source,
            }
        }
    }
}

/// Whether `program` is a plain name rather than a filesystem path.
pub fn is_bare_name(program: &str) -> bool {
    BARE_NAME.is_match(program)
}

/// Pick the working directory: explicit, then fallback, then the current one.
pub fn resolve_working_dir(explicit: Option<&Path>, fallback: Option<&Path>) -> Result<PathBuf> {
    let dir = match explicit.or(fallback) {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().map_err(|source| HerdError::Spawn {
            command: "<current directory>".into(),
            source,
        })?,
    };
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(HerdError::WorkingDir(dir))
    }
}

/// A running child with all three standard streams attached.
#[derive(Debug)]
pub struct PipedChild {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Start a long-lived child with piped stdin, stdout and stderr.
///
/// If any stream cannot be attached the child is killed and the streams that
/// were opened are dropped (closing them) before the error is returned.
pub fn spawn_piped(options: &ProcessOptions) -> Result<PipedChild> {
    let mut child = options
        .command()
        .spawn()
        .map_err(|e| options.spawn_error(e))?;
    debug!(program = %options.program, pid = ?child.id(), "spawned piped process");

    match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok(PipedChild {
            child,
            stdin,
            stdout,
            stderr,
        }),
        _ => {
            let _ = child.start_kill();
            Err(HerdError::Spawn {
                command: options.program.clone(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "standard streams could not be attached"),
            })
        }
    }
}

/// Outcome of a run-to-completion child.
#[derive(Debug)]
pub struct ProcessResult {
    pub status: ExitStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Both streams in arrival order.
    pub combined: Vec<String>,
    /// The child was killed because its timeout fired.
    pub timed_out: bool,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn combined_string(&self) -> String {
        self.combined.join("\n")
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::Sender<ProcessOutput>, wrap: fn(String) -> ProcessOutput)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(wrap(line)).await.is_err() {
                break;
            }
        }
    });
}

/// Run a child to completion and collect its output.
///
/// Stdin is closed. The timeout, if any, is measured on `clock`; on expiry
/// the child is killed and the result is marked `timed_out`.
pub async fn spawn_process(options: ProcessOptions, clock: &dyn Clock) -> Result<ProcessResult> {
    let mut cmd = options.command();
    cmd.stdin(Stdio::null());
    let mut child = cmd.spawn().map_err(|e| options.spawn_error(e))?;
    debug!(program = %options.program, pid = ?child.id(), "spawned process");

    let (tx, mut rx) = mpsc::channel(COLLECT_BUFFER);
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone(), ProcessOutput::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone(), ProcessOutput::Stderr);
    }
    drop(tx);

    let mut result = ProcessResult {
        status: ExitStatus::default(),
        stdout: Vec::new(),
        stderr: Vec::new(),
        combined: Vec::new(),
        timed_out: false,
    };
    let collect = async {
        while let Some(output) = rx.recv().await {
            let (line, stream) = match output {
                ProcessOutput::Stdout(line) => (line, &mut result.stdout),
                ProcessOutput::Stderr(line) => (line, &mut result.stderr),
            };
            result.combined.push(line.clone());
            stream.push(line);
        }
    };

    let timed_out = match options.timeout {
        Some(limit) => tokio::select! {
            () = collect => false,
            () = clock.sleep(limit) => true,
        },
        None => {
            collect.await;
            false
        }
    };

    if timed_out {
        debug!(program = %options.program, "process timed out, killing");
        let _ = child.kill().await;
    }
    result.timed_out = timed_out;
    result.status = child.wait().await.map_err(|source| HerdError::Spawn {
        command: options.program.clone(),
        source,
    })?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    async fn run(options: ProcessOptions) -> ProcessResult {
        spawn_process(options, &SystemClock).await.unwrap()
    }

    #[tokio::test]
    async fn test_collects_both_streams_in_order() {
        let result = run(ProcessOptions::new("sh").arg("-c").arg("echo out; echo err >&2")).await;
        assert!(result.success());
        assert_eq!(result.stdout, vec!["out"]);
        assert_eq!(result.stderr, vec!["err"]);
        assert_eq!(result.combined.len(), 2);
    }

    #[tokio::test]
    async fn test_env_and_working_dir_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(ProcessOptions::new("sh")
            .arg("-c")
            .arg("echo $HERD_TEST_VAR; pwd")
            .env("HERD_TEST_VAR", "present")
            .working_dir(dir.path()))
        .await;

        assert_eq!(result.stdout[0], "present");
        let name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(result.stdout[1].ends_with(&name));
    }

    #[tokio::test]
    async fn test_unknown_bare_name_is_tool_not_found() {
        let err = spawn_process(ProcessOptions::new("herd_missing_tool_12345"), &SystemClock)
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::ToolNotFound(ref name) if name == "herd_missing_tool_12345"));
    }

    #[tokio::test]
    async fn test_missing_path_is_a_spawn_error() {
        let err = spawn_process(ProcessOptions::new("/nonexistent/dir/tool"), &SystemClock)
            .await
            .unwrap_err();
        assert!(matches!(err, HerdError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_child() {
        let result = run(ProcessOptions::new("sleep").arg("10").timeout(Duration::from_millis(100))).await;
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let result = run(ProcessOptions::new("sh").arg("-c").arg("exit 42")).await;
        assert!(!result.success());
        assert_eq!(result.code(), Some(42));
    }

    #[tokio::test]
    async fn test_shell_indirection_passes_args_verbatim() {
        let options = ProcessOptions::new("echo")
            .arg("it's $HOME; `x`")
            .via_shell("/bin/sh");
        let (program, args) = options.invocation();
        assert_eq!(program, "/bin/sh");
        assert_eq!(args[..3], ["-c", "echo \"$@\"", "echo"]);

        let result = run(options).await;
        assert_eq!(result.stdout, vec!["it's $HOME; `x`"]);
    }

    #[tokio::test]
    async fn test_piped_child_echoes_stdin() {
        use tokio::io::AsyncWriteExt;

        let mut piped = spawn_piped(&ProcessOptions::new("cat")).unwrap();
        piped.stdin.write_all(b"ping\n").await.unwrap();
        drop(piped.stdin);
        let mut lines = BufReader::new(piped.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ping"));
        assert!(piped.child.wait().await.unwrap().success());
    }

    #[test]
    fn test_paths_skip_the_shell() {
        let options = ProcessOptions::new("./bin/tool").arg("x").via_shell("/bin/sh");
        assert_eq!(options.invocation(), ("./bin/tool".to_string(), vec!["x".to_string()]));
        assert!(is_bare_name("claude"));
        assert!(is_bare_name("claude-2.1"));
        assert!(!is_bare_name("/usr/bin/claude"));
        assert!(!is_bare_name("rm -rf"));
    }

    #[test]
    fn test_working_dir_priority() {
        let explicit = tempfile::tempdir().unwrap();
        let fallback = tempfile::tempdir().unwrap();

        let dir = resolve_working_dir(Some(explicit.path()), Some(fallback.path())).unwrap();
        assert_eq!(dir, explicit.path());

        let dir = resolve_working_dir(None, Some(fallback.path())).unwrap();
        assert_eq!(dir, fallback.path());

        let dir = resolve_working_dir(None, None).unwrap();
        assert_eq!(dir, std::env::current_dir().unwrap());

        let missing = explicit.path().join("missing");
        assert!(matches!(
            resolve_working_dir(Some(&missing), None),
            Err(HerdError::WorkingDir(_))
        ));
    }
}
