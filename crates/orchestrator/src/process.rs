//! Spawning external commands with merged, line-streamed output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{BuildError, Result};
use crate::stage::StageKind;

/// Argument vector plus working directory for one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Build from a full argument vector; the first element is the program.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Shorthand for `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
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

    pub fn current_dir(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

struct HandleInner {
    /// Cleared once the child has been reaped, so a recycled pid is never signalled
    pid: Mutex<Option<u32>>,
    terminated: AtomicBool,
}

/// Cloneable handle used to terminate a running child from another task.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    fn new(pid: Option<u32>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid: Mutex::new(pid),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Send SIGTERM to the child if it is still alive. Only the first call
    /// has an effect.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let pid = *self
            .inner
            .pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match pid {
            Some(pid) => {
                debug!(pid, "Sending SIGTERM to child process");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, error = %e, "Failed to signal child process");
                }
            }
            None => debug!("Child process already exited, nothing to terminate"),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn mark_reaped(&self) {
        *self
            .inner
            .pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// A spawned command whose stdout and stderr arrive as one line sequence.
pub struct RunningProcess {
    stage: StageKind,
    command: String,
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    handle: ProcessHandle,
}

impl RunningProcess {
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Next line of merged output, or `None` once both pipes are closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Reap the child after the output is drained.
    ///
    /// A terminated child maps to `CancellationRequested`, any other
    /// non-zero exit to `StageFailure`.
    pub async fn wait(mut self) -> Result<()> {
        while self.lines.recv().await.is_some() {}

        let status = self.child.wait().await;
        self.handle.mark_reaped();
        let status: ExitStatus = status?;

        if self.handle.is_terminated() {
            debug!(stage = %self.stage, command = %self.command, "Command terminated on request");
            return Err(BuildError::CancellationRequested { stage: self.stage });
        }

        if !status.success() {
            return Err(BuildError::stage_failed(
                self.stage,
                self.command,
                status.code(),
            ));
        }

        Ok(())
    }
}

/// Spawns commands on behalf of a pipeline stage.
pub struct ProcessRunner;

impl ProcessRunner {
    /// Start a command with stdout and stderr merged into one line stream.
    pub fn execute(stage: StageKind, spec: &CommandSpec) -> Result<RunningProcess> {
        debug!(stage = %stage, command = %spec, cwd = ?spec.cwd, "Spawning command");

        let mut child = spec
            .to_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildError::Spawn {
                stage,
                command: spec.to_string(),
                source,
            })?;

        let (tx, lines) = mpsc::unbounded_channel();

        // Read both pipes concurrently so neither can fill up and block the child
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let handle = ProcessHandle::new(child.id());

        Ok(RunningProcess {
            stage,
            command: spec.to_string(),
            child,
            lines,
            handle,
        })
    }

    /// Run an auxiliary query to completion and return its trimmed stdout.
    pub async fn capture(stage: StageKind, spec: &CommandSpec) -> Result<String> {
        debug!(stage = %stage, command = %spec, "Running query");

        let output = spec
            .to_command()
            .output()
            .await
            .map_err(|source| BuildError::Spawn {
                stage,
                command: spec.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stage = %stage, command = %spec, stderr = %stderr.trim(), "Query failed");
            return Err(BuildError::stage_failed(
                stage,
                spec.to_string(),
                output.status.code(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

async fn forward_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading child output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn drain(mut process: RunningProcess) -> (Vec<String>, Result<()>) {
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await {
            lines.push(line.trim_end().to_string());
        }
        (lines, process.wait().await)
    }

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new("cmake")
            .args(["--build", "build-wmma"])
            .arg("-j")
            .arg("16");
        assert_eq!(spec.to_string(), "cmake --build build-wmma -j 16");
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["hipconfig".to_string(), "-l".to_string()];
        let spec = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(spec.program, "hipconfig");
        assert_eq!(spec.args, vec!["-l"]);

        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn test_merges_stdout_and_stderr() {
        let spec = CommandSpec::shell("echo out; echo err 1>&2");
        let process = ProcessRunner::execute(StageKind::SyncSource, &spec).unwrap();

        let (mut lines, result) = drain(process).await;
        lines.sort();

        assert!(result.is_ok());
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_stage_failure() {
        let spec = CommandSpec::shell("echo partial; exit 3");
        let process = ProcessRunner::execute(StageKind::Configure, &spec).unwrap();

        let (lines, result) = drain(process).await;

        assert_eq!(lines, vec!["partial"]);
        match result {
            Err(BuildError::StageFailure { stage, code, .. }) => {
                assert_eq!(stage, StageKind::Configure);
                assert_eq!(code, Some(3));
            }
            other => panic!("expected stage failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-opsdash");
        let result = ProcessRunner::execute(StageKind::Compile, &spec);
        assert!(matches!(result, Err(BuildError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("marker.txt"), "x").unwrap();

        let spec = CommandSpec::new("ls").current_dir(temp_dir.path());
        let process = ProcessRunner::execute(StageKind::SyncSource, &spec).unwrap();

        let (lines, result) = drain(process).await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["marker.txt"]);
    }

    #[tokio::test]
    async fn test_terminate_cancels_long_running_command() {
        let spec = CommandSpec::shell("echo started; exec sleep 30");
        let mut process = ProcessRunner::execute(StageKind::Compile, &spec).unwrap();
        let handle = process.handle();

        assert_eq!(process.next_line().await.unwrap().trim_end(), "started");
        handle.terminate();
        handle.terminate();

        let result = tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .expect("terminated process should exit promptly");
        assert!(matches!(
            result,
            Err(BuildError::CancellationRequested {
                stage: StageKind::Compile
            })
        ));
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_harmless() {
        let spec = CommandSpec::new("true");
        let process = ProcessRunner::execute(StageKind::Compile, &spec).unwrap();
        let handle = process.handle();

        let (_, result) = drain(process).await;
        assert!(result.is_ok());

        handle.terminate();
        assert!(handle.is_terminated());
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_lossy() {
        let spec = CommandSpec::shell("printf 'ok \\377\\n'");
        let process = ProcessRunner::execute(StageKind::Compile, &spec).unwrap();

        let (lines, result) = drain(process).await;
        assert!(result.is_ok());
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
    }

    #[tokio::test]
    async fn test_capture_trims_output() {
        let spec = CommandSpec::shell("echo '  /opt/rocm/llvm/bin  '");
        let out = ProcessRunner::capture(StageKind::Configure, &spec)
            .await
            .unwrap();
        assert_eq!(out, "/opt/rocm/llvm/bin");
    }

    #[tokio::test]
    async fn test_capture_failure() {
        let spec = CommandSpec::shell("echo nope 1>&2; exit 2");
        let result = ProcessRunner::capture(StageKind::Configure, &spec).await;
        assert!(matches!(
            result,
            Err(BuildError::StageFailure { code: Some(2), .. })
        ));
    }
}
