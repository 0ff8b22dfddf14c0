mod registry;

use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub use registry::{register_exit_handler, ExitHook, ProcessRegistry};

use crate::output::OutputBuffer;

pub const DEFAULT_OUTPUT_CAPACITY: usize = 500;

/// How long to keep draining pipes after the child exited. Grandchildren
/// that inherited the pipes can hold them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to launch and how to present its output.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Overrides layered on top of the inherited environment
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
    /// Prefix for forwarded output lines and log fields
    pub label: String,
    /// Number of output lines retained for diagnostics
    pub output_capacity: usize,
    /// Echo every line to our own stdout/stderr as it arrives
    pub forward_output: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let label = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            label,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            forward_output: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    pub fn forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

/// How a process ended, plus the tail of what it printed.
///
/// Exactly one of `status` and `signal` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: Option<i32>,
    pub signal: Option<String>,
    pub output: String,
}

impl ProcessExit {
    fn from_status(status: ExitStatus, output: String) -> Self {
        Self {
            status: status.code(),
            signal: status.signal().map(signal_name),
            output,
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.status, &self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "killed by {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process '{label}' is already running")]
    AlreadyRunning { label: String },
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned process '{label}' has no pid")]
    MissingPid { label: String },
    #[error("failed waiting on process '{label}': {source}")]
    Wait {
        label: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
enum ProcessState {
    NotStarted,
    Running { pid: u32, kill: Arc<Notify> },
    Exited(ProcessExit),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct ProcessInner {
    spec: ProcessSpec,
    registry: ProcessRegistry,
    state: Mutex<ProcessState>,
    output: Mutex<OutputBuffer>,
}

/// Owns one OS process at a time.
///
/// Cloning is cheap and every clone observes the same process, so one task
/// can await the exit while another calls [`ProcessHandle::kill`].
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<ProcessInner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.inner.spec.label)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl ProcessHandle {
    pub fn new(spec: ProcessSpec, registry: ProcessRegistry) -> Self {
        let output = OutputBuffer::new(spec.output_capacity);
        Self {
            inner: Arc::new(ProcessInner {
                spec,
                registry,
                state: Mutex::new(ProcessState::NotStarted),
                output: Mutex::new(output),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.spec.label
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.inner.spec
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.inner.state.lock() {
            ProcessState::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.inner.state.lock(), ProcessState::Running { .. })
    }

    /// The result of the last run, once the OS reported its exit.
    pub fn exit(&self) -> Option<ProcessExit> {
        match &*self.inner.state.lock() {
            ProcessState::Exited(exit) => Some(exit.clone()),
            _ => None,
        }
    }

    /// Captured output of the current or last run.
    pub fn output(&self) -> String {
        self.inner.output.lock().to_text()
    }

    /// Spawn the process and return without waiting for it.
    ///
    /// Fails with [`ProcessError::AlreadyRunning`] while a previous start
    /// has not exited yet. A handle can be started again after its exit.
    ///
    /// The exit is only recorded once stdout and stderr are drained. When a
    /// descendant keeps the pipes open, that takes up to two seconds after
    /// the OS reports the exit, and a start in that window is rejected.
    /// Awaiting [`RunningProcess::wait`] first is always enough.
    pub fn start(&self) -> Result<RunningProcess, ProcessError> {
        let spec = &self.inner.spec;
        let mut state = self.inner.state.lock();

        if let ProcessState::Running { .. } = *state {
            return Err(ProcessError::AlreadyRunning {
                label: spec.label.clone(),
            });
        }

        let mut child = spec
            .command()
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        let pid = child.id().ok_or_else(|| ProcessError::MissingPid {
            label: spec.label.clone(),
        })?;

        *self.inner.output.lock() = OutputBuffer::new(spec.output_capacity);

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Stream::Stdout, self.inner.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Stream::Stderr, self.inner.clone())));
        }

        let kill = Arc::new(Notify::new());
        self.inner.registry.register(pid, &spec.label);
        *state = ProcessState::Running {
            pid,
            kill: kill.clone(),
        };
        drop(state);

        tracing::debug!(label = %spec.label, pid, program = %spec.program.display(), "process started");

        let inner = self.inner.clone();
        let waiter = tokio::spawn(async move { inner.supervise(child, pid, kill, pumps).await });

        Ok(RunningProcess { pid, waiter })
    }

    /// Spawn the process and wait for it to exit by any means.
    ///
    /// A non-zero exit status is a successful result.
    pub async fn run(&self) -> Result<ProcessExit, ProcessError> {
        self.start()?.wait().await
    }

    /// Ask the OS to kill the process (SIGKILL).
    ///
    /// The state only changes once the exit is observed, so callers await
    /// [`RunningProcess::wait`] afterwards. A no-op unless running.
    pub fn kill(&self) {
        if let ProcessState::Running { pid, kill } = &*self.inner.state.lock() {
            tracing::debug!(label = %self.inner.spec.label, pid, "kill requested");
            kill.notify_one();
        }
    }
}

impl ProcessInner {
    async fn supervise(
        self: Arc<Self>,
        mut child: Child,
        pid: u32,
        kill: Arc<Notify>,
        pumps: Vec<JoinHandle<()>>,
    ) -> Result<ProcessExit, ProcessError> {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.notified() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(label = %self.spec.label, pid, error = %e, "failed to signal process");
                }
                child.wait().await
            }
        };

        self.registry.deregister(pid);

        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        for mut pump in pumps {
            if tokio::time::timeout_at(drain_deadline, &mut pump)
                .await
                .is_err()
            {
                tracing::warn!(label = %self.spec.label, pid, "output still open after exit, detaching");
                pump.abort();
            }
        }

        let output = self.output.lock().to_text();
        let mut state = self.state.lock();
        match status {
            Ok(status) => {
                let exit = ProcessExit::from_status(status, output);
                tracing::debug!(label = %self.spec.label, pid, %exit, "process exited");
                *state = ProcessState::Exited(exit.clone());
                Ok(exit)
            }
            Err(source) => {
                *state = ProcessState::NotStarted;
                Err(ProcessError::Wait {
                    label: self.spec.label.clone(),
                    source,
                })
            }
        }
    }

    fn record(&self, stream: Stream, line: &str) {
        if self.spec.forward_output {
            match stream {
                Stream::Stdout => println!("[{}] {}", self.spec.label, line),
                Stream::Stderr => eprintln!("[{}] {}", self.spec.label, line),
            }
        }
        self.output.lock().push(line);
    }
}

/// Reads complete lines; a trailing partial line is emitted at end of stream.
async fn pump<R>(reader: R, stream: Stream, inner: Arc<ProcessInner>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                inner.record(stream, line.trim_end_matches(|c| c == '\n' || c == '\r'));
            }
            Err(e) => {
                tracing::warn!(label = %inner.spec.label, ?stream, error = %e, "output stream failed");
                break;
            }
        }
    }
}

/// A started process. Awaiting [`RunningProcess::wait`] yields its exit.
#[derive(Debug)]
pub struct RunningProcess {
    pid: u32,
    waiter: JoinHandle<Result<ProcessExit, ProcessError>>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True once the exit has been observed.
    pub fn is_finished(&self) -> bool {
        self.waiter.is_finished()
    }

    pub async fn wait(self) -> Result<ProcessExit, ProcessError> {
        self.waiter.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh")
            .args(["-c", script])
            .label("test-sh")
            .forward_output(false)
    }

    #[tokio::test]
    async fn test_run_collects_exit_status_and_output() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::new(sh("echo out; echo err 1>&2; exit 3"), registry.clone());

        let exit = handle.run().await.unwrap();

        assert_eq!(exit.status, Some(3));
        assert_eq!(exit.signal, None);
        assert!(!exit.success());
        assert!(exit.output.contains("out"));
        assert!(exit.output.contains("err"));
        assert!(registry.is_empty());
        assert_eq!(handle.exit(), Some(exit));
    }

    #[tokio::test]
    async fn test_partial_last_line_is_flushed() {
        let handle = ProcessHandle::new(sh("printf 'one\\ntwo'"), ProcessRegistry::new());
        let exit = handle.run().await.unwrap();
        assert_eq!(exit.output, "one\ntwo");
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let spec = sh("for i in 1 2 3 4 5 6; do echo line$i; done").output_capacity(2);
        let handle = ProcessHandle::new(spec, ProcessRegistry::new());
        let exit = handle.run().await.unwrap();
        assert_eq!(exit.output, "line5\nline6");
    }

    #[tokio::test]
    async fn test_env_and_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo $HARNESS_TEST_VAR; pwd")
            .env("HARNESS_TEST_VAR", "hello")
            .current_dir(dir.path());
        let handle = ProcessHandle::new(spec, ProcessRegistry::new());
        let exit = handle.run().await.unwrap();

        let dir_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(exit.output.starts_with("hello\n"));
        assert!(exit.output.contains(&dir_name));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let spec = ProcessSpec::new("/nonexistent/harness-binary-12345").forward_output(false);
        let handle = ProcessHandle::new(spec, ProcessRegistry::new());
        let result = handle.run().await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_second_start_while_running_fails() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::new(sh("sleep 30"), registry.clone());

        let running = handle.start().unwrap();
        let second = handle.start();
        assert!(matches!(second, Err(ProcessError::AlreadyRunning { .. })));
        assert_eq!(registry.len(), 1);

        handle.kill();
        let exit = running.wait().await.unwrap();
        assert_eq!(exit.status, None);
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let handle = ProcessHandle::new(sh("exit 0"), ProcessRegistry::new());

        // Never started
        handle.kill();
        handle.kill();

        let exit = handle.run().await.unwrap();
        assert!(exit.success());

        // Already exited
        handle.kill();
        handle.kill();
        assert_eq!(handle.exit(), Some(exit));
    }

    #[tokio::test]
    async fn test_kill_many_times_while_running() {
        let handle = ProcessHandle::new(sh("sleep 1; echo done"), ProcessRegistry::new());
        let running = handle.start().unwrap();
        handle.kill();
        handle.kill();
        handle.kill();
        let exit = running.wait().await.unwrap();
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));

        // Extra kill requests do not leak into the next run
        let exit = handle.run().await.unwrap();
        assert!(exit.success());
        assert_eq!(exit.output, "done");
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let handle = ProcessHandle::new(sh("echo again"), ProcessRegistry::new());
        let first = handle.run().await.unwrap();
        let second = handle.run().await.unwrap();
        assert!(first.success());
        assert!(second.success());
        assert_eq!(second.output, "again");
    }

    #[tokio::test]
    async fn test_exit_recorded_when_descendant_holds_pipes() {
        let handle = ProcessHandle::new(sh("sleep 10 & echo done"), ProcessRegistry::new());

        let started = std::time::Instant::now();
        let exit = handle.run().await.unwrap();
        let elapsed = started.elapsed();

        assert!(exit.success());
        assert_eq!(exit.output, "done");
        assert!(elapsed >= OUTPUT_DRAIN_TIMEOUT, "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "returned after {:?}", elapsed);

        // Once the run resolved the handle is free again
        assert!(handle.start().is_ok());
        handle.kill();
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(1000), "SIG1000");
    }
}
