use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// Pids of every live child spawned through one harness.
///
/// Process handles register on spawn and deregister once the exit has
/// been reaped, so whatever is left here is still running.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, label: &str) {
        self.inner.lock().insert(pid, label.to_string());
    }

    pub fn deregister(&self, pid: u32) {
        self.inner.lock().remove(&pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// SIGKILL every registered process and forget about it.
    ///
    /// Safe to call any number of times and from any context; errors are
    /// logged, never returned. Returns how many processes were signalled.
    pub fn kill_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.inner.lock());
        let mut killed = 0;

        for (pid, label) in entries {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => {
                    tracing::debug!(pid, %label, "killed leftover process");
                    killed += 1;
                }
                // Already gone
                Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid, %label, error = %e, "failed to kill process"),
            }
        }

        killed
    }
}

/// Kills a registry's processes when the harness process is interrupted.
///
/// The listener task is aborted when the hook is dropped.
#[derive(Debug)]
pub struct ExitHook {
    registry: ProcessRegistry,
    scratch_dirs: Arc<Mutex<Vec<PathBuf>>>,
    task: JoinHandle<()>,
}

impl ExitHook {
    /// Also delete `dir` when the hook fires.
    pub fn remove_on_exit(&self, dir: impl Into<PathBuf>) {
        self.scratch_dirs.lock().push(dir.into());
    }

    /// Run the cleanup the signal handler would run, without exiting.
    pub fn cleanup(&self) -> usize {
        cleanup(&self.registry, &self.scratch_dirs)
    }
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn cleanup(registry: &ProcessRegistry, scratch_dirs: &Mutex<Vec<PathBuf>>) -> usize {
    let killed = registry.kill_all();
    for dir in scratch_dirs.lock().drain(..) {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory");
            }
        }
    }
    killed
}

/// Listen for SIGINT, SIGTERM and SIGHUP; on the first one, kill everything
/// in `registry`, remove registered scratch directories and exit with
/// `128 + signo`.
///
/// Must be called from within a tokio runtime.
pub fn register_exit_handler(registry: &ProcessRegistry) -> std::io::Result<ExitHook> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let scratch_dirs = Arc::new(Mutex::new(Vec::new()));
    let task_registry = registry.clone();
    let task_dirs = scratch_dirs.clone();

    let task = tokio::spawn(async move {
        let code = tokio::select! {
            _ = sigint.recv() => 130,
            _ = sigterm.recv() => 143,
            _ = sighup.recv() => 129,
        };

        let killed = cleanup(&task_registry, &task_dirs);
        tracing::warn!(killed, "harness interrupted, child processes killed");
        std::process::exit(code);
    });

    Ok(ExitHook {
        registry: registry.clone(),
        scratch_dirs,
        task,
    })
}
