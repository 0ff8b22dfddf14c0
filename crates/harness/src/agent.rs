use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::process::{ProcessError, ProcessExit, ProcessHandle, ProcessRegistry, ProcessSpec, RunningProcess};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("signing agent exited before creating {}: {exit}\n{output}", socket.display())]
    Exited {
        socket: PathBuf,
        exit: String,
        output: String,
    },
    #[error("signing agent did not create {} within {timeout:?}\n{output}", socket.display())]
    Timeout {
        socket: PathBuf,
        timeout: Duration,
        output: String,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// The one signing agent every node of a scenario talks to.
///
/// Nodes only see the socket path, through the configured environment
/// variable.
#[derive(Debug)]
pub struct SigningAgent {
    socket: PathBuf,
    socket_env_var: String,
    process: ProcessHandle,
    running: Option<RunningProcess>,
}

impl SigningAgent {
    /// Launch `<program> <args...> <socket>` and wait for the socket file.
    pub async fn start(
        config: &AgentConfig,
        socket: impl Into<PathBuf>,
        registry: &ProcessRegistry,
        timeout: Duration,
        forward_output: bool,
    ) -> Result<Self, AgentError> {
        let socket = socket.into();
        let spec = ProcessSpec::new(&config.program)
            .args(config.args.iter())
            .arg(&socket)
            .label("agent")
            .forward_output(forward_output);

        let process = ProcessHandle::new(spec, registry.clone());
        let running = process.start()?;
        tracing::debug!(pid = running.pid(), socket = %socket.display(), "signing agent spawned");

        if let Err(e) = wait_for_socket(&socket, &process, &running, timeout).await {
            process.kill();
            if let Err(wait_err) = running.wait().await {
                tracing::warn!(error = %wait_err, "failed to reap signing agent");
            }
            return Err(e);
        }

        tracing::info!(socket = %socket.display(), "signing agent ready");
        Ok(Self {
            socket,
            socket_env_var: config.socket_env_var.clone(),
            process,
            running: Some(running),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn socket_env_var(&self) -> &str {
        &self.socket_env_var
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    /// Kill the agent and wait for it. Later calls return `None`.
    pub async fn stop(&mut self) -> Result<Option<ProcessExit>, AgentError> {
        let Some(running) = self.running.take() else {
            return Ok(None);
        };

        self.process.kill();
        let exit = running.wait().await?;
        tracing::debug!(%exit, "signing agent stopped");

        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(socket = %self.socket.display(), error = %e, "failed to remove agent socket");
            }
        }
        Ok(Some(exit))
    }
}

async fn wait_for_socket(
    socket: &Path,
    process: &ProcessHandle,
    running: &RunningProcess,
    timeout: Duration,
) -> Result<(), AgentError> {
    let started = Instant::now();
    loop {
        if socket.exists() {
            return Ok(());
        }
        if running.is_finished() {
            return Err(AgentError::Exited {
                socket: socket.to_path_buf(),
                exit: process
                    .exit()
                    .map(|exit| exit.to_string())
                    .unwrap_or_else(|| "unknown exit".to_string()),
                output: process.output(),
            });
        }
        if started.elapsed() >= timeout {
            return Err(AgentError::Timeout {
                socket: socket.to_path_buf(),
                timeout,
                output: process.output(),
            });
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_agent(script: &str) -> AgentConfig {
        AgentConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
            socket_env_var: "TEST_AUTH_SOCK".to_string(),
        }
    }

    #[tokio::test]
    async fn test_agent_ready_once_socket_exists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        // $1 is the socket path
        let config = sh_agent("touch \"$1\"; exec sleep 30");

        let mut agent = SigningAgent::start(
            &config,
            dir.path().join("agent.sock"),
            &registry,
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();

        assert!(agent.is_running());
        assert_eq!(agent.socket_env_var(), "TEST_AUTH_SOCK");
        assert_eq!(registry.len(), 1);

        let exit = agent.stop().await.unwrap().unwrap();
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
        assert!(!agent.socket().exists());
        assert!(registry.is_empty());
        assert!(agent.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_agent_exit_before_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_agent("echo 'no such option' 1>&2; exit 1");

        let result = SigningAgent::start(
            &config,
            dir.path().join("agent.sock"),
            &ProcessRegistry::new(),
            Duration::from_secs(5),
            false,
        )
        .await;

        match result {
            Err(AgentError::Exited { exit, output, .. }) => {
                assert_eq!(exit, "exit status 1");
                assert!(output.contains("no such option"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        let config = sh_agent("exec sleep 30");

        let result = SigningAgent::start(
            &config,
            dir.path().join("agent.sock"),
            &registry,
            Duration::from_millis(100),
            false,
        )
        .await;

        assert!(matches!(result, Err(AgentError::Timeout { .. })));
        assert!(registry.is_empty());
    }
}
