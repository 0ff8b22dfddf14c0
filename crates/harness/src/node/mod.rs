mod identity;
mod ports;
mod state;

use std::ffi::OsString;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use url::Url;

pub use identity::{NodeIdentity, SeedAddress, SeedParseError};
pub use ports::PortAllocator;
pub use state::{NodeRuntime, NodeState};

use crate::client::{ApiClient, ApiError};
use crate::config::HarnessConfig;
use crate::probe::DynProbe;
use crate::process::{ProcessError, ProcessExit, ProcessHandle, ProcessRegistry, ProcessSpec, RunningProcess};
use identity::InitOutput;

/// Everything the harness decides for a node before it exists.
pub(crate) struct NodeSetup {
    /// Unique across the scenario
    pub name: String,
    /// Human-readable handle, may repeat across nodes
    pub handle: String,
    pub passphrase: String,
    pub home: PathBuf,
    pub checkouts: PathBuf,
    pub api_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub seeds: Vec<SeedAddress>,
    pub agent_env: Option<(String, PathBuf)>,
    pub config: Arc<HarnessConfig>,
    pub registry: ProcessRegistry,
    pub probe: DynProbe,
}

struct NodeInner {
    setup: NodeSetup,
    seeds: Mutex<Vec<SeedAddress>>,
    state: tokio::sync::Mutex<NodeState>,
}

/// One simulated network participant.
///
/// Clones share the same node. Lifecycle operations on one node are
/// serialized; different nodes never share directories or ports.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.inner.setup.name)
            .field("api_addr", &self.inner.setup.api_addr)
            .field("peer_addr", &self.inner.setup.peer_addr)
            .finish()
    }
}

impl NodeHandle {
    pub(crate) fn new(mut setup: NodeSetup) -> Self {
        let seeds = std::mem::take(&mut setup.seeds);
        Self {
            inner: Arc::new(NodeInner {
                setup,
                seeds: Mutex::new(seeds),
                state: tokio::sync::Mutex::new(NodeState::Configured),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.setup.name
    }

    pub fn handle(&self) -> &str {
        &self.inner.setup.handle
    }

    pub fn passphrase(&self) -> &str {
        &self.inner.setup.passphrase
    }

    pub fn home(&self) -> &Path {
        &self.inner.setup.home
    }

    pub fn checkouts(&self) -> &Path {
        &self.inner.setup.checkouts
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.inner.setup.api_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.setup.peer_addr
    }

    pub fn api_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://{}", self.inner.setup.api_addr))
    }

    pub fn same_node(&self, other: &NodeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Seeds the node is launched with.
    pub fn seeds(&self) -> Vec<SeedAddress> {
        self.inner.seeds.lock().clone()
    }

    /// Remember a seed for the next launch. Returns false if already known.
    pub fn add_seed(&self, seed: SeedAddress) -> bool {
        let mut seeds = self.inner.seeds.lock();
        if seeds.contains(&seed) {
            return false;
        }
        seeds.push(seed);
        true
    }

    pub async fn state_name(&self) -> &'static str {
        self.inner.state.lock().await.name()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.is_running()
    }

    /// Pid of the node process while it runs.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.state.lock().await.runtime().map(NodeRuntime::pid)
    }

    // ========================================
    // Accessors
    // ========================================

    pub async fn identity(&self) -> Result<NodeIdentity, NodeError> {
        let state = self.inner.state.lock().await;
        state
            .identity()
            .cloned()
            .ok_or_else(|| self.not_ready("identity", &state))
    }

    pub async fn peer_id(&self) -> Result<String, NodeError> {
        Ok(self.identity().await?.peer_id)
    }

    pub async fn urn(&self) -> Result<String, NodeError> {
        Ok(self.identity().await?.urn)
    }

    /// Client for the control API, only while the node runs.
    pub async fn client(&self) -> Result<ApiClient, NodeError> {
        let state = self.inner.state.lock().await;
        state
            .runtime()
            .map(|runtime| runtime.client.clone())
            .ok_or_else(|| self.not_ready("client", &state))
    }

    pub async fn auth_token(&self) -> Result<String, NodeError> {
        let state = self.inner.state.lock().await;
        state
            .runtime()
            .and_then(|runtime| runtime.client.auth_token())
            .map(str::to_string)
            .ok_or_else(|| self.not_ready("auth token", &state))
    }

    /// Address other nodes use to find this one.
    pub async fn seed_address(&self) -> Result<SeedAddress, NodeError> {
        let peer_id = self.peer_id().await?;
        Ok(SeedAddress::new(peer_id, self.inner.setup.peer_addr))
    }

    /// Output captured from the running or last exited node process.
    pub async fn output(&self) -> String {
        match &*self.inner.state.lock().await {
            NodeState::Started { runtime } | NodeState::Onboarded { runtime, .. } => {
                runtime.process.output()
            }
            NodeState::Stopped { exit, .. } => exit.output.clone(),
            _ => String::new(),
        }
    }

    fn not_ready(&self, field: &'static str, state: &NodeState) -> NodeError {
        NodeError::NotReady {
            node: self.name().to_string(),
            field,
            state: state.name(),
        }
    }

    fn invalid_transition(&self, op: &'static str, state: &NodeState) -> NodeError {
        NodeError::InvalidTransition {
            node: self.name().to_string(),
            op,
            state: state.name(),
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Create the node's identity with the one-shot init tool.
    pub async fn init(&self) -> Result<NodeIdentity, NodeError> {
        let mut state = self.inner.state.lock().await;
        if !matches!(*state, NodeState::Configured) {
            return Err(self.invalid_transition("init", &state));
        }

        self.ensure_dirs()?;

        let setup = &self.inner.setup;
        let backend = &setup.config.backend;
        let spec = ProcessSpec::new(&backend.init_program)
            .args(backend.init_args.iter())
            .arg("--name")
            .arg(&setup.handle)
            .arg("--passphrase")
            .arg(&setup.passphrase)
            .envs(self.env_vars())
            .label(format!("{}-init", setup.name))
            .output_capacity(setup.config.output_capacity)
            .forward_output(setup.config.forward_output);

        let exit = ProcessHandle::new(spec, setup.registry.clone()).run().await?;
        if !exit.success() {
            return Err(NodeError::Init {
                node: setup.name.clone(),
                exit: exit.to_string(),
                output: exit.output,
            });
        }

        let descriptor = InitOutput::find(&exit.output).ok_or_else(|| NodeError::InitOutput {
            node: setup.name.clone(),
            output: exit.output.clone(),
        })?;

        let identity = NodeIdentity {
            handle: setup.handle.clone(),
            peer_id: descriptor.peer_id,
            urn: descriptor.urn,
            passphrase: setup.passphrase.clone(),
        };
        tracing::info!(node = %setup.name, peer_id = %identity.peer_id, "identity created");

        *state = NodeState::Initialized {
            identity: identity.clone(),
        };
        Ok(identity)
    }

    /// Spawn the node process and wait until its control API accepts
    /// connections.
    ///
    /// Fails fast if the node is already running. A node whose process died
    /// on its own is relaunched. A node that does not
    /// become reachable within the startup timeout is killed and the error
    /// carries the tail of its output.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut state = self.inner.state.lock().await;
        let identity = match &*state {
            NodeState::Configured => None,
            NodeState::Initialized { identity } => Some(identity.clone()),
            NodeState::Stopped { identity, .. } => identity.clone(),
            live if live.is_running() => {
                return Err(NodeError::AlreadyRunning {
                    node: self.name().to_string(),
                })
            }
            crashed => {
                tracing::warn!(node = %self.name(), state = crashed.name(), "node process exited on its own, relaunching");
                crashed.identity().cloned()
            }
        };

        self.ensure_dirs()?;

        let setup = &self.inner.setup;
        let process = ProcessHandle::new(self.node_spec(), setup.registry.clone());
        let running = process.start()?;
        tracing::info!(
            node = %setup.name,
            pid = running.pid(),
            api = %setup.api_addr,
            peer = %setup.peer_addr,
            "node spawned, waiting for control API"
        );

        let client = match self.connect(&process, &running).await {
            Ok(client) => client,
            Err(e) => {
                process.kill();
                if let Err(wait_err) = running.wait().await {
                    tracing::warn!(node = %setup.name, error = %wait_err, "failed to reap node after startup failure");
                }
                return Err(e);
            }
        };

        tracing::info!(node = %setup.name, "node ready");

        let runtime = NodeRuntime {
            process,
            running,
            client,
        };
        *state = match identity {
            Some(identity) => NodeState::Onboarded { runtime, identity },
            None => NodeState::Started { runtime },
        };
        Ok(())
    }

    /// Create an identity over the control API for a node started without
    /// the init tool.
    pub async fn onboard(&self) -> Result<NodeIdentity, NodeError> {
        let mut state = self.inner.state.lock().await;
        let client = match &*state {
            NodeState::Started { runtime } => runtime.client.clone(),
            other => return Err(self.invalid_transition("onboard", other)),
        };

        let created = client.create_identity(self.handle()).await?;
        let identity = NodeIdentity {
            handle: created.handle,
            peer_id: created.peer_id,
            urn: created.urn,
            passphrase: self.inner.setup.passphrase.clone(),
        };
        tracing::info!(node = %self.name(), peer_id = %identity.peer_id, "node onboarded");

        *state = match std::mem::replace(&mut *state, NodeState::Configured) {
            NodeState::Started { runtime } => NodeState::Onboarded {
                runtime,
                identity: identity.clone(),
            },
            other => other,
        };
        Ok(identity)
    }

    /// Kill the node process and wait for its exit.
    ///
    /// Returns `None` when nothing was running.
    pub async fn stop(&self) -> Result<Option<ProcessExit>, NodeError> {
        let mut state = self.inner.state.lock().await;
        let (runtime, identity) = match std::mem::replace(&mut *state, NodeState::Configured) {
            NodeState::Started { runtime } => (runtime, None),
            NodeState::Onboarded { runtime, identity } => (runtime, Some(identity)),
            other => {
                *state = other;
                return Ok(None);
            }
        };

        tracing::debug!(node = %self.name(), pid = runtime.pid(), "stopping node");
        runtime.process.kill();

        match runtime.running.wait().await {
            Ok(exit) => {
                tracing::info!(node = %self.name(), %exit, "node stopped");
                *state = NodeState::Stopped {
                    exit: exit.clone(),
                    identity,
                };
                Ok(Some(exit))
            }
            Err(e) => {
                *state = match identity {
                    Some(identity) => NodeState::Initialized { identity },
                    None => NodeState::Configured,
                };
                Err(e.into())
            }
        }
    }

    /// Delete the home and checkout directories. The node must not be running.
    pub async fn remove_dirs(&self) -> Result<(), NodeError> {
        let state = self.inner.state.lock().await;
        if state.is_running() {
            return Err(self.invalid_transition("remove directories", &state));
        }

        for dir in [self.home(), self.checkouts()] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ========================================
    // Auxiliary processes
    // ========================================

    /// A process in the node's environment: its home directory, the
    /// signing agent socket and a `PATH` that finds the backend's
    /// companion tools. Runs in the checkout directory.
    pub fn spawn<I, S>(&self, program: impl Into<PathBuf>, args: I) -> Result<ProcessHandle, NodeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.ensure_dirs()?;

        let setup = &self.inner.setup;
        let spec = ProcessSpec::new(program);
        let label = format!("{}:{}", setup.name, spec.label);
        let spec = spec
            .args(args)
            .envs(self.env_vars())
            .current_dir(&setup.checkouts)
            .label(label)
            .output_capacity(setup.config.output_capacity)
            .forward_output(setup.config.forward_output);

        Ok(ProcessHandle::new(spec, setup.registry.clone()))
    }

    /// [`NodeHandle::spawn`] and wait for the exit.
    pub async fn exec<I, S>(&self, program: impl Into<PathBuf>, args: I) -> Result<ProcessExit, NodeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(self.spawn(program, args)?.run().await?)
    }

    // ========================================
    // Internals
    // ========================================

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.home())?;
        std::fs::create_dir_all(self.checkouts())
    }

    fn env_vars(&self) -> Vec<(OsString, OsString)> {
        let setup = &self.inner.setup;
        let mut vars = vec![(
            OsString::from(&setup.config.home_env_var),
            setup.home.clone().into_os_string(),
        )];

        if let Some((var, socket)) = &setup.agent_env {
            vars.push((OsString::from(var), socket.clone().into_os_string()));
        }

        let program_dir = setup
            .config
            .backend
            .node_program
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf);
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = setup
            .config
            .tools_dir
            .clone()
            .into_iter()
            .chain(program_dir)
            .chain(std::env::split_paths(&inherited));

        match std::env::join_paths(dirs) {
            Ok(path) => vars.push((OsString::from("PATH"), path)),
            Err(e) => tracing::warn!(node = %setup.name, error = %e, "cannot extend PATH, inheriting it"),
        }

        vars
    }

    fn node_spec(&self) -> ProcessSpec {
        let setup = &self.inner.setup;
        let backend = &setup.config.backend;

        let mut spec = ProcessSpec::new(&backend.node_program)
            .arg("--http-listen")
            .arg(setup.api_addr.to_string())
            .arg("--peer-listen")
            .arg(setup.peer_addr.to_string())
            .arg("--key-passphrase")
            .arg(&setup.passphrase);

        for seed in self.seeds() {
            spec = spec.arg("--seed").arg(seed.to_string());
        }

        spec.args(backend.node_args.iter())
            .envs(self.env_vars())
            .current_dir(&setup.checkouts)
            .label(setup.name.clone())
            .output_capacity(setup.config.output_capacity)
            .forward_output(setup.config.forward_output)
    }

    async fn connect(
        &self,
        process: &ProcessHandle,
        running: &RunningProcess,
    ) -> Result<ApiClient, NodeError> {
        self.wait_until_reachable(process, running).await?;

        let setup = &self.inner.setup;
        let mut client = ApiClient::new(&self.api_url().map_err(ApiError::from)?)?;
        if setup.config.unseal_keystore {
            client
                .unseal(&setup.passphrase)
                .await
                .map_err(|source| NodeError::Unseal {
                    node: setup.name.clone(),
                    source,
                })?;
        }
        Ok(client)
    }

    async fn wait_until_reachable(
        &self,
        process: &ProcessHandle,
        running: &RunningProcess,
    ) -> Result<(), NodeError> {
        let setup = &self.inner.setup;
        let timeout = setup.config.startup_timeout();
        let started = Instant::now();

        loop {
            if setup.probe.is_reachable(setup.api_addr).await {
                tracing::debug!(node = %setup.name, elapsed = ?started.elapsed(), "control API reachable");
                return Ok(());
            }

            if running.is_finished() {
                return Err(NodeError::ExitedDuringStartup {
                    node: setup.name.clone(),
                    exit: process
                        .exit()
                        .map(|exit| exit.to_string())
                        .unwrap_or_else(|| "unknown exit".to_string()),
                    output: process.output(),
                });
            }

            if started.elapsed() >= timeout {
                return Err(NodeError::Unreachable {
                    node: setup.name.clone(),
                    addr: setup.api_addr,
                    timeout,
                    output: process.output(),
                });
            }

            tokio::time::sleep(setup.config.probe_interval()).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node '{node}' is already running")]
    AlreadyRunning { node: String },
    #[error("node '{node}': {field} is not available while {state}")]
    NotReady {
        node: String,
        field: &'static str,
        state: &'static str,
    },
    #[error("node '{node}': cannot {op} while {state}")]
    InvalidTransition {
        node: String,
        op: &'static str,
        state: &'static str,
    },
    #[error("node '{node}': identity init failed ({exit})\n{output}")]
    Init {
        node: String,
        exit: String,
        output: String,
    },
    #[error("node '{node}': init printed no identity descriptor\n{output}")]
    InitOutput { node: String, output: String },
    #[error("node '{node}': control API at {addr} not reachable within {timeout:?}\n{output}")]
    Unreachable {
        node: String,
        addr: SocketAddr,
        timeout: Duration,
        output: String,
    },
    #[error("node '{node}' exited during startup ({exit})\n{output}")]
    ExitedDuringStartup {
        node: String,
        exit: String,
        output: String,
    },
    #[error("node '{node}': failed to unseal keystore: {source}")]
    Unseal {
        node: String,
        #[source]
        source: ApiError,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use super::*;
    use crate::config::BackendConfig;
    use crate::probe::tests::FlakyProbe;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_node(dir: &TempDir, node_body: &str, init_body: &str, failures: usize) -> (NodeHandle, ProcessRegistry) {
        let node_program = script(dir.path(), "node.sh", node_body);
        let init_program = script(dir.path(), "init.sh", init_body);
        let config = HarnessConfig {
            backend: BackendConfig {
                node_program,
                node_args: vec![],
                init_program,
                init_args: vec![],
            },
            startup_timeout_ms: 300,
            probe_interval_ms: 10,
            forward_output: false,
            unseal_keystore: false,
            ..HarnessConfig::default()
        };
        let ports = PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let registry = ProcessRegistry::new();

        let node = NodeHandle::new(NodeSetup {
            name: "alice-1234".to_string(),
            handle: "alice".to_string(),
            passphrase: "secret".to_string(),
            home: dir.path().join("alice-1234-home"),
            checkouts: dir.path().join("alice-1234-checkouts"),
            api_addr: ports.allocate().unwrap(),
            peer_addr: ports.allocate().unwrap(),
            seeds: vec![],
            agent_env: None,
            config: Arc::new(config),
            registry: registry.clone(),
            probe: Arc::new(FlakyProbe {
                failures,
                calls: AtomicUsize::new(0),
            }),
        });
        (node, registry)
    }

    const INIT_OK: &str = r#"echo "generating keys" 1>&2; echo '{"peerId":"hyb-alice","urn":"urn:ident:alice"}'"#;

    #[tokio::test]
    async fn test_accessors_fail_before_transitions() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", INIT_OK, 0);

        assert_eq!(node.state_name().await, "configured");
        assert!(matches!(node.identity().await, Err(NodeError::NotReady { field: "identity", .. })));
        assert!(matches!(node.client().await, Err(NodeError::NotReady { field: "client", .. })));
        assert!(matches!(node.seed_address().await, Err(NodeError::NotReady { .. })));
        assert!(matches!(node.auth_token().await, Err(NodeError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_init_then_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let (node, registry) = test_node(&dir, "exec sleep 30", INIT_OK, 2);

        let identity = node.init().await.unwrap();
        assert_eq!(identity.peer_id, "hyb-alice");
        assert_eq!(identity.urn, "urn:ident:alice");
        assert_eq!(identity.handle, "alice");
        assert_eq!(node.state_name().await, "initialized");
        assert!(node.home().is_dir());
        assert!(node.checkouts().is_dir());

        // Identity is known, the client is not
        assert_eq!(node.peer_id().await.unwrap(), "hyb-alice");
        assert!(node.client().await.is_err());

        node.start().await.unwrap();
        assert_eq!(node.state_name().await, "onboarded");
        assert!(node.client().await.is_ok());
        assert_eq!(registry.len(), 1);

        let seed = node.seed_address().await.unwrap();
        assert_eq!(seed.to_string(), format!("hyb-alice@{}", node.peer_addr()));

        // Started without unsealing, so no token
        assert!(matches!(node.auth_token().await, Err(NodeError::NotReady { field: "auth token", .. })));

        assert!(matches!(node.start().await, Err(NodeError::AlreadyRunning { .. })));
        assert_eq!(registry.len(), 1);

        let exit = node.stop().await.unwrap().unwrap();
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(node.state_name().await, "stopped");
        assert!(registry.is_empty());

        // Identity survives the stop; stopping again is a no-op
        assert_eq!(node.peer_id().await.unwrap(), "hyb-alice");
        assert!(node.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", INIT_OK, 0);

        node.init().await.unwrap();
        node.start().await.unwrap();
        node.stop().await.unwrap();
        node.start().await.unwrap();
        assert_eq!(node.state_name().await, "onboarded");
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", INIT_OK, 0);

        node.init().await.unwrap();
        assert!(matches!(node.init().await, Err(NodeError::InvalidTransition { op: "init", .. })));
    }

    #[tokio::test]
    async fn test_init_failure_carries_output() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", "echo 'bad passphrase' 1>&2; exit 2", 0);

        match node.init().await {
            Err(NodeError::Init { exit, output, .. }) => {
                assert_eq!(exit, "exit status 2");
                assert!(output.contains("bad passphrase"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(node.state_name().await, "configured");
    }

    #[tokio::test]
    async fn test_init_without_descriptor() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", "echo done", 0);
        assert!(matches!(node.init().await, Err(NodeError::InitOutput { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_killed() {
        let dir = TempDir::new().unwrap();
        let (node, registry) = test_node(&dir, "echo 'booting'; exec sleep 30", INIT_OK, usize::MAX);

        match node.start().await {
            Err(NodeError::Unreachable { output, .. }) => assert!(output.contains("booting")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(registry.is_empty());
        assert_eq!(node.state_name().await, "configured");
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "echo 'address in use'; exit 7", INIT_OK, usize::MAX);

        match node.start().await {
            Err(NodeError::ExitedDuringStartup { exit, output, .. }) => {
                assert_eq!(exit, "exit status 7");
                assert!(output.contains("address in use"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_node_process_gets_launch_args() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "echo \"$@\"; exec sleep 30", INIT_OK, 0);
        node.add_seed("hyb-bob@127.0.0.1:9000".parse().unwrap());
        assert!(!node.add_seed("hyb-bob@127.0.0.1:9000".parse().unwrap()));

        node.start().await.unwrap();
        crate::retry::eventually(crate::retry::RetryPolicy::new(Duration::from_millis(20), 50), || async {
            let output = node.output().await;
            if output.contains("--seed hyb-bob@127.0.0.1:9000") {
                Ok(output)
            } else {
                Err(format!("launch args not printed yet: {:?}", output))
            }
        })
        .await
        .unwrap();

        let output = node.output().await;
        assert!(output.contains(&format!("--http-listen {}", node.api_addr())));
        assert!(output.contains(&format!("--peer-listen {}", node.peer_addr())));
        assert!(output.contains("--key-passphrase secret"));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_uses_node_environment() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", INIT_OK, 0);

        let exit = node
            .exec("sh", ["-c", "echo $PEER_HOME; pwd; echo $PATH"])
            .await
            .unwrap();
        let lines: Vec<_> = exit.output.lines().collect();

        assert!(exit.success());
        assert_eq!(lines[0], node.home().display().to_string());
        assert!(lines[1].ends_with("alice-1234-checkouts"));
        // Directory holding the backend binary comes first on PATH
        assert!(lines[2].starts_with(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_remove_dirs() {
        let dir = TempDir::new().unwrap();
        let (node, _) = test_node(&dir, "exec sleep 30", INIT_OK, 0);

        node.start().await.unwrap();
        assert!(node.remove_dirs().await.is_err());

        node.stop().await.unwrap();
        node.remove_dirs().await.unwrap();
        assert!(!node.home().exists());
        assert!(!node.checkouts().exists());
    }

    #[tokio::test]
    async fn test_crashed_node_is_not_running_and_relaunches() {
        let dir = TempDir::new().unwrap();
        let (node, registry) = test_node(&dir, "sleep 0.2; exit 3", INIT_OK, 0);

        node.init().await.unwrap();
        node.start().await.unwrap();
        assert!(node.is_running().await);

        crate::retry::eventually(crate::retry::RetryPolicy::new(Duration::from_millis(20), 100), || async {
            if node.is_running().await {
                Err("node still running")
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(node.state_name().await, "onboarded");
        assert!(registry.is_empty());

        // A dead process does not block the next launch
        node.start().await.unwrap();
        assert_eq!(node.peer_id().await.unwrap(), "hyb-alice");
        let exit = node.stop().await.unwrap().unwrap();
        assert!(exit.status == Some(3) || exit.signal.as_deref() == Some("SIGKILL"));
    }
}
