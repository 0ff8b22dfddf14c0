use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tempfile::TempDir;
use uuid::Uuid;

use crate::agent::SigningAgent;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::node::{NodeHandle, NodeSetup, PortAllocator, SeedAddress};
use crate::probe::{DynProbe, TcpProbe};
use crate::process::{register_exit_handler, ExitHook, ProcessRegistry};
use crate::retry::eventually;

/// What a new peer should look like.
#[derive(Debug, Clone)]
pub struct PeerParams {
    /// Handle of the peer; the directory name gets a random suffix
    pub name: String,
    /// Random when unset
    pub passphrase: Option<String>,
    /// Create the identity with the init tool before the first start.
    /// Otherwise the identity is created over the API once started.
    pub initialize: bool,
    pub seeds: Vec<SeedAddress>,
}

impl PeerParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passphrase: None,
            initialize: true,
            seeds: Vec::new(),
        }
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn initialize(mut self, initialize: bool) -> Self {
        self.initialize = initialize;
        self
    }

    pub fn seed(mut self, seed: SeedAddress) -> Self {
        self.seeds.push(seed);
        self
    }
}

/// Creates, wires and discards the nodes of one test scenario.
///
/// Everything lives under a fresh temporary root. Every process spawned
/// on the scenario's behalf is registered so it can be killed when the
/// harness is torn down, dropped, or the test process is interrupted.
pub struct NetworkHarness {
    config: Arc<HarnessConfig>,
    root: Option<TempDir>,
    root_path: PathBuf,
    registry: ProcessRegistry,
    exit_hook: ExitHook,
    agent: Option<SigningAgent>,
    ports: PortAllocator,
    probe: DynProbe,
    nodes: Vec<NodeHandle>,
}

impl NetworkHarness {
    /// Create the scenario root, install the exit handler and start the
    /// signing agent if one is configured.
    pub async fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("peer-harness-");
        let root = match &config.scenario_parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let root_path = root.path().to_path_buf();

        let registry = ProcessRegistry::new();
        let exit_hook = register_exit_handler(&registry)?;
        exit_hook.remove_on_exit(&root_path);

        let agent = match &config.agent {
            Some(agent_config) => Some(
                SigningAgent::start(
                    agent_config,
                    root_path.join("agent.sock"),
                    &registry,
                    config.startup_timeout(),
                    config.forward_output,
                )
                .await?,
            ),
            None => None,
        };

        tracing::info!(root = %root_path.display(), agent = agent.is_some(), "network harness ready");

        Ok(Self {
            ports: PortAllocator::new(config.listen_host),
            config: Arc::new(config),
            root: Some(root),
            root_path,
            registry,
            exit_hook,
            agent,
            probe: Arc::new(TcpProbe::default()),
            nodes: Vec::new(),
        })
    }

    /// Replace the readiness probe for nodes created from now on.
    pub fn with_probe(mut self, probe: DynProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn agent(&self) -> Option<&SigningAgent> {
        self.agent.as_ref()
    }

    pub fn peers(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Look a peer up by its unique name or, failing that, its handle.
    pub fn peer(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes
            .iter()
            .find(|node| node.name() == name)
            .or_else(|| self.nodes.iter().find(|node| node.handle() == name))
    }

    /// Allocate a node without starting it. With `params.initialize` the
    /// identity is created right away.
    pub async fn create_peer(&mut self, params: PeerParams) -> Result<NodeHandle, HarnessError> {
        let name = format!("{}-{}", params.name, short_id());
        let setup = NodeSetup {
            home: self.root_path.join(format!("{}-home", name)),
            checkouts: self.root_path.join(format!("{}-checkouts", name)),
            api_addr: self.ports.allocate()?,
            peer_addr: self.ports.allocate()?,
            passphrase: params
                .passphrase
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            handle: params.name,
            name,
            seeds: params.seeds,
            agent_env: self
                .agent
                .as_ref()
                .map(|agent| (agent.socket_env_var().to_string(), agent.socket().to_path_buf())),
            config: self.config.clone(),
            registry: self.registry.clone(),
            probe: self.probe.clone(),
        };

        let node = NodeHandle::new(setup);
        tracing::debug!(node = %node.name(), api = %node.api_addr(), peer = %node.peer_addr(), "peer created");
        self.nodes.push(node.clone());

        if params.initialize {
            node.init().await?;
        }
        Ok(node)
    }

    /// Create a peer, start it and make sure it has an identity.
    ///
    /// The node's control API is reachable once this returns.
    pub async fn start_peer(&mut self, params: PeerParams) -> Result<NodeHandle, HarnessError> {
        let initialize = params.initialize;
        let node = self.create_peer(params).await?;
        node.start().await?;
        if !initialize {
            node.onboard().await?;
        }
        let peer_id = node.peer_id().await?;
        tracing::info!(node = %node.name(), %peer_id, "peer started");
        Ok(node)
    }

    /// Make `from` know `to` as a seed.
    ///
    /// Directed: call it twice for mutual discovery. A running `from`
    /// learns the seed through its settings API; it is also kept for the
    /// node's next launch.
    pub async fn connect(&self, from: &NodeHandle, to: &NodeHandle) -> Result<(), HarnessError> {
        let seed = to.seed_address().await?;
        from.add_seed(seed.clone());

        if from.is_running().await {
            let client = from.client().await?;
            let mut settings = client.settings().await?;
            let seed = seed.to_string();
            if !settings.seeds.contains(&seed) {
                settings.seeds.push(seed);
                client.update_settings(settings).await?;
            }
        }

        tracing::debug!(from = %from.name(), to = %to.name(), "peers connected");
        Ok(())
    }

    /// Connect every running peer to every other, both directions.
    pub async fn connect_all(&self) -> Result<(), HarnessError> {
        let mut running = Vec::new();
        for node in &self.nodes {
            if node.is_running().await {
                running.push(node);
            }
        }

        for from in &running {
            for to in &running {
                if !from.same_node(to) {
                    self.connect(from, to).await?;
                }
            }
        }
        Ok(())
    }

    /// Stop a peer and delete its directories ahead of teardown.
    pub async fn remove_peer(&mut self, node: &NodeHandle) -> Result<(), HarnessError> {
        let index = self
            .nodes
            .iter()
            .position(|candidate| candidate.same_node(node))
            .ok_or_else(|| HarnessError::UnknownPeer(node.name().to_string()))?;

        node.stop().await?;
        node.remove_dirs().await?;
        self.nodes.remove(index);
        tracing::debug!(node = %node.name(), "peer removed");
        Ok(())
    }

    /// Retry `action` with the configured policy until it succeeds.
    pub async fn eventually<T, E, F, Fut>(&self, action: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        eventually(self.config.retry, action).await
    }

    /// Stop every node, then the signing agent, then delete the scenario
    /// root.
    ///
    /// Every node is attempted even when an earlier one fails; the
    /// failures are reported together at the end.
    pub async fn teardown(mut self) -> Result<(), HarnessError> {
        let nodes = std::mem::take(&mut self.nodes);
        tracing::info!(peers = nodes.len(), "tearing down network");

        // Nodes own disjoint resources, so they are stopped concurrently
        let results = join_all(nodes.iter().map(|node| async move {
            node.stop().await?;
            node.remove_dirs().await
        }))
        .await;

        let mut failures = Vec::new();
        for (node, result) in nodes.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(node = %node.name(), error = %e, "failed to tear down node");
                failures.push(format!("{}: {}", node.name(), e));
            }
        }

        if let Some(mut agent) = self.agent.take() {
            if let Err(e) = agent.stop().await {
                tracing::error!(error = %e, "failed to stop signing agent");
                failures.push(format!("agent: {}", e));
            }
        }

        let leftovers = self.registry.kill_all();
        if leftovers > 0 {
            tracing::warn!(leftovers, "killed processes still running at teardown");
        }

        if let Some(root) = self.root.take() {
            if let Err(e) = root.close() {
                tracing::error!(root = %self.root_path.display(), error = %e, "failed to remove scenario root");
                failures.push(format!("root: {}", e));
            }
        }

        if failures.is_empty() {
            tracing::info!("network torn down");
            Ok(())
        } else {
            Err(HarnessError::Teardown { failures })
        }
    }
}

impl Drop for NetworkHarness {
    fn drop(&mut self) {
        let killed = self.exit_hook.cleanup();
        if killed > 0 {
            tracing::warn!(killed, "network harness dropped without teardown");
        }
    }
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
