use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::DEFAULT_OUTPUT_CAPACITY;
use crate::retry::RetryPolicy;

pub const NODE_BIN_ENV: &str = "PEER_HARNESS_NODE_BIN";
pub const INIT_BIN_ENV: &str = "PEER_HARNESS_INIT_BIN";
pub const TOOLS_DIR_ENV: &str = "PEER_HARNESS_TOOLS_DIR";
pub const SCENARIO_DIR_ENV: &str = "PEER_HARNESS_SCENARIO_DIR";
pub const FORWARD_OUTPUT_ENV: &str = "PEER_HARNESS_FORWARD_OUTPUT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub backend: BackendConfig,
    /// Shared signing agent; nodes run without one when unset
    pub agent: Option<AgentConfig>,
    /// Environment variable that points a node at its home directory
    pub home_env_var: String,
    /// Prepended to `PATH` for every process spawned on behalf of a node
    pub tools_dir: Option<PathBuf>,
    /// Where per-scenario roots are created,
    ///  defaults to the system temp directory
    pub scenario_parent: Option<PathBuf>,
    /// Host every node listens on
    pub listen_host: IpAddr,
    /// Bound on how long a started node may take to open its control API
    pub startup_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Lines of output retained per process
    pub output_capacity: usize,
    /// Echo child output to our own stdout/stderr, prefixed per node
    pub forward_output: bool,
    /// Unlock the keystore over the API after start to obtain an auth token
    pub unseal_keystore: bool,
    /// Default policy for convergence checks
    pub retry: RetryPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            agent: None,
            home_env_var: "PEER_HOME".to_string(),
            tools_dir: None,
            scenario_parent: None,
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            startup_timeout_ms: 20_000,
            probe_interval_ms: 100,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            forward_output: true,
            unseal_keystore: true,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Long-running node binary
    pub node_program: PathBuf,
    /// Test-only flags appended to every node launch
    pub node_args: Vec<String>,
    /// One-shot identity tool
    pub init_program: PathBuf,
    /// Arguments placed before `--name` and `--passphrase`
    pub init_args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            node_program: PathBuf::from("peer-node"),
            node_args: vec![
                "--unsafe-fast-keystore".to_string(),
                "--skip-remote-helper-install".to_string(),
            ],
            init_program: PathBuf::from("peer-node"),
            init_args: vec!["init".to_string()],
        }
    }
}

impl BackendConfig {
    /// One binary serving both as node and, through `init`, as init tool.
    pub fn single_binary(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            node_program: program.clone(),
            init_program: program,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub program: PathBuf,
    /// Arguments placed before the socket path
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_socket_env_var")]
    pub socket_env_var: String,
}

fn default_socket_env_var() -> String {
    "SSH_AUTH_SOCK".to_string()
}

impl AgentConfig {
    /// `ssh-agent -D -a <socket>`
    pub fn ssh_agent() -> Self {
        Self {
            program: PathBuf::from("ssh-agent"),
            args: vec!["-D".to_string(), "-a".to_string()],
            socket_env_var: default_socket_env_var(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl HarnessConfig {
    /// Load from a TOML file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with overrides from the `PEER_HARNESS_*` environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(bin) = lookup(NODE_BIN_ENV) {
            self.backend.node_program = PathBuf::from(bin);
        }
        if let Some(bin) = lookup(INIT_BIN_ENV) {
            self.backend.init_program = PathBuf::from(bin);
        }
        if let Some(dir) = lookup(TOOLS_DIR_ENV) {
            self.tools_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(SCENARIO_DIR_ENV) {
            self.scenario_parent = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(FORWARD_OUTPUT_ENV) {
            self.forward_output = !matches!(value.trim(), "0" | "false" | "no" | "off");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.home_env_var.is_empty() {
            return Err(ConfigError::Invalid("home_env_var cannot be empty".into()));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "startup_timeout_ms must be positive".into(),
            ));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "probe_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = Some(agent);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HarnessConfig = toml::from_str(
            r#"
            startup_timeout_ms = 5000

            [backend]
            node_program = "/opt/node/bin/peer-node"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.backend.node_program,
            PathBuf::from("/opt/node/bin/peer-node")
        );
        assert_eq!(config.backend.init_args, vec!["init".to_string()]);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_ms, RetryPolicy::default().delay_ms);
        assert_eq!(config.home_env_var, "PEER_HOME");
        assert!(config.agent.is_none());
    }

    #[test]
    fn test_agent_section() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [agent]
            program = "ssh-agent"
            args = ["-D", "-a"]
            "#,
        )
        .unwrap();

        let agent = config.agent.unwrap();
        assert_eq!(agent.socket_env_var, "SSH_AUTH_SOCK");
        assert_eq!(agent.args, AgentConfig::ssh_agent().args);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (NODE_BIN_ENV, "/bin/node"),
            (INIT_BIN_ENV, "/bin/init"),
            (FORWARD_OUTPUT_ENV, "0"),
        ]
        .into_iter()
        .collect();

        let config = HarnessConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend.node_program, PathBuf::from("/bin/node"));
        assert_eq!(config.backend.init_program, PathBuf::from("/bin/init"));
        assert!(!config.forward_output);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HarnessConfig {
            startup_timeout_ms: 0,
            ..HarnessConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        let config = HarnessConfig::default().with_agent(AgentConfig::ssh_agent());
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded.agent.unwrap().program, PathBuf::from("ssh-agent"));
        assert_eq!(loaded.listen_host, config.listen_host);
    }
}
