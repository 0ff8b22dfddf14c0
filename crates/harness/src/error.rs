use crate::agent::AgentError;
use crate::client::ApiError;
use crate::config::ConfigError;
use crate::node::NodeError;
use crate::process::ProcessError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("signing agent error: {0}")]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("no peer named '{0}' in this network")]
    UnknownPeer(String),
    #[error("teardown finished with {} failure(s): {}", failures.len(), failures.join("; "))]
    Teardown { failures: Vec<String> },
}
