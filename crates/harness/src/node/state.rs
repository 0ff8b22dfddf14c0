use crate::client::ApiClient;
use crate::process::{ProcessExit, ProcessHandle, RunningProcess};

use super::identity::NodeIdentity;

/// Lifecycle of a node.
///
/// ```text
/// Configured ──init──▶ Initialized ──start──▶ Onboarded
///     │                                          ▲
///     └────start────▶ Started ──────onboard──────┘
///
/// Started | Onboarded ──stop──▶ Stopped ──start──▶ Started | Onboarded
/// ```
///
/// Identity and runtime data only exist in the variants that define them.
#[derive(Debug)]
pub enum NodeState {
    /// Directories and addresses allocated, nothing spawned
    Configured,
    /// Identity created by the init tool, process not running
    Initialized { identity: NodeIdentity },
    /// Running and reachable, no identity yet
    Started { runtime: NodeRuntime },
    /// Running and reachable with a known identity
    Onboarded {
        runtime: NodeRuntime,
        identity: NodeIdentity,
    },
    /// Process exited; the home directory is kept for a restart
    Stopped {
        exit: ProcessExit,
        identity: Option<NodeIdentity>,
    },
}

/// What only exists while the node process runs.
#[derive(Debug)]
pub struct NodeRuntime {
    pub(crate) process: ProcessHandle,
    pub(crate) running: RunningProcess,
    pub(crate) client: ApiClient,
}

impl NodeRuntime {
    pub fn pid(&self) -> u32 {
        self.running.pid()
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// True once the node process exited, whether stopped or crashed.
    pub fn has_exited(&self) -> bool {
        self.running.is_finished()
    }
}

impl NodeState {
    pub fn name(&self) -> &'static str {
        match self {
            NodeState::Configured => "configured",
            NodeState::Initialized { .. } => "initialized",
            NodeState::Started { .. } => "started",
            NodeState::Onboarded { .. } => "onboarded",
            NodeState::Stopped { .. } => "stopped",
        }
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        match self {
            NodeState::Initialized { identity } | NodeState::Onboarded { identity, .. } => {
                Some(identity)
            }
            NodeState::Stopped { identity, .. } => identity.as_ref(),
            NodeState::Configured | NodeState::Started { .. } => None,
        }
    }

    pub fn runtime(&self) -> Option<&NodeRuntime> {
        match self {
            NodeState::Started { runtime } | NodeState::Onboarded { runtime, .. } => Some(runtime),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime().is_some_and(|runtime| !runtime.has_exited())
    }
}
