/**
 * Signing agent shared by every node of a scenario.
 */
pub mod agent;
/**
 * Typed client for the backend's control API.
 *  Request structs double as the wire types the
 *  fake backend serves.
 */
pub mod client;
/**
 * Harness configuration: which binaries to launch,
 *  where scratch state lives and how long to wait.
 */
pub mod config;
pub mod error;
/**
 * Per-scenario coordinator owning a fleet of nodes.
 */
pub mod network;
/**
 * One simulated participant: identity, isolated
 *  directories, process lifecycle and a client.
 */
pub mod node;
/**
 * Bounded tail of a process's output.
 */
pub mod output;
/**
 * Readiness probes used while a node boots.
 */
pub mod probe;
/**
 * Child process supervision and the registry of
 *  pids to kill when the harness process dies.
 */
pub mod process;
/**
 * Retry-until-converged combinator.
 */
pub mod retry;

pub mod prelude {
    pub use crate::client::{ApiClient, ApiError};
    pub use crate::config::HarnessConfig;
    pub use crate::error::HarnessError;
    pub use crate::network::{NetworkHarness, PeerParams};
    pub use crate::node::{NodeHandle, NodeIdentity, NodeState, SeedAddress};
    pub use crate::output::OutputBuffer;
    pub use crate::process::{ProcessExit, ProcessHandle, ProcessRegistry, ProcessSpec};
    pub use crate::retry::{eventually, retry, retry_any, RetryPolicy};
}
