//! Shared helpers for the harness integration tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use harness::config::{AgentConfig, BackendConfig, HarnessConfig};
use harness::prelude::*;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("harness=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn fake_node() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fake-node"))
}

/// Configuration running every node on the fake backend.
pub fn fake_config() -> HarnessConfig {
    HarnessConfig {
        backend: BackendConfig::single_binary(fake_node()),
        startup_timeout_ms: 10_000,
        probe_interval_ms: 20,
        forward_output: false,
        retry: RetryPolicy::new(Duration::from_millis(50), 100),
        ..HarnessConfig::default()
    }
}

/// [`fake_config`] plus the fake signing agent.
pub fn fake_config_with_agent() -> HarnessConfig {
    fake_config().with_agent(AgentConfig {
        program: fake_node(),
        args: vec!["agent".to_string(), "--socket".to_string()],
        socket_env_var: "SSH_AUTH_SOCK".to_string(),
    })
}

pub async fn fake_network() -> anyhow::Result<NetworkHarness> {
    init_tracing();
    Ok(NetworkHarness::new(fake_config()).await?)
}

/// True while `pid` names a process, zombies included.
pub fn process_exists(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
