use std::path::Path;
use std::time::Duration;

use clap::Args;

use harness::prelude::*;

#[derive(Args, Debug, Clone)]
pub struct Up {
    /// Number of nodes to start
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub peers: u16,

    /// Seed every node with every other node
    #[arg(long)]
    pub connect: bool,

    /// Tear down after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration: Option<u64>,

    /// Prefix for node handles
    #[arg(long, default_value = "peer")]
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UpError {
    #[error("network error: {0}")]
    Harness(#[from] HarnessError),
    #[error("failed to wait for Ctrl-C: {0}")]
    Signal(#[from] std::io::Error),
}

/// What `up` reports about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub name: String,
    pub peer_id: String,
    pub api: String,
    pub seed: String,
}

impl std::fmt::Display for PeerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}  peer_id={}  api={}  seed={}",
            self.name, self.peer_id, self.api, self.seed
        )
    }
}

fn report(peers: &[PeerSummary], root: &Path) -> String {
    let mut lines: Vec<String> = peers.iter().map(ToString::to_string).collect();
    lines.push(format!("network root: {}", root.display()));
    lines.push(format!("stopped {} peer(s)", peers.len()));
    lines.join("\n")
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Up {
    type Error = UpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut network = NetworkHarness::new(ctx.config.clone()).await?;

        let mut peers = Vec::with_capacity(self.peers as usize);
        for i in 0..self.peers {
            let node = network
                .start_peer(PeerParams::new(format!("{}{}", self.name, i)))
                .await?;
            let summary = PeerSummary {
                name: node.name().to_string(),
                peer_id: node.peer_id().await.map_err(HarnessError::from)?,
                api: node.api_addr().to_string(),
                seed: node
                    .seed_address()
                    .await
                    .map_err(HarnessError::from)?
                    .to_string(),
            };
            tracing::info!(
                node = %summary.name,
                peer_id = %summary.peer_id,
                api = %summary.api,
                seed = %summary.seed,
                "peer up"
            );
            peers.push(summary);
        }

        if self.connect {
            network.connect_all().await?;
            tracing::info!(peers = self.peers, "all peers connected");
        }

        let root = network.root().to_path_buf();
        tracing::info!(root = %root.display(), "network up, waiting");

        // On Ctrl-C the exit hook may get there first; it kills the same processes
        match self.duration {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    result = tokio::signal::ctrl_c() => result?,
                }
            }
            None => tokio::signal::ctrl_c().await?,
        }

        network.teardown().await?;
        Ok(report(&peers, &root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_peers_then_root() {
        let peers = vec![
            PeerSummary {
                name: "peer0-1a2b3c4d".to_string(),
                peer_id: "hyb-one".to_string(),
                api: "127.0.0.1:4001".to_string(),
                seed: "hyb-one@127.0.0.1:4002".to_string(),
            },
            PeerSummary {
                name: "peer1-5e6f7a8b".to_string(),
                peer_id: "hyb-two".to_string(),
                api: "127.0.0.1:4003".to_string(),
                seed: "hyb-two@127.0.0.1:4004".to_string(),
            },
        ];

        let output = report(&peers, Path::new("/tmp/peer-harness-x"));
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(
            lines,
            vec![
                "peer0-1a2b3c4d  peer_id=hyb-one  api=127.0.0.1:4001  seed=hyb-one@127.0.0.1:4002",
                "peer1-5e6f7a8b  peer_id=hyb-two  api=127.0.0.1:4003  seed=hyb-two@127.0.0.1:4004",
                "network root: /tmp/peer-harness-x",
                "stopped 2 peer(s)",
            ]
        );
    }
}
