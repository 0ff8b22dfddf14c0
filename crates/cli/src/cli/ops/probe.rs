use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

use harness::probe::{ReadinessProbe, TcpProbe};

#[derive(Args, Debug, Clone)]
pub struct Probe {
    /// Address to connect to
    pub addr: SocketAddr,

    #[arg(long, default_value_t = 500)]
    pub timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{0} is not accepting connections")]
    Unreachable(SocketAddr),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Probe {
    type Error = ProbeError;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let probe = TcpProbe::new(Duration::from_millis(self.timeout_ms));
        if probe.is_reachable(self.addr).await {
            Ok(format!("{} is reachable", self.addr))
        } else {
            Err(ProbeError::Unreachable(self.addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::op::{Op, OpContext};

    #[tokio::test]
    async fn test_probe_reports_reachability() {
        let ctx = OpContext::new(None).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = Probe {
            addr,
            timeout_ms: 500,
        };

        assert!(probe.execute(&ctx).await.unwrap().contains("reachable"));

        drop(listener);
        assert!(matches!(
            probe.execute(&ctx).await,
            Err(ProbeError::Unreachable(a)) if a == addr
        ));
    }
}
