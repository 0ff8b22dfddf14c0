use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Answers "is something accepting connections at this address".
#[async_trait]
pub trait ReadinessProbe: Debug + Send + Sync {
    async fn is_reachable(&self, addr: SocketAddr) -> bool;
}

pub type DynProbe = Arc<dyn ReadinessProbe>;

/// Plain TCP connect; the connection is dropped right away.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        matches!(
            timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}
