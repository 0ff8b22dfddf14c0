use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::Deserialize;

/// Who a node is. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Human-readable handle
    pub handle: String,
    pub peer_id: String,
    /// Root URN of the identity
    pub urn: String,
    /// Protects the node's private key material
    pub passphrase: String,
}

/// The descriptor the init tool prints on stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitOutput {
    pub peer_id: String,
    pub urn: String,
}

impl InitOutput {
    /// Newest line that parses wins; stderr chatter is interleaved with it.
    pub(crate) fn find(output: &str) -> Option<Self> {
        output
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line.trim()).ok())
            .or_else(|| serde_json::from_str(output).ok())
    }
}

/// `peerId@host:port`, the form nodes accept as a seed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeedAddress {
    pub peer_id: String,
    pub addr: SocketAddr,
}

impl SeedAddress {
    pub fn new(peer_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            addr,
        }
    }
}

impl fmt::Display for SeedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.addr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedParseError {
    #[error("seed '{0}' is not of the form peerId@host:port")]
    Malformed(String),
    #[error("seed '{seed}' has an invalid address: {source}")]
    Addr {
        seed: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

impl FromStr for SeedAddress {
    type Err = SeedParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer_id, addr) = s
            .split_once('@')
            .filter(|(peer_id, _)| !peer_id.is_empty())
            .ok_or_else(|| SeedParseError::Malformed(s.to_string()))?;
        let addr = addr.parse().map_err(|source| SeedParseError::Addr {
            seed: s.to_string(),
            source,
        })?;
        Ok(Self::new(peer_id, addr))
    }
}
