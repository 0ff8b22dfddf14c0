use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, TcpListener};

use parking_lot::Mutex;

const MAX_ATTEMPTS: usize = 64;

/// Hands out ports from the OS ephemeral range, never the same one twice.
///
/// The probe listener is closed before the port is returned, so the node
/// binds it itself a moment later.
#[derive(Debug)]
pub struct PortAllocator {
    host: IpAddr,
    issued: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> std::io::Result<SocketAddr> {
        for _ in 0..MAX_ATTEMPTS {
            let addr = TcpListener::bind(SocketAddr::new(self.host, 0))?.local_addr()?;
            if self.issued.lock().insert(addr.port()) {
                return Ok(addr);
            }
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no unused port on {} after {} attempts", self.host, MAX_ATTEMPTS),
        ))
    }

    pub fn issued(&self) -> usize {
        self.issued.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_ports_are_unique() {
        let ports = PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let addrs: Vec<_> = (0..20).map(|_| ports.allocate().unwrap()).collect();
        let unique: HashSet<_> = addrs.iter().map(|a| a.port()).collect();

        assert_eq!(unique.len(), 20);
        assert_eq!(ports.issued(), 20);
        assert!(addrs.iter().all(|a| a.ip() == IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_allocated_port_is_bindable() {
        let ports = PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let addr = ports.allocate().unwrap();
        TcpListener::bind(addr).unwrap();
    }
}
