//! Remote node identity

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::NetworkError;
use crate::protocol::ChannelSet;

/// A remote node: host address plus base port
///
/// Host names are resolved once at construction, so `localhost:5000` and
/// `127.0.0.1:5000` are the same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerEndpoint {
    host: IpAddr,
    base_port: u16,
}

impl PeerEndpoint {
    pub fn new(host: IpAddr, base_port: u16) -> Self {
        Self { host, base_port }
    }

    /// Resolve a host name or literal address, preferring IPv4
    pub fn resolve(host: &str, base_port: u16) -> Result<Self, NetworkError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::new(ip, base_port));
        }

        let addrs: Vec<SocketAddr> = (host, base_port)
            .to_socket_addrs()
            .map_err(|e| NetworkError::Resolve(format!("{}: {}", host, e)))?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| Self::new(a.ip(), base_port))
            .ok_or_else(|| NetworkError::Resolve(format!("{}: no addresses", host)))
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn channels(&self) -> ChannelSet {
        ChannelSet::new(self.base_port)
    }

    pub fn text_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.channels().text())
    }

    pub fn video_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.channels().video())
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.channels().control())
    }

    pub fn audio_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.channels().audio())
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.host, self.base_port))
    }
}
