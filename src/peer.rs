//! # Peer Endpoints
//!
//! A peer is an endpoint advertised by the tracker: an IP address (or host
//! name), a port, and optionally the peer's self-chosen 20-byte id. The id
//! is filled in from the handshake when the tracker did not provide one.

use anyhow::{anyhow, Result};

use std::net::{SocketAddr, ToSocketAddrs};

/// A swarm endpoint discovered through the tracker.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Address string as announced by the tracker
    pub ip: String,
    /// Port to connect to
    pub port: u16,
    /// 20-byte peer id, when the tracker announced one
    pub peer_id: Option<Vec<u8>>,
}

impl Peer {
    /// Dial string for the endpoint. IPv6 literals are bracketed so the
    /// port separator stays unambiguous.
    pub fn dial_addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }

    /// Resolve the endpoint to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.dial_addr();
        let resolved = match addr.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        };

        resolved.ok_or_else(|| anyhow!("could not resolve peer address {addr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_dial_addr_is_host_colon_port() {
        let peer = Peer {
            ip: "192.0.2.7".to_string(),
            port: 6881,
            peer_id: None,
        };

        assert_eq!(peer.dial_addr(), "192.0.2.7:6881");
    }

    #[test]
    fn ipv6_dial_addr_is_bracketed() {
        let peer = Peer {
            ip: "2001:db8::1".to_string(),
            port: 6881,
            peer_id: None,
        };

        assert_eq!(peer.dial_addr(), "[2001:db8::1]:6881");
    }

    #[test]
    fn literal_addresses_resolve() {
        let peer = Peer {
            ip: "127.0.0.1".to_string(),
            port: 6881,
            peer_id: None,
        };
        assert_eq!(
            peer.socket_addr().unwrap(),
            "127.0.0.1:6881".parse().unwrap()
        );

        let peer = Peer {
            ip: "::1".to_string(),
            port: 6881,
            peer_id: None,
        };
        assert_eq!(peer.socket_addr().unwrap(), "[::1]:6881".parse().unwrap());
    }
}
