//! # Peer Endpoints
//!
//! Trackers return the swarm as a compact binary list, 6 bytes per peer:
//!
//! ```text
//! <IP: 4 bytes><port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order. A response whose length is not a
//! multiple of 6 is malformed and rejected as a whole.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const COMPACT_PEER_LEN: usize = 6;

/// A remote peer endpoint discovered through a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer listens on
    pub port: u16,
}

impl Peer {
    /// The dialable socket address of this peer.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decode a compact-form peer list received from a tracker.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>> {
    if !bytes.len().is_multiple_of(COMPACT_PEER_LEN) {
        return Err(anyhow!(
            "received malformed peer list of length {}",
            bytes.len()
        ));
    }

    let mut peers: Vec<Peer> = Vec::with_capacity(bytes.len() / COMPACT_PEER_LEN);
    for chunk in bytes.chunks_exact(COMPACT_PEER_LEN) {
        peers.push(Peer {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: BigEndian::read_u16(&chunk[4..6]),
        });
    }

    Ok(peers)
}
