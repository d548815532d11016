//! The boundary toward peer discovery collaborators.
//!
//! Trackers, DHT, PEX and LSD live outside this crate. Whatever they
//! are, they deliver endpoint batches; the session forwards them to the
//! peer pool. The compact formats below are the shapes those
//! collaborators hand over (BEP-23 and BEP-7).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::metainfo::PieceLayerCache;

/// Resources shared across sessions and never owned by one: the piece
/// layer cache today, the discovery aggregator and port mapper in the
/// embedder's hands.
///
/// Sessions hold an `Arc` and the container is released when the last
/// session (or the embedder) drops its reference.
pub struct SharedResources {
    pub layer_cache: PieceLayerCache,
}

impl SharedResources {
    pub fn new(layer_cache: PieceLayerCache) -> Arc<Self> {
        Arc::new(Self { layer_cache })
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self {
            layer_cache: PieceLayerCache::default(),
        }
    }
}

/// Parses a compact IPv4 peer list: 6 bytes per peer, 4 address + 2
/// port, network order. Trailing partial entries are ignored.
pub fn parse_compact_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parses a compact IPv6 peer list: 18 bytes per peer.
pub fn parse_compact_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}
