use std::collections::HashSet;
use std::net::IpAddr;

use sha1::{Digest, Sha1};

use crate::constants::ALLOWED_FAST_SET_SIZE;

/// Per-connection fast-extension state (BEP-6).
///
/// Tracks the pieces each side may request while choked, plus the peer's
/// SUGGEST hints in arrival order.
#[derive(Debug, Clone, Default)]
pub struct FastState {
    /// Pieces the remote allows us to request while it chokes us.
    pub theirs: HashSet<u32>,
    /// Pieces we allow the remote to request while we choke it.
    pub ours: HashSet<u32>,
    /// SUGGEST_PIECE hints, oldest first.
    pub suggested: Vec<u32>,
}

impl FastState {
    pub fn allow_incoming(&mut self, piece: u32) {
        self.theirs.insert(piece);
    }

    pub fn allow_outgoing(&mut self, piece: u32) {
        self.ours.insert(piece);
    }

    /// May we request this piece even though the peer chokes us?
    pub fn requestable_while_choked(&self, piece: u32) -> bool {
        self.theirs.contains(&piece)
    }

    /// Must we serve this request even though we choke the peer?
    pub fn servable_while_choking(&self, piece: u32) -> bool {
        self.ours.contains(&piece)
    }

    pub fn suggest(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            self.suggested.push(piece);
        }
    }
}

/// Computes the canonical allowed-fast set for a peer (BEP-6).
///
/// Both ends derive the same set from the peer's masked IP and the info
/// hash, so the pieces offered need never be negotiated.
pub fn allowed_fast_set(info_hash: &[u8; 20], peer_ip: IpAddr, num_pieces: u32) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let want = ALLOWED_FAST_SET_SIZE.min(num_pieces as usize);

    let masked = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&masked);
    seed.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(want);
    while set.len() < want {
        let digest = Sha1::digest(&seed);
        for word in digest.chunks_exact(4) {
            if set.len() >= want {
                break;
            }
            let piece = u32::from_be_bytes([word[0], word[1], word[2], word[3]]) % num_pieces;
            if !set.contains(&piece) {
                set.push(piece);
            }
        }
        seed = digest.to_vec();
    }

    set
}
