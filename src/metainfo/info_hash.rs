use std::fmt;

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// The identifier of a swarm, derived from the bencoded info dictionary.
///
/// v1 torrents hash with SHA-1 into 20 bytes; v2 torrents hash with
/// SHA-256 into 32 bytes. Overlays built around 20-byte identifiers (the
/// peer wire handshake among them) address v2 swarms by the SHA-256 hash
/// truncated to its first 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    /// Computes the v1 info hash of a raw bencoded info dictionary.
    pub fn v1_from_info(raw_info: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(raw_info);
        InfoHash::V1(hasher.finalize().into())
    }

    /// Computes the v2 info hash of a raw bencoded info dictionary.
    pub fn v2_from_info(raw_info: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw_info);
        InfoHash::V2(hasher.finalize().into())
    }

    /// Returns the 20-byte on-wire form: the v1 hash itself, or the v2
    /// hash truncated.
    pub fn wire(&self) -> [u8; 20] {
        match self {
            InfoHash::V1(h) => *h,
            InfoHash::V2(h) => {
                let mut out = [0u8; 20];
                out.copy_from_slice(&h[..20]);
                out
            }
        }
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, InfoHash::V2(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            InfoHash::V1(h) => h,
            InfoHash::V2(h) => h,
        }
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoHash::V1(_) => write!(f, "InfoHash::V1({self})"),
            InfoHash::V2(_) => write!(f, "InfoHash::V2({self})"),
        }
    }
}
