//! Merkle trees for BitTorrent v2 piece verification (BEP-52).
//!
//! Every file in a v2 torrent has a merkle tree whose leaves are SHA-256
//! hashes of 16 KiB blocks; the root is the file's `pieces root`. The
//! *piece layer* is the layer whose hashes each cover exactly one piece,
//! so a piece is verified by hashing its blocks up to that layer and then
//! walking root-ward with uncle hashes.

use sha2::{Digest, Sha256};

use crate::constants::BLOCK_LEN;

const ZERO_HASH: [u8; 32] = [0u8; 32];

/// A merkle tree stored layer by layer, bottom-up.
///
/// Layer 0 holds the leaves padded with zero hashes to a power of two;
/// each following layer halves until the root. Keeping whole layers makes
/// range extraction for HASHES responses and uncle lookup both O(1).
#[derive(Debug, Clone)]
pub struct MerkleTree {
    layers: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Builds a tree over the given leaf hashes.
    ///
    /// The leaf count is padded with `pad` up to
    /// `max(leaves, min_leaves).next_power_of_two()`. `min_leaves` lets a
    /// file shorter than one piece still produce a tree deep enough to
    /// have a piece layer. `pad` is the zero hash when the leaves are
    /// block hashes, and a zero-subtree root when the leaves already sit
    /// at the piece layer; mixing those up shifts every padded branch.
    pub fn from_leaves(mut leaves: Vec<[u8; 32]>, min_leaves: usize, pad: [u8; 32]) -> Self {
        let target = leaves.len().max(min_leaves).max(1).next_power_of_two();
        leaves.resize(target, pad);

        let mut layers = vec![leaves];
        while layers.last().expect("at least one layer").len() > 1 {
            let prev = layers.last().expect("at least one layer");
            let next: Vec<[u8; 32]> = prev
                .chunks_exact(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            layers.push(next);
        }

        Self { layers }
    }

    /// Builds the full block tree of a file's contents.
    pub fn from_file_bytes(data: &[u8], piece_length: u64) -> Self {
        let leaves: Vec<[u8; 32]> = if data.is_empty() {
            Vec::new()
        } else {
            data.chunks(BLOCK_LEN as usize).map(hash_block).collect()
        };
        let blocks_per_piece = (piece_length / BLOCK_LEN as u64).max(1) as usize;
        Self::from_leaves(leaves, blocks_per_piece, ZERO_HASH)
    }

    /// Builds the reduced tree whose leaves are a file's piece-layer
    /// hashes, padded with zero-subtree roots of piece height.
    pub fn from_piece_layer(piece_hashes: Vec<[u8; 32]>, piece_length: u64) -> Self {
        let pad = zero_subtree_root(select_layer(piece_length));
        Self::from_leaves(piece_hashes, 1, pad)
    }

    /// The root hash.
    pub fn root(&self) -> [u8; 32] {
        self.layers[self.layers.len() - 1][0]
    }

    /// Number of layers above the leaves.
    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    /// The hashes of one layer (0 = leaves), or `None` if out of range.
    pub fn layer(&self, layer: usize) -> Option<&[[u8; 32]]> {
        self.layers.get(layer).map(|l| l.as_slice())
    }

    /// Collects the uncle hashes proving `index` within `layer` up to the
    /// root: at every level the sibling of the current node, root-ward.
    pub fn proof(&self, layer: usize, index: usize) -> Option<Vec<[u8; 32]>> {
        if layer >= self.layers.len() || index >= self.layers[layer].len() {
            return None;
        }

        let mut uncles = Vec::with_capacity(self.depth() - layer);
        let mut idx = index;
        for level in layer..self.depth() {
            uncles.push(self.layers[level][idx ^ 1]);
            idx >>= 1;
        }
        Some(uncles)
    }

    /// Approximate heap footprint, used for cache accounting.
    pub fn byte_size(&self) -> usize {
        self.layers.iter().map(|l| l.len() * 32).sum()
    }
}

/// `log2(piece_length / 16 KiB)`: how many layers sit between the leaves
/// and the piece layer.
pub fn select_layer(piece_length: u64) -> u32 {
    let blocks = (piece_length / BLOCK_LEN as u64).max(1);
    blocks.ilog2()
}

/// SHA-256 of one 16 KiB block, zero-padded if the block is shorter.
pub fn hash_block(block: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(block);
    let short = (BLOCK_LEN as usize).saturating_sub(block.len());
    if short > 0 {
        hasher.update(vec![0u8; short]);
    }
    hasher.finalize().into()
}

/// Root of an all-zero-leaf subtree of the given height.
///
/// This is the value that pads a piece layer: a missing trailing piece is
/// a full subtree of zero leaf hashes, not a zero hash itself.
pub fn zero_subtree_root(levels: u32) -> [u8; 32] {
    let mut hash = ZERO_HASH;
    for _ in 0..levels {
        hash = hash_pair(&hash, &hash);
    }
    hash
}

pub(crate) fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Reduces the bytes of one piece to its piece-layer hash.
///
/// Blocks are hashed (short final block zero-padded), missing trailing
/// blocks contribute zero *hashes*, and the resulting
/// `piece_length / 16 KiB` leaves reduce pairwise to a single subtree
/// root. All intermediate buffers are dropped before returning.
pub fn piece_subtree_root(piece: &[u8], piece_length: u64) -> [u8; 32] {
    let leaves_per_piece = (piece_length / BLOCK_LEN as u64).max(1) as usize;

    let mut level: Vec<[u8; 32]> = piece.chunks(BLOCK_LEN as usize).map(hash_block).collect();
    level.resize(leaves_per_piece, ZERO_HASH);

    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level[0]
}

/// Verifies one piece against a file's `pieces root`.
///
/// `uncles` are the proof hashes from the piece layer to the root;
/// `piece_index` is the file-local piece number, whose bits pick the side
/// at each level: bit `i` set means our running hash is the right child
/// at level `i`.
pub fn verify_proof(
    piece: &[u8],
    piece_index: u32,
    piece_length: u64,
    uncles: &[[u8; 32]],
    pieces_root: &[u8; 32],
) -> bool {
    let mut hash = piece_subtree_root(piece, piece_length);

    for (level, uncle) in uncles.iter().enumerate() {
        hash = if (piece_index >> level) & 1 == 1 {
            hash_pair(uncle, &hash)
        } else {
            hash_pair(&hash, uncle)
        };
    }

    &hash == pieces_root
}
