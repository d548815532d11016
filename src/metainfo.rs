//! Torrent metainfo handling (BEP-3, BEP-47, BEP-52)
//!
//! Parsing of `.torrent` files for v1, v2 and hybrid torrents, the merkle
//! trees backing v2 piece verification, and the info hashes that identify
//! a swarm.

mod error;
mod file_tree;
mod info_hash;
mod layer_cache;
mod merkle;
mod torrent;

pub use error::MetainfoError;
pub use file_tree::{FileTree, FileTreeEntry};
pub use info_hash::InfoHash;
pub use layer_cache::{PieceLayerCache, DEFAULT_LAYER_CACHE_BYTES};
pub use merkle::{
    hash_block, piece_subtree_root, select_layer, verify_proof, zero_subtree_root, MerkleTree,
};
pub(crate) use merkle::hash_pair;
pub use torrent::{FileSpec, TorrentInfo};

#[cfg(test)]
mod tests;
