use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::MetainfoError;
use super::merkle::MerkleTree;

/// Default byte budget for cached piece-layer trees (50 MiB).
pub const DEFAULT_LAYER_CACHE_BYTES: usize = 50 * 1024 * 1024;

/// LRU cache of per-file merkle trees built from a torrent's piece layers.
///
/// The trees cached here have the *piece layer* as their leaves: enough to
/// prove any piece against the file's `pieces root` and to serve HASHES
/// requests at the piece layer and above. Eviction is by total byte
/// footprint, least-recently-used first.
pub struct PieceLayerCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    trees: HashMap<PathBuf, Arc<MerkleTree>>,
    order: VecDeque<PathBuf>,
    bytes: usize,
}

impl PieceLayerCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                trees: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
            }),
            capacity,
        }
    }

    /// Returns the cached tree for `path`, refreshing its LRU position.
    pub fn get(&self, path: &Path) -> Option<Arc<MerkleTree>> {
        let mut inner = self.inner.lock();
        let tree = inner.trees.get(path).cloned()?;
        inner.order.retain(|p| p != path);
        inner.order.push_back(path.to_path_buf());
        Some(tree)
    }

    /// Returns the tree for `path`, building it from the file's
    /// piece-layer string on a miss.
    ///
    /// `layer_hashes` is the concatenated 32-byte hash string from the
    /// torrent's `piece layers` dictionary; the rebuilt root must equal
    /// `pieces_root` or the torrent metadata is inconsistent.
    pub fn get_or_build(
        &self,
        path: &Path,
        layer_hashes: &[u8],
        piece_length: u64,
        pieces_root: &[u8; 32],
    ) -> Result<Arc<MerkleTree>, MetainfoError> {
        if let Some(tree) = self.get(path) {
            return Ok(tree);
        }

        if layer_hashes.is_empty() || layer_hashes.len() % 32 != 0 {
            return Err(MetainfoError::InvalidField("piece layers"));
        }

        let leaves: Vec<[u8; 32]> = layer_hashes
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let tree = Arc::new(MerkleTree::from_piece_layer(leaves, piece_length));
        if &tree.root() != pieces_root {
            return Err(MetainfoError::PieceLayerMismatch(
                path.display().to_string(),
            ));
        }

        self.insert(path.to_path_buf(), tree.clone());
        Ok(tree)
    }

    fn insert(&self, path: PathBuf, tree: Arc<MerkleTree>) {
        let mut inner = self.inner.lock();
        let size = tree.byte_size();

        while inner.bytes + size > self.capacity && !inner.order.is_empty() {
            if let Some(evicted) = inner.order.pop_front() {
                if let Some(old) = inner.trees.remove(&evicted) {
                    inner.bytes -= old.byte_size();
                }
            }
        }

        inner.bytes += size;
        inner.order.push_back(path.clone());
        inner.trees.insert(path, tree);
    }

    /// Total bytes held by cached trees.
    pub fn memory_used(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PieceLayerCache {
    fn default() -> Self {
        Self::new(DEFAULT_LAYER_CACHE_BYTES)
    }
}
