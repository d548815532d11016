//! v2 hash transfer (BEP-52): requesting piece-layer hashes from peers
//! and serving them from our own trees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::message::HashRequest;
use crate::metainfo::{hash_pair, MerkleTree};

/// Outstanding hash requests time out after this long.
pub const HASH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on outstanding hash requests per connection.
pub const MAX_PENDING_HASH_REQUESTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LedgerKey {
    pieces_root: [u8; 32],
    base_layer: u32,
    index: u32,
    length: u32,
}

impl From<&HashRequest> for LedgerKey {
    fn from(req: &HashRequest) -> Self {
        Self {
            pieces_root: req.pieces_root,
            base_layer: req.base_layer,
            index: req.index,
            length: req.length,
        }
    }
}

/// Tracks the hash requests we sent and are still waiting on.
#[derive(Default)]
pub struct HashRequestLedger {
    pending: RwLock<HashMap<LedgerKey, (HashRequest, Instant)>>,
}

impl HashRequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outgoing request. Returns false when the connection
    /// already has its fill of outstanding requests.
    pub fn record(&self, req: HashRequest) -> bool {
        let mut pending = self.pending.write();
        if pending.len() >= MAX_PENDING_HASH_REQUESTS {
            return false;
        }
        pending.insert((&req).into(), (req, Instant::now()));
        true
    }

    /// Matches an incoming HASHES or HASH_REJECT to its request.
    pub fn complete(
        &self,
        pieces_root: &[u8; 32],
        base_layer: u32,
        index: u32,
        length: u32,
    ) -> Option<HashRequest> {
        let key = LedgerKey {
            pieces_root: *pieces_root,
            base_layer,
            index,
            length,
        };
        self.pending.write().remove(&key).map(|(req, _)| req)
    }

    /// Drops and returns requests past the timeout.
    pub fn expire(&self) -> Vec<HashRequest> {
        let mut pending = self.pending.write();
        let now = Instant::now();
        let stale: Vec<LedgerKey> = pending
            .iter()
            .filter(|(_, (_, sent))| now.duration_since(*sent) > HASH_REQUEST_TIMEOUT)
            .map(|(key, _)| *key)
            .collect();
        stale
            .into_iter()
            .filter_map(|key| pending.remove(&key).map(|(req, _)| req))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }
}

/// Verifies a HASHES payload against a file's `pieces root`.
///
/// The `length` hashes reduce pairwise to the root of the subtree they
/// cover; the uncles then climb the remaining layers, the side at each
/// step given by the bits of `index / length`. With zero proof layers the
/// hashes must reduce to the root itself.
pub fn verify_hashes(
    pieces_root: &[u8; 32],
    index: u32,
    hashes: &[[u8; 32]],
    proofs: &[[u8; 32]],
) -> bool {
    if hashes.is_empty() || !hashes.len().is_power_of_two() {
        return false;
    }

    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    let mut hash = level[0];
    let mut position = index as usize / hashes.len();
    for uncle in proofs {
        hash = if position & 1 == 1 {
            hash_pair(uncle, &hash)
        } else {
            hash_pair(&hash, uncle)
        };
        position >>= 1;
    }

    &hash == pieces_root
}

/// Serves HASH_REQUESTs from the merkle trees we hold.
///
/// The trees are the reduced piece-layer trees out of the layer cache, so
/// the lowest layer this server can answer for is the piece layer; deeper
/// requests are rejected.
pub struct HashServer {
    trees: RwLock<HashMap<[u8; 32], Arc<MerkleTree>>>,
    /// The file-tree layer number of the piece layer.
    piece_layer: u32,
}

impl HashServer {
    pub fn new(piece_layer: u32) -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            piece_layer,
        }
    }

    pub fn register(&self, pieces_root: [u8; 32], tree: Arc<MerkleTree>) {
        self.trees.write().insert(pieces_root, tree);
    }

    pub fn unregister(&self, pieces_root: &[u8; 32]) {
        self.trees.write().remove(pieces_root);
    }

    /// Answers a request, or `None` when it must be rejected: unknown
    /// root, a layer below the piece layer, or a range outside the tree.
    #[allow(clippy::type_complexity)]
    pub fn respond(&self, req: &HashRequest) -> Option<(Vec<[u8; 32]>, Vec<[u8; 32]>)> {
        let relative = req.base_layer.checked_sub(self.piece_layer)?;
        let trees = self.trees.read();
        let tree = trees.get(&req.pieces_root)?;

        let layer = tree.layer(relative as usize)?;
        let start = req.index as usize;
        let end = start.checked_add(req.length as usize)?;
        if end > layer.len() {
            return None;
        }
        let hashes = layer[start..end].to_vec();

        // uncles of the subtree covering [start, end), root-ward
        let subtree_layer = relative + req.length.ilog2();
        let subtree_index = start / req.length as usize;
        let proofs = tree
            .proof(subtree_layer as usize, subtree_index)?
            .into_iter()
            .take(req.proof_layers as usize)
            .collect();

        Some((hashes, proofs))
    }
}
