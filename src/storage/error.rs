use thiserror::Error;

/// Errors from the storage layer.
///
/// `HybridMismatch` is the severe one: the torrent's v1 and v2 views
/// disagree about the same bytes, so nothing about the metadata can be
/// trusted and the session stops.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block range: piece {piece}, offset {offset}")]
    InvalidBlockRange { piece: u32, offset: u32 },

    #[error("hybrid torrent views disagree on piece {0}")]
    HybridMismatch(u32),

    #[error("missing merkle data for piece {0}")]
    MissingMerkleData(u32),

    #[error("path traversal in file path: {0}")]
    PathTraversal(String),

    #[error("verification worker failed")]
    WorkerFailed,

    #[error("metainfo error: {0}")]
    Metainfo(#[from] crate::metainfo::MetainfoError),
}
