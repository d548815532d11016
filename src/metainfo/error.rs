use crate::bencode::BencodeError;
use thiserror::Error;

/// Errors raised while parsing torrent metainfo.
///
/// Any of these aborts session creation; a torrent that does not parse is
/// never retried.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("invalid piece length {0}")]
    InvalidPieceLength(u64),

    #[error("hybrid torrent v1/v2 views disagree: {0}")]
    HybridMismatch(&'static str),

    #[error("piece layer does not match pieces root for {0}")]
    PieceLayerMismatch(String),

    #[error("unsupported meta version {0}")]
    UnsupportedVersion(i64),
}
