//! Disk storage: piece-to-file mapping, async writes, verification.
//!
//! Pieces map onto one or more file regions. v1 pieces span files in the
//! torrent's contiguous byte space; v2 pieces each belong to exactly one
//! file. BEP-47 padding files occupy byte space but are never created on
//! disk: writes into them vanish, reads out of them are zeros.

mod error;
mod file;
mod writer;

pub use error::StorageError;
pub use file::{FileEntry, FileSpan, V2PieceMap};
pub use writer::{HashKind, StorageWriter, VerifyOutcome};
