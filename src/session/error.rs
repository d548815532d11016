use thiserror::Error;

/// Errors surfaced by a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The torrent did not parse; the session was never created.
    #[error("metainfo error: {0}")]
    Metainfo(#[from] crate::metainfo::MetainfoError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The session task is gone; commands have nowhere to go.
    #[error("session stopped")]
    Stopped,
}
