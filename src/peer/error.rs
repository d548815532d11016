use thiserror::Error;

/// Errors raised on a peer connection.
///
/// Protocol violations close the offending connection and go no further;
/// transport failures additionally debit the peer's fail count in the
/// pool. Pool capacity errors are benign and mean "skip this peer".
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// uTP transport failed.
    #[error("utp error: {0}")]
    Utp(#[from] crate::utp::UtpError),

    /// The handshake bytes were malformed.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer answered with a different info hash.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A frame was malformed or out of bounds.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Unknown message id.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The peer violated protocol rules (bitfield not first, fast message
    /// without negotiation, illegal transition).
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer went silent past the inactivity limit, or an operation
    /// timed out.
    #[error("timeout")]
    Timeout,

    /// Error decoding bencode inside an extension message.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The connection budget or peer list is full; skip, do not retry.
    #[error("peer pool at capacity")]
    PoolFull,
}
