use thiserror::Error;

/// Errors on the uTP transport.
#[derive(Debug, Error)]
pub enum UtpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed utp packet")]
    InvalidPacket,

    #[error("connection reset by peer")]
    Reset,

    /// Five retransmissions went unanswered; the connection is dead.
    #[error("retransmission limit reached")]
    RetransmitLimit,

    #[error("connection closed")]
    Closed,

    #[error("connect timed out")]
    ConnectTimeout,

    /// No free connection-id pair; the socket is saturated.
    #[error("no available connection id")]
    IdExhausted,
}
