use thiserror::Error;

/// Errors produced while decoding bencode.
///
/// Encoding is infallible; only malformed input can fail.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed: empty, leading zeros, `-0`, or overflow.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte-string length prefix is not a valid decimal number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Encountered a byte that cannot start or continue a value.
    #[error("unexpected character: {0}")]
    UnexpectedChar(char),

    /// Extra bytes remain after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}
