use thiserror::Error;

/// Errors produced while decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is empty, has leading zeros, or overflows i64.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidLength,

    /// A byte that cannot start or continue a value at this position.
    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedByte(u8),

    /// Extra data exists after the top-level value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    TooDeep,

    /// The top-level value is not a dictionary where one was required.
    #[error("expected a dictionary")]
    NotADictionary,
}
