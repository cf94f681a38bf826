//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// A read or write would cross the buffer limit.
    #[error("buffer overrun: need {needed} bytes, have {available}")]
    Overrun { needed: usize, available: usize },

    /// A frame declared a length above the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame declared a negative length.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i32),

    /// A length-prefixed field declared a length that is neither a payload
    /// size nor the null sentinel.
    #[error("invalid field length: {0}")]
    InvalidLength(i32),

    /// The message carried a version this client does not speak.
    #[error("unsupported message version: {0}")]
    UnsupportedVersion(i8),

    /// An unrecognized value type code.
    #[error("unknown wire type code: {0}")]
    UnknownTypeCode(i8),

    /// A procedure name longer than the protocol allows.
    #[error("procedure name too long: {0} bytes (max 255)")]
    NameTooLong(usize),

    /// A parameter slot was never bound before serialization.
    #[error("parameter {index} has not been set")]
    UninitializedParam { index: usize },

    /// A parameter index outside the declared arity.
    #[error("parameter index {index} out of range (arity {arity})")]
    ParamIndexOutOfRange { index: usize, arity: usize },

    /// An array parameter with more elements than the wire can describe.
    #[error("array parameter too long: {0} elements (max 32767)")]
    ArrayTooLong(usize),

    /// A wire string that is not valid UTF-8.
    #[error("invalid utf-8 in wire string")]
    Utf8(#[from] std::str::Utf8Error),

    /// Structurally invalid message content.
    #[error("malformed message: {0}")]
    Malformed(String),
}
