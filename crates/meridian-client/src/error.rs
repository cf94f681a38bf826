//! Client error types.

use thiserror::Error;

use meridian_wire::WireError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned to callers of client operations.
///
/// Network and protocol failures on an established connection never surface
/// here: they close the connection and are reported through the status
/// listener, while the affected calls receive synthesized connection-lost
/// responses.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No usable connection to submit the request on.
    #[error("no connections to submit the request on")]
    NoConnections,

    /// A procedure was submitted with unbound parameter slots.
    #[error("one or more procedure parameters have not been set")]
    UninitializedParams,

    /// Establishing or authenticating a connection failed.
    #[error("connection failed: {0}")]
    ConnectFailure(String),

    /// An unexpected I/O-layer failure in the event loop.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A wire encoding failure before the request reached a connection.
    #[error("wire protocol error: {0}")]
    Wire(WireError),

    /// The status listener declined to block on backpressure.
    #[error("submission rejected due to backpressure")]
    BackpressureRejected,

    /// The client was entered in a way its threading model forbids.
    #[error("client misuse: {0}")]
    Misuse(&'static str),
}

impl From<WireError> for ClientError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::UninitializedParam { .. } => ClientError::UninitializedParams,
            other => ClientError::Wire(other),
        }
    }
}
