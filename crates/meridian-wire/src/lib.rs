//! # meridian-wire: Binary wire protocol for the Meridian client
//!
//! This crate defines the binary wire protocol a Meridian client speaks to
//! the cluster: the byte buffer codec, typed procedure parameters, the
//! login and invocation messages, and decoded invocation responses.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────┐
//! │   Length     │            Payload               │
//! │   (4 bytes)  │          (variable)              │
//! └──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: Big-endian `i32` of the payload size (excludes itself),
//!   at most [`MAX_MESSAGE_SIZE`]
//! - **Payload**: One login or invocation message
//!
//! All integers and floats are big-endian. Strings are a 4-byte signed
//! length (−1 signals null) followed by UTF-8 bytes; varbinary is the same
//! with raw bytes. Decimals are 16-byte two's-complement integers with
//! implied scale 12; timestamps are microseconds since the Unix epoch.
//!
//! Response parsing is zero-copy where it matters: result tables are views
//! over the reference-counted receive buffer.

mod buffer;
mod error;
mod message;
mod procedure;
mod response;
mod table;
mod value;

pub use buffer::{
    put_decimal, put_string, put_timestamp, put_varbinary, ByteBuffer, DECIMAL_NULL,
    DECIMAL_SCALE, DECIMAL_WIDTH,
};
pub use error::{WireError, WireResult};
pub use message::{
    invocation_request, login_request, next_frame, ClientData, LoginResponse, FRAME_PREFIX_SIZE,
    MAX_MESSAGE_SIZE, PASSWORD_HASH_SIZE, SERVICE_DATABASE, SERVICE_HASHINATOR,
};
pub use procedure::{ParameterSet, Procedure};
pub use response::{
    InvocationResponse, StatusCode, APP_STATUS_UNSET, CONNECTION_LOST_MESSAGE,
};
pub use table::{Row, Rows, Table};
pub use value::{Decimal, Timestamp, Value, WireType};
