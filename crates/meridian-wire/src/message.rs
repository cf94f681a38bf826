//! Wire message framing and the login/invocation message builders.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::{put_string, ByteBuffer};
use crate::error::{WireError, WireResult};
use crate::procedure::Procedure;

/// Size of the length prefix on every wire message.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Default maximum payload a peer may declare (50 MiB). Larger frames are a
/// protocol violation and close the connection.
pub const MAX_MESSAGE_SIZE: usize = 52_428_800;

/// Width of the SHA-1 password digest in the login request.
pub const PASSWORD_HASH_SIZE: usize = 20;

/// Service name for stored-procedure connections.
pub const SERVICE_DATABASE: &str = "database";

/// Service name for topology-aware connections.
pub const SERVICE_HASHINATOR: &str = "hashinator";

/// Protocol name carried in every login request.
const PROTOCOL_NAME: &str = "database";

/// Login request version.
const LOGIN_VERSION: i8 = 1;

/// Version of every other message.
const MESSAGE_VERSION: i8 = 0;

/// The identifier the dispatcher attaches to a request and the server
/// echoes in the response. Allocated monotonically, unique for the life of
/// a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientData(pub i64);

impl ClientData {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ClientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Extracts the next complete frame from an accumulating read buffer.
///
/// Returns `Ok(Some(payload))` with the length prefix stripped, sharing the
/// buffer's storage. Returns `Ok(None)` when more bytes are needed. The
/// declared length is validated before the payload is awaited, so an
/// oversized or negative prefix fails fast.
pub fn next_frame(buf: &mut BytesMut, max_size: usize) -> WireResult<Option<Bytes>> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return Ok(None);
    }
    let declared = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if declared < 0 {
        return Err(WireError::InvalidFrameLength(declared));
    }
    let len = declared as usize;
    if len > max_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }
    if buf.len() < FRAME_PREFIX_SIZE + len {
        return Ok(None);
    }
    buf.advance(FRAME_PREFIX_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Starts a framed message: reserves the length prefix.
fn begin_frame(capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + capacity);
    buf.put_i32(0);
    buf
}

/// Backfills the length prefix and freezes the message.
fn finish_frame(mut buf: BytesMut) -> Bytes {
    let payload = buf.len() - FRAME_PREFIX_SIZE;
    buf[..FRAME_PREFIX_SIZE].copy_from_slice(&(payload as i32).to_be_bytes());
    buf.freeze()
}

/// Builds a framed login request: version, protocol name, service name,
/// username, and the 20-byte SHA-1 of the password.
pub fn login_request(
    service: &str,
    username: &str,
    password_hash: &[u8; PASSWORD_HASH_SIZE],
) -> Bytes {
    let mut buf = begin_frame(
        1 + 4 + PROTOCOL_NAME.len() + 4 + service.len() + 4 + username.len() + PASSWORD_HASH_SIZE,
    );
    buf.put_i8(LOGIN_VERSION);
    put_string(&mut buf, Some(PROTOCOL_NAME));
    put_string(&mut buf, Some(service));
    put_string(&mut buf, Some(username));
    buf.put_slice(password_hash);
    finish_frame(buf)
}

/// The server's answer to a login request.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub auth_code: i8,
    pub host_id: i32,
    pub connection_id: i64,
    pub cluster_start_timestamp: i64,
    pub leader_ip_v4: i32,
    pub build_string: String,
}

impl LoginResponse {
    /// Decodes a login response payload (frame prefix already stripped).
    pub fn decode(frame: Bytes) -> WireResult<Self> {
        let mut buf = ByteBuffer::new(frame);
        let version = buf.get_i8()?;
        if version != 0 {
            return Err(WireError::UnsupportedVersion(version));
        }
        Ok(Self {
            auth_code: buf.get_i8()?,
            host_id: buf.get_i32()?,
            connection_id: buf.get_i64()?,
            cluster_start_timestamp: buf.get_i64()?,
            leader_ip_v4: buf.get_i32()?,
            build_string: buf.get_string()?.unwrap_or_default(),
        })
    }

    /// True when the server accepted the credentials.
    pub fn accepted(&self) -> bool {
        self.auth_code == 0
    }
}

/// Builds a framed invocation request for a procedure and a client-data
/// handle: version, procedure name, the handle, then the parameter set.
///
/// Fails when the name exceeds [`Procedure::MAX_NAME_LEN`] bytes or any
/// parameter slot is unbound.
pub fn invocation_request(procedure: &Procedure, client_data: ClientData) -> WireResult<Bytes> {
    let name = procedure.name();
    if name.len() > Procedure::MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.len()));
    }
    let mut buf = begin_frame(1 + 4 + name.len() + 8 + 2 + 16 * procedure.params().arity());
    buf.put_i8(MESSAGE_VERSION);
    put_string(&mut buf, Some(name));
    buf.put_i64(client_data.as_i64());
    procedure.params().encode(&mut buf)?;
    Ok(finish_frame(buf))
}
