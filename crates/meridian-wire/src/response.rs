//! Decoded invocation responses.

use std::fmt;

use bytes::Bytes;

use crate::buffer::ByteBuffer;
use crate::error::{WireError, WireResult};
use crate::message::ClientData;
use crate::table::Table;

/// Bit in the present-fields mask: a status string follows the status code.
const FIELD_STATUS_STRING: u8 = 1 << 5;
/// Bit in the present-fields mask: a serialized exception block is present.
const FIELD_EXCEPTION: u8 = 1 << 6;
/// Bit in the present-fields mask: an application status string is present.
const FIELD_APP_STATUS_STRING: u8 = 1 << 7;

/// Application status code when the procedure never set one.
pub const APP_STATUS_UNSET: i8 = i8::MIN;

/// Status string of a synthesized connection-loss response.
pub const CONNECTION_LOST_MESSAGE: &str = "Connection to the database was lost";

/// Outcome of a procedure invocation as reported by the cluster, or
/// synthesized by the client on connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The procedure executed without aborting.
    Success,
    /// The procedure aborted and was rolled back.
    UserAbort,
    /// The procedure failed cleanly, e.g. a constraint violation.
    GracefulFailure,
    /// The invocation failed inside the cluster.
    UnexpectedFailure,
    /// The connection the request was sent on was lost.
    ConnectionLost,
    /// A code this client does not know.
    Unknown(i8),
}

impl StatusCode {
    pub fn from_code(code: i8) -> Self {
        match code {
            1 => StatusCode::Success,
            -1 => StatusCode::UserAbort,
            -2 => StatusCode::GracefulFailure,
            -3 => StatusCode::UnexpectedFailure,
            -4 => StatusCode::ConnectionLost,
            other => StatusCode::Unknown(other),
        }
    }

    pub fn code(self) -> i8 {
        match self {
            StatusCode::Success => 1,
            StatusCode::UserAbort => -1,
            StatusCode::GracefulFailure => -2,
            StatusCode::UnexpectedFailure => -3,
            StatusCode::ConnectionLost => -4,
            StatusCode::Unknown(code) => code,
        }
    }
}

/// Response to a stored procedure invocation. Immutable once decoded; owns
/// its payload, and its tables share the received buffer without copying.
#[derive(Debug, Clone)]
pub struct InvocationResponse {
    client_data: ClientData,
    status: StatusCode,
    status_string: String,
    app_status_code: i8,
    app_status_string: String,
    cluster_round_trip_time: i32,
    results: Vec<Table>,
}

impl Default for InvocationResponse {
    /// An error response indicating the connection to the database was lost.
    fn default() -> Self {
        Self::connection_lost(ClientData(0))
    }
}

impl InvocationResponse {
    /// Synthesizes the response delivered when the connection carrying a
    /// request is lost.
    pub fn connection_lost(client_data: ClientData) -> Self {
        Self {
            client_data,
            status: StatusCode::ConnectionLost,
            status_string: CONNECTION_LOST_MESSAGE.to_string(),
            app_status_code: APP_STATUS_UNSET,
            app_status_string: String::new(),
            cluster_round_trip_time: 0,
            results: Vec::new(),
        }
    }

    /// Decodes a response payload (frame prefix already stripped).
    pub fn decode(frame: Bytes) -> WireResult<Self> {
        let mut buf = ByteBuffer::new(frame);
        let version = buf.get_i8()?;
        if version != 0 {
            return Err(WireError::UnsupportedVersion(version));
        }

        let client_data = ClientData(buf.get_i64()?);
        let present = buf.get_u8()?;
        let status = StatusCode::from_code(buf.get_i8()?);
        let status_string = if present & FIELD_STATUS_STRING != 0 {
            buf.get_string()?.unwrap_or_default()
        } else {
            String::new()
        };
        let app_status_code = buf.get_i8()?;
        let app_status_string = if present & FIELD_APP_STATUS_STRING != 0 {
            buf.get_string()?.unwrap_or_default()
        } else {
            String::new()
        };
        let cluster_round_trip_time = buf.get_i32()?;

        if present & FIELD_EXCEPTION != 0 {
            // Serialized exception details; length-prefixed and skipped.
            let len = buf.get_i32()?;
            if len < 0 {
                return Err(WireError::InvalidLength(len));
            }
            buf.set_position(buf.position() + len as usize)?;
        }

        let result_count = buf.get_i16()?;
        if result_count < 0 {
            return Err(WireError::InvalidLength(i32::from(result_count)));
        }

        let outer_limit = buf.limit();
        let mut results = Vec::with_capacity(result_count as usize);
        for _ in 0..result_count {
            let table_length = buf.get_i32()?;
            if table_length < 4 {
                return Err(WireError::Malformed(
                    "result table shorter than its header".into(),
                ));
            }
            let end = buf.position() + table_length as usize;
            if end > outer_limit {
                return Err(WireError::Overrun {
                    needed: table_length as usize,
                    available: buf.remaining(),
                });
            }
            buf.set_limit(end)?;
            results.push(Table::decode(buf.slice())?);
            buf.set_limit(outer_limit)?;
            buf.set_position(end)?;
        }

        Ok(Self {
            client_data,
            status,
            status_string,
            app_status_code,
            app_status_string,
            cluster_round_trip_time,
            results,
        })
    }

    /// The handle the dispatcher attached to the request.
    pub fn client_data(&self) -> ClientData {
        self.client_data
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The raw status byte.
    pub fn status_code(&self) -> i8 {
        self.status.code()
    }

    pub fn success(&self) -> bool {
        self.status == StatusCode::Success
    }

    pub fn failure(&self) -> bool {
        !self.success()
    }

    /// Human-readable description of a failure; empty on success.
    pub fn status_string(&self) -> &str {
        &self.status_string
    }

    /// Status code set by the procedure itself; [`APP_STATUS_UNSET`] when
    /// the procedure did not set one.
    pub fn app_status_code(&self) -> i8 {
        self.app_status_code
    }

    pub fn app_status_string(&self) -> &str {
        &self.app_status_string
    }

    /// Time between the cluster receiving the invocation and completing it,
    /// in milliseconds.
    pub fn cluster_round_trip_time(&self) -> i32 {
        self.cluster_round_trip_time
    }

    /// The result tables, in the order the procedure returned them.
    pub fn results(&self) -> &[Table] {
        &self.results
    }
}

impl fmt::Display for InvocationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Status: {}, {}",
            self.status.code(),
            self.status_string
        )?;
        writeln!(
            f,
            "App Status: {}, {}",
            self.app_status_code, self.app_status_string
        )?;
        writeln!(f, "Client Data: {}", self.client_data)?;
        writeln!(
            f,
            "Cluster Round Trip Time: {}",
            self.cluster_round_trip_time
        )?;
        for (index, table) in self.results.iter().enumerate() {
            writeln!(
                f,
                "Result Table {index}: {} columns, {} rows",
                table.column_count(),
                table.row_count()
            )?;
        }
        Ok(())
    }
}
