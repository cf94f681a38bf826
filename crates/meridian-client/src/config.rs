//! Client configuration.

use std::time::Duration;

use meridian_wire::MAX_MESSAGE_SIZE;

/// Default port a Meridian node listens on for clients.
pub const DEFAULT_PORT: u16 = 21212;

/// Tunables for a client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outstanding invocations per connection above which submissions hit
    /// backpressure.
    pub max_outstanding_per_connection: usize,
    /// Outbound queued bytes per connection above which submissions hit
    /// backpressure.
    pub max_queued_bytes_per_connection: usize,
    /// Largest frame a peer may send before the connection is closed with a
    /// protocol error.
    pub max_message_size: usize,
    /// Deadline for connect plus the authentication handshake.
    pub connect_timeout: Duration,
    /// Initial capacity of each connection's read buffer.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_outstanding_per_connection: 1000,
            max_queued_bytes_per_connection: 262_144,
            max_message_size: MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 64 * 1024,
        }
    }
}
