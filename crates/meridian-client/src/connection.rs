//! Connection state management.
//!
//! One [`Connection`] is one authenticated TCP link to one cluster node. The
//! connect and login phases run synchronously inside [`Connection::establish`]
//! on a dedicated poll; from `Ready` onward the connection is driven by the
//! client's event loop.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use meridian_wire::{self as wire, ClientData, LoginResponse, SERVICE_DATABASE};

use crate::callback::SharedCallback;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Token used on the short-lived handshake poll.
const HANDSHAKE_TOKEN: Token = Token(0);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect issued, not yet completed.
    Connecting,
    /// Login request written, waiting for the login response.
    Authenticating,
    /// Handshake complete; accepting submissions.
    Ready,
    /// New submissions refused; closes once the pending map empties.
    Draining,
    /// Terminal.
    Closed,
}

/// A submitted invocation waiting for its response.
pub(crate) struct PendingCall {
    pub handle: ClientData,
    pub callback: SharedCallback,
}

/// One authenticated connection to one cluster node.
pub(crate) struct Connection {
    pub hostname: String,
    pub addr: SocketAddr,
    pub token: Token,
    pub stream: TcpStream,
    pub state: ConnectionState,
    /// True when the connection closed on an error or peer close rather
    /// than a requested drain.
    pub failed: bool,
    pub read_buf: BytesMut,
    /// Whole-message frames queued for the socket, flushed contiguously.
    pub write_buf: BytesMut,
    /// Outstanding calls keyed by handle. Handles are allocated
    /// monotonically, so key order is submission order.
    pub pending: BTreeMap<ClientData, PendingCall>,
    /// Node identity reported by the login response.
    pub host_id: i32,
    pub connection_id: i64,
}

impl Connection {
    /// Connects and authenticates, blocking through the handshake.
    ///
    /// Runs on its own poll so no events belonging to other connections are
    /// consumed; the caller registers the returned connection with the
    /// client's poll.
    pub fn establish(
        hostname: &str,
        port: u16,
        username: &str,
        password: &str,
        token: Token,
        config: &ClientConfig,
    ) -> ClientResult<Self> {
        let addr = (hostname, port)
            .to_socket_addrs()
            .map_err(|e| {
                ClientError::ConnectFailure(format!("failed to resolve {hostname}:{port}: {e}"))
            })?
            .next()
            .ok_or_else(|| {
                ClientError::ConnectFailure(format!("no addresses for {hostname}:{port}"))
            })?;

        debug!(host = hostname, %addr, "connecting");
        let mut stream = TcpStream::connect(addr)
            .map_err(|e| ClientError::ConnectFailure(format!("connect to {addr} failed: {e}")))?;

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        poll.registry()
            .register(&mut stream, HANDSHAKE_TOKEN, Interest::WRITABLE)?;

        let deadline = Instant::now() + config.connect_timeout;

        // Connecting: wait for writability, then confirm the connect took.
        wait_for_event(&mut poll, &mut events, deadline)?;
        if let Some(e) = stream.take_error()? {
            return Err(ClientError::ConnectFailure(format!(
                "connect to {addr} failed: {e}"
            )));
        }
        stream.peer_addr().map_err(|e| {
            ClientError::ConnectFailure(format!("connect to {addr} failed: {e}"))
        })?;

        // Authenticating: write the login request, await the response.
        let digest: [u8; wire::PASSWORD_HASH_SIZE] = Sha1::digest(password.as_bytes()).into();
        let login = wire::login_request(SERVICE_DATABASE, username, &digest);
        write_all(&mut poll, &mut events, &mut stream, &login, deadline)?;

        poll.registry()
            .reregister(&mut stream, HANDSHAKE_TOKEN, Interest::READABLE)?;
        let mut read_buf = BytesMut::with_capacity(config.read_buffer_size);
        let frame = read_frame(
            &mut poll,
            &mut events,
            &mut stream,
            &mut read_buf,
            config.max_message_size,
            deadline,
        )?;
        let response = LoginResponse::decode(frame).map_err(|e| {
            ClientError::ConnectFailure(format!("malformed login response: {e}"))
        })?;
        if !response.accepted() {
            return Err(ClientError::ConnectFailure(format!(
                "authentication rejected by {hostname} (code {})",
                response.auth_code
            )));
        }
        poll.registry().deregister(&mut stream)?;

        debug!(
            host = hostname,
            host_id = response.host_id,
            connection_id = response.connection_id,
            build = %response.build_string,
            "authenticated"
        );

        Ok(Self {
            hostname: hostname.to_string(),
            addr,
            token,
            stream,
            state: ConnectionState::Ready,
            failed: false,
            read_buf,
            write_buf: BytesMut::new(),
            pending: BTreeMap::new(),
            host_id: response.host_id,
            connection_id: response.connection_id,
        })
    }

    /// True while the connection accepts new submissions.
    pub fn usable(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Outstanding invocations on this connection.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Bytes queued but not yet written to the socket.
    pub fn queued_bytes(&self) -> usize {
        self.write_buf.len()
    }

    /// True when this connection is past either backpressure threshold.
    pub fn over_threshold(&self, config: &ClientConfig) -> bool {
        self.outstanding() >= config.max_outstanding_per_connection
            || self.queued_bytes() >= config.max_queued_bytes_per_connection
    }

    /// Queues one whole-message frame for the socket.
    pub fn enqueue(&mut self, frame: &Bytes) {
        self.write_buf.extend_from_slice(frame);
    }

    /// The poll interest matching the current outbound queue.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Refuses new submissions; the connection closes once in-flight work
    /// completes.
    pub fn begin_drain(&mut self) {
        if self.state == ConnectionState::Ready {
            debug!(host = %self.hostname, outstanding = self.outstanding(), "draining");
            self.state = ConnectionState::Draining;
        }
    }

    /// Reads until `WouldBlock`, appending to the read buffer.
    ///
    /// Returns `false` when the peer closed or the socket errored.
    pub fn fill(&mut self) -> bool {
        let mut temp_buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut temp_buf) {
                Ok(0) => {
                    debug!(host = %self.hostname, "peer closed connection");
                    return false;
                }
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(host = %self.hostname, error = %e, "read error");
                    return false;
                }
            }
        }
    }

    /// Flushes queued frames until `WouldBlock` or the queue empties.
    ///
    /// Returns `false` when the socket failed.
    pub fn flush(&mut self) -> bool {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    warn!(host = %self.hostname, "socket refused writes");
                    return false;
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                    trace!(host = %self.hostname, bytes = n, remaining = self.write_buf.len(), "flushed");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(host = %self.hostname, error = %e, "write error");
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hostname", &self.hostname)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("outstanding", &self.pending.len())
            .field("queued_bytes", &self.write_buf.len())
            .field("host_id", &self.host_id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

fn time_left(deadline: Instant) -> ClientResult<Duration> {
    let now = Instant::now();
    if now >= deadline {
        return Err(ClientError::ConnectFailure("connection timed out".into()));
    }
    Ok(deadline - now)
}

fn wait_for_event(poll: &mut Poll, events: &mut Events, deadline: Instant) -> ClientResult<()> {
    loop {
        poll.poll(events, Some(time_left(deadline)?))?;
        if events.iter().next().is_some() {
            return Ok(());
        }
    }
}

fn write_all(
    poll: &mut Poll,
    events: &mut Events,
    stream: &mut TcpStream,
    frame: &Bytes,
    deadline: Instant,
) -> ClientResult<()> {
    let mut written = 0;
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => {
                return Err(ClientError::ConnectFailure(
                    "socket closed during login".into(),
                ));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_for_event(poll, events, deadline)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(ClientError::ConnectFailure(format!(
                    "write failed during login: {e}"
                )));
            }
        }
    }
    Ok(())
}

fn read_frame(
    poll: &mut Poll,
    events: &mut Events,
    stream: &mut TcpStream,
    read_buf: &mut BytesMut,
    max_message_size: usize,
    deadline: Instant,
) -> ClientResult<Bytes> {
    let mut temp_buf = [0u8; 4096];
    loop {
        if let Some(frame) = wire::next_frame(read_buf, max_message_size)
            .map_err(|e| ClientError::ConnectFailure(format!("malformed login response: {e}")))?
        {
            return Ok(frame);
        }
        match stream.read(&mut temp_buf) {
            Ok(0) => {
                return Err(ClientError::ConnectFailure(
                    "server closed the connection during login".into(),
                ));
            }
            Ok(n) => read_buf.extend_from_slice(&temp_buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_for_event(poll, events, deadline)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(ClientError::ConnectFailure(format!(
                    "read failed during login: {e}"
                )));
            }
        }
    }
}
