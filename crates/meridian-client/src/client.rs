//! The client: dispatcher and event loop.
//!
//! A [`Client`] owns its poll and every connection created through it, and
//! is driven cooperatively from a single thread. Submissions round-robin
//! across ready connections; responses are routed back to callbacks by the
//! client-data handle the dispatcher stamped on the request.

use std::cell::RefCell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use mio::{Events, Poll, Token};
use tracing::{debug, warn};

use meridian_wire::{self as wire, ClientData, InvocationResponse, Procedure};

use crate::callback::{ProcedureCallback, SharedCallback, SharedListener};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, PendingCall};
use crate::error::{ClientError, ClientResult};

/// Maximum events drained per poll iteration.
const MAX_EVENTS: usize = 64;

/// A client for invoking stored procedures on a Meridian cluster.
///
/// Single-threaded and cooperative: the client has no I/O thread of its
/// own, so requests are sent and callbacks invoked only while the caller is
/// inside [`run`](Client::run), [`run_once`](Client::run_once),
/// [`drain`](Client::drain), or a blocking [`invoke`](Client::invoke) or
/// [`submit`](Client::submit).
pub struct Client {
    poll: Poll,
    /// Insertion order doubles as the round-robin order.
    connections: Vec<Connection>,
    next_token: usize,
    cursor: usize,
    next_handle: i64,
    in_flight: usize,
    break_requested: bool,
    backpressure_reported: bool,
    /// The listener's block-or-reject decision for the current
    /// backpressure episode.
    backpressure_block: bool,
    pumping: bool,
    listener: Option<SharedListener>,
    config: ClientConfig,
}

impl Client {
    /// Creates a client with no status listener.
    pub fn new() -> ClientResult<Self> {
        Self::with_config(None, ClientConfig::default())
    }

    /// Creates a client with a status listener.
    pub fn with_listener(listener: SharedListener) -> ClientResult<Self> {
        Self::with_config(Some(listener), ClientConfig::default())
    }

    /// Creates a client with explicit configuration.
    pub fn with_config(
        listener: Option<SharedListener>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        Ok(Self {
            poll: Poll::new()?,
            connections: Vec::new(),
            next_token: 1,
            cursor: 0,
            next_handle: 0,
            in_flight: 0,
            break_requested: false,
            backpressure_reported: false,
            backpressure_block: true,
            pumping: false,
            listener,
            config,
        })
    }

    /// Connects to a node and authenticates, blocking through the
    /// handshake. Only the new socket is serviced while this runs; traffic
    /// on other connections waits for the next event loop entry.
    pub fn create_connection(
        &mut self,
        hostname: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> ClientResult<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let mut conn =
            Connection::establish(hostname, port, username, password, token, &self.config)?;
        let interest = conn.interest();
        self.poll
            .registry()
            .register(&mut conn.stream, token, interest)?;
        self.connections.push(conn);
        Ok(())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Invocations submitted but not yet answered.
    pub fn outstanding_count(&self) -> usize {
        self.in_flight
    }

    /// Asynchronously invokes a stored procedure.
    ///
    /// Returns as soon as the request is queued, unless the selected
    /// connection is over its backpressure threshold: then the listener is
    /// consulted, and the call either fails with
    /// [`ClientError::BackpressureRejected`] or runs the event loop until
    /// the pressure clears. The callback fires from a later event loop
    /// entry, exactly once.
    pub fn submit(&mut self, procedure: &Procedure, callback: SharedCallback) -> ClientResult<()> {
        let mut idx = self.pick().ok_or(ClientError::NoConnections)?;

        let handle = ClientData(self.next_handle);
        self.next_handle += 1;
        let frame = wire::invocation_request(procedure, handle)?;

        if self.connections[idx].over_threshold(&self.config) {
            if !self.notify_backpressure() {
                return Err(ClientError::BackpressureRejected);
            }
            if self.pumping {
                return Err(ClientError::Misuse(
                    "cannot block on backpressure from inside a callback",
                ));
            }
            loop {
                self.pump(None)?;
                idx = self.pick().ok_or(ClientError::NoConnections)?;
                if !self.connections[idx].over_threshold(&self.config) {
                    break;
                }
            }
        }

        self.cursor = (idx + 1) % self.connections.len();
        let conn = &mut self.connections[idx];
        conn.pending.insert(handle, PendingCall { handle, callback });
        conn.enqueue(&frame);
        self.in_flight += 1;
        self.rearm(idx);
        Ok(())
    }

    /// Synchronously invokes a stored procedure and returns its response.
    ///
    /// Runs the event loop until the response arrives; callbacks for
    /// earlier asynchronous submissions may be invoked before this returns.
    pub fn invoke(&mut self, procedure: &Procedure) -> ClientResult<InvocationResponse> {
        if self.pumping {
            return Err(ClientError::Misuse(
                "synchronous invoke from inside a callback",
            ));
        }
        let slot = Rc::new(RefCell::new(SyncCallback { response: None }));
        let callback: SharedCallback = slot.clone();
        self.submit(procedure, callback)?;
        loop {
            if let Some(response) = slot.borrow_mut().response.take() {
                // Consume the break raised by the capturing callback.
                self.break_requested = false;
                return Ok(response);
            }
            // Breaks raised by unrelated callbacks are absorbed here; a set
            // flag would otherwise stop every pump before it could dispatch
            // the response this call is waiting for.
            self.break_requested = false;
            self.pump(None)?;
        }
    }

    /// Runs one pump of the event loop: flushes writable connections,
    /// reads available responses, invokes their callbacks, and returns.
    /// A break requested by a callback stops the pump early and is
    /// consumed on return, exactly as in [`run`](Client::run).
    pub fn run_once(&mut self) -> ClientResult<()> {
        self.enter()?;
        let result = self.pump(Some(Duration::ZERO));
        self.break_requested = false;
        result
    }

    /// Runs the event loop until a callback requests a break or no ready
    /// connection remains. The break flag is consumed on return; a
    /// subsequent `run` resumes where this one stopped.
    pub fn run(&mut self) -> ClientResult<()> {
        self.enter()?;
        loop {
            if self.break_requested {
                self.break_requested = false;
                return Ok(());
            }
            if !self
                .connections
                .iter()
                .any(|c| c.state == ConnectionState::Ready)
            {
                return Ok(());
            }
            self.pump(None)?;
        }
    }

    /// Runs the event loop until every outstanding call has been answered.
    ///
    /// Returns `true` once nothing remains in flight, `false` if a callback
    /// broke the loop first.
    pub fn drain(&mut self) -> ClientResult<bool> {
        self.enter()?;
        loop {
            if self.in_flight == 0 {
                return Ok(true);
            }
            if self.break_requested {
                self.break_requested = false;
                return Ok(false);
            }
            self.pump(None)?;
        }
    }

    /// Stops routing new submissions to a connection; it closes once its
    /// in-flight calls complete. Returns `false` when no ready connection
    /// matches the hostname.
    pub fn begin_drain(&mut self, hostname: &str) -> bool {
        let Some(idx) = self
            .connections
            .iter()
            .position(|c| c.hostname == hostname && c.state == ConnectionState::Ready)
        else {
            return false;
        };
        self.connections[idx].begin_drain();
        if self.connections[idx].pending.is_empty() {
            self.close_connection(idx, false);
            // Inside a pump the sweep runs when the pump finishes.
            if !self.pumping {
                self.sweep_closed();
            }
        }
        true
    }

    /// Guards public event loop entry points.
    fn enter(&mut self) -> ClientResult<()> {
        if self.pumping {
            return Err(ClientError::Misuse("event loop reentered from a callback"));
        }
        if !self
            .connections
            .iter()
            .any(|c| matches!(c.state, ConnectionState::Ready | ConnectionState::Draining))
        {
            return Err(ClientError::NoConnections);
        }
        Ok(())
    }

    /// The next connection in round-robin order that accepts submissions.
    fn pick(&self) -> Option<usize> {
        let n = self.connections.len();
        for step in 0..n {
            let i = (self.cursor + step) % n;
            if self.connections[i].usable() {
                return Some(i);
            }
        }
        None
    }

    fn index_of(&self, token: Token) -> Option<usize> {
        self.connections.iter().position(|c| c.token == token)
    }

    /// One event loop iteration.
    fn pump(&mut self, timeout: Option<Duration>) -> ClientResult<()> {
        self.pumping = true;
        let result = self.pump_inner(timeout);
        self.pumping = false;
        result
    }

    fn pump_inner(&mut self, timeout: Option<Duration>) -> ClientResult<()> {
        // Frames left buffered when a callback broke the loop are not
        // announced by the poll again; deliver them before waiting on I/O.
        for idx in 0..self.connections.len() {
            if self.break_requested {
                break;
            }
            self.dispatch_frames(idx);
        }
        if self.break_requested {
            self.sweep_closed();
            return Ok(());
        }

        let mut events = Events::with_capacity(MAX_EVENTS);
        if let Err(e) = self.poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            let Some(idx) = self.index_of(token) else {
                continue;
            };
            if writable {
                self.handle_writable(idx);
            }
            if readable {
                self.handle_readable(idx);
            }
        }

        self.sweep_closed();
        Ok(())
    }

    fn handle_writable(&mut self, idx: usize) {
        if self.connections[idx].state == ConnectionState::Closed {
            return;
        }
        if !self.connections[idx].flush() {
            self.close_connection(idx, true);
            return;
        }
        self.rearm(idx);
    }

    fn handle_readable(&mut self, idx: usize) {
        if self.connections[idx].state == ConnectionState::Closed {
            return;
        }
        let open = self.connections[idx].fill();
        // Responses that arrived ahead of a close still get delivered.
        self.dispatch_frames(idx);
        if !open {
            self.close_connection(idx, true);
        }
    }

    /// Extracts and routes complete frames from a connection's read buffer,
    /// stopping early on a break request so the remainder is picked up by
    /// the next pump.
    fn dispatch_frames(&mut self, idx: usize) {
        loop {
            if self.break_requested || self.connections[idx].state == ConnectionState::Closed {
                return;
            }
            let next = {
                let conn = &mut self.connections[idx];
                wire::next_frame(&mut conn.read_buf, self.config.max_message_size)
            };
            match next {
                Ok(Some(frame)) => self.on_response(idx, frame),
                Ok(None) => return,
                Err(e) => {
                    warn!(
                        host = %self.connections[idx].hostname,
                        error = %e,
                        "protocol error, closing connection"
                    );
                    self.close_connection(idx, true);
                    return;
                }
            }
        }
    }

    /// Routes one response frame to its pending call.
    fn on_response(&mut self, idx: usize, frame: Bytes) {
        let response = match InvocationResponse::decode(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    host = %self.connections[idx].hostname,
                    error = %e,
                    "undecodable response, closing connection"
                );
                self.close_connection(idx, true);
                return;
            }
        };

        let handle = response.client_data();
        let Some(call) = self.connections[idx].pending.remove(&handle) else {
            warn!(
                host = %self.connections[idx].hostname,
                %handle,
                "dropping response for unknown handle"
            );
            if let Some(listener) = self.listener.clone() {
                listener
                    .borrow_mut()
                    .uncaught_exception(&format!("response for unknown handle {handle}"), handle);
            }
            return;
        };

        self.in_flight -= 1;
        self.deliver(call.callback, handle, response);
        self.maybe_clear_backpressure();

        if self.connections[idx].state == ConnectionState::Draining
            && self.connections[idx].pending.is_empty()
        {
            self.close_connection(idx, false);
        }
    }

    /// Invokes a callback exactly once, containing panics so the event
    /// loop survives a failing callback.
    fn deliver(&mut self, callback: SharedCallback, handle: ClientData, response: InvocationResponse) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            callback.borrow_mut().on_response(self, response)
        }));
        match outcome {
            Ok(true) => self.break_requested = true,
            Ok(false) => {}
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%handle, message = %message, "callback panicked");
                if let Some(listener) = self.listener.clone() {
                    listener.borrow_mut().uncaught_exception(&message, handle);
                }
            }
        }
    }

    /// Closes a connection and synthesizes a connection-lost response for
    /// every call still pending on it, in submission order. The connection
    /// stays in the list (skipped by routing) until the next sweep.
    fn close_connection(&mut self, idx: usize, failed: bool) {
        {
            let conn = &mut self.connections[idx];
            if conn.state == ConnectionState::Closed {
                return;
            }
            conn.state = ConnectionState::Closed;
            conn.failed = failed;
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }

        let pending = std::mem::take(&mut self.connections[idx].pending);
        if !pending.is_empty() {
            debug!(
                host = %self.connections[idx].hostname,
                lost = pending.len(),
                "synthesizing connection-lost responses"
            );
        }
        for (_, call) in pending {
            self.in_flight -= 1;
            let response = InvocationResponse::connection_lost(call.handle);
            self.deliver(call.callback, call.handle, response);
        }
        self.maybe_clear_backpressure();
    }

    /// Removes closed connections and notifies the listener about the ones
    /// that failed.
    fn sweep_closed(&mut self) {
        if self
            .connections
            .iter()
            .all(|c| c.state != ConnectionState::Closed)
        {
            return;
        }

        let mut lost = Vec::new();
        self.connections.retain(|c| {
            if c.state == ConnectionState::Closed {
                if c.failed {
                    lost.push(c.hostname.clone());
                }
                false
            } else {
                true
            }
        });
        self.cursor = 0;

        for hostname in lost {
            let connections_left = self.connections.len();
            debug!(host = %hostname, connections_left, "connection lost");
            if let Some(listener) = self.listener.clone() {
                listener
                    .borrow_mut()
                    .connection_lost(&hostname, connections_left);
            }
        }
    }

    /// Returns the listener's decision for the current backpressure
    /// episode (`true` = block until clear). The on edge is reported once
    /// per crossing; further submissions in the same episode reuse the
    /// decision without another notification.
    fn notify_backpressure(&mut self) -> bool {
        if !self.backpressure_reported {
            self.backpressure_reported = true;
            self.backpressure_block = match self.listener.clone() {
                Some(listener) => listener.borrow_mut().backpressure(true),
                None => true,
            };
        }
        self.backpressure_block
    }

    /// Reports the backpressure-off edge once everything has drained.
    fn maybe_clear_backpressure(&mut self) {
        if !self.backpressure_reported {
            return;
        }
        if self.in_flight == 0 && self.connections.iter().all(|c| c.queued_bytes() == 0) {
            self.backpressure_reported = false;
            if let Some(listener) = self.listener.clone() {
                listener.borrow_mut().backpressure(false);
            }
        }
    }

    /// Updates a connection's poll registration to match its outbound
    /// queue.
    fn rearm(&mut self, idx: usize) {
        if self.connections[idx].state == ConnectionState::Closed {
            return;
        }
        let token = self.connections[idx].token;
        let interest = self.connections[idx].interest();
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut self.connections[idx].stream, token, interest)
        {
            warn!(
                host = %self.connections[idx].hostname,
                error = %e,
                "failed to update poll registration"
            );
            self.close_connection(idx, true);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connections", &self.connections.len())
            .field("in_flight", &self.in_flight)
            .field("next_handle", &self.next_handle)
            .finish_non_exhaustive()
    }
}

/// Captures the response for a synchronous invoke and breaks the loop.
struct SyncCallback {
    response: Option<InvocationResponse>,
}

impl ProcedureCallback for SyncCallback {
    fn on_response(&mut self, _client: &mut Client, response: InvocationResponse) -> bool {
        self.response = Some(response);
        true
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
