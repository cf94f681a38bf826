//! Callback and status listener capabilities.

use std::cell::RefCell;
use std::rc::Rc;

use meridian_wire::{ClientData, InvocationResponse};

use crate::client::Client;

/// Receiver for the response to an asynchronous invocation.
///
/// Invoked exactly once per submitted call, with either the server's
/// response or a synthesized connection-lost response. The `client`
/// argument is the handle the response arrived on; callbacks may use it to
/// submit further requests, but must not tear the client down. Return
/// `true` to break the event loop.
///
/// A panic inside a callback is caught, reported through
/// [`StatusListener::uncaught_exception`], and otherwise swallowed so the
/// event loop survives.
pub trait ProcedureCallback {
    fn on_response(&mut self, client: &mut Client, response: InvocationResponse) -> bool;
}

impl<F> ProcedureCallback for F
where
    F: FnMut(&mut Client, InvocationResponse) -> bool,
{
    fn on_response(&mut self, client: &mut Client, response: InvocationResponse) -> bool {
        self(client, response)
    }
}

/// Callback ownership shared between user code and the dispatcher. The
/// dispatcher drops its reference after the single invocation.
pub type SharedCallback = Rc<RefCell<dyn ProcedureCallback>>;

/// Wraps a closure as a [`SharedCallback`].
pub fn callback<F>(f: F) -> SharedCallback
where
    F: FnMut(&mut Client, InvocationResponse) -> bool + 'static,
{
    Rc::new(RefCell::new(f))
}

/// Optional observer for client-level events. Every method has a no-op
/// default, so implementations override only what they care about.
pub trait StatusListener {
    /// A connection closed; `connections_left` counts the survivors.
    fn connection_lost(&mut self, hostname: &str, connections_left: usize) {
        let _ = (hostname, connections_left);
    }

    /// Backpressure changed state. Called with `true` once when a
    /// submission first finds its connection over threshold, with `false`
    /// once all outstanding work has drained. On the `true` edge the
    /// return value decides what `submit` does for the rest of the
    /// episode: `true` blocks until the pressure clears, `false` makes
    /// `submit` fail with `BackpressureRejected`.
    fn backpressure(&mut self, active: bool) -> bool {
        let _ = active;
        true
    }

    /// A callback failed, or the protocol was violated in a way that could
    /// be attributed to a single call.
    fn uncaught_exception(&mut self, message: &str, handle: ClientData) {
        let _ = (message, handle);
    }
}

/// Listener ownership shared between user code and the client.
pub type SharedListener = Rc<RefCell<dyn StatusListener>>;
