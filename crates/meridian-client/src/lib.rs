//! # meridian-client: Event-driven stored procedure client for Meridian
//!
//! This crate provides a single-threaded, cooperative client for invoking
//! stored procedures on a Meridian cluster over the binary wire protocol
//! defined in `meridian-wire`.
//!
//! The client has no dedicated I/O thread. Requests are written and
//! callbacks invoked only while the application is inside [`Client::run`],
//! [`Client::run_once`], [`Client::drain`], or a blocking call. A client
//! and everything reachable from it belong to one thread; the handle is
//! deliberately not `Send`.
//!
//! ## Usage
//!
//! ```ignore
//! use meridian_client::{callback, Client, DEFAULT_PORT};
//! use meridian_client::wire::{Procedure, Value};
//!
//! let mut client = Client::new()?;
//! client.create_connection("db.example.com", DEFAULT_PORT, "ops", "secret")?;
//!
//! // Synchronous invocation.
//! let mut add_user = Procedure::new("AddUser", 2);
//! add_user.set_param(0, Value::BigInt(17))?;
//! add_user.set_param(1, Value::Text("ada".into()))?;
//! let response = client.invoke(&add_user)?;
//! assert!(response.success());
//!
//! // Asynchronous invocation; the callback runs from a later `run`.
//! client.submit(&add_user, callback(|_client, response| {
//!     println!("{response}");
//!     false
//! }))?;
//! client.drain()?;
//! ```

mod callback;
mod client;
mod config;
mod connection;
mod error;

pub use callback::{callback, ProcedureCallback, SharedCallback, SharedListener, StatusListener};
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_PORT};
pub use connection::ConnectionState;
pub use error::{ClientError, ClientResult};

/// The wire protocol types a client application works with.
pub use meridian_wire as wire;

// Re-export the types that appear in the client's own signatures.
pub use meridian_wire::{ClientData, InvocationResponse, Procedure, StatusCode, Value};

#[cfg(test)]
mod tests;
