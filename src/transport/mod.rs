//! # Transport
//!
//! A newline-framed Unix domain socket endpoint. The broker side binds a
//! listener at a deterministic path and accepts exactly one peer connection
//! (the child process); the child dials that path as a client. Grounded in
//! the teacher's `ipc::unix_domain_socket` module, with framing switched
//! from 4-byte length-prefixed `bincode` to newline-delimited JSON so a
//! socket can be tailed and read by eye.

pub mod uds;

pub use uds::UdsTransport;

/// Lifecycle of a single [`UdsTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Constructed but not yet bound or dialed.
    Unbound,
    /// Server side has bound a listener; no peer connected yet.
    Listening,
    /// A peer connection is established; send/receive are live.
    Connected,
    /// Closed by `Close`, peer EOF, or an I/O error.
    Closed,
}
