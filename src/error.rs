//! # Error Taxonomy
//!
//! Typed error kinds shared by every subsystem of the broker core. Ambient,
//! outer-layer code (CLI glue, `main`) still uses `anyhow::Result` to bubble
//! these up without boilerplate, but the core itself returns `BrokerError` so
//! callers can distinguish, say, a timeout from a closed bus without string
//! matching.

use thiserror::Error;

/// Error kinds produced by the broker core.
///
/// Each variant corresponds to one of the error kinds named in the design:
/// invalid-argument, not-found, illegal-state, timeout, transport-io,
/// resource-exhausted, cancelled.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A caller-supplied argument failed validation (bad command path,
    /// malformed RPC parameters, out-of-range configuration value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lookup by process id, correlation id, or RPC method name failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted against an object in the wrong state
    /// (send on a closed bus, operation against a non-running process).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A bounded wait (ready gate, RPC call, kill grace, response delivery)
    /// expired before completing.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transport-level I/O failure, kept distinct from other error kinds so
    /// callers can tell framing/connection errors from logical ones.
    #[error("transport I/O error: {0}")]
    TransportIo(String),

    /// A bounded resource (the optimizer's work queue under `drop_newest`)
    /// rejected an admission.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The broker's root cancellation token fired while the operation was
    /// in flight.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl BrokerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn transport_io(msg: impl Into<String>) -> Self {
        Self::TransportIo(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}

/// Convenience alias for core-level results.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_include_context() {
        let e = BrokerError::not_found("process 'p1'");
        assert_eq!(e.to_string(), "not found: process 'p1'");

        let e = BrokerError::timeout("ready gate for 'p1' after 5s");
        assert!(e.to_string().starts_with("timeout:"));
    }
}
