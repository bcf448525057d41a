//! Error types for rdbshift.
//!
//! Uses `thiserror` for ergonomic error definitions. Server error *replies*
//! (`-BUSYKEY …`, `-WRONGTYPE …`) are normally surfaced as
//! [`Reply::Error`](crate::resp::Reply::Error) values, not as `Err`; the
//! [`Error::Reply`] variant exists for the few places (handshake, single-shot
//! sends) where an error reply aborts the operation.

use std::time::Duration;

/// Result type alias for rdbshift operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating into a Redis-compatible target.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TCP or TLS establishment to a target endpoint failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server rejected `AUTH`, `PING`, or `SELECT` during the handshake.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The RESP reply bytes were malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed error reply aborted a single-shot operation.
    #[error("server error reply: {0}")]
    Reply(String),

    /// Bad configuration: unknown keys, invalid combinations, or a broken
    /// cluster description (slot gaps, overlaps, unstable slots).
    #[error("config error: {0}")]
    Config(String),

    /// An I/O error occurred mid-batch.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns `true` for error classes that must abort the whole run
    /// (operator intervention required) rather than a single endpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Config(_))
    }

    /// Returns `true` for endpoint-local transport faults that the
    /// reconnect supervisor handles by rebuilding the endpoint.
    pub fn is_io_class(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) | Error::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Auth("bad password".into()).is_fatal());
        assert!(Error::Config("slot 100 unassigned".into()).is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
        assert!(!Error::Connect("refused".into()).is_fatal());
    }

    #[test]
    fn test_io_classification() {
        assert!(Error::ConnectionClosed.is_io_class());
        assert!(Error::Protocol("bad byte".into()).is_io_class());
        assert!(!Error::Auth("denied".into()).is_io_class());
        assert!(!Error::Config("overlap".into()).is_io_class());
    }
}
