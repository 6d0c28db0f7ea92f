//! Error codes carried by completions, plus the crate's own error types.
//!
//! [`SocketError`] is a plain code, not a Rust error chain: it is stamped onto
//! an operation context when the platform reports a failure and handed to
//! application callbacks. The framework never propagates it with `?` across a
//! completion boundary.

use std::io;

use thiserror::Error;

/// Transport-level failure code attached to a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SocketError {
    /// The peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The connection was aborted locally.
    #[error("connection aborted")]
    ConnectionAborted,
    /// Writing to a connection whose peer already closed its read side.
    #[error("broken pipe")]
    BrokenPipe,
    /// The socket was shut down before the operation completed.
    #[error("socket has been shut down")]
    Shutdown,
    /// The peer refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The operation was aborted because its socket was intentionally closed.
    #[error("operation aborted")]
    OperationAborted,
    /// The socket is not connected.
    #[error("socket is not connected")]
    NotConnected,
    /// The remote address could not be resolved or reached.
    #[error("host unreachable")]
    HostUnreachable,
    /// The local address is already bound.
    #[error("address already in use")]
    AddressInUse,
    /// The operation did not complete in time.
    #[error("operation timed out")]
    TimedOut,
    /// A send completed without transferring any bytes.
    #[error("send transferred zero bytes")]
    WriteZero,
    /// A framed message declared a length above the configured maximum.
    #[error("message exceeds the configured size limit")]
    MessageSize,
    /// A complete payload could not be deserialized.
    #[error("received message could not be decoded")]
    InvalidMessage,
    /// Any other platform failure, identified by its `io::ErrorKind`.
    #[error("socket error: {0:?}")]
    Other(io::ErrorKind),
}

impl SocketError {
    /// Whether this error means the peer (or a local shutdown) closed the
    /// stream, as opposed to a failure worth reporting.
    ///
    /// Receive completions carrying one of these are surfaced as a graceful
    /// close rather than an error.
    #[must_use]
    pub fn is_reset_class(self) -> bool {
        matches!(
            self,
            Self::ConnectionReset | Self::ConnectionAborted | Self::BrokenPipe | Self::Shutdown
        )
    }
}

impl From<io::ErrorKind> for SocketError {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::NotConnected => Self::NotConnected,
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::WriteZero => Self::WriteZero,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotFound => Self::HostUnreachable,
            other => Self::Other(other),
        }
    }
}

impl From<&io::Error> for SocketError {
    fn from(err: &io::Error) -> Self {
        Self::from(err.kind())
    }
}

/// Errors produced while converting between typed messages and payload bytes.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

impl From<rmp_serde::encode::Error> for SerializationError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SerializationError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Errors raised while building an outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes does not fit a 32-bit length prefix")]
    PayloadTooLarge { len: usize },
}
