//! Errors returned synchronously by connection and listener entry points.
//!
//! Transport failures that happen after an operation was submitted are not
//! errors here: they arrive as [`SocketError`](sockflow_core::SocketError)
//! codes through handler callbacks.

use sockflow_core::{FrameError, OperationKind, SerializationError};
use thiserror::Error;

use crate::lifecycle::ConnectionState;

#[derive(Debug, Error)]
pub enum NetError {
    /// A collaborator required by the called operation was never supplied.
    #[error("missing required collaborator: {collaborator}")]
    Configuration { collaborator: &'static str },

    /// The operation is not legal in the current lifecycle state.
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: OperationKind,
        state: ConnectionState,
    },

    /// A receive loop is already armed on this connection.
    #[error("a receive is already armed on this connection")]
    ReceiveArmed,

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("socket setup failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let err = NetError::Configuration {
            collaborator: "context pool",
        };
        assert_eq!(err.to_string(), "missing required collaborator: context pool");

        let err = NetError::InvalidState {
            operation: OperationKind::Send,
            state: ConnectionState::Idle,
        };
        assert_eq!(err.to_string(), "send is not allowed while idle");
    }

    #[test]
    fn wraps_serialization_errors() {
        let err: NetError = SerializationError::Encode("boom".to_string()).into();
        assert!(matches!(err, NetError::Serialization(_)));
    }
}
