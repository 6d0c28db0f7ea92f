//! Shared vocabulary types for completion-driven socket operations.

use std::fmt;

/// The kind of asynchronous socket operation a completion refers to.
///
/// Every pooled operation context is stamped with one of these before it is
/// submitted, and the dispatch engine routes the completion on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Outbound connection establishment.
    Connect,
    /// Inbound byte transfer on an open connection.
    Receive,
    /// Outbound byte transfer on an open connection.
    Send,
    /// Graceful connection teardown.
    Disconnect,
    /// Acceptance of an inbound connection on a listening socket.
    Accept,
}

impl OperationKind {
    /// Returns a stable lowercase name, used as a structured log field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Receive => "receive",
            Self::Send => "send",
            Self::Disconnect => "disconnect",
            Self::Accept => "accept",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_as_str() {
        for kind in [
            OperationKind::Connect,
            OperationKind::Receive,
            OperationKind::Send,
            OperationKind::Disconnect,
            OperationKind::Accept,
        ] {
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }
}
