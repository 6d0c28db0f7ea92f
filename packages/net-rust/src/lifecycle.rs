//! Connection and listener lifecycle: state machine plus disposed flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Observable state of a connection or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic lifecycle shared between an owner and its dispatch engine.
///
/// The disposed flag is independent of the state: the engine checks it
/// before every hook, so once set no completion reaches application code.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    disposed: AtomicBool,
}

impl Lifecycle {
    #[must_use]
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to` if the current state is `from`.
    ///
    /// # Errors
    ///
    /// Returns the actual state when it was not `from`.
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Moves to `Closed`. Returns `true` only for the call that performed the
    /// move, so closure is reported at most once.
    pub fn close(&self) -> bool {
        self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel)
            != ConnectionState::Closed as u8
    }

    /// Sets the disposed flag. Returns `true` the first time.
    pub fn dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(ConnectionState::Idle)
    }
}
