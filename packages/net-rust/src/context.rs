//! Reusable per-operation state handed between the pool, the I/O task and
//! the dispatch engine.
//!
//! An [`OperationContext`] is always passed by value. Whoever holds it owns
//! it: the pool while idle, the spawned I/O task while the operation is in
//! flight, the dispatch engine while the completion is routed. That makes a
//! double return to the pool a move error instead of a runtime bug.

use std::io;

use sockflow_core::{MessageFramer, OperationKind, OutgoingFrame, SocketError, Window};
use tokio::net::TcpStream;

/// Host and port an outbound connect targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

/// Opaque per-operation attachment.
#[derive(Debug, Default)]
pub enum UserToken {
    #[default]
    None,
    /// The receive stream's framer.
    Receive(MessageFramer),
    /// Progress of an outgoing frame.
    Send(OutgoingFrame),
    /// A socket produced by a connect or accept.
    Stream(TcpStream),
}

/// One in-flight asynchronous socket operation.
#[derive(Debug)]
pub struct OperationContext {
    kind: Option<OperationKind>,
    buffer: Vec<u8>,
    window: Window,
    bytes_transferred: usize,
    error: Option<SocketError>,
    remote: Option<RemoteEndpoint>,
    token: UserToken,
}

impl OperationContext {
    /// Creates an idle context with a zeroed transfer buffer of `buffer_size`
    /// bytes.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            kind: None,
            buffer: vec![0; buffer_size],
            window: Window::default(),
            bytes_transferred: 0,
            error: None,
            remote: None,
            token: UserToken::None,
        }
    }

    /// Stamps the operation kind and clears results from any previous use.
    pub fn prepare(&mut self, kind: OperationKind) {
        self.kind = Some(kind);
        self.bytes_transferred = 0;
        self.error = None;
    }

    /// Returns the context to its idle shape, keeping `buffer_size` bytes of
    /// buffer. Dropping the token closes any stream it held.
    pub fn reset(&mut self, buffer_size: usize) {
        self.kind = None;
        self.window = Window::default();
        self.bytes_transferred = 0;
        self.error = None;
        self.remote = None;
        self.token = UserToken::None;

        self.buffer.resize(buffer_size, 0);
        if self.buffer.capacity() > buffer_size.saturating_mul(4) {
            self.buffer.shrink_to(buffer_size);
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<OperationKind> {
        self.kind
    }

    #[must_use]
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    #[must_use]
    pub fn error(&self) -> Option<SocketError> {
        self.error
    }

    #[must_use]
    pub fn window(&self) -> Window {
        self.window
    }

    /// Restricts the next transfer to `window`, growing the buffer if the
    /// window reaches past it.
    pub fn set_window(&mut self, window: Window) {
        if self.buffer.len() < window.end() {
            self.buffer.resize(window.end(), 0);
        }
        self.window = window;
    }

    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// The whole backing buffer, for encoders that replace its contents.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// The bytes inside the current window.
    #[must_use]
    pub fn window_bytes(&self) -> &[u8] {
        &self.buffer[self.window.offset..self.window.end()]
    }

    /// The current window, writable, for receives.
    pub fn window_bytes_mut(&mut self) -> &mut [u8] {
        let end = self.window.end();
        &mut self.buffer[self.window.offset..end]
    }

    /// The bytes the last transfer moved, starting at the window offset.
    #[must_use]
    pub fn transferred_bytes(&self) -> &[u8] {
        let start = self.window.offset;
        &self.buffer[start..start + self.bytes_transferred.min(self.window.len)]
    }

    /// Records the outcome of a platform call.
    pub fn record(&mut self, result: io::Result<usize>) {
        match result {
            Ok(n) => {
                self.bytes_transferred = n;
                self.error = None;
            }
            Err(err) => self.fail(SocketError::from(&err)),
        }
    }

    /// Marks the operation as failed without transferring anything.
    pub fn fail(&mut self, error: SocketError) {
        self.bytes_transferred = 0;
        self.error = Some(error);
    }

    #[must_use]
    pub fn remote(&self) -> Option<&RemoteEndpoint> {
        self.remote.as_ref()
    }

    pub fn set_remote(&mut self, remote: RemoteEndpoint) {
        self.remote = Some(remote);
    }

    #[must_use]
    pub fn token(&self) -> &UserToken {
        &self.token
    }

    pub fn token_mut(&mut self) -> &mut UserToken {
        &mut self.token
    }

    pub fn set_token(&mut self, token: UserToken) {
        self.token = token;
    }

    pub fn take_token(&mut self) -> UserToken {
        std::mem::take(&mut self.token)
    }

    /// Splits a receive context into its framer and the bytes just read.
    pub fn receive_parts(&mut self) -> Option<(&mut MessageFramer, &[u8])> {
        let start = self.window.offset;
        let end = start + self.bytes_transferred.min(self.window.len);
        match &mut self.token {
            UserToken::Receive(framer) => Some((framer, &self.buffer[start..end])),
            _ => None,
        }
    }
}
