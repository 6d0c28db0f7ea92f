//! Length-prefixed message framing.
//!
//! # Wire format
//!
//! ```text
//! +----------------------+---------------------------+
//! | length: u32 (LE)     | payload: `length` bytes   |
//! +----------------------+---------------------------+
//! ```
//!
//! The payload has already been through the connection's transform when it is
//! framed. A zero length is legal and carries no payload bytes.
//!
//! Receiving is a byte-granular state machine: a transfer may deliver anything
//! from a single byte to a full chunk, so [`MessageFramer`] tracks how much of
//! the prefix or payload it has collected and reports the next window the
//! caller should read into. Sending is simpler: [`OutgoingFrame`] writes the
//! whole frame once and tracks how far the transfers have advanced.

use std::mem;

use tracing::trace;

use crate::error::FrameError;

/// Size of the little-endian length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default transfer chunk size for receives.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default upper bound on a declared payload length (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Receive-side framing limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    /// Largest number of bytes requested by a single receive.
    pub chunk_size: usize,
    /// Largest payload length a peer may declare. Larger declarations are
    /// rejected before any payload byte is buffered.
    pub max_payload_len: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// A region of an operation buffer that the next transfer should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    /// Start of the region.
    pub offset: usize,
    /// Number of bytes in the region.
    pub len: usize,
}

impl Window {
    #[must_use]
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last byte of the region.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

/// Where a [`MessageFramer`] is within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Collecting the 4-byte length prefix.
    AwaitingLength,
    /// Collecting `declared` payload bytes.
    AwaitingPayload { declared: usize },
    /// A full payload is available; the framer must be reset before reuse.
    Complete,
}

/// Outcome of feeding one transfer into a [`MessageFramer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The message is incomplete; read again into [`MessageFramer::window`].
    NeedMore,
    /// The payload is complete and can be taken with
    /// [`MessageFramer::take_payload`].
    Complete,
    /// The peer declared a payload larger than the configured limit.
    SizeExceeded { declared: usize, limit: usize },
}

/// Reassembles length-prefixed messages from arbitrarily split transfers.
///
/// One framer serves one connection's receive stream for its whole life:
/// after each [`FrameStatus::Complete`] the caller takes the payload and calls
/// [`reset`](Self::reset) before the next message.
///
/// The transfer chunk itself is not stored here. The caller reads into a
/// buffer of at least the configured chunk size, restricted to
/// [`window`](Self::window), and hands the bytes read to
/// [`complete_receive`](Self::complete_receive).
#[derive(Debug, Clone)]
pub struct MessageFramer {
    chunk_size: usize,
    max_payload_len: usize,
    phase: FramePhase,
    accumulated: Vec<u8>,
    finalized: Option<Vec<u8>>,
}

impl MessageFramer {
    /// Creates a framer awaiting the length prefix of its first message.
    ///
    /// A zero chunk size is raised to 1 so the framer can always make progress.
    #[must_use]
    pub fn new(config: &FramingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            max_payload_len: config.max_payload_len,
            phase: FramePhase::AwaitingLength,
            accumulated: Vec::with_capacity(LENGTH_PREFIX_LEN),
            finalized: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// The window the next receive must be restricted to.
    ///
    /// While collecting the prefix this is exactly the number of prefix bytes
    /// still missing, so a transfer can never run into the payload. While
    /// collecting the payload it is `min(remaining, chunk_size)`. A complete
    /// framer reports an empty window.
    #[must_use]
    pub fn window(&self) -> Window {
        let len = match self.phase {
            FramePhase::AwaitingLength => LENGTH_PREFIX_LEN - self.accumulated.len(),
            FramePhase::AwaitingPayload { declared } => {
                (declared - self.accumulated.len()).min(self.chunk_size)
            }
            FramePhase::Complete => 0,
        };
        Window::new(0, len)
    }

    /// Feeds the bytes delivered by one receive completion.
    ///
    /// `bytes` must not be longer than the current [`window`](Self::window);
    /// anything past the window is ignored. Once [`FrameStatus::Complete`] has
    /// been returned, further input is ignored and `Complete` is reported
    /// again until [`reset`](Self::reset) is called.
    pub fn complete_receive(&mut self, bytes: &[u8]) -> FrameStatus {
        let window = self.window();
        debug_assert!(
            bytes.len() <= window.len,
            "transfer of {} bytes overran a {}-byte window",
            bytes.len(),
            window.len
        );
        let bytes = &bytes[..bytes.len().min(window.len)];

        match self.phase {
            FramePhase::Complete => FrameStatus::Complete,
            FramePhase::AwaitingLength => {
                self.accumulated.extend_from_slice(bytes);
                if self.accumulated.len() < LENGTH_PREFIX_LEN {
                    return FrameStatus::NeedMore;
                }

                let mut prefix = [0u8; LENGTH_PREFIX_LEN];
                prefix.copy_from_slice(&self.accumulated[..LENGTH_PREFIX_LEN]);
                self.accumulated.clear();
                let declared = usize::try_from(u32::from_le_bytes(prefix)).unwrap_or(usize::MAX);

                if declared > self.max_payload_len {
                    trace!(declared, limit = self.max_payload_len, "rejecting oversized frame");
                    return FrameStatus::SizeExceeded {
                        declared,
                        limit: self.max_payload_len,
                    };
                }
                if declared == 0 {
                    self.finalized = Some(Vec::new());
                    self.phase = FramePhase::Complete;
                    return FrameStatus::Complete;
                }

                self.accumulated.reserve(declared);
                self.phase = FramePhase::AwaitingPayload { declared };
                FrameStatus::NeedMore
            }
            FramePhase::AwaitingPayload { declared } => {
                self.accumulated.extend_from_slice(bytes);
                if self.accumulated.len() < declared {
                    return FrameStatus::NeedMore;
                }
                self.finalized = Some(mem::take(&mut self.accumulated));
                self.phase = FramePhase::Complete;
                FrameStatus::Complete
            }
        }
    }

    /// Borrows the finalized payload, if the current message is complete.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.finalized.as_deref()
    }

    /// Moves the finalized payload out. Returns `None` before completion or
    /// when it was already taken.
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.finalized.take()
    }

    /// Clears all per-message state and returns to awaiting a length prefix.
    pub fn reset(&mut self) {
        self.accumulated.clear();
        self.finalized = None;
        self.phase = FramePhase::AwaitingLength;
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(&FramingConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Send side
// ---------------------------------------------------------------------------

/// Progress of one outgoing frame across partial send completions.
///
/// The frame bytes live in the operation buffer written by
/// [`encode_into`](Self::encode_into); this type only tracks the offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingFrame {
    len: usize,
    offset: usize,
}

impl OutgoingFrame {
    /// Writes `u32_le(payload.len()) ++ payload` into `out`, replacing its
    /// contents, and returns the progress tracker for it.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload length does not
    /// fit the 32-bit prefix.
    pub fn encode_into(payload: &[u8], out: &mut Vec<u8>) -> Result<Self, FrameError> {
        let prefix = u32::try_from(payload.len())
            .map_err(|_| FrameError::PayloadTooLarge { len: payload.len() })?;

        out.clear();
        out.reserve(LENGTH_PREFIX_LEN + payload.len());
        out.extend_from_slice(&prefix.to_le_bytes());
        out.extend_from_slice(payload);

        Ok(Self {
            len: out.len(),
            offset: 0,
        })
    }

    /// Total frame length, prefix included.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The unsent remainder of the frame.
    #[must_use]
    pub fn window(&self) -> Window {
        Window::new(self.offset, self.len - self.offset)
    }

    /// Advances past `transferred` bytes. Returns `true` once the whole frame
    /// has been sent.
    pub fn complete_send(&mut self, transferred: usize) -> bool {
        self.offset = (self.offset + transferred).min(self.len);
        self.is_done()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.offset == self.len
    }
}

/// Encodes a payload into a standalone frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload length does not fit
/// the 32-bit prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut frame = Vec::new();
    OutgoingFrame::encode_into(payload, &mut frame)?;
    Ok(frame)
}
