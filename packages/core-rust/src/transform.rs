//! Reversible whole-payload transforms applied around framing.
//!
//! A connection calls [`PayloadTransform::forward`] on a serialized payload
//! before framing it and [`PayloadTransform::inverse`] on a deframed payload
//! before deserializing it. Transforms are obfuscation hooks, not cryptography.

/// Pluggable reversible byte transform.
///
/// Both methods default to the identity, so implementors only override what
/// they need. `inverse(forward(p))` must equal `p` for every payload `p`.
pub trait PayloadTransform: Send + Sync {
    /// Applied to an outgoing payload before framing.
    fn forward(&self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }

    /// Applied to an incoming payload after deframing.
    fn inverse(&self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }
}

/// Leaves payloads untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl PayloadTransform for IdentityTransform {}

/// Default key used by [`XorTransform::default`].
pub const DEFAULT_XOR_KEY: [u8; 3] = [0xFA, 0x01, 0xC5];

/// Repeating-key XOR obfuscation. Self-inverse.
#[derive(Debug, Clone)]
pub struct XorTransform {
    key: Vec<u8>,
}

impl XorTransform {
    /// Creates a transform with the given key. An empty key behaves as the
    /// identity.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn apply(&self, mut payload: Vec<u8>) -> Vec<u8> {
        if self.key.is_empty() {
            return payload;
        }
        for (byte, k) in payload.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= k;
        }
        payload
    }
}

impl Default for XorTransform {
    fn default() -> Self {
        Self::new(DEFAULT_XOR_KEY)
    }
}

impl PayloadTransform for XorTransform {
    fn forward(&self, payload: Vec<u8>) -> Vec<u8> {
        self.apply(payload)
    }

    fn inverse(&self, payload: Vec<u8>) -> Vec<u8> {
        self.apply(payload)
    }
}
