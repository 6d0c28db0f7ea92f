//! Conversion between typed application messages and payload bytes.
//!
//! The framework never looks inside a payload. Applications plug in a
//! [`MessageSerializer`] for their message type; two stock implementations are
//! provided: [`RawSerializer`] for byte payloads and [`MsgPackSerializer`] for
//! any serde type, using named `MsgPack` encoding.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

/// Serialization contract consumed by connections.
pub trait MessageSerializer<M>: Send + Sync {
    /// Encodes a message into payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Encode`] if the message cannot be encoded.
    fn serialize(&self, message: &M) -> Result<Vec<u8>, SerializationError>;

    /// Decodes payload bytes into a message.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] if the bytes are not a valid
    /// encoding of `M`.
    fn deserialize(&self, payload: &[u8]) -> Result<M, SerializationError>;
}

/// Passes `Vec<u8>` payloads through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl MessageSerializer<Vec<u8>> for RawSerializer {
    fn serialize(&self, message: &Vec<u8>) -> Result<Vec<u8>, SerializationError> {
        Ok(message.clone())
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Vec<u8>, SerializationError> {
        Ok(payload.to_vec())
    }
}

/// Encodes any serde message as named `MsgPack` (`rmp_serde::to_vec_named`).
pub struct MsgPackSerializer<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> MsgPackSerializer<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for MsgPackSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for MsgPackSerializer<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for MsgPackSerializer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgPackSerializer").finish()
    }
}

impl<M> MessageSerializer<M> for MsgPackSerializer<M>
where
    M: Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &M) -> Result<Vec<u8>, SerializationError> {
        Ok(rmp_serde::to_vec_named(message)?)
    }

    fn deserialize(&self, payload: &[u8]) -> Result<M, SerializationError> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}
