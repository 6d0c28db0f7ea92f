//! sockflow core: length-prefixed framing, completion error codes, and the
//! serialization and transform contracts shared by clients and servers.

pub mod error;
pub mod framing;
pub mod serialization;
pub mod transform;
pub mod types;

pub use error::{FrameError, SerializationError, SocketError};
pub use framing::{
    encode_frame, FramePhase, FrameStatus, FramingConfig, MessageFramer, OutgoingFrame, Window,
    LENGTH_PREFIX_LEN,
};
pub use serialization::{MessageSerializer, MsgPackSerializer, RawSerializer};
pub use transform::{IdentityTransform, PayloadTransform, XorTransform};
pub use types::OperationKind;
