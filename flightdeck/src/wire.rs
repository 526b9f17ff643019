//! Message encoding for channel frames.
//!
//! Messages cross process boundaries as postcard bytes inside fixed-size
//! ring slots. Each channel also records the structural type hash of its
//! message type so a handle opened with the wrong `T` is refused instead of
//! decoding garbage.

use std::fmt;

use serde::{Deserialize, Serialize};
use type_hash::TypeHash;

/// Default payload capacity of one channel frame, in bytes.
pub const DEFAULT_FRAME_CAPACITY: usize = 1024;

/// Types that can travel through a channel.
///
/// Automatically implemented for all `Serialize + Deserialize + TypeHash`
/// types.
pub trait Message: Serialize + for<'de> Deserialize<'de> + TypeHash + Send + 'static {}
impl<T> Message for T where T: Serialize + for<'de> Deserialize<'de> + TypeHash + Send + 'static {}

/// Identity of a message type: structural hash plus a readable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    hash: u64,
    name: &'static str,
}

impl MessageType {
    /// Returns the identity of `T`.
    #[must_use]
    pub fn of<T: Message>() -> Self {
        Self {
            hash: T::type_hash(),
            name: std::any::type_name::<T>(),
        }
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:016x})", self.name, self.hash)
    }
}

/// Errors from encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Serialization or deserialization failed.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    /// The encoded message does not fit in a frame.
    #[error("encoded message is {len} bytes, frame holds {cap}")]
    TooLarge { len: usize, cap: usize },
}

/// Serializes `msg`, refusing anything larger than `cap` bytes.
pub fn encode<T: Message>(msg: &T, cap: usize) -> Result<Vec<u8>, FrameError> {
    let bytes = postcard::to_allocvec(msg)?;
    if bytes.len() > cap {
        return Err(FrameError::TooLarge {
            len: bytes.len(),
            cap,
        });
    }
    Ok(bytes)
}

/// Deserializes one message from a frame payload.
pub fn decode<T: Message>(bytes: &[u8]) -> Result<T, FrameError> {
    postcard::from_bytes(bytes).map_err(FrameError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, TypeHash, Debug, PartialEq)]
    struct Sample {
        a: u32,
        b: Option<f64>,
    }

    #[derive(Serialize, Deserialize, TypeHash, Debug, PartialEq)]
    struct Other {
        a: u32,
        c: Option<f64>,
    }

    #[test]
    fn test_encode_decode_sample() {
        let msg = Sample {
            a: 0xdead_beef,
            b: Some(1.5),
        };
        let bytes = encode(&msg, 64).unwrap();
        assert_eq!(decode::<Sample>(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = "x".repeat(100);
        let err = encode(&msg, 16).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { cap: 16, .. }));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(decode::<Sample>(&[]), Err(FrameError::Postcard(_))));
    }

    #[test]
    fn test_message_types_distinguish_structure() {
        assert_eq!(MessageType::of::<Sample>(), MessageType::of::<Sample>());
        assert_ne!(MessageType::of::<Sample>().hash(), MessageType::of::<Other>().hash());
        assert_ne!(MessageType::of::<String>().hash(), MessageType::of::<u64>().hash());
        assert!(MessageType::of::<Sample>().name().ends_with("Sample"));
    }
}
