use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub mod bincode;
pub mod json;

pub use self::bincode::BincodeCodec;
pub use self::json::JsonCodec;

/// Codec trait for turning message payloads into bytes and back
///
/// The transport itself never looks inside a payload; every request,
/// response and push goes through the codec the stream was built with.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value into bytes
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a value
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}
