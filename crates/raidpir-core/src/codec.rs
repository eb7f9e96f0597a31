//! Msgpack codec for all structured wire payloads.
//!
//! Encoding is named (maps, not tuples) so records stay self-describing and
//! fields can be optional across versions. Decoding is strict: trailing
//! bytes after a complete value are a protocol error, not padding.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("trailing data: consumed {consumed} of {total} bytes")]
    TrailingData { consumed: usize, total: usize },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut deserializer = rmp_serde::Deserializer::new(std::io::Cursor::new(bytes));
    let value = T::deserialize(&mut deserializer)?;
    let consumed = deserializer.position() as usize;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingData {
            consumed,
            total: bytes.len(),
        });
    }
    Ok(value)
}
