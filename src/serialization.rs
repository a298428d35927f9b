//! Value codecs and the invalidation message envelope.
//!
//! Two independent formats live here:
//!
//! - **Value envelope** for cached payloads, produced by the configured
//!   [`CacheCodec`]. The default [`PostcardCodec`] writes
//!
//!   ```text
//!   [MAGIC: b"CKIT"] [VERSION: u32 LE] [POSTCARD PAYLOAD]
//!   ```
//!
//! - **Message envelope** for [`InvalidationMessage`] on the bus:
//!
//!   ```text
//!   [MAGIC: b"CKIM"] [VERSION: u32 LE] [POSTCARD MESSAGE]
//!   ```
//!
//!   It never goes through the value codec, so swapping or upgrading the value
//!   codec does not change what travels over the bus.

use crate::bus::InvalidationMessage;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic header for cached values.
pub const CACHE_MAGIC: [u8; 4] = *b"CKIT";

/// Schema version of the value envelope. Bump when the payload layout changes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Magic header for invalidation messages.
pub const MESSAGE_MAGIC: [u8; 4] = *b"CKIM";

/// Version of the invalidation message layout.
pub const MESSAGE_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Encode/decode pair for cached values.
///
/// A codec instance is handed to each coordinator explicitly; there is no
/// process-wide resolver.
pub trait CacheCodec: Send + Sync + 'static {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`CacheCodec::encode`].
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Compact binary codec: postcard inside a versioned envelope.
#[derive(Clone, Copy, Debug, Default)]
pub struct PostcardCodec;

impl CacheCodec for PostcardCodec {
    fn name(&self) -> &'static str {
        "postcard"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serialize_for_cache(value)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        deserialize_from_cache(bytes)
    }
}

/// Plain JSON codec, useful when other tooling inspects the shared tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

/// Serialize a value into the versioned `CKIT` envelope.
pub fn serialize_for_cache<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(value).map_err(|e| Error::SerializationError(e.to_string()))?;
    Ok(wrap(CACHE_MAGIC, CURRENT_SCHEMA_VERSION, payload))
}

/// Deserialize a value from the versioned `CKIT` envelope.
///
/// # Errors
///
/// - `Error::InvalidCacheEntry`: bad magic or truncated header
/// - `Error::VersionMismatch`: envelope written by another schema version
/// - `Error::DeserializationError`: corrupted payload or type mismatch
pub fn deserialize_from_cache<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let payload = unwrap(bytes, CACHE_MAGIC, CURRENT_SCHEMA_VERSION)?;
    postcard::from_bytes(payload).map_err(|e| Error::DeserializationError(e.to_string()))
}

/// Encode an invalidation message for the bus.
pub fn encode_message(message: &InvalidationMessage) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(message).map_err(|e| Error::SerializationError(e.to_string()))?;
    Ok(wrap(MESSAGE_MAGIC, MESSAGE_VERSION, payload))
}

/// Decode an invalidation message received from the bus.
pub fn decode_message(bytes: &[u8]) -> Result<InvalidationMessage> {
    let payload = unwrap(bytes, MESSAGE_MAGIC, MESSAGE_VERSION)?;
    postcard::from_bytes(payload).map_err(|e| Error::DeserializationError(e.to_string()))
}

fn wrap(magic: [u8; 4], version: u32, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn unwrap(bytes: &[u8], magic: [u8; 4], expected: u32) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidCacheEntry(format!(
            "entry too short: {} bytes",
            bytes.len()
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..4] != magic {
        return Err(Error::InvalidCacheEntry(format!(
            "bad magic {:?}, expected {:?}",
            &header[..4],
            magic
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[4..]);
    let found = u32::from_le_bytes(version);
    if found != expected {
        return Err(Error::VersionMismatch { expected, found });
    }

    Ok(payload)
}
