//! Host value serialization seam
//!
//! The cache treats values as opaque in-process objects. Before a value can
//! enter the filesystem tier it has to be turned into bytes, and that
//! conversion belongs to the host: a [`ValueCodec`] implementation is passed
//! in at cache creation. [`JsonCodec`] is a ready-made implementation for
//! serde-enabled value types.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Serializes cache values to the byte arrays stored in the filesystem tier
/// and back.
pub trait ValueCodec<V>: Send + Sync + 'static {
    /// Serialized representation of `value`.
    ///
    /// Returns [`Error::NotSerializable`] when the codec refuses the value;
    /// such values never reach the filesystem tier.
    fn encode(&self, value: &V) -> Result<Vec<u8>>;

    /// Decodes a value previously produced by [`encode`](Self::encode).
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// [`ValueCodec`] backed by `serde_json`, usable with any serde-enabled
/// value type.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<V> ValueCodec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::NotSerializable(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corrupt(e.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
