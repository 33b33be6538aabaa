use std::cmp::Ordering;

use bytes::Bytes;

use crate::types::{GbpError, Result};

/// Describes how keys and values are encoded into tree nodes.
///
/// A layout with both a fixed key size and a fixed value size is stored in
/// fixed-size nodes; any other layout uses dynamic-size nodes. Encoded keys are
/// ordered by [`Layout::compare_encoded`], which defaults to byte order.
pub trait Layout: Clone + Send + Sync + 'static {
    /// Decoded key type.
    type Key: Clone + Send + Sync + 'static;
    /// Decoded value type.
    type Value: Clone + Send + Sync + 'static;

    /// Identifier persisted in the tree state and checked on open.
    fn identifier(&self) -> u64;

    /// Encoded key length when every key has the same size.
    fn fixed_key_size(&self) -> Option<usize>;

    /// Encoded value length when every value has the same size.
    fn fixed_value_size(&self) -> Option<usize>;

    /// Encode `key` into `out` using an order-preserving representation.
    fn encode_key(&self, key: &Self::Key, out: &mut Vec<u8>);

    /// Decode a key from its encoded representation.
    fn decode_key(&self, bytes: &[u8]) -> Result<Self::Key>;

    /// Encode `value` into `out`.
    fn encode_value(&self, value: &Self::Value, out: &mut Vec<u8>);

    /// Decode a value from `bytes`.
    fn decode_value(&self, bytes: &[u8]) -> Result<Self::Value>;

    /// Compare two encoded keys.
    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Type-erased key ordering used by the untyped tree core.
pub(crate) trait KeyOrder: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<L: Layout> KeyOrder for L {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.compare_encoded(a, b)
    }
}

pub(crate) fn encode_key<L: Layout>(layout: &L, key: &L::Key) -> Vec<u8> {
    let mut out = Vec::new();
    layout.encode_key(key, &mut out);
    out
}

pub(crate) fn encode_value<L: Layout>(layout: &L, value: &L::Value) -> Vec<u8> {
    let mut out = Vec::new();
    layout.encode_value(value, &mut out);
    out
}

/// `u64` keys and values, big-endian so byte order matches numeric order.
#[derive(Copy, Clone, Debug, Default)]
pub struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        u64::from_be_bytes(*b"u64:u64\0")
    }

    fn fixed_key_size(&self) -> Option<usize> {
        Some(8)
    }

    fn fixed_value_size(&self) -> Option<usize> {
        Some(8)
    }

    fn encode_key(&self, key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes)
    }

    fn encode_value(&self, value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<u64> {
        decode_u64(bytes)
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| GbpError::Corruption("u64 field is not 8 bytes"))?;
    Ok(u64::from_be_bytes(array))
}

/// Variable-length byte strings for keys and values.
#[derive(Copy, Clone, Debug, Default)]
pub struct BytesLayout;

impl Layout for BytesLayout {
    type Key = Bytes;
    type Value = Bytes;

    fn identifier(&self) -> u64 {
        u64::from_be_bytes(*b"bytes:v1")
    }

    fn fixed_key_size(&self) -> Option<usize> {
        None
    }

    fn fixed_value_size(&self) -> Option<usize> {
        None
    }

    fn encode_key(&self, key: &Bytes, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn encode_value(&self, value: &Bytes, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
