use crate::error::CacheError;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A CASC encoding key: up to 16 bytes plus the number of bytes that are significant.
///
/// Equality and hashing only look at the significant bytes, so a key read from an index
/// file (usually 9 bytes) matches the first 9 bytes of a full key once the full key is
/// [`truncated`](EncodingKey::truncated).
#[derive(Clone, Copy)]
pub struct EncodingKey {
    bytes: [u8; EncodingKey::MAX_LENGTH],
    length: u8,
}

impl EncodingKey {
    pub const MAX_LENGTH: usize = 16;

    /// Creates a key from the first (at most 16) bytes of `bytes`.
    pub fn new(bytes: &[u8]) -> Self {
        let length = bytes.len().min(Self::MAX_LENGTH);
        let mut key = [0u8; Self::MAX_LENGTH];
        key[..length].copy_from_slice(&bytes[..length]);
        Self {
            bytes: key,
            length: length as u8,
        }
    }

    pub fn from_hex(text: &str) -> Result<Self, CacheError> {
        Ok(Self::new(&hex::decode(text.trim())?))
    }

    /// The same key restricted to its first `length` bytes.
    pub fn truncated(&self, length: usize) -> Self {
        Self::new(&self.as_bytes()[..length.min(self.len())])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl PartialEq for EncodingKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for EncodingKey {}

impl Hash for EncodingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Display for EncodingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for EncodingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodingKey({self})")
    }
}
