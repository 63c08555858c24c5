//! MD5 digests of encrypted archive headers

use md5::{Digest, Md5};
use std::fmt;

/// MD5 of an encrypted `.bhd` header, stored at the front of its cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderDigest([u8; 16]);

impl HeaderDigest {
    /// Digest length in bytes
    pub const LEN: usize = 16;

    /// Create digest from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Compute the digest of `data`
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Read the digest from the first 16 bytes of `data`, if there are enough
    pub fn from_prefix(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = data.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert to lower-case hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Upper-case hex of the first four bytes, used to name archived caches
    pub fn short_hex_upper(&self) -> String {
        hex::encode_upper(&self.0[..4])
    }
}

impl fmt::Display for HeaderDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
