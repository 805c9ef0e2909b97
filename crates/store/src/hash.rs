//! Fixed-width block identifier.
//!
//! Block hashes are opaque 256-bit values. The store never interprets them
//! beyond equality and ordering; the zero value is reserved to mean
//! "no hash" (e.g. an uninitialised current tip).

use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

use crate::{
    StorageError,
    StorageResult,
};

/// Number of bytes in a block hash.
pub const HASH_LEN: usize = 32;

/// A 256-bit block hash.
///
/// Total order is byte-wise lexicographic. Hex encoding is always lowercase
/// and exactly 64 characters; parsing rejects anything else.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHash(#[serde(with = "hex_bytes")] pub [u8; HASH_LEN]);

impl BlockHash {
    /// The reserved "no hash" value.
    pub const NULL: BlockHash = BlockHash([0u8; HASH_LEN]);

    /// Parse from a lowercase hex string.
    pub fn from_hex(s: &str) -> StorageResult<Self> {
        if s.len() != 2 * HASH_LEN {
            return Err(StorageError::InvalidHash(s.to_string()));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(StorageError::InvalidHash(s.to_string()));
        }
        let mut buf = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut buf)
            .map_err(|_| StorageError::InvalidHash(s.to_string()))?;
        Ok(Self(buf))
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the reserved zero value.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Build from a raw slice; fails unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> StorageResult<Self> {
        let buf: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| StorageError::InvalidHash(hex::encode(bytes)))?;
        Ok(Self(buf))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for BlockHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

mod hex_bytes {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let mut buf = [0u8; 32];
        if s.len() != 64 {
            return Err(serde::de::Error::custom("block hash must be 64 hex chars"));
        }
        hex::decode_to_slice(&s, &mut buf).map_err(serde::de::Error::custom)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockHash {
        let mut b = [0u8; HASH_LEN];
        b[0] = 0xab;
        b[31] = 0x01;
        BlockHash(b)
    }

    #[test]
    fn hex_round_trip() {
        let h = sample();
        let encoded = h.to_hex();
        assert_eq!(encoded.len(), 64);
        assert_eq!(BlockHash::from_hex(&encoded).unwrap(), h);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(BlockHash::from_hex("ab").is_err());
        assert!(BlockHash::from_hex(&"0".repeat(63)).is_err());
        assert!(BlockHash::from_hex(&"0".repeat(65)).is_err());
    }

    #[test]
    fn rejects_non_hex_and_uppercase() {
        assert!(BlockHash::from_hex(&"zz".repeat(32)).is_err());
        let upper = sample().to_hex().to_uppercase();
        assert!(BlockHash::from_hex(&upper).is_err());
    }

    #[test]
    fn null_value() {
        assert!(BlockHash::NULL.is_null());
        assert!(BlockHash::default().is_null());
        assert!(!sample().is_null());
        assert_eq!(BlockHash::NULL.to_hex(), "0".repeat(64));
    }

    #[test]
    fn ordering_is_bytewise() {
        let mut lo = [0u8; HASH_LEN];
        let mut hi = [0u8; HASH_LEN];
        lo[0] = 1;
        hi[0] = 2;
        assert!(BlockHash(lo) < BlockHash(hi));

        // A difference in a later byte does not override an earlier one.
        let mut lo2 = lo;
        lo2[31] = 0xff;
        assert!(BlockHash(lo2) < BlockHash(hi));
    }

    #[test]
    fn from_slice_checks_length() {
        let h = sample();
        assert_eq!(BlockHash::from_slice(h.as_ref()).unwrap(), h);
        assert!(BlockHash::from_slice(&[0u8; 31]).is_err());
        assert!(BlockHash::from_slice(&[0u8; 33]).is_err());
    }
}
