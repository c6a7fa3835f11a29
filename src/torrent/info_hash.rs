//! Info hash identity
//!
//! The 160-bit SHA-1 of a torrent's info dictionary names a transfer for its
//! whole life in a session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

/// SHA-1 info hash of a torrent, ordered bytewise
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Wrap a raw 20-byte hash
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Hash a bencoded info dictionary
    pub fn of_info_dict(info_dict_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        Self(hasher.finalize().into())
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl FromStr for InfoHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(s, &mut hash)?;
        Ok(Self(hash))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(hash: [u8; 20]) -> Self {
        Self(hash)
    }
}

// Persisted as hex so resume files stay readable
impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase_hex() {
        let mut raw = [0u8; 20];
        raw[0] = 0xAB;
        raw[19] = 0x01;
        let hash = InfoHash::new(raw);
        assert_eq!(hash.to_string(), format!("ab{}01", "00".repeat(18)));
    }

    #[test]
    fn test_parse_roundtrip() {
        let text = "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
        let hash: InfoHash = text.parse().unwrap();
        assert_eq!(hash.to_hex(), text);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!("dd8255ec".parse::<InfoHash>().is_err());
        assert!("zz8255ecdc7ca55fb0bbf81323d87062db1f6d1c".parse::<InfoHash>().is_err());
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let low = InfoHash::new([0u8; 20]);
        let mut raw = [0u8; 20];
        raw[19] = 1;
        let mid = InfoHash::new(raw);
        let high = InfoHash::new([0xff; 20]);
        assert!(low < mid);
        assert!(mid < high);
    }

    #[test]
    fn test_of_info_dict_is_sha1() {
        // sha1("abc")
        let hash = InfoHash::of_info_dict(b"abc");
        assert_eq!(hash.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = InfoHash::new([0x11; 20]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(20)));
        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
