//! Content addressing: SHA-256 fingerprints of complete byte sequences.

use std::fmt;
use std::str::FromStr;

use ring::digest::{Context, SHA256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const FINGERPRINT_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Invalid fingerprint hex: {0}")]
    InvalidHex(String),
    #[error("Fingerprint must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Canonical identity of a byte sequence. Byte-identical content always maps
/// to the same fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Fingerprint a complete in-memory buffer. The empty buffer has a
    /// well-defined fingerprint like any other input.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Fingerprinter::new();
        hasher.update(bytes);
        hasher.finish().0
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, FingerprintError> {
        let raw = hex::decode(s).map_err(|_| FingerprintError::InvalidHex(s.to_string()))?;
        let bytes: [u8; FINGERPRINT_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| FingerprintError::InvalidLength(raw.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for streamed uploads. Tracks the byte count alongside
/// the digest so the committed size always matches the hashed content.
#[derive(Clone)]
pub struct Fingerprinter {
    ctx: Context,
    len: u64,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(&SHA256),
            len: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.ctx.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> (Fingerprint, u64) {
        let digest = self.ctx.finish();
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(digest.as_ref());
        (Fingerprint(bytes), self.len)
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            Fingerprint::of(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            Fingerprint::of(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_whole() {
        let mut hasher = Fingerprinter::new();
        hasher.update(b"hello ");
        hasher.update(b"");
        hasher.update(b"world");
        let (fp, len) = hasher.finish();

        assert_eq!(fp, Fingerprint::of(b"hello world"));
        assert_eq!(len, 11);
    }

    #[test]
    fn test_distinct_content_distinct_fingerprint() {
        assert_ne!(Fingerprint::of(b"abc"), Fingerprint::of(b"abd"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "zz".parse::<Fingerprint>(),
            Err(FingerprintError::InvalidHex(_))
        ));
        assert_eq!(
            "abcd".parse::<Fingerprint>(),
            Err(FingerprintError::InvalidLength(2))
        );

        let fp = Fingerprint::of(b"abc");
        assert_eq!(fp.to_hex().parse::<Fingerprint>().unwrap(), fp);
    }
}
