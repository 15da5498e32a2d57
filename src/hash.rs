// src/hash.rs

//! SHA-256 helpers for content addressing, cache fingerprints and key ids
//!
//! Every digest in the repository is SHA-256, rendered as lowercase hex.
//! [`Digest`] wraps a validated hex value so blob-store keys coming off
//! the wire can't smuggle path separators into the store layout.

use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

/// Length of a SHA-256 digest rendered as hex
pub const SHA256_HEX_LEN: usize = 64;

/// Hash parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Hash string has wrong length
    InvalidLength { expected: usize, got: usize },
    /// Hash string contains invalid hex characters
    InvalidHex(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength { expected, got } => {
                write!(f, "invalid hash length: expected {}, got {}", expected, got)
            }
            Self::InvalidHex(s) => write!(f, "invalid hex in hash: {}", s),
        }
    }
}

impl std::error::Error for HashError {}

/// A validated SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Validate a hex string as a SHA-256 digest
    pub fn new(value: impl Into<String>) -> Result<Self, HashError> {
        let value = value.into();
        if value.len() != SHA256_HEX_LEN {
            return Err(HashError::InvalidLength {
                expected: SHA256_HEX_LEN,
                got: value.len(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(value));
        }
        Ok(Self(value.to_lowercase()))
    }

    /// Digest of a byte slice
    pub fn of(data: &[u8]) -> Self {
        Self(sha256(data))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Incremental hasher that separates fields unambiguously
///
/// Each field is written length-prefixed, so `("ab", "c")` and `("a", "bc")`
/// produce different digests.
pub struct FieldHasher {
    inner: Sha256,
}

impl FieldHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Append one length-prefixed field
    pub fn field(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        let data = data.as_ref();
        self.inner.update((data.len() as u64).to_be_bytes());
        self.inner.update(data);
        self
    }

    /// Append an optional field, distinguishing `None` from an empty value
    pub fn optional(&mut self, data: Option<&[u8]>) -> &mut Self {
        match data {
            Some(bytes) => {
                self.inner.update([1u8]);
                self.field(bytes)
            }
            None => {
                self.inner.update([0u8]);
                self
            }
        }
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for FieldHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the SHA-256 of a byte slice as hex
pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 of a reader's contents, returning (hex digest, byte count)
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sha256_reader_matches_slice() {
        let data = vec![7u8; 20000];
        let (digest, len) = sha256_reader(&data[..]).unwrap();
        assert_eq!(digest, sha256(&data));
        assert_eq!(len, 20000);
    }

    #[test]
    fn test_digest_validation() {
        assert!(Digest::new("abc").is_err());
        assert!(Digest::new("../".repeat(21) + "a").is_err());
        let upper = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        assert_eq!(Digest::new(upper).unwrap(), Digest::of(b"hello world"));
    }

    #[test]
    fn test_field_hasher_separates_fields() {
        let mut a = FieldHasher::new();
        a.field("ab").field("c");
        let mut b = FieldHasher::new();
        b.field("a").field("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_field_hasher_none_differs_from_empty() {
        let mut a = FieldHasher::new();
        a.optional(None);
        let mut b = FieldHasher::new();
        b.optional(Some(b""));
        assert_ne!(a.finish(), b.finish());
    }
}
