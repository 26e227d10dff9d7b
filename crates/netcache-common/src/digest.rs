//! Salted SHA-1 digests
//!
//! Every hash the cache writes to disk (key hashes, partition hashes,
//! header and body hashes, blob names) is a SHA-1 over a per-cache salt
//! followed by the data. The salt keeps offline dictionary attacks from
//! telling which URLs a cache contains.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a SHA-1 digest in bytes
pub const DIGEST_LENGTH: usize = 20;

/// Length of the cache salt in bytes
pub const SALT_LENGTH: usize = 16;

/// A 160-bit SHA-1 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, From, Into)]
#[derive(Serialize, Deserialize)]
pub struct Sha1Digest([u8; DIGEST_LENGTH]);

impl Sha1Digest {
    /// Length of the hex representation
    pub const HEX_LENGTH: usize = DIGEST_LENGTH * 2;

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Lowercase hex form, used for file names
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form produced by [`Sha1Digest::to_hex`]
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != Self::HEX_LENGTH {
            return None;
        }
        let mut bytes = [0u8; DIGEST_LENGTH];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Parse from a byte slice of exactly [`DIGEST_LENGTH`] bytes
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; DIGEST_LENGTH] = data.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Random per-cache salt, generated once and persisted next to the records
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Generate a new random salt
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create from existing bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    // Never print the salt itself.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(..)")
    }
}

/// Streaming salted SHA-1
pub struct SaltedHasher {
    inner: Sha1,
}

impl SaltedHasher {
    /// Create a hasher primed with the salt
    #[must_use]
    pub fn new(salt: &Salt) -> Self {
        let mut inner = Sha1::new();
        inner.update(salt.as_bytes());
        Self { inner }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Update with a length-prefixed field so adjacent fields cannot alias
    pub fn update_field(&mut self, data: &[u8]) {
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
    }

    /// Finalize and return the digest
    #[must_use]
    pub fn finalize(self) -> Sha1Digest {
        Sha1Digest(self.inner.finalize().into())
    }
}

/// Salted SHA-1 of a single buffer
#[must_use]
pub fn compute_sha1(data: &[u8], salt: &Salt) -> Sha1Digest {
    let mut hasher = SaltedHasher::new(salt);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_changes_digest() {
        let data = b"hello, world!";
        let a = compute_sha1(data, &Salt::from_bytes([1u8; SALT_LENGTH]));
        let b = compute_sha1(data, &Salt::from_bytes([2u8; SALT_LENGTH]));
        assert_ne!(a, b);
        assert_eq!(a, compute_sha1(data, &Salt::from_bytes([1u8; SALT_LENGTH])));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let salt = Salt::from_bytes([7u8; SALT_LENGTH]);
        let expected = compute_sha1(b"hello, world!", &salt);

        let mut hasher = SaltedHasher::new(&salt);
        hasher.update(b"hello, ");
        hasher.update(b"world!");
        assert_eq!(hasher.finalize(), expected);
    }

    #[test]
    fn test_fields_do_not_alias() {
        let salt = Salt::from_bytes([0u8; SALT_LENGTH]);

        let mut a = SaltedHasher::new(&salt);
        a.update_field(b"ab");
        a.update_field(b"c");

        let mut b = SaltedHasher::new(&salt);
        b.update_field(b"a");
        b.update_field(b"bc");

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_hex_parse() {
        let digest = compute_sha1(b"x", &Salt::from_bytes([3u8; SALT_LENGTH]));
        let hex = digest.to_hex();
        assert_eq!(hex.len(), Sha1Digest::HEX_LENGTH);
        assert_eq!(Sha1Digest::from_hex(&hex), Some(digest));

        assert_eq!(Sha1Digest::from_hex("abc"), None);
        assert_eq!(Sha1Digest::from_hex(&"zz".repeat(DIGEST_LENGTH)), None);
    }

    #[test]
    fn test_salt_debug_is_redacted() {
        let salt = Salt::random();
        assert_eq!(format!("{salt:?}"), "Salt(..)");
    }
}
