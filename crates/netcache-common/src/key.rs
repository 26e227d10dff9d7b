//! Cache entry identity
//!
//! A key names a record by partition, type and identifier. Its salted hash
//! is both the Bloom filter input and the on-disk file name; the partition
//! hash and the type form the two directory levels above it.

use crate::digest::{Salt, SaltedHasher, Sha1Digest, compute_sha1};
use crate::error::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a cache entry
#[derive(Clone)]
pub struct Key {
    partition: String,
    record_type: String,
    identifier: String,
    hash: Sha1Digest,
    partition_hash: Sha1Digest,
}

impl Key {
    /// Length of the hash string used as a record file name
    pub const HASH_STRING_LENGTH: usize = Sha1Digest::HEX_LENGTH;

    /// Create a key, hashing it with the cache salt
    pub fn new(
        partition: impl Into<String>,
        record_type: impl Into<String>,
        identifier: impl Into<String>,
        salt: &Salt,
    ) -> Result<Self> {
        let partition = partition.into();
        let record_type = record_type.into();
        let identifier = identifier.into();

        Self::validate_type(&record_type)?;
        if identifier.is_empty() {
            return Err(Error::invalid_key("empty identifier"));
        }

        let hash = Self::compute_hash(&partition, &record_type, &identifier, salt);
        let partition_hash = compute_sha1(partition.as_bytes(), salt);

        Ok(Self {
            partition,
            record_type,
            identifier,
            hash,
            partition_hash,
        })
    }

    /// Reassemble a key decoded from disk. No hashing happens here; the
    /// caller is expected to compare it against the key it asked for.
    pub fn from_parts(
        partition: String,
        record_type: String,
        identifier: String,
        hash: Sha1Digest,
        partition_hash: Sha1Digest,
    ) -> Result<Self> {
        Self::validate_type(&record_type)?;
        Ok(Self {
            partition,
            record_type,
            identifier,
            hash,
            partition_hash,
        })
    }

    fn compute_hash(
        partition: &str,
        record_type: &str,
        identifier: &str,
        salt: &Salt,
    ) -> Sha1Digest {
        let mut hasher = SaltedHasher::new(salt);
        hasher.update_field(record_type.as_bytes());
        hasher.update_field(partition.as_bytes());
        hasher.update_field(identifier.as_bytes());
        hasher.finalize()
    }

    /// The type is used verbatim as a directory name
    fn validate_type(record_type: &str) -> Result<()> {
        if record_type.is_empty() {
            return Err(Error::invalid_key("empty type"));
        }
        // Also rules out "." and "..". Dotfiles are in-flight temporaries.
        if record_type.starts_with('.') {
            return Err(Error::invalid_key(format!(
                "type may not start with '.': {record_type}"
            )));
        }
        if let Some(c) = record_type
            .chars()
            .find(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
        {
            return Err(Error::invalid_key(format!(
                "type contains invalid character {c:?}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn partition(&self) -> &str {
        &self.partition
    }

    #[must_use]
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn hash(&self) -> &Sha1Digest {
        &self.hash
    }

    #[must_use]
    pub fn partition_hash(&self) -> &Sha1Digest {
        &self.partition_hash
    }

    /// Record file name
    #[must_use]
    pub fn hash_as_string(&self) -> String {
        self.hash.to_hex()
    }

    /// First directory level under `Records`
    #[must_use]
    pub fn partition_hash_as_string(&self) -> String {
        self.partition_hash.to_hex()
    }

    /// Partition directory name for a partition that has no key at hand
    #[must_use]
    pub fn partition_to_partition_hash_as_string(partition: &str, salt: &Salt) -> String {
        compute_sha1(partition.as_bytes(), salt).to_hex()
    }

    /// Parse a record file name back into a hash
    #[must_use]
    pub fn string_to_hash(s: &str) -> Option<Sha1Digest> {
        Sha1Digest::from_hex(s)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.partition == other.partition
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.partition.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("partition", &self.partition)
            .field("type", &self.record_type)
            .field("identifier", &self.identifier)
            .field("hash", &self.hash.to_hex())
            .finish()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.partition, self.record_type, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::SALT_LENGTH;

    fn salt() -> Salt {
        Salt::from_bytes([9u8; SALT_LENGTH])
    }

    #[test]
    fn test_key_equality() {
        let a = Key::new("p", "Resource", "https://example.com/", &salt()).unwrap();
        let b = Key::new("p", "Resource", "https://example.com/", &salt()).unwrap();
        let c = Key::new("q", "Resource", "https://example.com/", &salt()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash_as_string().len(), Key::HASH_STRING_LENGTH);
    }

    #[test]
    fn test_salt_changes_hash() {
        let a = Key::new("", "Resource", "id", &salt()).unwrap();
        let b = Key::new("", "Resource", "id", &Salt::from_bytes([1u8; SALT_LENGTH])).unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(Key::new("p", "Resource", "", &salt()).is_err());
        assert!(Key::new("p", "", "id", &salt()).is_err());
        assert!(Key::new("p", "a/b", "id", &salt()).is_err());
        assert!(Key::new("p", "..", "id", &salt()).is_err());
        assert!(Key::new("p", ".hidden", "id", &salt()).is_err());
    }

    #[test]
    fn test_empty_partition_is_valid() {
        let key = Key::new("", "Resource", "id", &salt()).unwrap();
        assert_eq!(
            key.partition_hash_as_string(),
            Key::partition_to_partition_hash_as_string("", &salt())
        );
    }

    #[test]
    fn test_hash_string_round_trip() {
        let key = Key::new("p", "Resource", "id", &salt()).unwrap();
        assert_eq!(Key::string_to_hash(&key.hash_as_string()), Some(*key.hash()));
        assert_eq!(Key::string_to_hash("not-a-hash"), None);
    }
}
