//! netcache Common - Shared types and utilities
//!
//! This crate provides the key, digest and salt types, the error
//! definitions and the configuration structures used by the netcache
//! storage engine and its tooling.

pub mod config;
pub mod digest;
pub mod error;
pub mod key;

pub use config::{StorageConfig, StorageMode};
pub use digest::{DIGEST_LENGTH, SALT_LENGTH, Salt, SaltedHasher, Sha1Digest, compute_sha1};
pub use error::{Error, Result};
pub use key::Key;
