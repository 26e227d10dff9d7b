//! Configuration types for netcache
//!
//! All fields carry defaults so a partial TOML table deserializes cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling mode of a storage instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Delayed write dispatch, read timeouts and probabilistic shrinking
    #[default]
    Normal,
    /// Deterministic behavior for tests: writes dispatch immediately,
    /// reads never time out and the cache is never shrunk
    AvoidRandomness,
}

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Capacity in bytes. Zero disables both storing and retrieving.
    pub capacity: u64,
    /// Scheduling mode
    pub mode: StorageMode,
    /// Delay before the first write of a burst is dispatched
    pub initial_write_delay_ms: u64,
    /// Deadline after which outstanding reads are canceled
    pub read_timeout_ms: u64,
    /// Maximum number of reads touching the disk at once
    pub max_active_reads: usize,
    /// Maximum number of concurrent record reads during traversal
    pub traverse_parallelism: usize,
    /// Bodies larger than this are stored as shared blobs
    pub inline_body_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: 256 * 1024 * 1024, // 256 MB
            mode: StorageMode::Normal,
            initial_write_delay_ms: 1000,
            read_timeout_ms: 1500,
            max_active_reads: 5,
            traverse_parallelism: 5,
            inline_body_threshold: 4096, // one VM page
        }
    }
}

impl StorageConfig {
    /// Config with the given mode and capacity, defaults elsewhere
    #[must_use]
    pub fn new(mode: StorageMode, capacity: u64) -> Self {
        Self {
            capacity,
            mode,
            ..Default::default()
        }
    }

    /// Delay applied before dispatching a burst of writes
    #[must_use]
    pub fn initial_write_delay(&self) -> Duration {
        match self.mode {
            StorageMode::Normal => Duration::from_millis(self.initial_write_delay_ms),
            StorageMode::AvoidRandomness => Duration::ZERO,
        }
    }

    /// Read deadline, if reads can time out in this mode
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.mode {
            StorageMode::Normal => Some(Duration::from_millis(self.read_timeout_ms)),
            StorageMode::AvoidRandomness => None,
        }
    }

    /// Check the values make sense
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_active_reads == 0 {
            return Err(crate::Error::Configuration(
                "max_active_reads must be at least 1".into(),
            ));
        }
        if self.traverse_parallelism == 0 {
            return Err(crate::Error::Configuration(
                "traverse_parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
