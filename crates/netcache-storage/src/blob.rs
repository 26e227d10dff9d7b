//! Content-addressable body storage
//!
//! Large bodies live once under `Blobs/<hash>` no matter how many records
//! use them. A record points at its body through a small reference file
//! (`<record>-blob`) holding the digest, and every blob carries an explicit
//! reference count in `Blobs/<hash>.refs`. Count updates for one digest are
//! serialized by a striped lock; different digests never contend on a
//! single global lock.
//!
//! Counts can drift when the process dies between updating a count and a
//! reference file. Synchronize rebuilds them from the reference files found
//! under `Records`, skipping digests that saw changes while it was looking.

use crate::layout::{is_temporary_file_name, write_atomically};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use netcache_common::{DIGEST_LENGTH, Error, Result, Salt, Sha1Digest, compute_sha1};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Suffix of the reference count sidecar
pub const REFS_SUFFIX: &str = ".refs";

const LOCK_STRIPES: usize = 64;

const REFERENCE_FILE_SIZE: usize = DIGEST_LENGTH + 4;

/// A body and its salted hash
#[derive(Clone, Debug)]
pub struct Blob {
    pub data: Bytes,
    pub hash: Sha1Digest,
}

/// Outcome of a blob synchronize pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobSyncStats {
    pub blob_count: u64,
    pub total_size: u64,
    pub deleted: u64,
    /// Reference counts rewritten to match the reference files
    pub repaired: u64,
}

/// Digests with reference changes in flight, and digests changed since a
/// reference scan began
#[derive(Default)]
struct Activity {
    busy: HashMap<Sha1Digest, usize>,
    touched: Option<HashSet<Sha1Digest>>,
}

impl Activity {
    fn enter(&mut self, hash: Sha1Digest) {
        *self.busy.entry(hash).or_insert(0) += 1;
        if let Some(touched) = &mut self.touched {
            touched.insert(hash);
        }
    }

    fn leave(&mut self, hash: Sha1Digest) {
        if let Some(count) = self.busy.get_mut(&hash) {
            *count -= 1;
            if *count == 0 {
                self.busy.remove(&hash);
            }
        }
        if let Some(touched) = &mut self.touched {
            touched.insert(hash);
        }
    }

    fn is_settled(&self, hash: &Sha1Digest) -> bool {
        !self.busy.contains_key(hash) && self.touched.as_ref().is_none_or(|t| !t.contains(hash))
    }
}

struct ActivityGuard<'a> {
    activity: &'a Mutex<Activity>,
    hash: Sha1Digest,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.activity.lock().leave(self.hash);
    }
}

/// Deduplicating store for large bodies
pub struct BlobStorage {
    directory: PathBuf,
    salt: Salt,
    approximate_size: AtomicU64,
    stripes: Vec<Mutex<()>>,
    activity: Mutex<Activity>,
}

fn encode_reference(hash: &Sha1Digest) -> Bytes {
    let mut buf = BytesMut::with_capacity(REFERENCE_FILE_SIZE);
    buf.put_slice(hash.as_bytes());
    buf.put_u32_le(crc32c::crc32c(hash.as_bytes()));
    buf.freeze()
}

fn decode_reference(data: &[u8]) -> Result<Sha1Digest> {
    if data.len() != REFERENCE_FILE_SIZE {
        return Err(Error::Truncated {
            needed: REFERENCE_FILE_SIZE,
            available: data.len(),
        });
    }
    let (digest, mut checksum) = data.split_at(DIGEST_LENGTH);
    let expected = checksum.get_u32_le();
    let actual = crc32c::crc32c(digest);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Sha1Digest::from_slice(digest).ok_or_else(|| Error::internal("digest length"))
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl BlobStorage {
    /// Create a blob store in `directory`
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, salt: Salt) -> Self {
        Self {
            directory: directory.into(),
            salt,
            approximate_size: AtomicU64::new(0),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            activity: Mutex::new(Activity::default()),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Total size of stored blobs as of the last synchronize, adjusted by
    /// adds and removals since
    #[must_use]
    pub fn approximate_size(&self) -> u64 {
        self.approximate_size.load(Ordering::Relaxed)
    }

    fn blob_path(&self, hash: &Sha1Digest) -> PathBuf {
        self.directory.join(hash.to_hex())
    }

    fn refs_path(&self, hash: &Sha1Digest) -> PathBuf {
        self.directory.join(format!("{}{REFS_SUFFIX}", hash.to_hex()))
    }

    fn stripe(&self, hash: &Sha1Digest) -> &Mutex<()> {
        &self.stripes[hash.as_bytes()[0] as usize % LOCK_STRIPES]
    }

    /// Mark `hash` as having a reference change in flight
    fn enter(&self, hash: &Sha1Digest) -> ActivityGuard<'_> {
        self.activity.lock().enter(*hash);
        ActivityGuard {
            activity: &self.activity,
            hash: *hash,
        }
    }

    fn read_count(&self, hash: &Sha1Digest) -> u64 {
        match fs::read(self.refs_path(hash)) {
            Ok(data) if data.len() == 8 => (&data[..]).get_u64_le(),
            Ok(_) => {
                warn!("Malformed reference count for blob {}", hash);
                0
            }
            Err(_) => 0,
        }
    }

    fn write_count(&self, hash: &Sha1Digest, count: u64) -> io::Result<()> {
        write_atomically(&self.refs_path(hash), &count.to_le_bytes())
    }

    fn subtract_size(&self, size: u64) {
        let _ = self
            .approximate_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(size))
            });
    }

    /// Read the digest a reference file points at
    pub fn read_reference(&self, path: &Path) -> Result<Sha1Digest> {
        decode_reference(&fs::read(path)?)
    }

    /// Make the reference file at `path` point at a blob holding `data`,
    /// storing the data if no other record has it yet
    pub fn add(&self, path: &Path, data: &Bytes) -> Result<Blob> {
        let hash = compute_sha1(data, &self.salt);
        let _activity = self.enter(&hash);

        match self.read_reference(path) {
            Ok(existing) if existing == hash => {
                // Already pointing here; make sure the data did not go missing.
                let _guard = self.stripe(&hash).lock();
                let blob_path = self.blob_path(&hash);
                if !blob_path.exists() {
                    write_atomically(&blob_path, data)?;
                    self.approximate_size
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                if self.read_count(&hash) == 0 {
                    self.write_count(&hash, 1)?;
                }
                return Ok(Blob {
                    data: data.clone(),
                    hash,
                });
            }
            Ok(existing) => {
                let _previous = self.enter(&existing);
                self.release(&existing);
            }
            Err(_) => {}
        }

        {
            let _guard = self.stripe(&hash).lock();
            let blob_path = self.blob_path(&hash);
            if !blob_path.exists() {
                write_atomically(&blob_path, data)?;
                self.approximate_size
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            let count = self.read_count(&hash);
            self.write_count(&hash, count + 1)?;
        }

        if let Err(e) = write_atomically(path, &encode_reference(&hash)) {
            self.release(&hash);
            return Err(e.into());
        }

        Ok(Blob {
            data: data.clone(),
            hash,
        })
    }

    /// Load the blob a reference file points at, verifying its contents
    pub fn get(&self, path: &Path) -> Result<Blob> {
        let hash = self.read_reference(path)?;
        let data = Bytes::from(fs::read(self.blob_path(&hash))?);
        let actual = compute_sha1(&data, &self.salt);
        if actual != hash {
            return Err(Error::DigestMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(Blob { data, hash })
    }

    /// Delete a reference file and drop its share of the blob
    pub fn remove(&self, path: &Path) {
        let hash = self.read_reference(path).ok();
        let _activity = hash.as_ref().map(|hash| self.enter(hash));
        if let Err(e) = remove_if_exists(path) {
            warn!("Failed to remove blob reference {}: {}", path.display(), e);
            return;
        }
        if let Some(hash) = hash {
            self.release(&hash);
        }
    }

    /// Drop one reference, deleting the blob with the last one
    fn release(&self, hash: &Sha1Digest) {
        let _guard = self.stripe(hash).lock();
        let count = self.read_count(hash);
        if count > 1 {
            if let Err(e) = self.write_count(hash, count - 1) {
                warn!("Failed to update reference count of blob {}: {}", hash, e);
            }
            return;
        }

        let blob_path = self.blob_path(hash);
        let size = fs::metadata(&blob_path).map(|m| m.len()).unwrap_or(0);
        match remove_if_exists(&blob_path) {
            Ok(true) => self.subtract_size(size),
            Ok(false) => {}
            Err(e) => warn!("Failed to delete blob {}: {}", hash, e),
        }
        let _ = remove_if_exists(&self.refs_path(hash));
    }

    /// Number of records sharing the blob behind a reference file. Zero when
    /// the record has no blob.
    #[must_use]
    pub fn share_count(&self, path: &Path) -> u64 {
        match self.read_reference(path) {
            Ok(hash) => self.read_count(&hash),
            Err(_) => 0,
        }
    }

    /// Start remembering which digests change, ahead of a
    /// [`synchronize_with_references`](Self::synchronize_with_references)
    pub fn begin_reference_scan(&self) {
        self.activity.lock().touched = Some(HashSet::new());
    }

    /// Delete unreferenced blobs, stray sidecars and unknown files, then
    /// recompute the total size
    pub fn synchronize(&self) -> BlobSyncStats {
        self.synchronize_blobs(None)
    }

    /// Like [`synchronize`](Self::synchronize), but first rewrite every
    /// count that disagrees with `references`, the number of reference files
    /// per digest counted since [`begin_reference_scan`](Self::begin_reference_scan).
    /// Blobs nobody references are deleted.
    pub fn synchronize_with_references(
        &self,
        references: &HashMap<Sha1Digest, u64>,
    ) -> BlobSyncStats {
        let stats = self.synchronize_blobs(Some(references));
        self.activity.lock().touched = None;
        stats
    }

    fn synchronize_blobs(&self, references: Option<&HashMap<Sha1Digest, u64>>) -> BlobSyncStats {
        let mut stats = BlobSyncStats::default();
        let Ok(entries) = fs::read_dir(&self.directory) else {
            self.approximate_size.store(0, Ordering::Relaxed);
            return stats;
        };

        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_temporary_file_name(&name) {
                continue;
            }
            let path = entry.path();

            if let Some(hex) = name.strip_suffix(REFS_SUFFIX) {
                match Sha1Digest::from_hex(hex) {
                    Some(hash) => {
                        let _guard = self.stripe(&hash).lock();
                        if !self.blob_path(&hash).exists() {
                            let _ = remove_if_exists(&path);
                        }
                    }
                    None => {
                        let _ = remove_if_exists(&path);
                    }
                }
                continue;
            }

            let Some(hash) = Sha1Digest::from_hex(&name) else {
                debug!("Deleting unknown file in blob directory: {}", name);
                let _ = remove_if_exists(&path);
                stats.deleted += 1;
                continue;
            };

            let _guard = self.stripe(&hash).lock();
            let mut count = self.read_count(&hash);
            let settled = references.is_some() && self.activity.lock().is_settled(&hash);
            if let Some(references) = references.filter(|_| settled) {
                let actual = references.get(&hash).copied().unwrap_or(0);
                if actual != count {
                    debug!(
                        "Blob {} has {} references, count said {}",
                        hash, actual, count
                    );
                    if actual > 0
                        && let Err(e) = self.write_count(&hash, actual)
                    {
                        warn!("Failed to repair reference count of blob {}: {}", hash, e);
                    }
                    stats.repaired += 1;
                    count = actual;
                }
            }
            if count == 0 {
                debug!("Deleting unreferenced blob {}", hash);
                let _ = remove_if_exists(&path);
                let _ = remove_if_exists(&self.refs_path(&hash));
                stats.deleted += 1;
                continue;
            }
            stats.blob_count += 1;
            stats.total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }

        self.approximate_size
            .store(stats.total_size, Ordering::Relaxed);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcache_common::SALT_LENGTH;
    use tempfile::tempdir;

    fn storage(dir: &Path) -> BlobStorage {
        BlobStorage::new(dir.join("Blobs"), Salt::from_bytes([3u8; SALT_LENGTH]))
    }

    fn body(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 10_000])
    }

    #[test]
    fn test_add_and_get() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let reference = dir.path().join("records/aa-blob");

        let blob = blobs.add(&reference, &body(1)).unwrap();
        assert_eq!(blobs.share_count(&reference), 1);
        assert_eq!(blobs.approximate_size(), 10_000);

        let read = blobs.get(&reference).unwrap();
        assert_eq!(read.hash, blob.hash);
        assert_eq!(read.data, body(1));
    }

    #[test]
    fn test_dedup_and_share_counts() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");
        let b = dir.path().join("records/bb-blob");

        let blob_a = blobs.add(&a, &body(1)).unwrap();
        let blob_b = blobs.add(&b, &body(1)).unwrap();
        assert_eq!(blob_a.hash, blob_b.hash);
        assert_eq!(blobs.share_count(&a), 2);
        assert_eq!(blobs.share_count(&b), 2);
        // Stored once
        assert_eq!(blobs.approximate_size(), 10_000);

        blobs.remove(&a);
        assert!(!a.exists());
        assert_eq!(blobs.share_count(&b), 1);
        assert!(blobs.get(&b).is_ok());

        blobs.remove(&b);
        assert_eq!(blobs.approximate_size(), 0);
        assert!(!blobs.blob_path(&blob_a.hash).exists());
        assert!(!blobs.refs_path(&blob_a.hash).exists());
    }

    #[test]
    fn test_re_adding_same_body_keeps_count() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");

        blobs.add(&a, &body(1)).unwrap();
        blobs.add(&a, &body(1)).unwrap();
        assert_eq!(blobs.share_count(&a), 1);
    }

    #[test]
    fn test_replacing_body_releases_old_blob() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");

        let old = blobs.add(&a, &body(1)).unwrap();
        let new = blobs.add(&a, &body(2)).unwrap();
        assert_ne!(old.hash, new.hash);
        assert!(!blobs.blob_path(&old.hash).exists());
        assert_eq!(blobs.get(&a).unwrap().data, body(2));
        assert_eq!(blobs.approximate_size(), 10_000);
    }

    #[test]
    fn test_corrupt_blob_is_absent() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");

        let blob = blobs.add(&a, &body(1)).unwrap();
        fs::write(blobs.blob_path(&blob.hash), b"garbage").unwrap();
        let err = blobs.get(&a).unwrap_err();
        assert!(err.is_corruption());

        fs::write(&a, b"short").unwrap();
        assert!(blobs.get(&a).is_err());
        assert_eq!(blobs.share_count(&a), 0);
    }

    #[test]
    fn test_missing_reference() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let missing = dir.path().join("records/none-blob");

        assert!(blobs.get(&missing).unwrap_err().is_not_found());
        assert_eq!(blobs.share_count(&missing), 0);
        blobs.remove(&missing);
    }

    #[test]
    fn test_synchronize_removes_unreferenced() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");
        let kept = blobs.add(&a, &body(1)).unwrap();

        // Orphan: data without a count, a stray sidecar and a foreign file
        let orphan = compute_sha1(b"orphan", &Salt::from_bytes([3u8; SALT_LENGTH]));
        fs::write(blobs.blob_path(&orphan), b"orphan").unwrap();
        let stray = compute_sha1(b"stray", &Salt::from_bytes([3u8; SALT_LENGTH]));
        fs::write(blobs.refs_path(&stray), 1u64.to_le_bytes()).unwrap();
        fs::write(blobs.directory().join("junk"), b"junk").unwrap();

        let stats = blobs.synchronize();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.total_size, 10_000);
        assert!(blobs.blob_path(&kept.hash).exists());
        assert!(!blobs.blob_path(&orphan).exists());
        assert!(!blobs.refs_path(&stray).exists());
        assert!(!blobs.directory().join("junk").exists());
        assert_eq!(blobs.approximate_size(), 10_000);
    }

    #[test]
    fn test_synchronize_rebuilds_counts_from_references() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");
        let b = dir.path().join("records/bb-blob");
        let c = dir.path().join("records/cc-blob");
        let shared = blobs.add(&a, &body(1)).unwrap();
        blobs.add(&b, &body(1)).unwrap();
        blobs.write_count(&shared.hash, 7).unwrap();

        // Count says one reference, but the reference file is gone
        let lost = blobs.add(&c, &body(2)).unwrap();
        fs::remove_file(&c).unwrap();
        assert_eq!(blobs.approximate_size(), 20_000);

        blobs.begin_reference_scan();
        let references = HashMap::from([(shared.hash, 2)]);
        let stats = blobs.synchronize_with_references(&references);

        assert_eq!(stats.repaired, 2);
        assert_eq!(stats.blob_count, 1);
        assert_eq!(blobs.share_count(&a), 2);
        assert!(!blobs.blob_path(&lost.hash).exists());
        assert!(!blobs.refs_path(&lost.hash).exists());
        assert_eq!(blobs.approximate_size(), 10_000);

        // Counts are exact again: both releases are needed to free the body
        blobs.remove(&a);
        assert!(blobs.blob_path(&shared.hash).exists());
        blobs.remove(&b);
        assert!(!blobs.blob_path(&shared.hash).exists());
    }

    #[test]
    fn test_synchronize_skips_blobs_changed_during_scan() {
        let dir = tempdir().unwrap();
        let blobs = storage(dir.path());
        let a = dir.path().join("records/aa-blob");

        blobs.begin_reference_scan();
        // Added after the records walk would have passed
        let added = blobs.add(&a, &body(1)).unwrap();
        let stats = blobs.synchronize_with_references(&HashMap::new());

        assert_eq!(stats.repaired, 0);
        assert!(blobs.blob_path(&added.hash).exists());
        assert_eq!(blobs.share_count(&a), 1);

        // Without a scan in progress the same digest is settled
        blobs.begin_reference_scan();
        let references = HashMap::from([(added.hash, 1)]);
        let stats = blobs.synchronize_with_references(&references);
        assert_eq!(stats.repaired, 0);
        assert_eq!(stats.blob_count, 1);
    }
}
