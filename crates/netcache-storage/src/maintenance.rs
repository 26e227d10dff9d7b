//! Background sweeps over the records directory
//!
//! These run on the blocking pool and report back to the controller, which
//! owns the filters and the size counter.

use crate::blob::{BlobStorage, BlobSyncStats};
use crate::filter::ContentsFilter;
use crate::layout::{
    CacheLayout, FileTimes, blob_path_for_record_path, delete_empty_records_directories,
    file_times, traverse_records_files, volume_block_size,
};
use netcache_common::{Key, Sha1Digest};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Upper bound on the chance of evicting any single record per sweep
const MAXIMUM_DELETION_PROBABILITY: f64 = 0.33;

/// Sharing beyond this many records stops protecting a body further
const MAXIMUM_EFFECTIVE_SHARE_COUNT: u64 = 5;

/// Minimum age of a blob reference without a record before synchronize
/// deletes it
const ORPHAN_REFERENCE_GRACE: Duration = Duration::from_secs(60);

/// How valuable a record is, in `[0, 1]`. Old records that were read
/// recently are worth the most.
#[must_use]
pub fn compute_record_worth(times: &FileTimes, now: SystemTime) -> f64 {
    // Modification time is bumped on reads, so it doubles as access time.
    let age = signed_seconds(times.creation, now);
    let access_age = signed_seconds(times.creation, times.modification);
    if age <= 0.0 || access_age < 0.0 || access_age > age {
        return 0.0;
    }
    access_age / age
}

fn signed_seconds(from: SystemTime, to: SystemTime) -> f64 {
    match to.duration_since(from) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Chance that a shrink sweep deletes a record
#[must_use]
pub fn deletion_probability(times: &FileTimes, body_share_count: u64, now: SystemTime) -> f64 {
    let worth = compute_record_worth(times, now);
    // The most valuable entries never get deleted.
    let effective_worth = (1.1 * worth).min(1.0);
    let probability = (1.0 - effective_worth) * MAXIMUM_DELETION_PROBABILITY;
    if body_share_count == 0 {
        return probability;
    }
    probability / body_share_count.min(MAXIMUM_EFFECTIVE_SHARE_COUNT) as f64
}

/// Rough size of the record files, avoiding a stat per file. Most of the
/// space goes to blobs when they are in use.
#[must_use]
pub fn estimate_records_size(
    record_count: u64,
    blob_count: u64,
    volume_block_size: u64,
    inline_body_threshold: usize,
) -> u64 {
    let inline_body_count = record_count - blob_count.min(record_count);
    let header_sizes = record_count * volume_block_size;
    let inline_body_sizes = (inline_body_threshold as u64 / 2) * inline_body_count;
    header_sizes + inline_body_sizes
}

/// Delete the record file and the blob reference of one key
pub fn delete_record_files(record_path: &Path, blob_storage: &BlobStorage) {
    if let Err(e) = fs::remove_file(record_path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to delete record {}: {}", record_path.display(), e);
    }
    blob_storage.remove(&blob_path_for_record_path(record_path));
}

/// Freshly rebuilt state
#[derive(Debug)]
pub struct SynchronizeOutcome {
    pub record_filter: ContentsFilter,
    pub blob_filter: ContentsFilter,
    pub records_size: u64,
    pub record_count: u64,
    pub blob_count: u64,
    /// Files under `Records` whose name is not a key hash
    pub deleted: u64,
    pub blobs: BlobSyncStats,
}

/// Rebuild the filters, the size estimate and the blob reference counts
/// from what is on disk
pub fn synchronize_records(
    layout: &CacheLayout,
    blob_storage: &BlobStorage,
    inline_body_threshold: usize,
) -> SynchronizeOutcome {
    let mut record_filter = ContentsFilter::new();
    let mut record_paths = HashSet::new();
    let mut blob_entries = Vec::new();
    let mut record_count = 0u64;
    let mut deleted = 0u64;

    let started = SystemTime::now();
    blob_storage.begin_reference_scan();

    traverse_records_files(layout.records_path(), None, None, |entry| {
        let (hash_string, is_blob) = entry.hash_part();
        let Some(hash) = Key::string_to_hash(hash_string) else {
            debug!("Deleting unknown file {}", entry.path.display());
            let _ = fs::remove_file(&entry.path);
            deleted += 1;
            return;
        };
        if is_blob {
            blob_entries.push((entry.path.with_file_name(hash_string), hash, entry.path));
        } else {
            record_count += 1;
            record_filter.add(&hash);
            record_paths.insert(entry.path);
        }
    });

    let mut blob_filter = ContentsFilter::new();
    let mut references: HashMap<Sha1Digest, u64> = HashMap::new();
    let mut blob_count = 0u64;
    for (record_path, hash, path) in blob_entries {
        if !record_paths.contains(&record_path) && is_settled_orphan(&path, started) {
            debug!("Deleting blob reference without a record {}", path.display());
            let _ = fs::remove_file(&path);
            deleted += 1;
            continue;
        }
        match blob_storage.read_reference(&path) {
            Ok(digest) => *references.entry(digest).or_insert(0) += 1,
            Err(e) if e.is_corruption() => {
                debug!("Deleting unreadable blob reference {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                deleted += 1;
                continue;
            }
            Err(_) => continue,
        }
        blob_count += 1;
        blob_filter.add(&hash);
    }

    let records_size = estimate_records_size(
        record_count,
        blob_count,
        volume_block_size(layout.base_path()),
        inline_body_threshold,
    );

    let blobs = blob_storage.synchronize_with_references(&references);
    delete_empty_records_directories(layout.records_path());

    SynchronizeOutcome {
        record_filter,
        blob_filter,
        records_size,
        record_count,
        blob_count,
        deleted,
        blobs,
    }
}

/// A reference file with no record next to it. Young ones may belong to a
/// write that has not put its record down yet.
fn is_settled_orphan(path: &Path, scan_started: SystemTime) -> bool {
    file_times(path).is_ok_and(|times| {
        scan_started
            .duration_since(times.modification)
            .is_ok_and(|age| age >= ORPHAN_REFERENCE_GRACE)
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShrinkOutcome {
    pub examined: u64,
    pub deleted: u64,
}

/// Walk every record and delete it with its deletion probability.
/// `should_delete` is handed the probability and makes the call.
pub fn shrink_records(
    layout: &CacheLayout,
    blob_storage: &BlobStorage,
    now: SystemTime,
    mut should_delete: impl FnMut(f64) -> bool,
) -> ShrinkOutcome {
    let mut outcome = ShrinkOutcome::default();

    traverse_records_files(layout.records_path(), None, None, |entry| {
        if entry.hash_part().1 {
            return;
        }
        outcome.examined += 1;

        let Ok(times) = file_times(&entry.path) else {
            return;
        };
        let share_count = blob_storage.share_count(&blob_path_for_record_path(&entry.path));
        let probability = deletion_probability(&times, share_count, now);
        if should_delete(probability) {
            delete_record_files(&entry.path, blob_storage);
            outcome.deleted += 1;
        }
    });

    outcome
}

/// Delete records of `record_type` (or all types) modified at or after
/// `modified_since` (or at any time). Returns the number of files removed.
pub fn clear_records(
    layout: &CacheLayout,
    blob_storage: &BlobStorage,
    record_type: Option<&str>,
    modified_since: Option<SystemTime>,
) -> u64 {
    let mut deleted = 0u64;

    traverse_records_files(layout.records_path(), None, record_type, |entry| {
        if entry.hash_part().1 {
            // Otherwise removed along with their record, or by synchronize
            // once orphaned.
            if modified_since.is_none() && entry.path.exists() {
                blob_storage.remove(&entry.path);
                deleted += 1;
            }
            return;
        }
        if let Some(since) = modified_since {
            match file_times(&entry.path) {
                Ok(times) if times.modification < since => return,
                Ok(_) => {}
                Err(_) => return,
            }
        }
        if let Err(e) = fs::remove_file(&entry.path) {
            warn!("Failed to delete record {}: {}", entry.path.display(), e);
            return;
        }
        deleted += 1;
        let blob_path = blob_path_for_record_path(&entry.path);
        if blob_path.exists() {
            blob_storage.remove(&blob_path);
            deleted += 1;
        }
    });

    delete_empty_records_directories(layout.records_path());
    // Drops blobs whose last reference just went away.
    blob_storage.synchronize();
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::write_atomically;
    use crate::record::{Record, encode_record};
    use bytes::Bytes;
    use netcache_common::{SALT_LENGTH, Salt};
    use std::fs::File;
    use tempfile::tempdir;

    fn salt() -> Salt {
        Salt::from_bytes([4u8; SALT_LENGTH])
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: CacheLayout,
        blobs: BlobStorage,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        let blobs = BlobStorage::new(layout.blobs_path(), salt());
        Fixture {
            _dir: dir,
            layout,
            blobs,
        }
    }

    fn write(f: &Fixture, record_type: &str, id: &str, body: Vec<u8>) -> Key {
        let key = Key::new("", record_type, id, &salt()).unwrap();
        let record = Record::new(
            key.clone(),
            SystemTime::now(),
            Bytes::new(),
            Bytes::from(body),
            &salt(),
        );
        let path = f.layout.record_path_for_key(&key);
        let is_blob = record.body.len() > 4096;
        if is_blob {
            f.blobs
                .add(&blob_path_for_record_path(&path), &record.body)
                .unwrap();
        }
        write_atomically(&path, &encode_record(&record, is_blob, &salt())).unwrap();
        key
    }

    fn times(creation: u64, modification: u64) -> FileTimes {
        FileTimes {
            creation: SystemTime::UNIX_EPOCH + Duration::from_secs(creation),
            modification: SystemTime::UNIX_EPOCH + Duration::from_secs(modification),
        }
    }

    #[test]
    fn test_record_worth() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(200);
        assert_eq!(compute_record_worth(&times(100, 100), now), 0.0);
        assert!((compute_record_worth(&times(100, 150), now) - 0.5).abs() < 1e-9);
        assert!((compute_record_worth(&times(100, 200), now) - 1.0).abs() < 1e-9);
        // Nonsensical times
        assert_eq!(compute_record_worth(&times(100, 50), now), 0.0);
        assert_eq!(compute_record_worth(&times(100, 300), now), 0.0);
        assert_eq!(compute_record_worth(&times(300, 300), now), 0.0);
    }

    #[test]
    fn test_deletion_probability() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(200);
        let never_read = times(100, 100);
        assert!((deletion_probability(&never_read, 0, now) - 0.33).abs() < 1e-9);
        assert!((deletion_probability(&never_read, 1, now) - 0.33).abs() < 1e-9);
        assert!((deletion_probability(&never_read, 3, now) - 0.11).abs() < 1e-9);
        assert!((deletion_probability(&never_read, 50, now) - 0.066).abs() < 1e-9);
        // Recently read records are kept
        assert_eq!(deletion_probability(&times(100, 200), 0, now), 0.0);
    }

    #[test]
    fn test_estimate_records_size() {
        assert_eq!(estimate_records_size(0, 0, 4096, 4096), 0);
        assert_eq!(estimate_records_size(10, 0, 4096, 4096), 10 * 4096 + 10 * 2048);
        assert_eq!(estimate_records_size(10, 4, 4096, 4096), 10 * 4096 + 6 * 2048);
        // Stray blob references never make the count negative
        assert_eq!(estimate_records_size(1, 5, 512, 4096), 512);
    }

    #[test]
    fn test_synchronize_records() {
        let f = fixture();
        let small = write(&f, "Resource", "small", vec![1; 10]);
        let large = write(&f, "Resource", "large", vec![2; 10_000]);

        let junk = f.layout.records_path().join("p/Resource/not-a-hash");
        fs::create_dir_all(junk.parent().unwrap()).unwrap();
        fs::write(&junk, b"junk").unwrap();

        let outcome = synchronize_records(&f.layout, &f.blobs, 4096);
        assert_eq!(outcome.record_count, 2);
        assert_eq!(outcome.blob_count, 1);
        assert_eq!(outcome.deleted, 1);
        assert!(!junk.exists());
        assert!(!f.layout.records_path().join("p").exists());

        assert!(outcome.record_filter.may_contain(small.hash()));
        assert!(outcome.record_filter.may_contain(large.hash()));
        assert!(outcome.blob_filter.may_contain(large.hash()));
        assert!(!outcome.blob_filter.may_contain(small.hash()));
        assert_eq!(outcome.blobs.total_size, 10_000);
        assert!(outcome.records_size > 0);
    }

    #[test]
    fn test_shrink_deletes_by_decision() {
        let f = fixture();
        let a = write(&f, "Resource", "a", vec![1; 10]);
        let b = write(&f, "Resource", "b", vec![2; 10_000]);

        let kept = shrink_records(&f.layout, &f.blobs, SystemTime::now(), |_| false);
        assert_eq!(kept, ShrinkOutcome { examined: 2, deleted: 0 });

        let all = shrink_records(&f.layout, &f.blobs, SystemTime::now(), |p| {
            assert!((0.0..=MAXIMUM_DELETION_PROBABILITY).contains(&p));
            true
        });
        assert_eq!(all, ShrinkOutcome { examined: 2, deleted: 2 });
        assert!(!f.layout.record_path_for_key(&a).exists());
        assert!(!f.layout.blob_path_for_key(&b).exists());
        assert_eq!(f.blobs.approximate_size(), 0);
    }

    #[test]
    fn test_clear_by_type() {
        let f = fixture();
        let resource = write(&f, "Resource", "a", vec![1; 10_000]);
        let other = write(&f, "Other", "b", vec![2; 10]);

        let deleted = clear_records(&f.layout, &f.blobs, Some("Resource"), None);
        assert_eq!(deleted, 2);
        assert!(!f.layout.record_path_for_key(&resource).exists());
        assert!(!f.layout.blob_path_for_key(&resource).exists());
        assert!(f.layout.record_path_for_key(&other).exists());
        assert_eq!(f.blobs.approximate_size(), 0);
    }

    #[test]
    fn test_clear_modified_since() {
        let f = fixture();
        let key = write(&f, "Resource", "a", vec![1; 10]);

        let future = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(clear_records(&f.layout, &f.blobs, None, Some(future)), 0);
        assert!(f.layout.record_path_for_key(&key).exists());

        let past = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(clear_records(&f.layout, &f.blobs, None, Some(past)), 1);
        assert!(!f.layout.record_path_for_key(&key).exists());
    }

    #[test]
    fn test_clear_modified_since_takes_blob_reference_along() {
        let f = fixture();
        let key = write(&f, "Resource", "a", vec![1; 10_000]);

        let past = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(clear_records(&f.layout, &f.blobs, None, Some(past)), 2);
        assert!(!f.layout.record_path_for_key(&key).exists());
        assert!(!f.layout.blob_path_for_key(&key).exists());
        assert_eq!(f.blobs.approximate_size(), 0);
        assert_eq!(fs::read_dir(f.layout.blobs_path()).unwrap().count(), 0);
    }

    fn backdate(path: &Path, by: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_synchronize_frees_blob_of_lost_reference() {
        let f = fixture();
        let key = write(&f, "Resource", "a", vec![3; 20_000]);
        fs::remove_file(f.layout.blob_path_for_key(&key)).unwrap();
        fs::remove_file(f.layout.record_path_for_key(&key)).unwrap();
        assert_eq!(f.blobs.approximate_size(), 20_000);

        let outcome = synchronize_records(&f.layout, &f.blobs, 4096);
        assert_eq!(outcome.record_count, 0);
        assert_eq!(outcome.blob_count, 0);
        assert_eq!(outcome.blobs.repaired, 1);
        assert_eq!(outcome.blobs.blob_count, 0);
        assert_eq!(f.blobs.approximate_size(), 0);
        assert_eq!(fs::read_dir(f.layout.blobs_path()).unwrap().count(), 0);
    }

    #[test]
    fn test_synchronize_deletes_old_orphan_blob_reference() {
        let f = fixture();
        let key = write(&f, "Resource", "a", vec![4; 20_000]);
        let reference = f.layout.blob_path_for_key(&key);
        fs::remove_file(f.layout.record_path_for_key(&key)).unwrap();
        backdate(&reference, Duration::from_secs(3600));

        let outcome = synchronize_records(&f.layout, &f.blobs, 4096);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.blob_count, 0);
        assert!(!reference.exists());
        assert_eq!(f.blobs.approximate_size(), 0);
        assert_eq!(fs::read_dir(f.layout.blobs_path()).unwrap().count(), 0);
    }

    #[test]
    fn test_synchronize_keeps_fresh_orphan_blob_reference() {
        let f = fixture();
        let key = write(&f, "Resource", "a", vec![5; 20_000]);
        let reference = f.layout.blob_path_for_key(&key);
        fs::remove_file(f.layout.record_path_for_key(&key)).unwrap();

        let outcome = synchronize_records(&f.layout, &f.blobs, 4096);
        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.blob_count, 1);
        assert!(reference.exists());
        assert_eq!(outcome.blobs.repaired, 0);
        assert_eq!(f.blobs.approximate_size(), 20_000);
    }
}
