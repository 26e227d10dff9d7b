//! On-disk layout
//!
//! ```text
//! <base>/Version <N>/salt
//! <base>/Version <N>/Records/<partitionHash>/<type>/<keyHash>
//! <base>/Version <N>/Records/<partitionHash>/<type>/<keyHash>-blob
//! <base>/Version <N>/Blobs/<blobHash>
//! <base>/Version <N>/Blobs/<blobHash>.refs
//! ```
//!
//! Every file is written to a dotfile next to its final location and then
//! renamed into place, so walks skip names starting with `.`.

use crate::record::STORAGE_VERSION;
use netcache_common::{Key, SALT_LENGTH, Salt};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Prefix of the versioned directory under the base path
pub const VERSION_DIRECTORY_PREFIX: &str = "Version ";

/// Directory holding record files
pub const RECORDS_DIRECTORY_NAME: &str = "Records";

/// Directory holding shared bodies
pub const BLOBS_DIRECTORY_NAME: &str = "Blobs";

/// File holding the per-cache salt
pub const SALT_FILE_NAME: &str = "salt";

/// Suffix of the blob reference file next to a record
pub const BLOB_SUFFIX: &str = "-blob";

/// Fallback when the file system block size cannot be queried
pub const DEFAULT_VOLUME_BLOCK_SIZE: u64 = 4096;

/// Reads only refresh the modification time when it is older than this
const MODIFICATION_TIME_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Paths of one cache instance
#[derive(Clone, Debug)]
pub struct CacheLayout {
    base_path: PathBuf,
    version_path: PathBuf,
    records_path: PathBuf,
    blobs_path: PathBuf,
}

impl CacheLayout {
    /// Layout rooted at `base_path` for the current format version
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let version_path = base_path.join(version_directory_name(STORAGE_VERSION));
        let records_path = version_path.join(RECORDS_DIRECTORY_NAME);
        let blobs_path = version_path.join(BLOBS_DIRECTORY_NAME);
        Self {
            base_path,
            version_path,
            records_path,
            blobs_path,
        }
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    #[must_use]
    pub fn version_path(&self) -> &Path {
        &self.version_path
    }

    #[must_use]
    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    #[must_use]
    pub fn blobs_path(&self) -> &Path {
        &self.blobs_path
    }

    #[must_use]
    pub fn salt_path(&self) -> PathBuf {
        self.version_path.join(SALT_FILE_NAME)
    }

    /// `Records/<partitionHash>`
    #[must_use]
    pub fn partition_path(&self, partition_hash: &str) -> PathBuf {
        self.records_path.join(partition_hash)
    }

    /// `Records/<partitionHash>/<type>`
    #[must_use]
    pub fn record_directory_for_key(&self, key: &Key) -> PathBuf {
        self.partition_path(&key.partition_hash_as_string())
            .join(key.record_type())
    }

    /// `Records/<partitionHash>/<type>/<keyHash>`
    #[must_use]
    pub fn record_path_for_key(&self, key: &Key) -> PathBuf {
        self.record_directory_for_key(key)
            .join(key.hash_as_string())
    }

    /// `Records/<partitionHash>/<type>/<keyHash>-blob`
    #[must_use]
    pub fn blob_path_for_key(&self, key: &Key) -> PathBuf {
        blob_path_for_record_path(&self.record_path_for_key(key))
    }
}

/// Name of the directory for a format version
#[must_use]
pub fn version_directory_name(version: u32) -> String {
    format!("{VERSION_DIRECTORY_PREFIX}{version}")
}

/// Reference file that sits next to a record whose body is a blob
#[must_use]
pub fn blob_path_for_record_path(record_path: &Path) -> PathBuf {
    let mut name = record_path.as_os_str().to_owned();
    name.push(BLOB_SUFFIX);
    PathBuf::from(name)
}

/// In-flight temporary files start with a dot
#[must_use]
pub fn is_temporary_file_name(name: &str) -> bool {
    name.starts_with('.')
}

/// Write `data` to `path` so readers see either the old or the new file
pub fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
        .to_string_lossy();
    fs::create_dir_all(parent)?;

    let temp_path = parent.join(format!(".{file_name}.{:08x}.tmp", rand::random::<u32>()));
    let result = fs::File::create(&temp_path)
        .and_then(|mut file| file.write_all(data))
        .and_then(|()| fs::rename(&temp_path, path));
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Load the salt of this cache, creating it on first use
pub fn read_or_make_salt(path: &Path) -> io::Result<Salt> {
    match fs::read(path) {
        Ok(data) if data.len() == SALT_LENGTH => {
            let mut bytes = [0u8; SALT_LENGTH];
            bytes.copy_from_slice(&data);
            return Ok(Salt::from_bytes(bytes));
        }
        Ok(data) => warn!(
            "Ignoring salt file {} with unexpected size {}",
            path.display(),
            data.len()
        ),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let salt = Salt::random();
    write_atomically(path, salt.as_bytes())?;
    debug!("Created new salt at {}", path.display());
    Ok(salt)
}

/// Remove `Version M` directories left behind by older formats
pub fn delete_old_versions(base_path: &Path) {
    let Ok(entries) = fs::read_dir(base_path) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(version) = name
            .to_str()
            .and_then(|n| n.strip_prefix(VERSION_DIRECTORY_PREFIX))
            .and_then(|v| v.parse::<u32>().ok())
        else {
            continue;
        };
        if version >= STORAGE_VERSION {
            continue;
        }
        debug!("Deleting cache directory for format version {}", version);
        if let Err(e) = fs::remove_dir_all(entry.path()) {
            warn!("Failed to delete old cache version {}: {}", version, e);
        }
    }
}

/// A file found under `Records`
#[derive(Clone, Debug)]
pub struct RecordsEntry {
    /// Full path of the file
    pub path: PathBuf,
    /// File name: a key hash, optionally followed by `-blob`
    pub file_name: String,
    /// Name of the partition directory
    pub partition_hash: String,
    /// Name of the type directory
    pub record_type: String,
}

impl RecordsEntry {
    /// Split the file name into the hash part and whether it is a blob reference
    #[must_use]
    pub fn hash_part(&self) -> (&str, bool) {
        match self.file_name.strip_suffix(BLOB_SUFFIX) {
            Some(hash) => (hash, true),
            None => (&self.file_name, false),
        }
    }
}

fn sub_directories(path: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| Some((e.file_name().into_string().ok()?, e.path())))
        .filter(|(name, _)| !is_temporary_file_name(name))
        .collect()
}

/// Walk `Records/<partition>/<type>/*`, optionally restricted to one
/// partition directory and one type. Temporaries are skipped.
pub fn traverse_records_files(
    records_path: &Path,
    partition_hash: Option<&str>,
    record_type: Option<&str>,
    mut visit: impl FnMut(RecordsEntry),
) {
    for (partition_name, partition_path) in sub_directories(records_path) {
        if partition_hash.is_some_and(|p| p != partition_name) {
            continue;
        }
        for (type_name, type_path) in sub_directories(&partition_path) {
            if record_type.is_some_and(|t| t != type_name) {
                continue;
            }
            let Ok(files) = fs::read_dir(&type_path) else {
                continue;
            };
            for file in files.flatten() {
                if !file.file_type().is_ok_and(|t| t.is_file()) {
                    continue;
                }
                let Ok(file_name) = file.file_name().into_string() else {
                    continue;
                };
                if is_temporary_file_name(&file_name) {
                    continue;
                }
                visit(RecordsEntry {
                    path: file.path(),
                    file_name,
                    partition_hash: partition_name.clone(),
                    record_type: type_name.clone(),
                });
            }
        }
    }
}

/// Prune type and partition directories that no longer hold anything
pub fn delete_empty_records_directories(records_path: &Path) {
    for (_, partition_path) in sub_directories(records_path) {
        for (_, type_path) in sub_directories(&partition_path) {
            // Fails when not empty.
            let _ = fs::remove_dir(&type_path);
        }
        let _ = fs::remove_dir(&partition_path);
    }
}

/// Creation and modification time of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTimes {
    pub creation: SystemTime,
    pub modification: SystemTime,
}

/// Read the times of a file. File systems without birth times report the
/// modification time as creation time.
pub fn file_times(path: &Path) -> io::Result<FileTimes> {
    let metadata = fs::metadata(path)?;
    let modification = metadata.modified()?;
    let creation = metadata.created().unwrap_or(modification);
    Ok(FileTimes {
        creation,
        modification,
    })
}

/// Mark a record as recently used. Only touches the file system when the
/// stored time is more than an hour old.
pub fn update_file_modification_time_if_needed(path: &Path) -> io::Result<()> {
    let times = file_times(path)?;
    let now = SystemTime::now();
    let stale = now
        .duration_since(times.modification)
        .is_ok_and(|age| age >= MODIFICATION_TIME_UPDATE_INTERVAL);
    if !stale && times.modification <= now {
        return Ok(());
    }
    fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(now)
}

/// Allocation unit of the volume holding `path`
#[must_use]
pub fn volume_block_size(path: &Path) -> u64 {
    #[cfg(unix)]
    {
        match nix::sys::statvfs::statvfs(path) {
            #[allow(clippy::useless_conversion)]
            Ok(stat) if stat.block_size() > 0 => return u64::from(stat.block_size()),
            Ok(_) => {}
            Err(e) => debug!("statvfs failed for {}: {}", path.display(), e),
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    DEFAULT_VOLUME_BLOCK_SIZE
}
