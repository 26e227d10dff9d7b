//! Record enumeration
//!
//! Walks the records directory and decodes each record's metadata and
//! header on the blocking pool, with a bounded number of files in flight.

use crate::layout::{blob_path_for_record_path, file_times, traverse_records_files};
use crate::maintenance::compute_record_worth;
use crate::operation::{RecordInfo, TraverseFlags};
use crate::record::{Record, decode_record_header, decode_record_metadata};
use crate::storage::StorageContext;
use bytes::Bytes;
use netcache_common::Key;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

fn read_entry(
    context: &StorageContext,
    path: &Path,
    flags: TraverseFlags,
) -> Option<(Record, RecordInfo)> {
    let data = Bytes::from(fs::read(path).ok()?);
    let metadata = match decode_record_metadata(&data) {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!("Skipping undecodable record {}: {}", path.display(), e);
            return None;
        }
    };
    let header = decode_record_header(&data, &metadata, &context.salt).ok()?;

    let worth = if flags.contains(TraverseFlags::COMPUTE_WORTH) {
        file_times(path).map_or(0.0, |times| {
            compute_record_worth(&times, SystemTime::now())
        })
    } else {
        -1.0
    };
    let body_share_count = if flags.contains(TraverseFlags::SHARE_COUNT) {
        context
            .blob_storage
            .share_count(&blob_path_for_record_path(path))
    } else {
        0
    };

    let info = RecordInfo {
        body_size: metadata.body_size,
        worth,
        body_share_count,
        body_hash: metadata.body_hash.to_hex(),
    };
    let record = Record {
        key: metadata.key,
        timestamp: metadata.timestamp,
        header,
        body: Bytes::new(),
        body_hash: metadata.body_hash,
    };
    Some((record, info))
}

/// Feed every matching record to `handler`, then `None` once
pub(crate) async fn traverse_records<F>(
    context: Arc<StorageContext>,
    record_type: Option<String>,
    partition: Option<String>,
    flags: TraverseFlags,
    mut handler: F,
) where
    F: FnMut(Option<(&Record, &RecordInfo)>),
{
    let partition_hash = partition
        .map(|p| Key::partition_to_partition_hash_as_string(&p, &context.salt));

    let parallelism = context.config.traverse_parallelism;
    let (paths, mut listed) = mpsc::channel(parallelism * 4);
    let listing = Arc::clone(&context);
    let walker = tokio::task::spawn_blocking(move || {
        traverse_records_files(
            listing.layout.records_path(),
            partition_hash.as_deref(),
            record_type.as_deref(),
            |entry| {
                if !entry.hash_part().1 {
                    let _ = paths.blocking_send(entry.path);
                }
            },
        );
    });

    let semaphore = Arc::new(Semaphore::new(parallelism));
    let mut join_set = JoinSet::new();
    while let Some(path) = listed.recv().await {
        // Only spawn once a slot is free, handing out what already finished.
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        while let Some(result) = join_set.try_join_next() {
            handle_result(result, &mut handler);
        }
        let context = Arc::clone(&context);
        join_set.spawn(async move {
            let _permit = permit;
            tokio::task::spawn_blocking(move || read_entry(&context, &path, flags))
                .await
                .ok()
                .flatten()
        });
    }
    if let Err(e) = walker.await {
        warn!("Listing records for traversal failed: {}", e);
    }

    while let Some(result) = join_set.join_next().await {
        handle_result(result, &mut handler);
    }
    handler(None);
}

fn handle_result<F>(
    result: Result<Option<(Record, RecordInfo)>, JoinError>,
    handler: &mut F,
) where
    F: FnMut(Option<(&Record, &RecordInfo)>),
{
    match result {
        Ok(Some((record, info))) => handler(Some((&record, &info))),
        Ok(None) => {}
        Err(e) => warn!("Traversal task failed: {}", e),
    }
}
