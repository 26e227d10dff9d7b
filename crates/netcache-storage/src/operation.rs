//! Read and write operation state

use crate::blob::Blob;
use crate::record::{DecodedRecord, Record};
use bitflags::bitflags;
use bytes::Bytes;
use netcache_common::{Error, Key, Result};
use std::cmp::Ordering;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// Read priority. Higher values are dispatched first.
pub type Priority = u32;

/// Called with the body once it has been stored as a blob
pub type MappedBodyHandler = Box<dyn FnOnce(Bytes) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadOperationId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteOperationId(pub u64);

/// Where a read spent its time
#[derive(Clone, Debug, Default)]
pub struct Timings {
    pub start_time: Option<Instant>,
    pub dispatch_time: Option<Instant>,
    pub record_io_start_time: Option<Instant>,
    pub record_io_end_time: Option<Instant>,
    pub blob_io_start_time: Option<Instant>,
    pub blob_io_end_time: Option<Instant>,
    pub completion_time: Option<Instant>,
    /// Reads dispatched by the storage before this one was queued
    pub dispatch_count_at_start: u64,
    /// Reads dispatched by the storage before this one was dispatched
    pub dispatch_count_at_dispatch: u64,
    pub synchronization_in_progress_at_dispatch: bool,
    pub shrink_in_progress_at_dispatch: bool,
    pub was_canceled: bool,
}

/// Result of a retrieve
#[derive(Clone, Debug, Default)]
pub struct Retrieved {
    pub record: Option<Record>,
    pub timings: Timings,
}

impl Retrieved {
    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.record.is_some()
    }
}

/// What became of a finished read
pub(crate) struct ReadOutcome {
    pub record: Option<Record>,
    /// Why there is no record
    pub error: Option<Error>,
}

impl ReadOutcome {
    fn hit(record: Record) -> Self {
        Self {
            record: Some(record),
            error: None,
        }
    }

    fn miss(error: Error) -> Self {
        Self {
            record: None,
            error: Some(error),
        }
    }

    /// The files for the key exist but are unusable
    pub fn is_corrupt(&self) -> bool {
        self.error.as_ref().is_some_and(Error::is_corruption)
    }
}

pub(crate) struct ReadOperation {
    pub id: ReadOperationId,
    pub key: Key,
    pub priority: Priority,
    pub timings: Timings,
    completion: Option<oneshot::Sender<Retrieved>>,
    waiting_count: usize,
    record: Option<Result<DecodedRecord>>,
    blob: Option<Result<Blob>>,
}

impl ReadOperation {
    pub fn new(
        id: ReadOperationId,
        key: Key,
        priority: Priority,
        completion: oneshot::Sender<Retrieved>,
        dispatch_count: u64,
    ) -> Self {
        Self {
            id,
            key,
            priority,
            timings: Timings {
                start_time: Some(Instant::now()),
                dispatch_count_at_start: dispatch_count,
                ..Default::default()
            },
            completion: Some(completion),
            waiting_count: 0,
            record: None,
            blob: None,
        }
    }

    /// Number of background reads this operation now waits for
    pub fn dispatched(&mut self, waiting_count: usize) {
        self.waiting_count = waiting_count;
    }

    /// Returns true when nothing else is outstanding
    pub fn record_read(&mut self, record: Result<DecodedRecord>) -> bool {
        self.record = Some(record);
        self.finish_one()
    }

    /// Returns true when nothing else is outstanding
    pub fn blob_read(&mut self, blob: Result<Blob>) -> bool {
        self.blob = Some(blob);
        self.finish_one()
    }

    fn finish_one(&mut self) -> bool {
        self.waiting_count = self.waiting_count.saturating_sub(1);
        self.waiting_count == 0
    }

    /// Combine the record and the blob into the final answer
    pub fn resolve(&mut self) -> ReadOutcome {
        let decoded = match self.record.take() {
            Some(Ok(decoded)) => decoded,
            Some(Err(e)) if e.is_not_found() => return ReadOutcome::miss(Error::NotFound),
            Some(Err(e)) => return ReadOutcome::miss(e),
            None => return ReadOutcome::miss(Error::NotFound),
        };

        if decoded.record.key != self.key {
            return ReadOutcome::miss(Error::corrupt("record belongs to a different key"));
        }

        let is_body_inline = decoded.is_body_inline();
        let mut record = decoded.record;
        match self.blob.take() {
            Some(Ok(blob)) => {
                if blob.hash != record.body_hash {
                    return ReadOutcome::miss(Error::DigestMismatch {
                        expected: record.body_hash.to_hex(),
                        actual: blob.hash.to_hex(),
                    });
                }
                record.body = blob.data;
            }
            _ if !is_body_inline => {
                return ReadOutcome::miss(Error::corrupt("body blob is missing"));
            }
            _ => {}
        }

        ReadOutcome::hit(record)
    }

    /// Deliver the result. Only the first call has any effect.
    pub fn complete(&mut self, record: Option<Record>) {
        self.timings.completion_time = Some(Instant::now());
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Retrieved {
                record,
                timings: self.timings.clone(),
            });
        }
    }

    /// Complete with an empty result. Retryable errors mark the read
    /// canceled so the caller can go elsewhere.
    pub fn fail(&mut self, error: &Error) {
        if self.completion.is_none() {
            return;
        }
        debug!("Retrieve of {} missed: {}", self.key, error);
        self.timings.was_canceled = error.is_retryable();
        self.complete(None);
    }

    /// Complete with an empty result, marking the read canceled
    pub fn cancel(&mut self) {
        self.fail(&Error::Timeout);
    }
}

/// Queue entry of a read waiting for a free slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingRead {
    pub priority: Priority,
    pub id: ReadOperationId,
}

impl Ord for PendingRead {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for PendingRead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct WriteOperation {
    pub id: WriteOperationId,
    pub record: Record,
    pub mapped_body_handler: Option<MappedBodyHandler>,
}

bitflags! {
    /// What [`RecordInfo`] fields a traversal should fill in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraverseFlags: u8 {
        /// Compute the eviction worth of each record
        const COMPUTE_WORTH = 0b0000_0001;
        /// Report how many records share the body
        const SHARE_COUNT = 0b0000_0010;
    }
}

impl Default for TraverseFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Per-record details handed to a traversal handler
#[derive(Clone, Debug, PartialEq)]
pub struct RecordInfo {
    pub body_size: u64,
    /// -1 unless [`TraverseFlags::COMPUTE_WORTH`] was requested
    pub worth: f64,
    /// 0 unless [`TraverseFlags::SHARE_COUNT`] was requested
    pub body_share_count: u64,
    pub body_hash: String,
}
