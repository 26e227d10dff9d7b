//! The storage controller
//!
//! [`Storage`] is a cheap handle. Every call is forwarded to a single
//! controller task that owns the filters, the size counter and the
//! operation tables; file I/O runs on the blocking pool and reports back
//! as events. Deletions and access time bumps go through a serial queue.

use crate::blob::{Blob, BlobStorage};
use crate::filter::RebuildableFilter;
use crate::layout::{
    CacheLayout, read_or_make_salt, update_file_modification_time_if_needed, write_atomically,
};
use crate::maintenance::{
    ShrinkOutcome, SynchronizeOutcome, clear_records, delete_record_files, shrink_records,
    synchronize_records,
};
use crate::operation::{
    MappedBodyHandler, PendingRead, Priority, ReadOperation, ReadOperationId, RecordInfo,
    Retrieved, TraverseFlags, WriteOperation, WriteOperationId,
};
use crate::record::{DecodedRecord, Record, decode_record, encode_record};
use crate::serial::SerialQueue;
use crate::traverse::traverse_records;
use bytes::Bytes;
use netcache_common::{Error, Key, Result, Salt, StorageConfig, StorageMode};
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of an asynchronous storage call
///
/// Resolves to `T::default()` if the storage shut down before answering.
pub struct Completion<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    fn channel() -> (oneshot::Sender<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }
}

impl<T: Default> Future for Completion<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(std::result::Result::unwrap_or_default)
    }
}

/// Snapshot of the controller state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub capacity: u64,
    pub approximate_size: u64,
    pub records_size: u64,
    pub blobs_size: u64,
    pub pending_reads: usize,
    pub active_reads: usize,
    pub pending_writes: usize,
    pub active_writes: usize,
    pub synchronization_in_progress: bool,
    pub shrink_in_progress: bool,
}

/// State shared by the handle, the controller and background tasks
pub(crate) struct StorageContext {
    pub layout: CacheLayout,
    pub salt: Salt,
    pub blob_storage: BlobStorage,
    pub config: StorageConfig,
}

enum Command {
    Retrieve {
        key: Key,
        priority: Priority,
        completion: oneshot::Sender<Retrieved>,
    },
    Store {
        record: Record,
        mapped_body_handler: Option<MappedBodyHandler>,
    },
    Remove {
        keys: Vec<Key>,
        completion: oneshot::Sender<()>,
    },
    SetCapacity(u64),
    Clear {
        record_type: Option<String>,
        modified_since: Option<SystemTime>,
        completion: oneshot::Sender<()>,
    },
    Synchronize(oneshot::Sender<()>),
    Shrink(oneshot::Sender<()>),
    Flush(oneshot::Sender<()>),
    Stats(oneshot::Sender<StorageStats>),
    MayContain {
        key: Key,
        completion: oneshot::Sender<bool>,
    },
}

enum Event {
    RecordRead {
        id: ReadOperationId,
        result: Result<DecodedRecord>,
        io_start: Instant,
        io_end: Instant,
    },
    BlobRead {
        id: ReadOperationId,
        result: Result<Blob>,
        io_start: Instant,
        io_end: Instant,
    },
    BlobStored {
        id: WriteOperationId,
        blob: Blob,
    },
    WriteFinished {
        id: WriteOperationId,
        record_size: u64,
    },
    SynchronizeFinished(Box<SynchronizeOutcome>),
    ShrinkFinished(ShrinkOutcome),
    ClearFinished {
        full: bool,
        deleted: u64,
        completion: oneshot::Sender<()>,
    },
}

/// Open activities per dispatched write, shared with the background writer
type WriteActivities = Arc<Mutex<HashMap<WriteOperationId, usize>>>;

/// Persistent network cache storage
#[derive(Clone)]
pub struct Storage {
    commands: mpsc::UnboundedSender<Command>,
    context: Arc<StorageContext>,
}

impl Storage {
    /// Open (or create) the cache at `path`
    pub async fn open(path: impl AsRef<Path>, mode: StorageMode, capacity: u64) -> Result<Self> {
        Self::open_with_config(path, StorageConfig::new(mode, capacity)).await
    }

    /// Open (or create) the cache at `path` with full configuration
    pub async fn open_with_config(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let layout = CacheLayout::new(path.as_ref());
        let salt = {
            let layout = layout.clone();
            tokio::task::spawn_blocking(move || -> Result<Salt> {
                fs::create_dir_all(layout.records_path())?;
                fs::create_dir_all(layout.blobs_path())?;
                Ok(read_or_make_salt(&layout.salt_path())?)
            })
            .await
            .map_err(|e| Error::internal(format!("open task failed: {e}")))??
        };

        let blob_storage = BlobStorage::new(layout.blobs_path(), salt);
        let context = Arc::new(StorageContext {
            layout,
            salt,
            blob_storage,
            config,
        });

        let serial = SerialQueue::new("netcache-serial")?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            "Opened cache at {} (capacity={}, mode={:?})",
            context.layout.version_path().display(),
            context.config.capacity,
            context.config.mode
        );

        let mut controller = Controller::new(Arc::clone(&context), event_tx, serial);
        controller.synchronize();
        tokio::spawn(controller.run(command_rx, event_rx));

        Ok(Self {
            commands: command_tx,
            context,
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Dropping request: {}", Error::Closed);
        }
    }

    /// Look up a record. Higher priorities are read from disk first.
    pub fn retrieve(&self, key: &Key, priority: Priority) -> Completion<Retrieved> {
        let (completion, result) = Completion::channel();
        self.send(Command::Retrieve {
            key: key.clone(),
            priority,
            completion,
        });
        result
    }

    /// Queue a record for writing
    pub fn store(&self, record: Record) {
        self.send(Command::Store {
            record,
            mapped_body_handler: None,
        });
    }

    /// Queue a record for writing. If the body ends up in the blob store,
    /// `handler` receives the stored bytes.
    pub fn store_with_mapped_body_handler(
        &self,
        record: Record,
        handler: impl FnOnce(Bytes) + Send + 'static,
    ) {
        self.send(Command::Store {
            record,
            mapped_body_handler: Some(Box::new(handler)),
        });
    }

    /// Delete a record. Resolves once its files are gone.
    pub fn remove(&self, key: &Key) -> Completion<()> {
        self.remove_many(vec![key.clone()])
    }

    /// Delete several records. Resolves once their files are gone.
    pub fn remove_many(&self, keys: Vec<Key>) -> Completion<()> {
        let (completion, result) = Completion::channel();
        self.send(Command::Remove { keys, completion });
        result
    }

    /// Enumerate records, optionally restricted to a type and a partition.
    /// `handler` sees every record (without its body) and then `None` once.
    pub async fn traverse<F>(
        &self,
        record_type: Option<&str>,
        partition: Option<&str>,
        flags: TraverseFlags,
        handler: F,
    ) where
        F: FnMut(Option<(&Record, &RecordInfo)>),
    {
        traverse_records(
            Arc::clone(&self.context),
            record_type.map(str::to_string),
            partition.map(str::to_string),
            flags,
            handler,
        )
        .await;
    }

    /// Change the capacity, shrinking if the cache is now too large
    pub fn set_capacity(&self, capacity: u64) {
        self.send(Command::SetCapacity(capacity));
    }

    /// Delete records of `record_type` (or all) modified since
    /// `modified_since` (or ever)
    pub fn clear(
        &self,
        record_type: Option<&str>,
        modified_since: Option<SystemTime>,
    ) -> Completion<()> {
        let (completion, result) = Completion::channel();
        self.send(Command::Clear {
            record_type: record_type.map(str::to_string),
            modified_since,
            completion,
        });
        result
    }

    /// Rebuild filters and size from disk. Resolves when a rebuild that
    /// started after this call has finished.
    pub fn synchronize(&self) -> Completion<()> {
        let (completion, result) = Completion::channel();
        self.send(Command::Synchronize(completion));
        result
    }

    /// Run one eviction sweep if over capacity. Resolves after the
    /// synchronize that follows it, or right away when nothing is to be done.
    pub fn shrink(&self) -> Completion<()> {
        let (completion, result) = Completion::channel();
        self.send(Command::Shrink(completion));
        result
    }

    /// Dispatch queued writes now. Resolves once no write is pending or
    /// in flight.
    pub fn flush(&self) -> Completion<()> {
        let (completion, result) = Completion::channel();
        self.send(Command::Flush(completion));
        result
    }

    pub async fn stats(&self) -> StorageStats {
        let (completion, result) = Completion::channel();
        self.send(Command::Stats(completion));
        result.await
    }

    /// Estimated bytes on disk
    pub async fn approximate_size(&self) -> u64 {
        self.stats().await.approximate_size
    }

    pub async fn capacity(&self) -> u64 {
        self.stats().await.capacity
    }

    /// False means the key is certainly not stored
    pub async fn may_contain(&self, key: &Key) -> bool {
        let (completion, result) = Completion::channel();
        self.send(Command::MayContain {
            key: key.clone(),
            completion,
        });
        result.await
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        self.context.layout.base_path()
    }

    #[must_use]
    pub fn version_path(&self) -> &Path {
        self.context.layout.version_path()
    }

    #[must_use]
    pub fn records_path(&self) -> &Path {
        self.context.layout.records_path()
    }

    #[must_use]
    pub fn record_path_for_key(&self, key: &Key) -> PathBuf {
        self.context.layout.record_path_for_key(key)
    }

    #[must_use]
    pub fn salt(&self) -> &Salt {
        &self.context.salt
    }

    #[must_use]
    pub fn mode(&self) -> StorageMode {
        self.context.config.mode
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.context.config
    }

    /// Build a key hashed with this cache's salt
    pub fn make_key(
        &self,
        partition: impl Into<String>,
        record_type: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Result<Key> {
        Key::new(partition, record_type, identifier, &self.context.salt)
    }

    /// Build a record stamped with the current time
    #[must_use]
    pub fn make_record(&self, key: Key, header: impl Into<Bytes>, body: impl Into<Bytes>) -> Record {
        Record::new(
            key,
            SystemTime::now(),
            header.into(),
            body.into(),
            &self.context.salt,
        )
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn read_record_file(path: &Path, salt: &Salt) -> Result<DecodedRecord> {
    let data = Bytes::from(fs::read(path)?);
    decode_record(&data, salt, SystemTime::now())
}

/// Background half of a write
fn write_record(
    context: &StorageContext,
    id: WriteOperationId,
    record: &Record,
    activities: &WriteActivities,
    events: &mpsc::UnboundedSender<Event>,
) {
    let layout = &context.layout;
    let record_path = layout.record_path_for_key(&record.key);
    let blob_path = layout.blob_path_for_key(&record.key);

    let mut body_is_blob = false;
    if record.body.len() > context.config.inline_body_threshold {
        match context.blob_storage.add(&blob_path, &record.body) {
            Ok(blob) => {
                body_is_blob = true;
                *activities.lock().entry(id).or_insert(0) += 1;
                let _ = events.send(Event::BlobStored { id, blob });
            }
            Err(e) => {
                warn!("Failed to store body as blob, writing it inline: {}", e);
                context.blob_storage.remove(&blob_path);
            }
        }
    } else {
        // A previous version of the record may have had a blob.
        context.blob_storage.remove(&blob_path);
    }

    let data = encode_record(record, body_is_blob, &context.salt);
    let record_size = match write_atomically(&record_path, &data) {
        Ok(()) => data.len() as u64,
        Err(e) => {
            error!(
                "Failed to write {} bytes of record data to {}: {}",
                data.len(),
                record_path.display(),
                e
            );
            0
        }
    };
    let _ = events.send(Event::WriteFinished { id, record_size });
}

struct Controller {
    context: Arc<StorageContext>,
    events: mpsc::UnboundedSender<Event>,
    serial: SerialQueue,

    capacity: u64,
    approximate_records_size: u64,
    record_filter: RebuildableFilter,
    blob_filter: RebuildableFilter,

    reads: HashMap<ReadOperationId, ReadOperation>,
    pending_reads: BinaryHeap<PendingRead>,
    active_reads: HashSet<ReadOperationId>,
    next_read_id: u64,
    read_dispatch_count: u64,
    read_timeout_deadline: Option<Instant>,

    /// Newest at the front, dispatched from the back
    pending_writes: VecDeque<WriteOperation>,
    active_writes: HashMap<WriteOperationId, WriteOperation>,
    write_activities: WriteActivities,
    next_write_id: u64,
    write_dispatch_deadline: Option<Instant>,

    synchronization_in_progress: bool,
    synchronize_requested: bool,
    delete_old_versions: bool,
    shrink_in_progress: bool,
    clears_in_progress: usize,

    /// Waiting for the rebuild that is running
    synchronize_waiters: Vec<oneshot::Sender<()>>,
    /// Waiting for the next rebuild to start
    synchronize_requests: Vec<oneshot::Sender<()>>,
    shrink_waiters: Vec<oneshot::Sender<()>>,
    flush_waiters: Vec<oneshot::Sender<()>>,

    commands_open: bool,
}

impl Controller {
    fn new(
        context: Arc<StorageContext>,
        events: mpsc::UnboundedSender<Event>,
        serial: SerialQueue,
    ) -> Self {
        let capacity = context.config.capacity;
        Self {
            context,
            events,
            serial,
            capacity,
            approximate_records_size: 0,
            record_filter: RebuildableFilter::new(),
            blob_filter: RebuildableFilter::new(),
            reads: HashMap::new(),
            pending_reads: BinaryHeap::new(),
            active_reads: HashSet::new(),
            next_read_id: 0,
            read_dispatch_count: 0,
            read_timeout_deadline: None,
            pending_writes: VecDeque::new(),
            active_writes: HashMap::new(),
            write_activities: Arc::new(Mutex::new(HashMap::new())),
            next_write_id: 0,
            write_dispatch_deadline: None,
            synchronization_in_progress: false,
            synchronize_requested: false,
            delete_old_versions: true,
            shrink_in_progress: false,
            clears_in_progress: 0,
            synchronize_waiters: Vec::new(),
            synchronize_requests: Vec::new(),
            shrink_waiters: Vec::new(),
            flush_waiters: Vec::new(),
            commands_open: true,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            if !self.commands_open && self.is_idle() {
                break;
            }
            tokio::select! {
                command = commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All storage handles dropped, finishing outstanding work");
                        self.commands_open = false;
                        self.write_dispatch_deadline = None;
                        self.dispatch_pending_writes();
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                () = sleep_until_opt(self.write_dispatch_deadline) => {
                    self.write_dispatch_deadline = None;
                    self.dispatch_pending_writes();
                }
                () = sleep_until_opt(self.read_timeout_deadline) => self.cancel_all_reads(),
            }
        }
        debug!("Storage controller stopped");
    }

    fn is_idle(&self) -> bool {
        self.pending_writes.is_empty()
            && self.active_writes.is_empty()
            && self.reads.is_empty()
            && !self.synchronization_in_progress
            && !self.shrink_in_progress
            && self.clears_in_progress == 0
    }

    fn is_deterministic(&self) -> bool {
        self.context.config.mode == StorageMode::AvoidRandomness
    }

    fn approximate_size(&self) -> u64 {
        self.approximate_records_size + self.context.blob_storage.approximate_size()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Retrieve {
                key,
                priority,
                completion,
            } => self.retrieve(key, priority, completion),
            Command::Store {
                record,
                mapped_body_handler,
            } => self.store(record, mapped_body_handler),
            Command::Remove { keys, completion } => self.remove(keys, completion),
            Command::SetCapacity(capacity) => {
                self.capacity = capacity;
                self.shrink_if_needed();
            }
            Command::Clear {
                record_type,
                modified_since,
                completion,
            } => self.clear(record_type, modified_since, completion),
            Command::Synchronize(completion) => {
                self.synchronize_requests.push(completion);
                self.synchronize();
            }
            Command::Shrink(completion) => self.request_shrink(completion),
            Command::Flush(completion) => {
                self.write_dispatch_deadline = None;
                self.flush_waiters.push(completion);
                self.dispatch_pending_writes();
                self.resolve_flush_waiters();
            }
            Command::Stats(completion) => {
                let _ = completion.send(self.stats());
            }
            Command::MayContain { key, completion } => {
                let _ = completion.send(self.record_filter.may_contain(key.hash()));
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RecordRead {
                id,
                result,
                io_start,
                io_end,
            } => {
                // Gone if it was canceled.
                let Some(op) = self.reads.get_mut(&id) else {
                    return;
                };
                op.timings.record_io_start_time = Some(io_start.into_std());
                op.timings.record_io_end_time = Some(io_end.into_std());
                if op.record_read(result) {
                    self.finish_read(id);
                }
            }
            Event::BlobRead {
                id,
                result,
                io_start,
                io_end,
            } => {
                let Some(op) = self.reads.get_mut(&id) else {
                    return;
                };
                op.timings.blob_io_start_time = Some(io_start.into_std());
                op.timings.blob_io_end_time = Some(io_end.into_std());
                if op.blob_read(result) {
                    self.finish_read(id);
                }
            }
            Event::BlobStored { id, blob } => {
                if let Some(op) = self.active_writes.get_mut(&id) {
                    self.blob_filter.add(op.record.key.hash());
                    if let Some(handler) = op.mapped_body_handler.take() {
                        handler(blob.data);
                    }
                }
                self.finish_write_activity(id);
            }
            Event::WriteFinished { id, record_size } => {
                self.approximate_records_size += record_size;
                self.finish_write_activity(id);
            }
            Event::SynchronizeFinished(outcome) => self.finish_synchronize(*outcome),
            Event::ShrinkFinished(outcome) => {
                info!(
                    "Cache shrink completed: deleted {} of {} records",
                    outcome.deleted, outcome.examined
                );
                self.shrink_in_progress = false;
                // Waiters see the size recomputed by the following synchronize.
                self.synchronize_requests.append(&mut self.shrink_waiters);
                self.synchronize();
            }
            Event::ClearFinished {
                full,
                deleted,
                completion,
            } => {
                debug!("Cache clear completed, {} files deleted", deleted);
                self.clears_in_progress -= 1;
                if !full {
                    self.synchronize();
                }
                let _ = completion.send(());
            }
        }
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            capacity: self.capacity,
            approximate_size: self.approximate_size(),
            records_size: self.approximate_records_size,
            blobs_size: self.context.blob_storage.approximate_size(),
            pending_reads: self.pending_reads.len(),
            active_reads: self.active_reads.len(),
            pending_writes: self.pending_writes.len(),
            active_writes: self.active_writes.len(),
            synchronization_in_progress: self.synchronization_in_progress,
            shrink_in_progress: self.shrink_in_progress,
        }
    }

    fn has_write_for(&self, key: &Key) -> bool {
        self.pending_writes.iter().any(|op| op.record.key == *key)
            || self.active_writes.values().any(|op| op.record.key == *key)
    }

    /// Newest queued or in-flight value for a key
    fn record_from_memory(&self, key: &Key) -> Option<Record> {
        self.pending_writes
            .iter()
            .chain(self.active_writes.values())
            .find(|op| op.record.key == *key)
            .map(|op| op.record.clone())
    }

    // Reads

    fn retrieve(&mut self, key: Key, priority: Priority, completion: oneshot::Sender<Retrieved>) {
        let id = ReadOperationId(self.next_read_id);
        self.next_read_id += 1;
        let mut op = ReadOperation::new(id, key, priority, completion, self.read_dispatch_count);

        if self.capacity == 0 || !self.record_filter.may_contain(op.key.hash()) {
            op.fail(&Error::NotFound);
            return;
        }
        if let Some(record) = self.record_from_memory(&op.key) {
            debug!("Found write operation in progress for {:?}", op.key);
            op.complete(Some(record));
            return;
        }

        self.reads.insert(id, op);
        self.pending_reads.push(PendingRead { priority, id });
        self.dispatch_pending_reads();
    }

    fn dispatch_pending_reads(&mut self) {
        while self.active_reads.len() < self.context.config.max_active_reads {
            let Some(pending) = self.pending_reads.pop() else {
                return;
            };
            self.dispatch_read(pending.id);
        }
        if !self.pending_reads.is_empty() {
            debug!("Limiting parallel retrieves");
        }
    }

    fn dispatch_read(&mut self, id: ReadOperationId) {
        let Some(op) = self.reads.get_mut(&id) else {
            return;
        };
        op.timings.dispatch_time = Some(std::time::Instant::now());
        op.timings.dispatch_count_at_dispatch = self.read_dispatch_count;
        op.timings.synchronization_in_progress_at_dispatch = self.synchronization_in_progress;
        op.timings.shrink_in_progress_at_dispatch = self.shrink_in_progress;
        self.read_dispatch_count += 1;
        self.active_reads.insert(id);

        let should_get_body = self.blob_filter.may_contain(op.key.hash());
        op.dispatched(if should_get_body { 2 } else { 1 });

        let record_path = self.context.layout.record_path_for_key(&op.key);
        let blob_path = self.context.layout.blob_path_for_key(&op.key);

        let context = Arc::clone(&self.context);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let io_start = Instant::now();
            let result = read_record_file(&record_path, &context.salt);
            let _ = events.send(Event::RecordRead {
                id,
                result,
                io_start,
                io_end: Instant::now(),
            });
        });

        if should_get_body {
            let context = Arc::clone(&self.context);
            let events = self.events.clone();
            tokio::task::spawn_blocking(move || {
                let io_start = Instant::now();
                let result = context.blob_storage.get(&blob_path);
                let _ = events.send(Event::BlobRead {
                    id,
                    result,
                    io_start,
                    io_end: Instant::now(),
                });
            });
        }

        if self.read_timeout_deadline.is_none()
            && let Some(timeout) = self.context.config.read_timeout()
        {
            self.read_timeout_deadline = Some(Instant::now() + timeout);
        }
    }

    fn finish_read(&mut self, id: ReadOperationId) {
        let Some(mut op) = self.reads.remove(&id) else {
            return;
        };
        self.active_reads.remove(&id);

        let outcome = op.resolve();
        let record_path = self.context.layout.record_path_for_key(&op.key);
        let is_corrupt = outcome.is_corrupt();
        match (outcome.record, outcome.error) {
            (Some(record), _) => {
                self.serial.dispatch(move || {
                    if let Err(e) = update_file_modification_time_if_needed(&record_path) {
                        debug!("Failed to bump modification time: {}", e);
                    }
                });
                op.complete(Some(record));
            }
            (None, error) => {
                if is_corrupt && !self.has_write_for(&op.key) {
                    warn!("Deleting unusable record for {:?}", op.key);
                    let context = Arc::clone(&self.context);
                    self.serial.dispatch(move || {
                        delete_record_files(&record_path, &context.blob_storage);
                    });
                }
                op.fail(&error.unwrap_or(Error::NotFound));
            }
        }

        if self.active_reads.is_empty() {
            self.read_timeout_deadline = None;
        }
        self.dispatch_pending_reads();
    }

    fn cancel_all_reads(&mut self) {
        self.read_timeout_deadline = None;
        warn!(
            "Read timeout, canceling {} active and {} pending reads",
            self.active_reads.len(),
            self.pending_reads.len()
        );
        for (_, mut op) in self.reads.drain() {
            op.cancel();
        }
        self.active_reads.clear();
        self.pending_reads.clear();
    }

    // Writes

    fn store(&mut self, record: Record, mapped_body_handler: Option<MappedBodyHandler>) {
        if self.capacity == 0 {
            return;
        }

        // Added right away since retrieves also look at queued writes.
        self.record_filter.add(record.key.hash());

        let is_initial_write = self.pending_writes.is_empty() && self.active_writes.is_empty();
        self.pending_writes.retain(|op| op.record.key != record.key);

        let id = WriteOperationId(self.next_write_id);
        self.next_write_id += 1;
        self.pending_writes.push_front(WriteOperation {
            id,
            record,
            mapped_body_handler,
        });

        if self.is_deterministic() {
            if !self.synchronization_in_progress {
                self.dispatch_pending_writes();
            }
            return;
        }

        if is_initial_write && self.write_dispatch_deadline.is_none() {
            // Stay out of the way of the reads that typically follow.
            self.write_dispatch_deadline =
                Some(Instant::now() + self.context.config.initial_write_delay());
        }
    }

    fn dispatch_pending_writes(&mut self) {
        // One write at a time.
        while self.active_writes.is_empty() {
            let Some(op) = self.pending_writes.pop_back() else {
                return;
            };
            self.dispatch_write(op);
        }
    }

    fn dispatch_write(&mut self, op: WriteOperation) {
        let id = op.id;
        // Already added in store(), but a clear may have wiped it.
        self.record_filter.add(op.record.key.hash());
        self.write_activities.lock().insert(id, 1);

        let record = op.record.clone();
        self.active_writes.insert(id, op);

        let context = Arc::clone(&self.context);
        let activities = Arc::clone(&self.write_activities);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            write_record(&context, id, &record, &activities, &events);
        });
    }

    fn finish_write_activity(&mut self, id: WriteOperationId) {
        let finished = {
            let mut activities = self.write_activities.lock();
            match activities.get_mut(&id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    activities.remove(&id);
                    true
                }
                None => false,
            }
        };
        if !finished {
            return;
        }

        self.active_writes.remove(&id);
        self.dispatch_pending_writes();
        self.shrink_if_needed();
        self.resolve_flush_waiters();
    }

    fn resolve_flush_waiters(&mut self) {
        if !self.pending_writes.is_empty() || !self.active_writes.is_empty() {
            return;
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // Removal

    fn remove(&mut self, keys: Vec<Key>, completion: oneshot::Sender<()>) {
        // The filters cannot forget keys; a few extra false positives are fine.
        let paths: Vec<PathBuf> = keys
            .iter()
            .map(|key| {
                self.pending_writes.retain(|op| op.record.key != *key);
                self.context.layout.record_path_for_key(key)
            })
            .collect();

        let context = Arc::clone(&self.context);
        self.serial.dispatch(move || {
            for path in &paths {
                delete_record_files(path, &context.blob_storage);
            }
            let _ = completion.send(());
        });
        self.resolve_flush_waiters();
    }

    fn clear(
        &mut self,
        record_type: Option<String>,
        modified_since: Option<SystemTime>,
        completion: oneshot::Sender<()>,
    ) {
        let full = record_type.is_none() && modified_since.is_none();
        info!(
            "Clearing cache (type={:?}, modified_since={:?})",
            record_type, modified_since
        );

        self.pending_writes.retain(|op| {
            record_type
                .as_deref()
                .is_some_and(|t| t != op.record.key.record_type())
        });
        self.resolve_flush_waiters();

        if full {
            self.record_filter.clear();
            self.blob_filter.clear();
            self.approximate_records_size = 0;
            // The in-flight write still lands on disk.
            let threshold = self.context.config.inline_body_threshold;
            for op in self.active_writes.values() {
                self.record_filter.add(op.record.key.hash());
                if op.record.body.len() > threshold {
                    self.blob_filter.add(op.record.key.hash());
                }
            }
        }

        self.clears_in_progress += 1;
        let context = Arc::clone(&self.context);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let deleted = clear_records(
                &context.layout,
                &context.blob_storage,
                record_type.as_deref(),
                modified_since,
            );
            let _ = events.send(Event::ClearFinished {
                full,
                deleted,
                completion,
            });
        });
    }

    // Maintenance

    fn synchronize(&mut self) {
        if self.synchronization_in_progress || self.shrink_in_progress {
            self.synchronize_requested = true;
            return;
        }
        self.synchronization_in_progress = true;
        self.synchronize_requested = false;
        self.synchronize_waiters.append(&mut self.synchronize_requests);
        self.record_filter.begin_rebuild();
        self.blob_filter.begin_rebuild();

        debug!("Synchronizing cache");
        let delete_old_versions = std::mem::take(&mut self.delete_old_versions);
        let context = Arc::clone(&self.context);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            if delete_old_versions {
                crate::layout::delete_old_versions(context.layout.base_path());
            }
            let outcome = synchronize_records(
                &context.layout,
                &context.blob_storage,
                context.config.inline_body_threshold,
            );
            let _ = events.send(Event::SynchronizeFinished(Box::new(outcome)));
        });
    }

    fn finish_synchronize(&mut self, outcome: SynchronizeOutcome) {
        info!(
            "Cache synchronization completed: {} records, {} blob references, records size {}, blobs size {}",
            outcome.record_count,
            outcome.blob_count,
            outcome.records_size,
            outcome.blobs.total_size
        );

        self.record_filter.finish_rebuild(outcome.record_filter);
        self.blob_filter.finish_rebuild(outcome.blob_filter);
        self.approximate_records_size = outcome.records_size;
        self.synchronization_in_progress = false;

        for waiter in self.synchronize_waiters.drain(..) {
            let _ = waiter.send(());
        }

        if self.is_deterministic() {
            self.dispatch_pending_writes();
        }
        if self.synchronize_requested || !self.synchronize_requests.is_empty() {
            self.synchronize();
        }
    }

    fn shrink_if_needed(&mut self) {
        // Eviction is random.
        if self.is_deterministic() {
            return;
        }
        if self.approximate_size() > self.capacity {
            self.shrink();
        }
    }

    fn shrink(&mut self) -> bool {
        if self.shrink_in_progress || self.synchronization_in_progress {
            return false;
        }
        self.shrink_in_progress = true;
        info!(
            "Shrinking cache: approximate size {} exceeds capacity {}",
            self.approximate_size(),
            self.capacity
        );

        let context = Arc::clone(&self.context);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = shrink_records(
                &context.layout,
                &context.blob_storage,
                SystemTime::now(),
                |probability| rand::random::<f64>() < probability,
            );
            let _ = events.send(Event::ShrinkFinished(outcome));
        });
        true
    }

    fn request_shrink(&mut self, completion: oneshot::Sender<()>) {
        if self.is_deterministic() || self.approximate_size() <= self.capacity {
            let _ = completion.send(());
            return;
        }
        if self.shrink_in_progress || self.shrink() {
            self.shrink_waiters.push(completion);
            return;
        }
        // A synchronize is running; the caller sees its result instead.
        self.synchronize_waiters.push(completion);
    }
}
