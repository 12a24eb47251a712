//! File-based cache storage
//!
//! The storage is a set of numbered data files in one directory, each a
//! concatenation of framed records. There are two kinds of records: adding
//! and removing. A removing record (tombstone) differs from an adding one
//! by the absence of a value. When the storage starts it replays all files
//! in number order: every adding record sets the key's position in the
//! in-memory index, every tombstone deletes it, so the index ends up
//! reflecting the last write per key.
//!
//! All writes go through a single persistence worker fed by a bounded task
//! queue; `put` returns after enqueueing. Reads and removals are
//! synchronous.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::ValueCodec;
use crate::error::{Error, Result};
use crate::fs::file::{parse_data_file_name, DataFile, Position};
use crate::fs::record::{self, HEADER_LEN};
use crate::settings::Settings;

/// Max capacity of the persistence task queue
pub const TASK_QUEUE_CAPACITY: usize = 100;

/// Work items of the persistence worker
enum Task<V> {
    /// Append one key/value record and index it
    Persist { key: String, value: Arc<V> },
    /// Persist a memory snapshot, close all files, notify the caller
    Flush {
        entries: HashMap<String, Arc<V>>,
        on_stopped: Box<dyn FnOnce() + Send>,
    },
}

struct TaskQueue<V> {
    tx: Sender<Task<V>>,
    /// Kept so the stop path can discard the oldest queued tasks when the
    /// queue is full
    rx: Receiver<Task<V>>,
}

struct WorkerHandle {
    thread: thread::JoinHandle<()>,
    /// Closed when the worker exits
    done: Receiver<()>,
}

/// Append-only log-structured cache storage
pub struct FilesystemCache<V> {
    settings: Settings,
    /// Max data file size (storage size / files count)
    file_max_size: u64,
    codec: Arc<dyn ValueCodec<V>>,
    /// Data files by number; doubles as the lock serializing appends,
    /// rotation, and retention
    files: Mutex<BTreeMap<u32, Arc<DataFile>>>,
    /// Entries positions index, authoritative for `get`
    positions: DashMap<String, Position>,
    /// Sending half of the task queue; `None` before start and after stop
    tasks: RwLock<Option<TaskQueue<V>>>,
    worker: Mutex<Option<WorkerHandle>>,
    /// Set by `shutdown`; the worker drains remaining tasks without
    /// executing them
    interrupted: AtomicBool,
}

impl<V: Send + Sync + 'static> FilesystemCache<V> {
    /// Creates a new filesystem cache over the configured directory.
    pub fn create(settings: Settings, codec: Arc<dyn ValueCodec<V>>) -> Result<Self> {
        let dir = &settings.fs_cache_dir_path;
        if !dir.exists() {
            return Err(Error::Config(format!(
                "filesystem cache directory does not exist: {}",
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "filesystem cache directory path is not a directory: {}",
                dir.display()
            )));
        }
        let file_max_size = settings.fs_file_max_size();
        Ok(Self {
            settings,
            file_max_size,
            codec,
            files: Mutex::new(BTreeMap::new()),
            positions: DashMap::new(),
            tasks: RwLock::new(None),
            worker: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        })
    }

    /// Starts the cache: rebuilds the positions index from the data files
    /// and spins up the persistence worker.
    pub fn start(store: &Arc<Self>) -> Result<()> {
        store.load_data()?;

        let (tx, rx) = bounded(TASK_QUEUE_CAPACITY);
        let (done_tx, done_rx) = bounded::<()>(0);
        let worker_rx = rx.clone();
        let worker_store = Arc::clone(store);
        let thread = thread::Builder::new()
            .name("tlvcache-fs".to_string())
            .spawn(move || {
                let _open_until_exit = done_tx;
                worker_store.run_worker(worker_rx);
            })?;

        *store.worker.lock() = Some(WorkerHandle {
            thread,
            done: done_rx,
        });
        *store.tasks.write() = Some(TaskQueue { tx, rx });
        info!("filesystem cache started");
        Ok(())
    }

    /// Retrieves the value stored for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to get: key = {key}, error = {e}");
                None
            }
        }
    }

    /// Schedules `value` to be persisted under `key`.
    ///
    /// The write itself happens on the persistence worker; when the task
    /// queue is full this call blocks until a slot frees up.
    pub fn put(&self, key: &str, value: Arc<V>) {
        let guard = self.tasks.read();
        match guard.as_ref() {
            Some(queue) => {
                debug!("put requested: {key}");
                let task = Task::Persist {
                    key: key.to_string(),
                    value,
                };
                if queue.tx.send(task).is_err() {
                    debug!("persistence queue closed, dropping put: {key}");
                }
            }
            None => debug!("filesystem cache not running, dropping put: {key}"),
        }
    }

    /// Removes `key` from the storage.
    ///
    /// Synchronous, so stale data is never served after removal returns.
    /// Nothing is physically deleted; a record without a value is appended
    /// and wins over earlier records on replay. Keys that are not indexed
    /// produce no tombstone.
    pub fn remove(&self, key: &str) {
        if self.positions.remove(key).is_some() {
            match self.persist_entry(key, None) {
                Ok(_) => debug!("key removed: {key}"),
                Err(e) => warn!("failed to remove: key = {key}, error = {e}"),
            }
        }
    }

    /// Initiates an orderly shutdown.
    ///
    /// The given memory snapshot is persisted best-effort, every file
    /// handle is closed, and `on_stopped` runs on the worker thread once
    /// the queue has drained. Further submissions are refused.
    pub fn stop(&self, entries: HashMap<String, Arc<V>>, on_stopped: Box<dyn FnOnce() + Send>) {
        info!("filesystem cache stop initiated");
        let Some(queue) = self.tasks.write().take() else {
            debug!("filesystem cache not running, nothing to stop");
            return;
        };

        // the queue may be full of pending writes; discard the oldest ones
        // until the flush task fits, so the drain cannot block itself
        let mut task = Task::Flush {
            entries,
            on_stopped,
        };
        loop {
            match queue.tx.try_send(task) {
                Ok(()) => break,
                Err(TrySendError::Full(t)) => {
                    task = t;
                    let _ = queue.rx.try_recv();
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        // dropping the queue closes the channel; the worker exits after
        // processing what is left
    }

    /// Attempts to stop the cache immediately, without any persistence
    /// (abnormal shutdown).
    ///
    /// Blocks until the worker terminates or the timeout elapses,
    /// whichever happens first; returns whether termination completed in
    /// time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("filesystem cache shutdown initiated");
        self.interrupted.store(true, Ordering::SeqCst);
        drop(self.tasks.write().take());
        for file in self.files.lock().values() {
            file.close();
        }

        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return true;
        };
        match handle.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.thread.join();
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                *worker = Some(handle);
                false
            }
        }
    }

    /// Snapshot of the current storage content: key to record location.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.positions
            .iter()
            .map(|entry| {
                let pos = entry.value();
                (
                    entry.key().clone(),
                    format!("{} - [{}, {}]", pos.file.name(), pos.offset, pos.size),
                )
            })
            .collect()
    }

    /// Short description of the current state.
    pub fn describe(&self) -> String {
        format!("size = {}", self.files_sum_size())
    }

    // -------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------

    fn run_worker(self: Arc<Self>, rx: Receiver<Task<V>>) {
        while let Ok(task) = rx.recv() {
            if self.interrupted.load(Ordering::SeqCst) {
                // abnormal shutdown: drain without executing
                continue;
            }
            match task {
                Task::Persist { key, value } => self.run_persist(&key, &value),
                Task::Flush {
                    entries,
                    on_stopped,
                } => {
                    if let Err(e) = self.persist_entries(&entries) {
                        warn!("failed to persist entries while stopping: {e}");
                    }
                    for file in self.files.lock().values() {
                        file.close();
                    }
                    info!("filesystem cache stop done");
                    on_stopped();
                }
            }
        }
    }

    fn run_persist(&self, key: &str, value: &Arc<V>) {
        match self.persist_entry(key, Some(value)) {
            Ok(pos) => {
                self.positions.insert(key.to_string(), pos);
                debug!("put done: {key}");
            }
            Err(e) => warn!("failed to put: key = {key}, error = {e}"),
        }
    }

    /// Persists one entry (or a tombstone when `value` is `None`) and
    /// returns its position.
    fn persist_entry(&self, key: &str, value: Option<&Arc<V>>) -> Result<Position> {
        let value_bytes = match value {
            Some(v) => Some(self.codec.encode(v)?),
            None => None,
        };
        let record = record::encode(key, value_bytes.as_deref(), self.file_max_size)?;

        let mut files = self.files.lock();
        let file = self.file_for_append(&mut files, record.len() as u64)?;
        let offset = file.append(&record)?;
        Ok(Position {
            file,
            offset,
            size: (record.len() as u64 - HEADER_LEN) as u32,
        })
    }

    /// Persists a set of entries, skipping the ones that cannot be stored.
    /// I/O failures abort the whole batch.
    fn persist_entries(&self, entries: &HashMap<String, Arc<V>>) -> Result<()> {
        for (key, value) in entries {
            match self.persist_entry(key, Some(value)) {
                Ok(_) => {}
                Err(e @ Error::Io(_)) => return Err(e),
                Err(e) => warn!("entry not persisted: key = {key}, error = {e}"),
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Rotation and retention
    // -------------------------------------------------------------------

    /// Returns the file the next record goes to, rotating to a fresh file
    /// when the current one cannot hold `record_len` more bytes.
    fn file_for_append(
        &self,
        files: &mut BTreeMap<u32, Arc<DataFile>>,
        record_len: u64,
    ) -> Result<Arc<DataFile>> {
        if let Some(file) = files.values().next_back() {
            if file.size() + record_len <= self.file_max_size {
                return Ok(Arc::clone(file));
            }
            self.retire_for_new_file(files);
        }
        self.add_new_file(files)
    }

    /// Removes the oldest files (and their index entries) until a new
    /// full-sized file fits both the byte and the count budget.
    fn retire_for_new_file(&self, files: &mut BTreeMap<u32, Arc<DataFile>>) {
        let mut total: u64 = files.values().map(|f| f.size()).sum();
        let mut count = files.len() as u64;
        let mut to_retire: Vec<u32> = Vec::new();

        for (&number, file) in files.iter() {
            if total + self.file_max_size <= self.settings.fs_cache_max_size
                && count < self.settings.fs_cache_files_count
            {
                break;
            }
            if to_retire.len() + 1 == files.len() {
                // never retire the file records are still appended to
                break;
            }
            to_retire.push(number);
            total -= file.size();
            count -= 1;
        }
        if to_retire.is_empty() {
            return;
        }

        let retired_numbers: HashSet<u32> = to_retire.iter().copied().collect();
        self.positions
            .retain(|_, pos| !retired_numbers.contains(&pos.file.number()));
        for number in to_retire {
            if let Some(file) = files.remove(&number) {
                self.delete_file(&file);
            }
        }
    }

    fn add_new_file(&self, files: &mut BTreeMap<u32, Arc<DataFile>>) -> Result<Arc<DataFile>> {
        let number = files.keys().next_back().map_or(1, |n| n + 1);
        let file = DataFile::create(&self.settings.fs_cache_dir_path, number)?;
        info!("data file created: {}", file.name());
        files.insert(number, Arc::clone(&file));
        Ok(file)
    }

    fn delete_file(&self, file: &DataFile) {
        file.close();
        if let Err(e) = std::fs::remove_file(file.path()) {
            warn!("failed to delete data file {}: {e}", file.path().display());
        }
        info!("data file removed: {}", file.name());
    }

    // -------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------

    fn try_get(&self, key: &str) -> Result<Option<V>> {
        let pos = match self.positions.get(key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        let payload = pos.file.read_at(pos.offset, pos.size as usize)?;

        // the payload is the key bytes followed by the value bytes
        let key_len = key.len();
        if payload.len() < key_len {
            return Err(Error::Corrupt("record shorter than its key".to_string()));
        }
        let value = self.codec.decode(&payload[key_len..])?;
        Ok(Some(value))
    }

    // -------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------

    /// Loads the data files and rebuilds the positions index.
    fn load_data(&self) -> Result<()> {
        self.load_files()?;
        self.load_positions();

        let files = self.files.lock();
        if files.is_empty() {
            info!("no data files loaded");
        } else {
            let names: Vec<String> = files.values().map(|f| f.name()).collect();
            info!("data files loaded: {names:?}");
        }
        drop(files);

        let removed = self.remove_unused_files();
        if !removed.is_empty() {
            info!("removed unused files: {removed:?}");
        }
        Ok(())
    }

    /// Accepts data files newest-first while they fit the storage budget;
    /// the newest accepted file stays open for writing.
    fn load_files(&self) -> Result<()> {
        let mut files = self.files.lock();
        files.clear();

        let mut listed = self.data_files()?;
        listed.sort_by_key(|(number, _)| std::cmp::Reverse(*number));

        let mut all_size = 0u64;
        for (i, (number, path)) in listed.into_iter().enumerate() {
            let file_size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("failed to load data file {}: {e}", path.display());
                    return Ok(());
                }
            };
            if all_size + file_size > self.settings.fs_cache_max_size {
                break;
            }
            all_size += file_size;
            match DataFile::open(path.clone(), number, file_size, i == 0) {
                Ok(file) => {
                    files.insert(number, file);
                }
                Err(e) => {
                    warn!("failed to load data file {}: {e}", path.display());
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Replays the loaded files in number order and builds the index.
    fn load_positions(&self) {
        self.positions.clear();
        let mut files = self.files.lock();

        let writable = files.keys().next_back().copied();
        let mut failed: Vec<u32> = Vec::new();
        for (&number, file) in files.iter() {
            match self.read_positions(file) {
                Ok(end) => {
                    // appends resume where the last complete record ends,
                    // overwriting any torn tail
                    if Some(number) == writable {
                        file.set_size(end);
                    }
                }
                Err(e) => {
                    // a broken file may hide removal records; dropping all
                    // previously indexed data prevents serving keys whose
                    // tombstones were lost with it
                    warn!(
                        "failed to read entries from data file {}: {e}",
                        file.path().display()
                    );
                    self.positions.clear();
                    file.close();
                    failed.push(number);
                }
            }
        }
        for number in failed {
            files.remove(&number);
        }
    }

    /// Reads all record positions of `file` into the index; returns the
    /// offset right after the last complete record.
    fn read_positions(&self, file: &Arc<DataFile>) -> Result<u64> {
        let file_size = file.size();
        let mut pos: u64 = 0;

        while pos + HEADER_LEN < file_size {
            let header_bytes = file.read_at(pos, HEADER_LEN as usize)?;
            let header = record::read_header(&mut header_bytes.as_slice())?;
            let end = pos + HEADER_LEN + header.payload_len();
            if end > file_size {
                // trailing partial record, ignored
                break;
            }
            let key_bytes = file.read_at(pos + HEADER_LEN, header.key_len as usize)?;
            let key = record::decode_key(&key_bytes)?;

            if header.value_len > 0 {
                self.positions.insert(
                    key,
                    Position {
                        file: Arc::clone(file),
                        offset: pos + HEADER_LEN,
                        size: header.payload_len() as u32,
                    },
                );
            } else {
                self.positions.remove(&key);
            }
            pos = end;
        }
        Ok(pos)
    }

    /// Deletes from the storage directory the data files that were not
    /// accepted into the storage.
    fn remove_unused_files(&self) -> Vec<String> {
        let mut removed = Vec::new();
        let Ok(all) = self.data_files() else {
            return removed;
        };
        let files = self.files.lock();
        for (number, path) in all {
            if !files.contains_key(&number) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                            removed.push(name.to_string());
                        }
                    }
                    Err(e) => {
                        warn!("failed to remove unused data file {}: {e}", path.display())
                    }
                }
            }
        }
        removed
    }

    /// Lists the data files present in the storage directory.
    fn data_files(&self) -> Result<Vec<(u32, PathBuf)>> {
        let mut result = Vec::new();
        for entry in std::fs::read_dir(&self.settings.fs_cache_dir_path)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(number) = parse_data_file_name(name) {
                result.push((number, path));
            }
        }
        Ok(result)
    }

    fn files_sum_size(&self) -> u64 {
        self.files.lock().values().map(|f| f.size()).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
