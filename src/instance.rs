//! Two-level cache coordinator
//!
//! Level 1 is memory, level 2 is the file system. The memory level
//! supports three eviction strategies (FIFO, LRU, LFU) selected through
//! [`Settings`]; whatever the memory level evicts is forwarded to the
//! filesystem level and comes back on a later `get` or after a restart.
//!
//! An instance moves through a fixed chain of states during its lifetime:
//!
//! ```text
//! Created -> Starting -> Working -> Stopping -> Stopped
//! ```
//!
//! Caching operations are honored only in the `Working` state and silently
//! ignored in every other one. Any state transition outside the chain is a
//! programmer error and panics.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tracing::debug;

use crate::codec::ValueCodec;
use crate::error::{Error, Result};
use crate::fs::FilesystemCache;
use crate::memory::{create_memory_cache, EvictionSink, MemoryCache};
use crate::settings::Settings;

/// Lifecycle state of a cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    /// Just after creation, before `start`
    Created = 0,
    /// `start` is underway; the filesystem tier is replaying its files
    Starting = 1,
    /// Fully operational
    Working = 2,
    /// `stop` or `shutdown` is underway
    Stopping = 3,
    /// Terminal state
    Stopped = 4,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheState::Created => "CREATED",
            CacheState::Starting => "STARTING",
            CacheState::Working => "WORKING",
            CacheState::Stopping => "STOPPING",
            CacheState::Stopped => "STOPPED",
        };
        write!(f, "{name}")
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: CacheState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> CacheState {
        match self.0.load(Ordering::SeqCst) {
            0 => CacheState::Created,
            1 => CacheState::Starting,
            2 => CacheState::Working,
            3 => CacheState::Stopping,
            _ => CacheState::Stopped,
        }
    }

    fn store(&self, state: CacheState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn compare_and_set(&self, current: CacheState, new: CacheState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Two-level cache instance
pub struct TlvCache<V> {
    /// Configuration settings
    settings: Settings,
    /// Memory cache instance
    memory: Box<dyn MemoryCache<V>>,
    /// Filesystem cache instance
    fs: Arc<FilesystemCache<V>>,
    /// State of the instance; shared with the stop completion callback,
    /// which runs on the persistence worker thread
    state: Arc<StateCell>,
}

impl<V: fmt::Debug + Send + Sync + 'static> TlvCache<V> {
    /// Creates a new cache instance in the `Created` state.
    ///
    /// `codec` is the host's serialization routine for values crossing
    /// into the filesystem tier.
    pub fn create(settings: Settings, codec: Arc<dyn ValueCodec<V>>) -> Result<Arc<Self>> {
        settings.validate()?;

        let sink = Arc::new(InstanceEvictionSink {
            cache: OnceLock::new(),
        });
        let memory = create_memory_cache(&settings, Arc::clone(&sink) as Arc<dyn EvictionSink<V>>);
        let fs = Arc::new(FilesystemCache::create(settings.clone(), codec)?);

        let cache = Arc::new(Self {
            settings,
            memory,
            fs,
            state: Arc::new(StateCell::new(CacheState::Created)),
        });
        // the sink is created before the instance it reports to; bind the
        // handle now that the instance exists
        let _ = sink.cache.set(Arc::downgrade(&cache));
        Ok(cache)
    }

    /// Associates `value` with `key` in this cache.
    pub fn put(&self, key: &str, value: Arc<V>) {
        if self.state.load() != CacheState::Working {
            return;
        }
        self.memory.put(key, value);
        // a shadow copy in the filesystem tier would serve stale data
        self.fs.remove(key);
    }

    /// Returns the value associated with `key`, or `None` when there is no
    /// cached value for it.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        if self.state.load() != CacheState::Working {
            return None;
        }
        match self.memory.get(key) {
            Some(value) => Some(value),
            None => self.fs.get(key).map(Arc::new),
        }
    }

    /// Discards any cached value for `key`.
    pub fn remove(&self, key: &str) {
        if self.state.load() != CacheState::Working {
            return;
        }
        self.memory.remove(key);
        self.fs.remove(key);
    }

    /// Returns the state of the cache instance.
    pub fn state(&self) -> CacheState {
        self.state.load()
    }

    /// Returns the configuration the instance was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Snapshot of the current memory cache content.
    pub fn mem_snapshot(&self) -> HashMap<String, String> {
        if self.state.load() == CacheState::Working {
            self.memory.snapshot()
        } else {
            HashMap::new()
        }
    }

    /// Snapshot of the current filesystem cache content.
    pub fn fs_snapshot(&self) -> HashMap<String, String> {
        if self.state.load() == CacheState::Working {
            self.fs.snapshot()
        } else {
            HashMap::new()
        }
    }

    /// One-line description of the current state of both tiers.
    pub fn describe(&self) -> String {
        format!(
            "state = {}, memory [{}], filesystem [{}]",
            self.state.load(),
            self.memory.describe(),
            self.fs.describe()
        )
    }

    /// Starts the cache service.
    ///
    /// Loading the data saved in the filesystem storage can take a while;
    /// the instance reports `Starting` until it completes. On failure the
    /// instance goes straight to `Stopped`.
    pub fn start(&self) -> Result<()> {
        self.state.store(CacheState::Starting);
        if let Err(e) = FilesystemCache::start(&self.fs) {
            self.state.store(CacheState::Stopped);
            return Err(Error::Start(Box::new(e)));
        }
        self.state.store(CacheState::Working);
        Ok(())
    }

    /// Initiates an orderly shutdown.
    ///
    /// The live content of the memory tier is handed to the filesystem
    /// tier for persistence. Once the flush completes the instance reports
    /// `Stopped` and `on_stopped` runs (on the persistence worker thread).
    ///
    /// # Panics
    ///
    /// Panics when the instance is neither `Working` nor already
    /// `Stopped`.
    pub fn stop(&self, on_stopped: impl FnOnce() + Send + 'static) {
        if self.state.load() == CacheState::Stopped {
            return;
        }
        if !self
            .state
            .compare_and_set(CacheState::Working, CacheState::Stopping)
        {
            panic!("illegal to stop a cache that is not working");
        }
        let state = Arc::clone(&self.state);
        self.fs.stop(
            self.memory.live_contents(),
            Box::new(move || {
                state.store(CacheState::Stopped);
                on_stopped();
            }),
        );
    }

    /// Initiates an abnormal, urgent shutdown without persisting anything.
    ///
    /// Blocks until the persistence worker terminates or the timeout
    /// elapses, whichever happens first; returns whether termination
    /// completed in time.
    ///
    /// # Panics
    ///
    /// Panics when the instance has not been started.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        match self.state.load() {
            CacheState::Stopped => return true,
            CacheState::Stopping => {}
            _ => {
                if !self
                    .state
                    .compare_and_set(CacheState::Working, CacheState::Stopping)
                {
                    panic!("illegal to shut down a cache that has not been started");
                }
            }
        }
        if self.fs.shutdown(timeout) {
            self.state.store(CacheState::Stopped);
            true
        } else {
            false
        }
    }
}

/// Forwards the entries evicted from the memory tier to the filesystem
/// tier.
///
/// The sink has to exist before the memory cache, which has to exist
/// before the instance; the instance reference is therefore bound after
/// construction through a write-once slot instead of a back edge.
struct InstanceEvictionSink<V> {
    cache: OnceLock<Weak<TlvCache<V>>>,
}

impl<V: fmt::Debug + Send + Sync + 'static> EvictionSink<V> for InstanceEvictionSink<V> {
    fn on_evicted(&self, key: &str, value: &Arc<V>) {
        let Some(cache) = self.cache.get().and_then(Weak::upgrade) else {
            return;
        };
        debug!("entry evicted: {key}");
        cache.fs.put(key, Arc::clone(value));
    }
}

// =============================================================================
// Tests
// =============================================================================
