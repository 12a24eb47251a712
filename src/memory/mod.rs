//! In-memory cache tier
//!
//! A bounded key/value store with a strategy-selected eviction policy. On
//! overflow exactly one entry is chosen by the policy and handed to the
//! [`EvictionSink`], which lets the owner move it to a lower tier instead of
//! losing it.
//!
//! Values are held through reclaimable references: the tier may drop the
//! referenced object under memory pressure while the entry shell stays
//! resident until it is removed or evicted. `get` on a reclaimed entry
//! reports a miss.

mod fifo;
mod lfu;
mod lru;

pub use fifo::FifoMemoryCache;
pub use lfu::LfuMemoryCache;
pub use lru::LruMemoryCache;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::settings::{Settings, Strategy};

/// Receives the entries evicted from the memory tier on overflow.
pub trait EvictionSink<V>: Send + Sync {
    /// Called with each evicted key/value pair whose value is still live.
    fn on_evicted(&self, key: &str, value: &Arc<V>);
}

/// Bounded in-memory key/value store producing an eviction stream.
pub trait MemoryCache<V>: Send + Sync {
    /// Associates `value` with `key`, evicting at most one entry on
    /// overflow.
    fn put(&self, key: &str, value: Arc<V>);

    /// Returns the value for `key`, or `None` when the key is missing or
    /// its value has been reclaimed.
    fn get(&self, key: &str) -> Option<Arc<V>>;

    /// Discards any cached value for `key`. Never notifies the sink.
    fn remove(&self, key: &str);

    /// All key/value pairs whose values are still live.
    fn live_contents(&self) -> HashMap<String, Arc<V>>;

    /// Debug view of the current content.
    fn snapshot(&self) -> HashMap<String, String>;

    /// Short description of the current state.
    fn describe(&self) -> String;
}

/// Reclaimable handle to a cached value.
///
/// The memory tier may drop the referenced object while keeping the entry
/// shell resident; `load` then returns `None`.
pub(crate) struct ValueRef<V> {
    slot: RwLock<Option<Arc<V>>>,
}

impl<V> ValueRef<V> {
    pub(crate) fn new(value: Arc<V>) -> Self {
        Self {
            slot: RwLock::new(Some(value)),
        }
    }

    pub(crate) fn load(&self) -> Option<Arc<V>> {
        self.slot.read().clone()
    }

    /// Drops the referenced value, keeping the shell.
    #[allow(dead_code)]
    pub(crate) fn reclaim(&self) {
        *self.slot.write() = None;
    }
}

/// Builds the memory cache implementation selected by `settings.strategy`.
pub fn create_memory_cache<V>(
    settings: &Settings,
    sink: Arc<dyn EvictionSink<V>>,
) -> Box<dyn MemoryCache<V>>
where
    V: fmt::Debug + Send + Sync + 'static,
{
    match settings.strategy {
        Strategy::Fifo => Box::new(FifoMemoryCache::new(settings, sink)),
        Strategy::Lru => Box::new(LruMemoryCache::new(settings, sink)),
        Strategy::Lfu => Box::new(LfuMemoryCache::new(settings, sink)),
    }
}
