//! LRU memory cache
//!
//! Delegates storage and recency bookkeeping to the `lru` crate: every
//! successful `get` promotes the entry to the newest position, overflow
//! evicts the least recently used one.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::{EvictionSink, MemoryCache, ValueRef};
use crate::settings::Settings;

/// Memory cache implementing the LRU eviction strategy
pub struct LruMemoryCache<V> {
    cache: Mutex<LruCache<String, ValueRef<V>>>,
    /// Handler to process evicted entries
    sink: Arc<dyn EvictionSink<V>>,
}

impl<V: fmt::Debug + Send + Sync + 'static> LruMemoryCache<V> {
    pub fn new(settings: &Settings, sink: Arc<dyn EvictionSink<V>>) -> Self {
        let capacity =
            NonZeroUsize::new(settings.memory_cache_max_size as usize).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            sink,
        }
    }
}

impl<V: fmt::Debug + Send + Sync + 'static> MemoryCache<V> for LruMemoryCache<V> {
    fn put(&self, key: &str, value: Arc<V>) {
        let displaced = self
            .cache
            .lock()
            .push(key.to_string(), ValueRef::new(value));

        if let Some((displaced_key, displaced_value)) = displaced {
            // a same-key replacement is not a capacity eviction
            if displaced_key != key {
                if let Some(live) = displaced_value.load() {
                    self.sink.on_evicted(&displaced_key, &live);
                }
            }
        }
    }

    fn get(&self, key: &str) -> Option<Arc<V>> {
        // a hit refreshes the entry's recency even when the value itself
        // has been reclaimed; the shell stays until evicted
        self.cache.lock().get(key).and_then(ValueRef::load)
    }

    fn remove(&self, key: &str) {
        self.cache.lock().pop(key);
    }

    fn live_contents(&self) -> HashMap<String, Arc<V>> {
        self.cache
            .lock()
            .iter()
            .filter_map(|(k, v)| v.load().map(|v| (k.clone(), v)))
            .collect()
    }

    fn snapshot(&self) -> HashMap<String, String> {
        self.cache
            .lock()
            .iter()
            .map(|(k, v)| {
                let rendered = match v.load() {
                    Some(v) => format!("{v:?}"),
                    None => "null".to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("size = {}", self.cache.lock().len())
    }
}

// =============================================================================
// Tests
// =============================================================================
