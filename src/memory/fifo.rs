//! FIFO memory cache
//!
//! Keeps entries in insertion order and evicts the oldest one on overflow.
//! Re-`put`ting a key moves it to the newest position, so recently written
//! keys are the last to go.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{EvictionSink, MemoryCache, ValueRef};
use crate::settings::Settings;

/// Stale queue slots tolerated before the insertion queue is compacted
const COMPACT_SLACK: usize = 32;

/// Memory cache implementing the FIFO eviction strategy
pub struct FifoMemoryCache<V> {
    /// Max number of entries
    max_size: u64,
    inner: Mutex<FifoInner<V>>,
    /// Handler to process evicted entries
    sink: Arc<dyn EvictionSink<V>>,
}

struct FifoEntry<V> {
    value: ValueRef<V>,
    /// Sequence of the entry's latest insertion; queue slots with an older
    /// sequence are stale.
    seq: u64,
}

struct FifoInner<V> {
    map: HashMap<String, FifoEntry<V>>,
    /// Insertion order, oldest in front. May contain stale slots left
    /// behind by re-puts and removals; they are skipped on eviction and
    /// swept out when the queue grows past the compaction threshold.
    queue: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl<V> FifoInner<V> {
    /// Pops insertion slots until a live one is found and removes that
    /// entry from the map.
    fn evict_oldest(&mut self) -> Option<(String, ValueRef<V>)> {
        while let Some((seq, key)) = self.queue.pop_front() {
            if self.map.get(&key).is_some_and(|e| e.seq == seq) {
                let entry = self.map.remove(&key)?;
                return Some((key, entry.value));
            }
        }
        None
    }

    fn compact(&mut self) {
        if self.queue.len() > self.map.len() * 2 + COMPACT_SLACK {
            let map = &self.map;
            self.queue
                .retain(|(seq, key)| map.get(key).is_some_and(|e| e.seq == *seq));
        }
    }
}

impl<V: fmt::Debug + Send + Sync + 'static> FifoMemoryCache<V> {
    pub fn new(settings: &Settings, sink: Arc<dyn EvictionSink<V>>) -> Self {
        Self {
            max_size: settings.memory_cache_max_size,
            inner: Mutex::new(FifoInner {
                map: HashMap::new(),
                queue: VecDeque::new(),
                next_seq: 0,
            }),
            sink,
        }
    }
}

impl<V: fmt::Debug + Send + Sync + 'static> MemoryCache<V> for FifoMemoryCache<V> {
    fn put(&self, key: &str, value: Arc<V>) {
        let evicted = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let value = ValueRef::new(value);
            match inner.map.get_mut(key) {
                Some(entry) => {
                    entry.value = value;
                    entry.seq = seq;
                }
                None => {
                    inner
                        .map
                        .insert(key.to_string(), FifoEntry { value, seq });
                }
            }
            inner.queue.push_back((seq, key.to_string()));
            inner.compact();

            if inner.map.len() as u64 > self.max_size {
                inner.evict_oldest()
            } else {
                None
            }
        };

        if let Some((evicted_key, value)) = evicted {
            if let Some(live) = value.load() {
                self.sink.on_evicted(&evicted_key, &live);
            }
        }
    }

    fn get(&self, key: &str) -> Option<Arc<V>> {
        self.inner.lock().map.get(key).and_then(|e| e.value.load())
    }

    fn remove(&self, key: &str) {
        // the queue slot goes stale and is skipped on eviction
        self.inner.lock().map.remove(key);
    }

    fn live_contents(&self) -> HashMap<String, Arc<V>> {
        self.inner
            .lock()
            .map
            .iter()
            .filter_map(|(k, e)| e.value.load().map(|v| (k.clone(), v)))
            .collect()
    }

    fn snapshot(&self) -> HashMap<String, String> {
        self.inner
            .lock()
            .map
            .iter()
            .map(|(k, e)| {
                let rendered = match e.value.load() {
                    Some(v) => format!("{v:?}"),
                    None => "null".to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("size = {}", self.inner.lock().map.len())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::test_support::{mem_settings, RecordingSink};
    use super::*;

    fn cache(max_size: u64) -> (FifoMemoryCache<i32>, Arc<RecordingSink<i32>>) {
        let sink = RecordingSink::new();
        let cache = FifoMemoryCache::new(&mem_settings(max_size), sink.clone());
        (cache, sink)
    }

    #[test]
    fn test_put_get_remove() {
        let (cache, _) = cache(10);
        cache.put("a", Arc::new(1));
        assert_eq!(cache.get("a").as_deref(), Some(&1));
        cache.remove("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_evicts_oldest_insertion() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.put("c", Arc::new(3));

        assert_eq!(sink.keys(), vec!["a"]);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some(&2));
        assert_eq!(cache.get("c").as_deref(), Some(&3));
    }

    #[test]
    fn test_get_does_not_refresh_order() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.get("a");
        cache.put("c", Arc::new(3));

        // "a" is still the oldest insertion despite the read
        assert_eq!(sink.keys(), vec!["a"]);
    }

    #[test]
    fn test_reput_moves_to_newest() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.put("a", Arc::new(10));
        cache.put("c", Arc::new(3));

        assert_eq!(sink.keys(), vec!["b"]);
        assert_eq!(cache.get("a").as_deref(), Some(&10));
    }

    #[test]
    fn test_reput_does_not_evict() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.put("b", Arc::new(20));
        assert!(sink.keys().is_empty());
        assert_eq!(cache.get("a").as_deref(), Some(&1));
        assert_eq!(cache.get("b").as_deref(), Some(&20));
    }

    #[test]
    fn test_removed_key_skipped_on_eviction() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.remove("a");
        cache.put("c", Arc::new(3));
        cache.put("d", Arc::new(4));

        // "a" left a stale queue slot; "b" is the oldest live entry
        assert_eq!(sink.keys(), vec!["b"]);
    }

    #[test]
    fn test_reclaimed_value_not_reported_to_sink() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.inner.lock().map.get("a").unwrap().value.reclaim();

        assert_eq!(cache.get("a"), None);
        cache.put("c", Arc::new(3));
        assert!(sink.keys().is_empty());
        assert_eq!(cache.get("b").as_deref(), Some(&2));
    }

    #[test]
    fn test_live_contents_skips_reclaimed() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.inner.lock().map.get("b").unwrap().value.reclaim();

        let live = cache.live_contents();
        assert_eq!(live.len(), 1);
        assert!(live.contains_key("a"));
    }

    #[test]
    fn test_snapshot_renders_reclaimed_as_null() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.inner.lock().map.get("b").unwrap().value.reclaim();

        let snapshot = cache.snapshot();
        assert_eq!(snapshot["a"], "1");
        assert_eq!(snapshot["b"], "null");
    }

    #[test]
    fn test_queue_compaction_keeps_eviction_correct() {
        let (cache, sink) = cache(3);
        cache.put("a", Arc::new(0));
        cache.put("b", Arc::new(0));
        cache.put("c", Arc::new(0));
        // heavy re-put churn builds up stale slots past the threshold
        for i in 0..200 {
            cache.put("b", Arc::new(i));
        }
        cache.put("d", Arc::new(1));
        assert_eq!(sink.keys(), vec!["a"]);
    }

    #[test]
    fn test_describe() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        assert_eq!(cache.describe(), "size = 1");
    }
}
