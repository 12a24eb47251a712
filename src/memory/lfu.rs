//! LFU memory cache built on a hitched stack
//!
//! Entries live in a doubly linked stack, partially sorted by how often
//! they were retrieved. The stack is partitioned by 256 sentinel nodes
//! called hitches; a hitch is a bookmark covering a range of hit counts,
//! and every entry between a hitch and the next one is supposed to have a
//! hit count within that range. Bucket widths double as hit counts grow, so
//! a handful of sentinels covers the whole `u32` range.
//!
//! Strict LFU order is not maintained. `get` only bumps a counter, and the
//! stack is rebalanced lazily: the eviction sweep walks from the lowest
//! bucket, moves misfiled entries to the bucket that covers their count,
//! and takes the first entry that fits its bucket. That keeps `get` and
//! `put` constant-time and amortizes the sorting work into evictions.
//!
//! The node links are kept in a slot arena (indices instead of pointers),
//! with a free list for recycled slots.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{EvictionSink, MemoryCache, ValueRef};
use crate::settings::Settings;

/// Number of hitch sentinels partitioning the stack
const HITCH_COUNT: usize = 256;

/// Cache data associated with a cache key and a stack slot
struct DataEntry<V> {
    key: String,
    /// How many times the entry was retrieved. Incremented without the
    /// stack lock; lost increments under contention are acceptable since
    /// the count only selects a bucket.
    hits: AtomicU32,
    value: ValueRef<V>,
    /// Arena slot of the entry's stack node; written under the stack lock.
    slot: AtomicUsize,
}

/// Memory cache implementing the LFU eviction strategy
pub struct LfuMemoryCache<V> {
    /// Max number of entries
    max_size: u64,
    /// Key to entry associations; reads bypass the stack lock
    map: DashMap<String, Arc<DataEntry<V>>>,
    stack: Mutex<HitchedStack<V>>,
    /// Handler to process evicted entries
    sink: Arc<dyn EvictionSink<V>>,
}

impl<V: fmt::Debug + Send + Sync + 'static> LfuMemoryCache<V> {
    pub fn new(settings: &Settings, sink: Arc<dyn EvictionSink<V>>) -> Self {
        Self {
            max_size: settings.memory_cache_max_size,
            map: DashMap::new(),
            stack: Mutex::new(HitchedStack::new()),
            sink,
        }
    }
}

impl<V: fmt::Debug + Send + Sync + 'static> MemoryCache<V> for LfuMemoryCache<V> {
    fn put(&self, key: &str, value: Arc<V>) {
        let new_entry = Arc::new(DataEntry {
            key: key.to_string(),
            hits: AtomicU32::new(0),
            value: ValueRef::new(value),
            slot: AtomicUsize::new(usize::MAX),
        });
        let old_entry = self.map.insert(key.to_string(), Arc::clone(&new_entry));

        let mut evicted = None;
        {
            let mut stack = self.stack.lock();

            // a previous entry for the key keeps its stack position: the
            // new entry is swapped into the same node and carries the hit
            // count over
            let replaced = match old_entry {
                Some(old) => {
                    let idx = old.slot.load(Ordering::Relaxed);
                    if stack.data_at(idx).is_some_and(|e| Arc::ptr_eq(e, &old)) {
                        new_entry
                            .hits
                            .store(old.hits.load(Ordering::Relaxed), Ordering::Relaxed);
                        new_entry.slot.store(idx, Ordering::Relaxed);
                        stack.replace(idx, Arc::clone(&new_entry));
                        true
                    } else {
                        // the old entry was unlinked by a concurrent
                        // remove; treat this as a fresh insertion
                        false
                    }
                }
                None => false,
            };

            if !replaced {
                // a concurrent put or remove may already have displaced
                // this entry from the map; linking it would leave an
                // orphan node behind
                let still_current = self
                    .map
                    .get(key)
                    .is_some_and(|e| Arc::ptr_eq(e.value(), &new_entry));
                if still_current {
                    if stack.entries_count == self.max_size {
                        evicted = stack.remove_least_frequent();
                    } else {
                        stack.entries_count += 1;
                    }
                    let idx = stack.push_top(Arc::clone(&new_entry));
                    new_entry.slot.store(idx, Ordering::Relaxed);
                }
            }
        }

        if let Some(victim) = evicted {
            // the key may have been re-inserted concurrently; only the
            // victim entry itself is removed
            self.map
                .remove_if(&victim.key, |_, current| Arc::ptr_eq(current, &victim));
            if let Some(live) = victim.value.load() {
                self.sink.on_evicted(&victim.key, &live);
            }
        }
    }

    fn get(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.map.get(key)?;
        let value = entry.value.load()?;
        entry.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    fn remove(&self, key: &str) {
        let removed = self.map.remove(key);
        if let Some((_, entry)) = removed {
            let mut stack = self.stack.lock();
            let idx = entry.slot.load(Ordering::Relaxed);
            if stack.data_at(idx).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                stack.unlink(idx);
                stack.release(idx);
                stack.entries_count -= 1;
            }
        }
    }

    fn live_contents(&self) -> HashMap<String, Arc<V>> {
        self.map
            .iter()
            .filter_map(|e| e.value().value.load().map(|v| (e.key().clone(), v)))
            .collect()
    }

    fn snapshot(&self) -> HashMap<String, String> {
        self.map
            .iter()
            .map(|e| {
                let hits = e.value().hits.load(Ordering::Relaxed);
                let rendered = match e.value().value.load() {
                    Some(v) => format!("{v:?}"),
                    None => "null".to_string(),
                };
                (e.key().clone(), format!("{hits} - {rendered}"))
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("size = {}", self.stack.lock().entries_count)
    }
}

/// Stack node payload
enum Node<V> {
    /// Bucket sentinel covering `[hits_min, hits_max]`
    Hitch { hits_min: u32, hits_max: u32 },
    /// Data entry
    Data(Arc<DataEntry<V>>),
    /// Recycled arena slot
    Free,
}

impl<V> fmt::Debug for Node<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Hitch { hits_min, hits_max } => write!(f, "[{hits_min}, {hits_max}]"),
            Node::Data(entry) => {
                write!(f, "[{}, {}]", entry.key, entry.hits.load(Ordering::Relaxed))
            }
            Node::Free => write!(f, "[free]"),
        }
    }
}

struct Slot<V> {
    prev: Option<usize>,
    next: Option<usize>,
    node: Node<V>,
}

/// Entries stack providing the LFU eviction order.
///
/// Hitches are created once and never move; data entries are linked in
/// between. The map of upper bounds gives the ceiling lookup used to file
/// an entry into the bucket covering its hit count.
struct HitchedStack<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    /// Hitch slots keyed by their upper bound
    hitches_by_max: BTreeMap<u32, usize>,
    /// First hitch, covering `[0, 0]`
    top: usize,
    entries_count: u64,
}

impl<V> HitchedStack<V> {
    fn new() -> Self {
        let mut slots: Vec<Slot<V>> = Vec::with_capacity(HITCH_COUNT);
        let mut hitches_by_max = BTreeMap::new();

        // half the hitches are one hit wide, a quarter two hits wide and
        // so on, ending with a single hitch covering the rest of the range
        let mut count = HITCH_COUNT;
        let mut width: u32 = 0;
        let mut min: u32 = 0;
        while count > 1 {
            count /= 2;
            width = if width == 0 { 1 } else { width * 2 };
            for _ in 0..count {
                let idx = slots.len();
                slots.push(Slot {
                    prev: idx.checked_sub(1),
                    next: Some(idx + 1),
                    node: Node::Hitch {
                        hits_min: min,
                        hits_max: min + width - 1,
                    },
                });
                hitches_by_max.insert(min + width - 1, idx);
                min += width;
            }
        }
        let last = slots.len();
        slots.push(Slot {
            prev: last.checked_sub(1),
            next: None,
            node: Node::Hitch {
                hits_min: min,
                hits_max: u32::MAX,
            },
        });
        hitches_by_max.insert(u32::MAX, last);

        Self {
            slots,
            free: Vec::new(),
            hitches_by_max,
            top: 0,
            entries_count: 0,
        }
    }

    fn data_at(&self, idx: usize) -> Option<&Arc<DataEntry<V>>> {
        match &self.slots.get(idx)?.node {
            Node::Data(entry) => Some(entry),
            _ => None,
        }
    }

    /// Swaps `entry` into the node at `idx`, keeping the node's position.
    fn replace(&mut self, idx: usize, entry: Arc<DataEntry<V>>) {
        self.slots[idx].node = Node::Data(entry);
    }

    /// Links a new entry right after `top`.
    fn push_top(&mut self, entry: Arc<DataEntry<V>>) -> usize {
        let idx = self.alloc(entry);
        self.insert_after(idx, self.top);
        idx
    }

    /// Evicts the least frequent entry from the stack.
    ///
    /// Walks down from `top` tracking the current hitch. Entries that no
    /// longer fit the bucket they sit in are moved to the bucket covering
    /// their hit count; the first entry that fits is the victim.
    fn remove_least_frequent(&mut self) -> Option<Arc<DataEntry<V>>> {
        let mut curr_hitch_max = match self.slots[self.top].node {
            Node::Hitch { hits_max, .. } => hits_max,
            _ => unreachable!("top is always a hitch"),
        };
        let mut cursor = self.slots[self.top].next;

        while let Some(idx) = cursor {
            let next = self.slots[idx].next;
            let entry_hits = match &self.slots[idx].node {
                Node::Hitch { hits_max, .. } => {
                    curr_hitch_max = *hits_max;
                    None
                }
                Node::Data(entry) => Some(entry.hits.load(Ordering::Relaxed)),
                Node::Free => unreachable!("free slot linked into the stack"),
            };

            match entry_hits {
                None => cursor = next,
                Some(hits) if hits <= curr_hitch_max => {
                    self.unlink(idx);
                    return self.release(idx);
                }
                Some(hits) => {
                    // entry sits in a bucket that no longer covers its hit
                    // count; file it under the right hitch and go on
                    cursor = next;
                    self.unlink(idx);
                    let target = self.ceiling_hitch(hits);
                    self.insert_after(idx, target);
                }
            }
        }
        None
    }

    /// Smallest hitch whose upper bound covers `hits`.
    fn ceiling_hitch(&self, hits: u32) -> usize {
        *self
            .hitches_by_max
            .range(hits..)
            .next()
            .map(|(_, idx)| idx)
            .expect("hitch table covers the whole u32 range")
    }

    fn alloc(&mut self, entry: Arc<DataEntry<V>>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx].node = Node::Data(entry);
                idx
            }
            None => {
                self.slots.push(Slot {
                    prev: None,
                    next: None,
                    node: Node::Data(entry),
                });
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<Arc<DataEntry<V>>> {
        let node = std::mem::replace(&mut self.slots[idx].node, Node::Free);
        self.free.push(idx);
        match node {
            Node::Data(entry) => Some(entry),
            _ => None,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if let Some(p) = prev {
            self.slots[p].next = next;
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn insert_after(&mut self, idx: usize, after: usize) {
        let next = self.slots[after].next;
        self.slots[idx].prev = Some(after);
        self.slots[idx].next = next;
        self.slots[after].next = Some(idx);
        if let Some(n) = next {
            self.slots[n].prev = Some(idx);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::test_support::{mem_settings, RecordingSink};
    use super::*;

    fn cache(max_size: u64) -> (LfuMemoryCache<i32>, Arc<RecordingSink<i32>>) {
        let sink = RecordingSink::new();
        let cache = LfuMemoryCache::new(&mem_settings(max_size), sink.clone());
        (cache, sink)
    }

    #[test]
    fn test_hitch_layout() {
        let (cache, _) = cache(5);
        let stack = cache.stack.lock();

        assert_eq!(stack.hitches_by_max.len(), HITCH_COUNT);
        // top covers [0, 0]
        assert!(matches!(
            stack.slots[stack.top].node,
            Node::Hitch {
                hits_min: 0,
                hits_max: 0
            }
        ));
        // the one-hit-wide buckets cover [0, 127]
        assert_eq!(stack.hitches_by_max.get(&127), Some(&127));
        // the widest finite bucket ends at 1023
        assert!(stack.hitches_by_max.contains_key(&1023));
        // and a single hitch covers the rest of the range
        let (&last_max, &last_idx) = stack.hitches_by_max.iter().next_back().unwrap();
        assert_eq!(last_max, u32::MAX);
        assert!(matches!(
            stack.slots[last_idx].node,
            Node::Hitch {
                hits_min: 1024,
                hits_max: u32::MAX
            }
        ));
    }

    #[test]
    fn test_put_get_remove() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        assert_eq!(cache.get("a").as_deref(), Some(&1));
        cache.remove("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stack.lock().entries_count, 0);
    }

    #[test]
    fn test_evicts_least_frequent() {
        let (cache, sink) = cache(3);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.put("c", Arc::new(3));
        cache.get("a");
        cache.get("a");
        cache.get("b");
        cache.put("d", Arc::new(4));

        // "c" is the only entry still at zero hits
        let evicted = sink.evicted.lock();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "c");
        assert_eq!(*evicted[0].1, 3);
        drop(evicted);

        assert_eq!(cache.get("c"), None);
        assert_eq!(cache.get("d").as_deref(), Some(&4));
    }

    #[test]
    fn test_frequent_entry_survives_churn() {
        let (cache, _) = cache(2);
        cache.put("x", Arc::new(1));
        for _ in 0..10 {
            cache.get("x");
        }
        cache.put("y", Arc::new(2));
        cache.put("z", Arc::new(3));

        // "y" never got a hit, so it goes; the hot "x" stays
        assert_eq!(cache.get("x").as_deref(), Some(&1));
        assert_eq!(cache.get("y"), None);
        assert_eq!(cache.get("z").as_deref(), Some(&3));
    }

    #[test]
    fn test_sweep_rebalances_misfiled_entries() {
        let (cache, sink) = cache(3);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        for _ in 0..3 {
            cache.get("b");
        }
        cache.put("c", Arc::new(3));
        cache.get("c");
        // stack order is c(1), b(3), a(0); the sweep has to step over the
        // two misfiled entries before it finds "a"
        cache.put("d", Arc::new(4));

        assert_eq!(sink.keys(), vec!["a"]);
        assert_eq!(cache.get("b").as_deref(), Some(&2));
        assert_eq!(cache.get("c").as_deref(), Some(&3));
    }

    #[test]
    fn test_reput_carries_hits_over() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.get("a");
        cache.get("a");
        cache.get("a");
        cache.put("a", Arc::new(2));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot["a"], "3 - 2");
        assert_eq!(cache.stack.lock().entries_count, 1);
    }

    #[test]
    fn test_reput_keeps_frequency_for_eviction() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        for _ in 0..5 {
            cache.get("a");
        }
        cache.put("a", Arc::new(10));
        cache.put("b", Arc::new(2));
        cache.put("c", Arc::new(3));

        // the re-put "a" kept its five hits, so the fresh "b" is evicted
        assert_eq!(sink.keys(), vec!["b"]);
        assert_eq!(cache.get("a").as_deref(), Some(&10));
    }

    #[test]
    fn test_get_on_reclaimed_value_is_a_miss() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.get("a");
        cache.map.get("a").unwrap().value.reclaim();

        assert_eq!(cache.get("a"), None);
        // the shell is still tracked until evicted or removed
        assert_eq!(cache.stack.lock().entries_count, 1);
        assert_eq!(cache.snapshot()["a"], "1 - null");
    }

    #[test]
    fn test_evicted_reclaimed_value_not_reported_to_sink() {
        let (cache, sink) = cache(2);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.map.get("a").unwrap().value.reclaim();
        cache.put("c", Arc::new(3));

        // "a" was evicted but its value was gone already
        assert!(sink.keys().is_empty());
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stack.lock().entries_count, 2);
    }

    #[test]
    fn test_remove_of_missing_key_is_a_noop() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.remove("missing");
        assert_eq!(cache.stack.lock().entries_count, 1);
    }

    #[test]
    fn test_remove_never_notifies_sink() {
        let (cache, sink) = cache(5);
        cache.put("a", Arc::new(1));
        cache.remove("a");
        assert!(sink.keys().is_empty());
    }

    #[test]
    fn test_live_contents_skips_reclaimed() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        cache.map.get("b").unwrap().value.reclaim();

        let live = cache.live_contents();
        assert_eq!(live.len(), 1);
        assert_eq!(*live["a"], 1);
    }

    #[test]
    fn test_eviction_count_stays_bounded() {
        let (cache, sink) = cache(5);
        for i in 0..50 {
            cache.put(&format!("k{i}"), Arc::new(i));
        }
        assert_eq!(cache.stack.lock().entries_count, 5);
        assert_eq!(cache.map.len(), 5);
        assert_eq!(sink.evicted.lock().len(), 45);
    }

    #[test]
    fn test_describe() {
        let (cache, _) = cache(5);
        cache.put("a", Arc::new(1));
        cache.put("b", Arc::new(2));
        assert_eq!(cache.describe(), "size = 2");
    }

    #[test]
    fn test_concurrent_gets_and_puts() {
        use std::thread;

        let sink = RecordingSink::new();
        let cache = Arc::new(LfuMemoryCache::new(&mem_settings(64), sink));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("k{}", (t * 31 + i) % 100);
                        cache.put(&key, Arc::new(i));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.stack.lock().entries_count <= 64);
        assert_eq!(cache.stack.lock().entries_count, cache.map.len() as u64);
    }
}
