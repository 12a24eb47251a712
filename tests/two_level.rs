//! Two-level cache integration tests
//!
//! Cross-tier scenarios: memory evictions spilling into the filesystem
//! tier, orderly stop persisting the memory content for the next start,
//! and abnormal shutdown behavior.

use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tlvcache::{CacheState, JsonCodec, Settings, Strategy, TlvCache};

fn settings(dir: &Path, strategy: Strategy) -> Settings {
    Settings {
        strategy,
        memory_cache_max_size: 5,
        fs_cache_max_size: 100_000,
        fs_cache_files_count: 4,
        fs_cache_dir_path: dir.to_path_buf(),
    }
}

fn started(dir: &Path, strategy: Strategy) -> Arc<TlvCache<String>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let cache = TlvCache::create(settings(dir, strategy), Arc::new(JsonCodec)).unwrap();
    cache.start().unwrap();
    cache
}

fn stop_and_wait(cache: &Arc<TlvCache<String>>) {
    let (tx, rx) = mpsc::channel();
    cache.stop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(cache.state(), CacheState::Stopped);
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

fn value(i: usize) -> Arc<String> {
    Arc::new(format!("value-{i}"))
}

#[test]
fn test_overflow_spills_to_filesystem_and_back() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Lfu);

    // one more entry than the memory tier holds
    for i in 0..6 {
        cache.put(&format!("k{i}"), value(i));
    }

    // every key stays reachable: five from memory, the evicted one from
    // the filesystem tier once the persistence worker lands it
    for i in 0..6 {
        let key = format!("k{i}");
        wait_until(&key, || {
            cache.get(&key).as_deref() == Some(&format!("value-{i}"))
        });
    }
    assert_eq!(cache.mem_snapshot().len(), 5);
    assert!(cache.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_fifo_eviction_reaches_fs_snapshot() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Fifo);

    for i in 0..6 {
        cache.put(&format!("k{i}"), value(i));
    }

    // "k0" was the oldest insertion; it moves down a tier
    wait_until("k0 in the filesystem tier", || {
        cache.fs_snapshot().contains_key("k0")
    });
    assert!(!cache.mem_snapshot().contains_key("k0"));
    assert_eq!(cache.get("k0").as_deref().map(String::as_str), Some("value-0"));
    assert!(cache.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_stop_persists_memory_content_across_restart() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Lru);
    for i in 0..3 {
        cache.put(&format!("k{i}"), value(i));
    }
    stop_and_wait(&cache);
    drop(cache);

    let cache = started(dir.path(), Strategy::Lru);
    for i in 0..3 {
        assert_eq!(
            cache.get(&format!("k{i}")).as_deref(),
            Some(&format!("value-{i}")),
            "k{i} must survive the restart"
        );
    }

    // a removal holds across the next restart too
    cache.remove("k1");
    stop_and_wait(&cache);
    drop(cache);

    let cache = started(dir.path(), Strategy::Lru);
    assert_eq!(cache.get("k1"), None);
    assert_eq!(cache.get("k0").as_deref().map(String::as_str), Some("value-0"));
    assert!(cache.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_put_invalidates_filesystem_shadow() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Fifo);

    cache.put("k", Arc::new("old".to_string()));
    for i in 0..5 {
        cache.put(&format!("filler{i}"), value(i));
    }
    wait_until("k spilled to the filesystem tier", || {
        cache.fs_snapshot().contains_key("k")
    });

    // the rewrite goes to memory and synchronously drops the stale copy
    cache.put("k", Arc::new("new".to_string()));
    assert!(!cache.fs_snapshot().contains_key("k"));
    assert_eq!(cache.get("k").as_deref().map(String::as_str), Some("new"));

    stop_and_wait(&cache);
    drop(cache);
    let cache = started(dir.path(), Strategy::Fifo);
    assert_eq!(cache.get("k").as_deref().map(String::as_str), Some("new"));
    assert!(cache.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_remove_holds_for_both_tiers() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Lfu);

    cache.put("k", Arc::new("v".to_string()));
    cache.remove("k");
    assert_eq!(cache.get("k"), None);

    // nothing in flight resurrects it
    thread::sleep(Duration::from_millis(100));
    assert_eq!(cache.get("k"), None);
    assert!(cache.shutdown(Duration::from_secs(5)));
}

#[test]
fn test_shutdown_with_pending_work() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Lfu);

    // overflow the memory tier so the persistence queue has work
    for i in 0..60 {
        cache.put(&format!("k{i}"), value(i));
    }

    let terminated = cache.shutdown(Duration::ZERO);
    let state = cache.state();
    assert!(
        state == CacheState::Stopping || state == CacheState::Stopped,
        "unexpected state {state}"
    );
    if !terminated {
        assert_eq!(state, CacheState::Stopping);
    }

    // a patient retry sees the worker gone
    assert!(cache.shutdown(Duration::from_secs(10)));
    assert_eq!(cache.state(), CacheState::Stopped);
}

#[test]
fn test_overwrite_and_remove_round_trip() {
    let dir = tempdir().unwrap();
    let cache = started(dir.path(), Strategy::Lru);

    cache.put("k", Arc::new("v1".to_string()));
    cache.put("k", Arc::new("v2".to_string()));
    assert_eq!(cache.get("k").as_deref().map(String::as_str), Some("v2"));

    cache.remove("k");
    assert_eq!(cache.get("k"), None);
    assert!(cache.shutdown(Duration::from_secs(5)));
}
