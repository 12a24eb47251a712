//! Two-level key/value cache
//!
//! Level 1 is memory, level 2 is the file system:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        TlvCache<V>                             │
//! ├────────────────────────────┬───────────────────────────────────┤
//! │  L1: MemoryCache           │  L2: FilesystemCache              │
//! │  ┌──────────────────────┐  │  ┌─────────────────────────────┐  │
//! │  │ FIFO / LRU / LFU     │  │  │ append-only data files      │  │
//! │  │ bounded, in-process  │──┼─▶│ tlv<NNNNNNNN>.fsc           │  │
//! │  │ reclaimable values   │  │  │ + in-memory position index  │  │
//! │  └──────────────────────┘  │  └─────────────────────────────┘  │
//! │        eviction sink ──────┘        single persistence worker  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The memory level supports three eviction strategies, selected through
//! [`Settings`]: FIFO, LRU, and LFU (an approximate, bucketed LFU built on
//! a hitched stack, see [`memory`]). Entries evicted from memory are
//! absorbed by the filesystem level and restored from it on a miss or
//! after a restart.
//!
//! Keys are arbitrary non-empty strings and are stored as-is. Values are
//! opaque to the cache; a host-supplied [`ValueCodec`] serializes them on
//! their way into the filesystem tier. The memory tier holds values behind
//! reclaimable references, so a large value may silently disappear under
//! memory pressure without breaking the cache contract.
//!
//! A cache instance passes through the state chain `Created -> Starting ->
//! Working -> Stopping -> Stopped`; see [`instance`] for the lifecycle
//! rules.
//!
//! # Modules
//!
//! - [`codec`] - host serialization seam for values
//! - [`error`] - error types
//! - [`fs`] - filesystem cache tier (log files, index, persistence worker)
//! - [`instance`] - the two-level coordinator and its lifecycle
//! - [`memory`] - memory cache tier (FIFO, LRU, hitched-stack LFU)
//! - [`settings`] - configuration parameters and validation

pub mod codec;
pub mod error;
pub mod fs;
pub mod instance;
pub mod memory;
pub mod settings;

// Re-export commonly used types
pub use codec::{JsonCodec, ValueCodec};
pub use error::{Error, Result};
pub use fs::FilesystemCache;
pub use instance::{CacheState, TlvCache};
pub use memory::{EvictionSink, MemoryCache};
pub use settings::{Settings, Strategy};
