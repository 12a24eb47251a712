//! Cache configuration settings

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Accepted range for `memoryCacheMaxSize` (entries)
const MEMORY_CACHE_SIZE_RANGE: (u64, u64) = (5, 1_000_000);

/// Accepted range for `fsCacheMaxSize` (bytes)
const FS_CACHE_SIZE_RANGE: (u64, u64) = (100, 1_000_000);

/// Accepted range for `fsCacheFilesCount`
const FS_CACHE_FILES_RANGE: (u64, u64) = (2, 1_000);

/// Smallest useful data file; fewer bytes per file would not fit a record
const MIN_FILE_SIZE: u64 = 100;

/// Memory cache eviction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// First In First Out
    Fifo,
    /// Least Recently Used
    Lru,
    /// Least Frequently Used
    Lfu,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FIFO" => Ok(Strategy::Fifo),
            "LRU" => Ok(Strategy::Lru),
            "LFU" => Ok(Strategy::Lfu),
            other => Err(Error::Config(format!(
                "unknown strategy: {other}. One of FIFO, LRU, LFU required"
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Fifo => write!(f, "FIFO"),
            Strategy::Lru => write!(f, "LRU"),
            Strategy::Lfu => write!(f, "LFU"),
        }
    }
}

/// Configuration parameters of the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Eviction strategy of the memory cache
    pub strategy: Strategy,
    /// Max number of objects in the memory cache
    pub memory_cache_max_size: u64,
    /// Max size of the filesystem cache (bytes)
    pub fs_cache_max_size: u64,
    /// Number of data files of the filesystem cache
    pub fs_cache_files_count: u64,
    /// Directory where the data files are placed
    pub fs_cache_dir_path: PathBuf,
}

impl Settings {
    /// Reads settings from a key/value property map supplied by the host.
    ///
    /// All parameters are required; missing, empty, unparsable, or
    /// out-of-range values produce [`Error::Config`] naming the offending
    /// parameter.
    pub fn from_map(props: &HashMap<String, String>) -> Result<Self> {
        let settings = Self {
            strategy: read_strategy(props, "strategy")?,
            memory_cache_max_size: read_int(props, "memoryCacheMaxSize", MEMORY_CACHE_SIZE_RANGE)?,
            fs_cache_max_size: read_int(props, "fsCacheMaxSize", FS_CACHE_SIZE_RANGE)?,
            fs_cache_files_count: read_int(props, "fsCacheFilesCount", FS_CACHE_FILES_RANGE)?,
            fs_cache_dir_path: PathBuf::from(read_string(props, "fsCacheDirPath")?),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Checks field ranges and the cross-parameter constraint.
    pub fn validate(&self) -> Result<()> {
        check_range(
            "memoryCacheMaxSize",
            self.memory_cache_max_size,
            MEMORY_CACHE_SIZE_RANGE,
        )?;
        check_range("fsCacheMaxSize", self.fs_cache_max_size, FS_CACHE_SIZE_RANGE)?;
        check_range(
            "fsCacheFilesCount",
            self.fs_cache_files_count,
            FS_CACHE_FILES_RANGE,
        )?;
        if self.fs_cache_max_size / self.fs_cache_files_count < MIN_FILE_SIZE {
            return Err(Error::Config(format!(
                "too many files for the filesystem cache: max size of a file must be at least {MIN_FILE_SIZE} bytes"
            )));
        }
        Ok(())
    }

    /// Max size of a single data file (storage size / files count)
    pub fn fs_file_max_size(&self) -> u64 {
        self.fs_cache_max_size / self.fs_cache_files_count
    }
}

fn read_string(props: &HashMap<String, String>, name: &str) -> Result<String> {
    let value = props
        .get(name)
        .ok_or_else(|| Error::Config(format!("parameter missing: {name}")))?;
    if value.trim().is_empty() {
        return Err(Error::Config(format!("parameter empty: {name}")));
    }
    Ok(value.clone())
}

fn read_int(props: &HashMap<String, String>, name: &str, (min, max): (u64, u64)) -> Result<u64> {
    let raw = read_string(props, name)?;
    raw.parse::<u64>()
        .ok()
        .filter(|value| (min..=max).contains(value))
        .ok_or_else(|| {
            Error::Config(format!(
                "wrong parameter value: {name} = {raw}. Number from {min} to {max} required"
            ))
        })
}

fn read_strategy(props: &HashMap<String, String>, name: &str) -> Result<Strategy> {
    read_string(props, name)?.parse()
}

fn check_range(name: &str, value: u64, (min, max): (u64, u64)) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "wrong parameter value: {name} = {value}. Number from {min} to {max} required"
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================
