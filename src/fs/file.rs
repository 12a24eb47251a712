//! Data files of the filesystem cache
//!
//! Files are named `tlv<NNNNNNNN>.fsc` where the eight zero-padded decimal
//! digits are the file's unique number within the storage. The highest
//! numbered file is the only one appended to.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::fs::record::HEADER_LEN;

/// Builds the file name for a data file number.
pub(crate) fn data_file_name(number: u32) -> String {
    format!("tlv{number:08}.fsc")
}

/// Parses a data file number out of a file name; `None` when the name does
/// not match the `tlv<8 digits>.fsc` pattern.
pub(crate) fn parse_data_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("tlv")?.strip_suffix(".fsc")?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A file containing cache data
pub(crate) struct DataFile {
    number: u32,
    path: PathBuf,
    /// File size in bytes; advanced by the append path only
    size: AtomicU64,
    /// Open handle, `None` once closed. Reads and appends share it and
    /// serialize on the lock.
    handle: Mutex<Option<File>>,
}

impl DataFile {
    /// Creates data file `number` in `dir`; the file must not exist yet.
    pub(crate) fn create(dir: &Path, number: u32) -> Result<Arc<Self>> {
        let path = dir.join(data_file_name(number));
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Arc::new(Self {
            number,
            path,
            size: AtomicU64::new(0),
            handle: Mutex::new(Some(file)),
        }))
    }

    /// Opens an existing data file, read/write when `writable`.
    pub(crate) fn open(path: PathBuf, number: u32, size: u64, writable: bool) -> Result<Arc<Self>> {
        let file = if writable {
            File::options().read(true).write(true).open(&path)?
        } else {
            File::open(&path)?
        };
        Ok(Arc::new(Self {
            number,
            path,
            size: AtomicU64::new(size),
            handle: Mutex::new(Some(file)),
        }))
    }

    pub(crate) fn number(&self) -> u32 {
        self.number
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn name(&self) -> String {
        data_file_name(self.number)
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Resets the append position; used after replay so that new records
    /// overwrite a torn tail instead of extending it.
    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Appends a record at the end of the file.
    ///
    /// Returns the offset where the record payload (after the header)
    /// begins. The size is advanced only after a complete write, so a
    /// partial write is overwritten by the next append and ignored on
    /// replay.
    pub(crate) fn append(&self, record: &[u8]) -> Result<u64> {
        let mut guard = self.handle.lock();
        let file = guard.as_mut().ok_or_else(closed_handle)?;
        let start = self.size.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(start))?;
        file.write_all(record)?;
        self.size
            .store(start + record.len() as u64, Ordering::Release);
        Ok(start + HEADER_LEN)
    }

    /// Reads exactly `len` bytes starting at `offset`.
    pub(crate) fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut guard = self.handle.lock();
        let file = guard.as_mut().ok_or_else(closed_handle)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Closes the handle; subsequent reads and appends fail. Idempotent.
    pub(crate) fn close(&self) {
        self.handle.lock().take();
    }
}

fn closed_handle() -> crate::error::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "data file handle is closed").into()
}

/// Position of a key-value entry inside the cache storage
#[derive(Clone)]
pub(crate) struct Position {
    /// File holding the record
    pub(crate) file: Arc<DataFile>,
    /// Byte offset of the key bytes within the file
    pub(crate) offset: u64,
    /// Combined length of the key and value bytes
    pub(crate) size: u32,
}

// =============================================================================
// Tests
// =============================================================================
