//! Error types for the two-level cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache
///
/// Data-plane failures (a record that cannot be persisted, a file that
/// cannot be read) are logged and swallowed close to where they happen;
/// control-plane failures (configuration, startup) surface to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem cache failed to start
    #[error("error while starting filesystem cache")]
    Start(#[source] Box<Error>),

    /// Key-value entry too big to fit into a single data file
    #[error("entry too big: size = {size}, required < {max}")]
    TooBig { size: u64, max: u64 },

    /// The host codec refused to serialize a value
    #[error("value not serializable: {0}")]
    NotSerializable(String),

    /// Malformed record encountered while decoding
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
