//! Crate-wide error type.
//!
//! The reftable format defines a closed set of failure kinds (malformed
//! data, I/O failure, missing file, lock contention, bad API usage, refname
//! conflicts) rather than one taxonomy per module. A single enum mirrors
//! that directly instead of splitting errors up the way a multi-format
//! container would.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed file: bad magic, bad CRC, unexpected block type, truncated
    /// varint, out-of-order keys, and similar on-disk corruption.
    #[error("malformed reftable data: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A named table or stack file does not exist. The stack reload loop
    /// retries on this one specifically; every other variant propagates.
    #[error("file not found: {0}")]
    NotExist(String),

    /// A `.lock` file is already held. Retry policy belongs to the caller.
    #[error("lock held: {0}")]
    Lock(String),

    /// Invalid arguments: `update_index` out of `[min, max]`, non-increasing
    /// keys, a block too small to hold its own restart array, etc.
    #[error("invalid argument: {0}")]
    Api(String),

    /// A ref name collides with an existing ref or a directory prefix of one.
    #[error("ref name conflict: {0}")]
    NameConflict(String),

    /// An invalid ref name: empty component, `.`/`..` component, trailing
    /// slash.
    #[error("invalid ref name: {0}")]
    Refname(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(msg: impl Into<String>) -> Error {
        Error::Format(msg.into())
    }

    pub fn api(msg: impl Into<String>) -> Error {
        Error::Api(msg.into())
    }
}
