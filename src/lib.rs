//! # reftable — block-structured, sorted reference-database storage engine
//!
//! Format guarantees (frozen at v1):
//! - All multi-byte integers on the wire are big-endian; never negotiated
//! - A table is immutable once written: updates append a new table to a
//!   stack rather than mutating an existing file
//! - Within a table, ref and log records are sorted by name and
//!   prefix-compressed against a periodic restart point for binary search
//! - A table's footer carries a CRC32 over the fixed-width trailer; a
//!   corrupt footer fails the whole open, no partial read
//! - Stacked tables are merged by `update_index`: newer tables (including
//!   deletion tombstones) shadow older ones for the same ref name
//! - `tables.list` plus lock-file rename is the only mutation protocol;
//!   there is no in-place file editing anywhere in the format

pub mod basics;
pub mod block;
pub mod block_source;
pub mod error;
pub mod iter;
pub mod merged;
pub mod options;
pub mod reader;
pub mod record;
pub mod refname;
pub mod stack;
pub mod writer;

pub use block_source::{Block, BlockSource, BufBlockSource, FileBlockSource};
pub use error::{Error, Result};
pub use merged::MergedTables;
pub use options::{ReadOptions, WriteOptions};
pub use reader::Reader;
pub use record::{LogRecord, ObjRecord, Record, RefRecord, RefValue};
pub use stack::Stack;
pub use writer::{Stats, Writer};
