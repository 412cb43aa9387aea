//! Random-access read interface supplying an opaque block of bytes given
//! `(offset, size)`. Two implementations: one backed by a file, one backed
//! by an in-memory buffer (used by tests and by callers building a table
//! purely in memory).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::error::Result;

/// A block of bytes read from a `BlockSource`. Cheap to clone: wraps shared
/// storage rather than copying on every borrow.
#[derive(Clone)]
pub struct Block(Arc<[u8]>);

impl Block {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub trait BlockSource: Send {
    /// Read `size` bytes starting at `off`, clamped to the source's length.
    fn read_block(&self, off: u64, size: u64) -> Result<Block>;
    fn size(&self) -> u64;
}

/// In-memory block source, typically built once from a `Vec<u8>` that a
/// table writer produced.
pub struct BufBlockSource {
    data: Arc<[u8]>,
}

impl BufBlockSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl BlockSource for BufBlockSource {
    fn read_block(&self, off: u64, size: u64) -> Result<Block> {
        let off = off as usize;
        let end = (off + size as usize).min(self.data.len());
        let off = off.min(self.data.len());
        Ok(Block(self.data[off..end].into()))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// File-backed block source. Each read is an independent positioned read;
/// no internal caching beyond what the OS page cache already provides.
pub struct FileBlockSource {
    file: std::sync::Mutex<File>,
    len: u64,
}

impl FileBlockSource {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        log::trace!("opened {} ({} bytes)", path.display(), len);
        Ok(Self {
            file: std::sync::Mutex::new(file),
            len,
        })
    }
}

impl BlockSource for FileBlockSource {
    fn read_block(&self, off: u64, size: u64) -> Result<Block> {
        let read_len = size.min(self.len.saturating_sub(off.min(self.len))) as usize;
        let mut buf = vec![0u8; read_len];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(off.min(self.len)))?;
        file.read_exact(&mut buf)?;
        Ok(Block(buf.into()))
    }

    fn size(&self) -> u64 {
        self.len
    }
}
