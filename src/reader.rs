//! Table reader: parses the footer, dispatches seeks either through the
//! sparse index (when present) or linearly block by block, and exposes the
//! section boundaries that `merged.rs`/`iter.rs` build on.

use crate::basics::{get_u24, get_u64};
use crate::block::BlockReader;
use crate::block_source::{Block, BlockSource};
use crate::error::{Error, Result};
use crate::options::ReadOptions;
use crate::record::{IndexRecord, Record, BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG, BLOCK_TYPE_OBJ, BLOCK_TYPE_REF};
use crate::writer::{FOOTER_SIZE, HEADER_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SectionKind {
    Ref,
    Obj,
    Log,
}

pub struct Reader {
    source: Box<dyn BlockSource>,
    hash_size: u8,
    block_size: u32,

    min_update_index: u64,
    max_update_index: u64,

    ref_index_offset: u64,
    obj_offset: u64,
    object_id_len: u8,
    obj_index_offset: u64,
    log_offset: u64,
    log_index_offset: u64,

    ref_end: u64,
    obj_end: u64,
    log_end: u64,
}

const DEFAULT_HASH_SIZE: u8 = 20;

impl Reader {
    pub fn open(source: Box<dyn BlockSource>) -> Result<Self> {
        Self::open_with_options(source, ReadOptions::default())
    }

    pub fn open_with_options(source: Box<dyn BlockSource>, _opts: ReadOptions) -> Result<Self> {
        let size = source.size();
        if size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(Error::format("file too small to contain a reftable footer"));
        }
        let footer_block = source.read_block(size - FOOTER_SIZE as u64, FOOTER_SIZE as u64)?;
        let footer = footer_block.as_slice();
        if footer.len() != FOOTER_SIZE {
            return Err(Error::format("truncated footer"));
        }
        if &footer[0..4] != b"REFT" {
            return Err(Error::format("bad magic in footer"));
        }
        let version = footer[4];
        if version != 1 {
            return Err(Error::format(format!("unsupported reftable version {version}")));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&footer[..FOOTER_SIZE - 4]);
        let want_crc = get_u32_be(&footer[FOOTER_SIZE - 4..]);
        if hasher.finalize() != want_crc {
            return Err(Error::format("footer CRC mismatch"));
        }

        let block_size = get_u24(&footer[5..8]);
        let min_update_index = get_u64(&footer[8..16]);
        let max_update_index = get_u64(&footer[16..24]);
        let ref_index_offset = get_u64(&footer[24..32]);
        let packed_obj = get_u64(&footer[32..40]);
        let object_id_len = (packed_obj & 0x1f) as u8;
        let obj_offset = packed_obj >> 5;
        let obj_index_offset = get_u64(&footer[40..48]);
        let log_offset = get_u64(&footer[48..56]);
        let log_index_offset = get_u64(&footer[56..64]);

        let footer_start = size - FOOTER_SIZE as u64;
        let ref_end = first_nonzero(&[ref_index_offset, obj_offset, log_offset]).unwrap_or(footer_start);
        let obj_end = first_nonzero(&[obj_index_offset, log_offset]).unwrap_or(footer_start);
        let log_end = first_nonzero(&[log_index_offset]).unwrap_or(footer_start);

        Ok(Self {
            source,
            hash_size: DEFAULT_HASH_SIZE,
            block_size: if block_size == 0 { crate::options::DEFAULT_BLOCK_SIZE } else { block_size },
            min_update_index,
            max_update_index,
            ref_index_offset,
            obj_offset,
            object_id_len,
            obj_index_offset,
            log_offset,
            log_index_offset,
            ref_end,
            obj_end,
            log_end,
        })
    }

    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }
    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    fn section_bounds(&self, section: SectionKind) -> (u64, u64, u64, u8) {
        match section {
            SectionKind::Ref => (HEADER_SIZE as u64, self.ref_end, self.ref_index_offset, BLOCK_TYPE_REF),
            SectionKind::Obj => (self.obj_offset, self.obj_end, self.obj_index_offset, BLOCK_TYPE_OBJ),
            SectionKind::Log => (self.log_offset, self.log_end, self.log_index_offset, BLOCK_TYPE_LOG),
        }
    }

    fn load_block(&self, off: u64) -> Result<Block> {
        let len = (self.block_size as u64).min(self.source.size().saturating_sub(off));
        self.source.read_block(off, len)
    }

    fn block_reader<'a>(&self, block: &'a Block) -> Result<BlockReader<'a>> {
        BlockReader::new(block.as_slice(), 0, self.hash_size)
    }

    /// Seek within `section`, honoring its index when present. Returns an
    /// iterator positioned at the first record with key >= `want_key`
    /// (possibly past end of section, in which case the first `next_record()`
    /// returns `None`).
    pub(crate) fn seek(&self, section: SectionKind, want_key: &[u8]) -> Result<SectionIter<'_>> {
        let (start, end, index_offset, leaf_type) = self.section_bounds(section);
        if start == 0 {
            // Section absent; only obj/log ever carry a zero start offset.
            return Ok(SectionIter::empty(self, leaf_type, end));
        }

        let leaf_off = if index_offset != 0 {
            self.descend_index(index_offset, want_key)?
        } else {
            start
        };

        self.seek_from(leaf_type, leaf_off, end, want_key)
    }

    /// An index or data level can legitimately span several consecutive
    /// blocks of the same type (see `Writer::build_index`'s threshold
    /// check). Starting from `off`, walk forward while the *next* block is
    /// still of `block_type` and its first key is `<= want_key`, returning
    /// the offset of the block that actually covers `want_key`. Mirrors
    /// `reader_seek_linear`'s block-advance loop.
    fn advance_while_next_covers(&self, block_type: u8, mut off: u64, want_key: &[u8]) -> Result<u64> {
        loop {
            let next_off = off + self.block_size as u64;
            let next_block = match self.load_block(next_off) {
                Ok(b) if !b.is_empty() => b,
                _ => return Ok(off),
            };
            let next_reader = match self.block_reader(&next_block) {
                Ok(r) => r,
                Err(_) => return Ok(off),
            };
            if next_reader.block_type() != block_type {
                return Ok(off);
            }
            let first_key = match next_reader.start().next()? {
                Some(rec) => rec.key().to_vec(),
                None => return Ok(off),
            };
            if first_key.as_slice() > want_key {
                return Ok(off);
            }
            off = next_off;
        }
    }

    fn descend_index(&self, mut off: u64, want_key: &[u8]) -> Result<u64> {
        loop {
            let block = self.load_block(off)?;
            let reader = self.block_reader(&block)?;
            if reader.block_type() != BLOCK_TYPE_INDEX {
                return Ok(off);
            }
            off = self.advance_while_next_covers(BLOCK_TYPE_INDEX, off, want_key)?;
            let block = self.load_block(off)?;
            let reader = self.block_reader(&block)?;
            let mut it = reader.seek(want_key)?;
            let rec = match it.next()? {
                Some(Record::Index(IndexRecord { offset, .. })) => offset,
                Some(_) => return Err(Error::format("non-index record inside index block")),
                None => return Err(Error::format("index seek found no covering entry")),
            };
            off = rec;
        }
    }

    fn seek_from<'a>(&'a self, leaf_type: u8, off: u64, end: u64, want_key: &[u8]) -> Result<SectionIter<'a>> {
        if off >= end {
            return Ok(SectionIter::empty(self, leaf_type, end));
        }
        let off = self.advance_while_next_covers(leaf_type, off, want_key)?;
        let block = self.load_block(off)?;
        let reader = self.block_reader(&block)?;
        if reader.block_type() != leaf_type {
            return Err(Error::format("section offset does not point at expected block type"));
        }
        let it = reader.seek(want_key)?;
        Ok(SectionIter {
            reader: self,
            leaf_type,
            end,
            block: Some(block),
            pos: it.pos(),
            last_key: it.last_key().to_vec(),
            next_block_off: off + self.block_size as u64,
        })
    }

    pub fn seek_ref(&self, name: &str) -> Result<SectionIter<'_>> {
        self.seek(SectionKind::Ref, name.as_bytes())
    }

    pub fn seek_log(&self, name: &str) -> Result<SectionIter<'_>> {
        self.seek(SectionKind::Log, name.as_bytes())
    }

    /// Looks up the object index for `hash`, truncating it to
    /// `object_id_len()` bytes first. Returns the list of ref-section block
    /// offsets that may contain refs pointing at `hash`.
    pub fn obj_offsets_for(&self, hash: &[u8]) -> Result<Vec<u64>> {
        if self.obj_offset == 0 {
            return Ok(Vec::new());
        }
        let want_len = (self.object_id_len as usize).min(hash.len());
        let want = &hash[..want_len];
        let mut it = self.seek(SectionKind::Obj, want)?;
        match it.next_record()? {
            Some(Record::Obj(rec)) if rec.hash_prefix == want => Ok(rec.offsets),
            _ => Ok(Vec::new()),
        }
    }

    pub fn object_id_len(&self) -> u8 {
        self.object_id_len
    }

    /// Loads the ref block at an absolute offset, as used when following an
    /// object-index offset list. `offset == 0` maps to `HEADER_SIZE`, matching
    /// the on-disk convention that a ref section always starts right after
    /// the header and never legitimately sits at byte 0.
    pub(crate) fn ref_block_at(&self, offset: u64) -> Result<Block> {
        let off = if offset == 0 { HEADER_SIZE as u64 } else { offset };
        self.load_block(off)
    }

    pub(crate) fn new_block_reader<'a>(&self, block: &'a Block) -> Result<BlockReader<'a>> {
        self.block_reader(block)
    }

    pub(crate) fn hash_size(&self) -> u8 {
        self.hash_size
    }
}

fn first_nonzero(vals: &[u64]) -> Option<u64> {
    vals.iter().copied().find(|&v| v != 0)
}

fn get_u32_be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Sequential cursor over one section, crossing block boundaries
/// transparently and stopping at the section's end offset. Holds the
/// currently loaded block's bytes directly rather than a borrowed
/// `BlockIter`, so it can move to the next block without a self-referential
/// struct: each call re-derives a short-lived `BlockReader`/`BlockIter` pair
/// from `block` and `pos`/`last_key`.
pub struct SectionIter<'a> {
    reader: &'a Reader,
    leaf_type: u8,
    end: u64,
    block: Option<Block>,
    pos: usize,
    last_key: Vec<u8>,
    next_block_off: u64,
}

impl<'a> SectionIter<'a> {
    fn empty(reader: &'a Reader, leaf_type: u8, end: u64) -> Self {
        Self {
            reader,
            leaf_type,
            end,
            block: None,
            pos: 0,
            last_key: Vec::new(),
            next_block_off: end,
        }
    }

    /// Decodes the next record, translating its on-wire `update_index`
    /// (relative to this table's `min_update_index`) back to the absolute
    /// value callers deal with everywhere else.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(block) = &self.block {
                let br = self.reader.block_reader(block)?;
                let prev_key = std::mem::take(&mut self.last_key);
                let mut it = br.iter_at(self.pos, prev_key);
                if let Some(mut rec) = it.next()? {
                    self.pos = it.pos();
                    self.last_key = it.last_key().to_vec();
                    let base = self.reader.min_update_index();
                    match &mut rec {
                        Record::Ref(r) => r.update_index += base,
                        Record::Log(l) => l.update_index += base,
                        _ => {}
                    }
                    return Ok(Some(rec));
                }
                self.block = None;
            }

            if self.next_block_off >= self.end {
                return Ok(None);
            }
            let block = self.reader.load_block(self.next_block_off)?;
            let br = self.reader.block_reader(&block)?;
            if br.block_type() != self.leaf_type {
                return Ok(None);
            }
            self.next_block_off += self.reader.block_size as u64;
            self.pos = 4; // just past the 4-byte block header
            self.last_key = Vec::new();
            self.block = Some(block);
        }
    }

    pub fn next_ref(&mut self) -> Result<Option<crate::record::RefRecord>> {
        match self.next_record()? {
            Some(Record::Ref(r)) => Ok(Some(r)),
            Some(_) => Err(Error::format("expected ref record")),
            None => Ok(None),
        }
    }

    pub fn next_log(&mut self) -> Result<Option<crate::record::LogRecord>> {
        match self.next_record()? {
            Some(Record::Log(r)) => Ok(Some(r)),
            Some(_) => Err(Error::format("expected log record")),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_source::BufBlockSource;
    use crate::options::WriteOptions;
    use crate::record::{RefRecord, RefValue};
    use crate::writer::Writer;

    fn build_table(n: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut opts = WriteOptions::default();
        opts.block_size = 256;
        let mut w = Writer::new(&mut out, opts);
        w.set_limits(1, 1);
        for i in 0..n {
            let name = format!("refs/heads/branch{i:03}");
            w.add_ref(&RefRecord {
                ref_name: name,
                update_index: 1,
                value: RefValue::Direct { value: vec![i; 20] },
            })
            .unwrap();
        }
        w.close().unwrap();
        out
    }

    #[test]
    fn seek_ref_exact_and_missing() {
        let data = build_table(40);
        let reader = Reader::open(Box::new(BufBlockSource::new(data))).unwrap();

        let mut it = reader.seek_ref("refs/heads/branch020").unwrap();
        let rec = it.next_ref().unwrap().unwrap();
        assert_eq!(rec.ref_name, "refs/heads/branch020");

        let mut it = reader.seek_ref("refs/heads/zzzz").unwrap();
        assert!(it.next_ref().unwrap().is_none());
    }

    #[test]
    fn full_scan_is_sorted_and_complete() {
        let data = build_table(40);
        let reader = Reader::open(Box::new(BufBlockSource::new(data))).unwrap();
        let mut it = reader.seek_ref("").unwrap();
        let mut count = 0;
        let mut last = String::new();
        while let Some(rec) = it.next_ref().unwrap() {
            assert!(rec.ref_name.as_str() > last.as_str());
            last = rec.ref_name;
            count += 1;
        }
        assert_eq!(count, 40);
    }
}
