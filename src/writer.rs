//! Table writer: streams records into successive blocks, builds a
//! multi-level sparse index per section, aggregates an object-id→offsets
//! map from the refs it has seen, and closes out with a CRC-checked footer.
//!
//! The writer buffers the whole file in memory (`buf`) before handing it to
//! the underlying `Write` at `close()`. reftable files are write-once and
//! bounded by a single process's worth of ref churn, so this is simpler than
//! streaming to a `Seek`-able sink and matches the source's own
//! build-then-flush discipline (`writer_close` patches the header in place
//! before the final write).

use std::collections::BTreeMap;
use std::io::Write;
use std::mem;

use crate::basics::{common_prefix_size, put_u24, put_u64};
use crate::block::BlockWriter;
use crate::error::{Error, Result};
use crate::options::WriteOptions;
use crate::record::{IndexRecord, LogRecord, ObjRecord, Record, RefRecord, RefValue, BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG, BLOCK_TYPE_REF};

pub const HEADER_SIZE: usize = 24;
pub const FOOTER_SIZE: usize = 68;
pub const VERSION: u8 = 1;

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub ref_blocks: u32,
    pub obj_blocks: u32,
    pub log_blocks: u32,
    pub index_blocks: u32,
    pub bytes: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Ref,
    Obj,
    Log,
}

pub struct Writer<W: Write> {
    out: W,
    opts: WriteOptions,
    buf: Vec<u8>,

    min_update_index: u64,
    max_update_index: u64,

    cur_block: Option<BlockWriter>,
    last_ref_key: Option<Vec<u8>>,
    last_log_key: Option<Vec<u8>>,

    ref_index: Vec<IndexRecord>,
    obj_index: Vec<IndexRecord>,
    log_index: Vec<IndexRecord>,

    obj_tree: BTreeMap<Vec<u8>, Vec<u64>>,

    ref_section_finished: bool,

    ref_index_offset: u64,
    obj_offset: u64,
    object_id_len: u8,
    obj_index_offset: u64,
    log_offset: u64,
    log_index_offset: u64,

    stats: Stats,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W, opts: WriteOptions) -> Self {
        let mut buf = Vec::new();
        buf.resize(HEADER_SIZE, 0u8); // patched at close()
        Self {
            out,
            opts,
            buf,
            min_update_index: 0,
            max_update_index: u64::MAX,
            cur_block: None,
            last_ref_key: None,
            last_log_key: None,
            ref_index: Vec::new(),
            obj_index: Vec::new(),
            log_index: Vec::new(),
            obj_tree: BTreeMap::new(),
            ref_section_finished: false,
            ref_index_offset: 0,
            obj_offset: 0,
            object_id_len: 0,
            obj_index_offset: 0,
            log_offset: 0,
            log_index_offset: 0,
            stats: Stats::default(),
        }
    }

    pub fn set_limits(&mut self, min_update_index: u64, max_update_index: u64) {
        self.min_update_index = min_update_index;
        self.max_update_index = max_update_index;
    }

    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    // ── Ref ──────────────────────────────────────────────────────────────

    pub fn add_ref(&mut self, rec: &RefRecord) -> Result<()> {
        if rec.update_index < self.min_update_index || rec.update_index > self.max_update_index {
            return Err(Error::api(format!(
                "update_index {} outside [{}, {}]",
                rec.update_index, self.min_update_index, self.max_update_index
            )));
        }
        if let Some(last) = &self.last_ref_key {
            if rec.ref_name.as_bytes() <= last.as_slice() {
                return Err(Error::api("ref names must be added in strictly increasing order"));
            }
        }
        self.last_ref_key = Some(rec.ref_name.as_bytes().to_vec());

        let value_hashes: Vec<Vec<u8>> = match &rec.value {
            RefValue::Direct { value } => vec![value.clone()],
            RefValue::Annotated { value, target_value } => vec![value.clone(), target_value.clone()],
            RefValue::Deletion | RefValue::Symbolic { .. } => Vec::new(),
        };

        let mut relative = rec.clone();
        relative.update_index = rec.update_index - self.min_update_index;

        let header_off = self.add_record_to_section(Record::Ref(relative), Section::Ref)?;

        if !self.opts.skip_index_objects {
            for h in value_hashes {
                self.register_hash(&h, header_off);
            }
        }
        Ok(())
    }

    fn register_hash(&mut self, hash: &[u8], block_offset: u64) {
        let offsets = self.obj_tree.entry(hash.to_vec()).or_default();
        if offsets.last() != Some(&block_offset) {
            offsets.push(block_offset);
        }
    }

    // ── Log ──────────────────────────────────────────────────────────────

    pub fn add_log(&mut self, rec: &LogRecord) -> Result<()> {
        if !self.ref_section_finished {
            self.finish_section(Section::Ref)?;
            self.ref_section_finished = true;
        }
        if rec.update_index < self.min_update_index || rec.update_index > self.max_update_index {
            return Err(Error::api(format!(
                "update_index {} outside [{}, {}]",
                rec.update_index, self.min_update_index, self.max_update_index
            )));
        }
        if let Some(last) = &self.last_log_key {
            if rec.ref_name.as_bytes() <= last.as_slice() {
                return Err(Error::api("log entries must be added in strictly increasing order"));
            }
        }
        self.last_log_key = Some(rec.ref_name.as_bytes().to_vec());

        if self.log_offset == 0 && self.cur_block.is_none() {
            self.log_offset = self.buf.len() as u64;
        }

        let mut relative = rec.clone();
        relative.update_index = rec.update_index - self.min_update_index;
        self.add_record_to_section(Record::Log(relative), Section::Log)?;
        Ok(())
    }

    // ── Shared block plumbing ──────────────────────────────────────────────

    fn index_vec_mut(&mut self, section: Section) -> &mut Vec<IndexRecord> {
        match section {
            Section::Ref => &mut self.ref_index,
            Section::Obj => &mut self.obj_index,
            Section::Log => &mut self.log_index,
        }
    }

    fn start_block(&mut self, block_type: u8) -> BlockWriter {
        let header_off = self.buf.len();
        BlockWriter::new(
            &mut self.buf,
            header_off,
            block_type,
            self.opts.block_size,
            self.opts.restart_interval,
            self.opts.hash_size,
        )
    }

    /// Adds `rec`, flushing and starting new blocks as needed. Returns the
    /// absolute offset of the block the record ultimately landed in.
    fn add_record_to_section(&mut self, rec: Record, section: Section) -> Result<u64> {
        loop {
            if self.cur_block.is_none() {
                self.cur_block = Some(self.start_block(rec.block_type()));
            }
            let header_off = self.cur_block.as_ref().unwrap().header_off();
            let added = self.cur_block.as_mut().unwrap().add(&mut self.buf, &rec)?;
            if added {
                return Ok(header_off as u64);
            }
            self.flush_current_block(section)?;
        }
    }

    fn flush_current_block(&mut self, section: Section) -> Result<()> {
        if let Some(mut bw) = self.cur_block.take() {
            let block_type = bw.block_type();
            let header_off = bw.header_off();
            let last_key = bw.last_key().to_vec();
            let mut end = bw.finish(&mut self.buf);

            if !self.opts.unpadded && block_type != BLOCK_TYPE_LOG {
                let target = header_off + self.opts.block_size as usize;
                if target > end {
                    self.buf.resize(target, 0);
                    end = target;
                }
            }

            self.index_vec_mut(section).push(IndexRecord {
                last_key,
                offset: header_off as u64,
            });

            match block_type {
                BLOCK_TYPE_REF => self.stats.ref_blocks += 1,
                crate::record::BLOCK_TYPE_OBJ => self.stats.obj_blocks += 1,
                BLOCK_TYPE_LOG => self.stats.log_blocks += 1,
                BLOCK_TYPE_INDEX => self.stats.index_blocks += 1,
                _ => {}
            }
            self.stats.bytes = end as u64;
        }
        Ok(())
    }

    // ── Section / index finish ──────────────────────────────────────────

    fn finish_section(&mut self, section: Section) -> Result<()> {
        self.flush_current_block(section)?;

        let threshold = if self.opts.unpadded { 1 } else { 3 };
        let level = mem::take(self.index_vec_mut(section));
        if !level.is_empty() {
            let index_offset = self.build_index(level, threshold)?;
            match section {
                Section::Ref => self.ref_index_offset = index_offset,
                Section::Obj => self.obj_index_offset = index_offset,
                Section::Log => self.log_index_offset = index_offset,
            }
        }

        if section == Section::Ref {
            self.maybe_dump_object_index()?;
        }
        Ok(())
    }

    /// Repeatedly packs `level` into BLOCK_TYPE_INDEX blocks, producing a new,
    /// smaller level of IndexRecords describing those blocks, until the level
    /// is at most `threshold` entries. Returns the offset of the first block
    /// of the final (topmost) level built. Index levels are self-contained:
    /// unlike ref/obj/log leaf records they never feed back into one of the
    /// three section index arrays, so this bypasses `add_record_to_section`.
    fn build_index(&mut self, mut level: Vec<IndexRecord>, threshold: usize) -> Result<u64> {
        let mut top_offset = 0u64;
        while level.len() > threshold {
            let new_level = self.write_index_level(&level)?;
            top_offset = new_level[0].offset;
            level = new_level;
        }
        Ok(top_offset)
    }

    /// Packs `level` into one or more BLOCK_TYPE_INDEX blocks and returns an
    /// IndexRecord per block written (always non-empty for a non-empty input).
    fn write_index_level(&mut self, level: &[IndexRecord]) -> Result<Vec<IndexRecord>> {
        let mut out_level = Vec::new();
        let mut bw = self.start_block(BLOCK_TYPE_INDEX);

        for rec in level {
            loop {
                let added = bw.add(&mut self.buf, &Record::Index(rec.clone()))?;
                if added {
                    break;
                }
                out_level.push(self.finish_index_block(bw)?);
                bw = self.start_block(BLOCK_TYPE_INDEX);
            }
        }
        out_level.push(self.finish_index_block(bw)?);
        Ok(out_level)
    }

    fn finish_index_block(&mut self, mut bw: BlockWriter) -> Result<IndexRecord> {
        let header_off = bw.header_off() as u64;
        let last_key = bw.last_key().to_vec();
        let mut end = bw.finish(&mut self.buf);
        if !self.opts.unpadded {
            let target = header_off as usize + self.opts.block_size as usize;
            if target > end {
                self.buf.resize(target, 0);
                end = target;
            }
        }
        self.stats.index_blocks += 1;
        self.stats.bytes = end as u64;
        Ok(IndexRecord { last_key, offset: header_off })
    }

    fn maybe_dump_object_index(&mut self) -> Result<()> {
        if self.opts.skip_index_objects || self.ref_index_offset == 0 || self.obj_tree.is_empty() {
            return Ok(());
        }

        let mut max_common = 0usize;
        let mut prev: Option<&Vec<u8>> = None;
        for k in self.obj_tree.keys() {
            if let Some(p) = prev {
                max_common = max_common.max(common_prefix_size(p, k));
            }
            prev = Some(k);
        }
        let object_id_len = (max_common + 1).clamp(1, self.opts.hash_size as usize) as u8;
        self.object_id_len = object_id_len;
        self.obj_offset = self.buf.len() as u64;

        let entries: Vec<(Vec<u8>, Vec<u64>)> = self
            .obj_tree
            .iter()
            .map(|(k, v)| (k[..object_id_len as usize].to_vec(), v.clone()))
            .collect();

        for (prefix, offsets) in entries {
            let rec = Record::Obj(ObjRecord {
                hash_prefix: prefix,
                offsets,
            });
            self.add_record_to_section(rec, Section::Obj)?;
        }
        self.finish_section(Section::Obj)
    }

    // ── Close ────────────────────────────────────────────────────────────

    pub fn close(mut self) -> Result<Stats> {
        if !self.ref_section_finished {
            self.finish_section(Section::Ref)?;
            self.ref_section_finished = true;
        }
        self.finish_section(Section::Log)?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(b"REFT");
        header[4] = VERSION;
        put_u24(&mut header[5..8], self.opts.block_size);
        put_u64(&mut header[8..16], self.min_update_index);
        put_u64(&mut header[16..24], self.max_update_index);
        self.buf[0..HEADER_SIZE].copy_from_slice(&header);

        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        footer.extend_from_slice(&header);
        footer.extend_from_slice(&self.ref_index_offset.to_be_bytes());
        let packed_obj = (self.obj_offset << 5) | (self.object_id_len as u64 & 0x1f);
        footer.extend_from_slice(&packed_obj.to_be_bytes());
        footer.extend_from_slice(&self.obj_index_offset.to_be_bytes());
        footer.extend_from_slice(&self.log_offset.to_be_bytes());
        footer.extend_from_slice(&self.log_index_offset.to_be_bytes());
        debug_assert_eq!(footer.len(), FOOTER_SIZE - 4);

        let mut h = crc32fast::Hasher::new();
        h.update(&footer);
        let crc = h.finalize();
        footer.extend_from_slice(&crc.to_be_bytes());

        self.buf.extend_from_slice(&footer);
        self.stats.bytes = self.buf.len() as u64;

        self.out.write_all(&self.buf)?;
        log::debug!(
            "wrote reftable: {} bytes, {} ref blocks, {} obj blocks, {} log blocks, {} index blocks",
            self.stats.bytes, self.stats.ref_blocks, self.stats.obj_blocks, self.stats.log_blocks, self.stats.index_blocks,
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_source::BufBlockSource;
    use crate::reader::Reader;

    fn direct_ref(name: &str, idx: u64, b: u8) -> RefRecord {
        RefRecord {
            ref_name: name.into(),
            update_index: idx,
            value: RefValue::Direct { value: vec![b; 20] },
        }
    }

    #[test]
    fn write_and_reopen_small_table() {
        let mut out = Vec::new();
        {
            let mut opts = WriteOptions::default();
            opts.block_size = 256;
            let mut w = Writer::new(&mut out, opts);
            w.set_limits(1, 1);
            for i in 0..10u8 {
                let name = format!("refs/heads/branch{i:02}");
                w.add_ref(&direct_ref(&name, 1, i)).unwrap();
            }
            w.close().unwrap();
        }

        let src = BufBlockSource::new(out);
        let reader = Reader::open(Box::new(src)).unwrap();
        assert_eq!(reader.min_update_index(), 1);
        assert_eq!(reader.max_update_index(), 1);
    }

    #[test]
    fn rejects_out_of_order_refs() {
        let mut out = Vec::new();
        let mut w = Writer::new(&mut out, WriteOptions::default());
        w.set_limits(1, 1);
        w.add_ref(&direct_ref("refs/heads/b", 1, 1)).unwrap();
        assert!(w.add_ref(&direct_ref("refs/heads/a", 1, 2)).is_err());
    }
}
