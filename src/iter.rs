//! Iterator composition that sits above a raw section scan: a filtering
//! wrapper that re-seeks and compares to double-check a resolved value (used
//! when following `refs_for` style lookups), and an indexed iterator that
//! walks a caller-supplied list of ref-section block offsets (the object
//! index's payload) instead of a contiguous section range.

use crate::error::Result;
use crate::merged::MergedTables;
use crate::reader::Reader;
use crate::record::{RefRecord, RefValue};

/// Walks a caller-supplied list of ref-section block offsets, yielding every
/// record in each block in turn. Used to drive the object index's offset
/// list: `obj_offsets_for` only narrows a lookup down to candidate blocks,
/// not individual records, so each block is scanned in full.
pub struct IndexedTableRefIter<'a> {
    reader: &'a Reader,
    offsets: Vec<u64>,
    next_offset_idx: usize,
    block: Option<crate::block_source::Block>,
    pos: usize,
    last_key: Vec<u8>,
}

impl<'a> IndexedTableRefIter<'a> {
    pub fn new(reader: &'a Reader, offsets: Vec<u64>) -> Self {
        Self {
            reader,
            offsets,
            next_offset_idx: 0,
            block: None,
            pos: 0,
            last_key: Vec::new(),
        }
    }

    fn load_next_block(&mut self) -> Result<bool> {
        if self.next_offset_idx >= self.offsets.len() {
            return Ok(false);
        }
        let off = self.offsets[self.next_offset_idx];
        self.next_offset_idx += 1;
        self.block = Some(self.reader.ref_block_at(off)?);
        self.pos = 4; // just past the 4-byte block header
        self.last_key = Vec::new();
        Ok(true)
    }

    pub fn next(&mut self) -> Result<Option<RefRecord>> {
        loop {
            if let Some(block) = &self.block {
                let br = self.reader.new_block_reader(block)?;
                let prev_key = std::mem::take(&mut self.last_key);
                let mut it = br.iter_at(self.pos, prev_key);
                match it.next()? {
                    Some(rec) => {
                        self.pos = it.pos();
                        self.last_key = it.last_key().to_vec();
                        if let Some(r) = rec.as_ref() {
                            return Ok(Some(r.clone()));
                        }
                        return Err(crate::error::Error::format("non-ref record in ref block"));
                    }
                    None => {
                        self.block = None;
                    }
                }
            }
            if !self.load_next_block()? {
                return Ok(None);
            }
        }
    }
}

/// Filters an `IndexedTableRefIter` down to records whose resolved value
/// actually matches `oid`, re-seeking through the full stack to double-check
/// a candidate when `double_check` is set. Mirrors
/// `filtering_ref_iterator`'s `double_check` mode: the object index's
/// truncated hash prefix can alias unrelated objects, so a match against the
/// raw block scan is only a candidate until confirmed.
pub struct FilteringRefIter<'a> {
    inner: IndexedTableRefIter<'a>,
    oid: Vec<u8>,
    double_check: Option<&'a MergedTables<'a>>,
}

impl<'a> FilteringRefIter<'a> {
    pub fn new(inner: IndexedTableRefIter<'a>, oid: Vec<u8>, double_check: Option<&'a MergedTables<'a>>) -> Self {
        Self { inner, oid, double_check }
    }

    fn matches(&self, rec: &RefRecord) -> bool {
        match &rec.value {
            RefValue::Direct { value } => value == &self.oid,
            RefValue::Annotated { value, target_value } => value == &self.oid || target_value == &self.oid,
            RefValue::Deletion | RefValue::Symbolic { .. } => false,
        }
    }

    pub fn next(&mut self) -> Result<Option<RefRecord>> {
        loop {
            let rec = match self.inner.next()? {
                Some(r) => r,
                None => return Ok(None),
            };
            if !self.matches(&rec) {
                continue;
            }
            if let Some(stack) = self.double_check {
                match stack.resolve(&rec.ref_name, 8)? {
                    Some(cur) if self.matches(&cur) => return Ok(Some(cur)),
                    _ => continue,
                }
            }
            return Ok(Some(rec));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_source::BufBlockSource;
    use crate::options::WriteOptions;
    use crate::writer::Writer;

    fn build_table() -> (Vec<u8>, Vec<u8>) {
        let target = vec![7u8; 20];
        let mut out = Vec::new();
        let mut w = Writer::new(&mut out, WriteOptions::default());
        w.set_limits(1, 1);
        w.add_ref(&RefRecord {
            ref_name: "refs/heads/a".into(),
            update_index: 1,
            value: RefValue::Direct { value: vec![1; 20] },
        })
        .unwrap();
        w.add_ref(&RefRecord {
            ref_name: "refs/heads/b".into(),
            update_index: 1,
            value: RefValue::Direct { value: target.clone() },
        })
        .unwrap();
        w.close().unwrap();
        (out, target)
    }

    #[test]
    fn indexed_iter_finds_ref_via_object_offsets() {
        let (data, target) = build_table();
        let reader = Reader::open(Box::new(BufBlockSource::new(data))).unwrap();
        let offsets = reader.obj_offsets_for(&target).unwrap();
        assert!(!offsets.is_empty());

        let mut it = IndexedTableRefIter::new(&reader, offsets);
        let mut found = false;
        while let Some(rec) = it.next().unwrap() {
            if rec.ref_name == "refs/heads/b" {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn filtering_iter_rejects_non_matching_refs() {
        let (data, target) = build_table();
        let reader = Reader::open(Box::new(BufBlockSource::new(data))).unwrap();
        let offsets = reader.obj_offsets_for(&target).unwrap();
        let inner = IndexedTableRefIter::new(&reader, offsets);
        let mut it = FilteringRefIter::new(inner, target, None);
        let rec = it.next().unwrap().unwrap();
        assert_eq!(rec.ref_name, "refs/heads/b");
        assert!(it.next().unwrap().is_none());
    }
}
