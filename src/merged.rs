//! Merges the ref (or log) sections of a stack of tables into one sorted,
//! de-duplicated stream: when several tables define the same key, the entry
//! from the table with the highest stack index wins and the rest are
//! dropped, including deletions (a deletion at a higher index shadows a
//! direct value below it, so the merged view never resurrects a deleted
//! ref).
//!
//! This mirrors the source's `merged_iter` exactly in spirit: a min-heap
//! keyed on `(key, reverse(table_index))` so that of several equal keys the
//! highest index sorts first, then a drain loop that discards the rest of
//! the run. The one place this deliberately does not follow the source: the
//! priority-queue comparator in the original has no surviving body in the
//! retrieval pack (`pq.c` was not present, only the `pq.h` declaration), so
//! the heap ordering here is derived straight from this module's own
//! drain-loop contract rather than ported line for line.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::reader::{Reader, SectionIter};
use crate::record::{LogRecord, Record, RefRecord};

enum Kind<'a> {
    Ref(SectionIter<'a>),
    Log(SectionIter<'a>),
}

impl<'a> Kind<'a> {
    fn next(&mut self) -> Result<Option<Record>> {
        match self {
            Kind::Ref(it) => it.next_record(),
            Kind::Log(it) => it.next_record(),
        }
    }
}

struct HeapEntry {
    key: Vec<u8>,
    table_index: usize,
    rec: Record,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.table_index == other.table_index
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    /// `BinaryHeap` is a max-heap; reversing both comparisons makes `pop()`
    /// return the smallest key, and among equal keys the highest
    /// `table_index` (the newest table, which should shadow older ones).
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| self.table_index.cmp(&other.table_index))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges one ref/log section across an ordered slice of readers (lowest
/// stack index first, i.e. oldest table first — matching `stack_init`'s
/// convention of appending new tables at the end).
pub struct MergedIter<'a> {
    heap: BinaryHeap<HeapEntry>,
    sources: Vec<Kind<'a>>,
    include_deletions: bool,
}

impl<'a> MergedIter<'a> {
    fn new(mut sources: Vec<Kind<'a>>, include_deletions: bool) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (i, src) in sources.iter_mut().enumerate() {
            if let Some(rec) = src.next()? {
                heap.push(HeapEntry {
                    key: rec.key().to_vec(),
                    table_index: i,
                    rec,
                });
            }
        }
        Ok(Self { heap, sources, include_deletions })
    }

    fn refill(&mut self, table_index: usize) -> Result<()> {
        if let Some(rec) = self.sources[table_index].next()? {
            self.heap.push(HeapEntry {
                key: rec.key().to_vec(),
                table_index,
                rec,
            });
        }
        Ok(())
    }

    /// Returns the next surviving record, skipping shadowed duplicates and
    /// (unless `include_deletions`) deletion tombstones.
    fn next_raw(&mut self) -> Result<Option<Record>> {
        loop {
            let winner = match self.heap.pop() {
                Some(e) => e,
                None => return Ok(None),
            };

            // Drain every other entry sharing this key; each belongs to an
            // older table and is shadowed by `winner`.
            while let Some(top) = self.heap.peek() {
                if top.key != winner.key {
                    break;
                }
                let shadowed = self.heap.pop().unwrap();
                self.refill(shadowed.table_index)?;
            }
            self.refill(winner.table_index)?;

            if !self.include_deletions {
                if let Record::Ref(r) = &winner.rec {
                    if r.is_deletion() {
                        continue;
                    }
                }
            }
            return Ok(Some(winner.rec));
        }
    }

    pub fn next_ref(&mut self) -> Result<Option<RefRecord>> {
        match self.next_raw()? {
            Some(Record::Ref(r)) => Ok(Some(r)),
            Some(_) => Err(crate::error::Error::format("expected ref record in merged ref iterator")),
            None => Ok(None),
        }
    }

    pub fn next_log(&mut self) -> Result<Option<LogRecord>> {
        match self.next_raw()? {
            Some(Record::Log(l)) => Ok(Some(l)),
            Some(_) => Err(crate::error::Error::format("expected log record in merged log iterator")),
            None => Ok(None),
        }
    }
}

/// A stack of tables, ordered oldest-first, ready to be queried as one
/// logical reference database.
pub struct MergedTables<'a> {
    readers: &'a [Reader],
}

impl<'a> MergedTables<'a> {
    /// Validates the non-overlap invariant the source enforces in
    /// `merged_table_from_stack`: table `i`'s `max_update_index` must be
    /// strictly less than table `i+1`'s `min_update_index`.
    pub fn new(readers: &'a [Reader]) -> Result<Self> {
        for w in readers.windows(2) {
            if w[0].max_update_index() >= w[1].min_update_index() {
                return Err(crate::error::Error::format(
                    "stacked tables must have strictly increasing, non-overlapping update_index ranges",
                ));
            }
        }
        Ok(Self { readers })
    }

    pub fn seek_ref(&self, name: &str) -> Result<MergedIter<'_>> {
        let mut sources = Vec::with_capacity(self.readers.len());
        for r in self.readers {
            sources.push(Kind::Ref(r.seek_ref(name)?));
        }
        MergedIter::new(sources, false)
    }

    /// As `seek_ref`, but yields deletion tombstones instead of filtering
    /// them out. Used by compaction, which must see a shadowing deletion to
    /// decide whether to carry it into the compacted table (spec: elided
    /// only when the compacted range starts at the base of the stack).
    pub fn seek_ref_with_deletions(&self, name: &str) -> Result<MergedIter<'_>> {
        let mut sources = Vec::with_capacity(self.readers.len());
        for r in self.readers {
            sources.push(Kind::Ref(r.seek_ref(name)?));
        }
        MergedIter::new(sources, true)
    }

    pub fn seek_log(&self, name: &str) -> Result<MergedIter<'_>> {
        let mut sources = Vec::with_capacity(self.readers.len());
        for r in self.readers {
            sources.push(Kind::Log(r.seek_log(name)?));
        }
        // Log entries are timestamped history, not a point-in-time map,
        // and reftable log records are never deletions; nothing to filter.
        MergedIter::new(sources, true)
    }

    /// Resolves a ref through the full shadowing stack and follows a
    /// symbolic target at most `max_depth` hops, matching
    /// `refs_resolve`'s loop-guard in the source.
    pub fn resolve(&self, name: &str, max_depth: usize) -> Result<Option<RefRecord>> {
        let mut cur = name.to_string();
        for _ in 0..max_depth {
            let mut it = self.seek_ref(&cur)?;
            let rec = match it.next_ref()? {
                Some(r) if r.ref_name == cur => r,
                _ => return Ok(None),
            };
            match &rec.value {
                crate::record::RefValue::Symbolic { target } => cur = target.clone(),
                _ => return Ok(Some(rec)),
            }
        }
        Err(crate::error::Error::format(format!("symbolic ref cycle following {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_source::BufBlockSource;
    use crate::options::WriteOptions;
    use crate::record::RefValue;
    use crate::writer::Writer;

    fn table_with(min: u64, max: u64, refs: &[(&str, RefValue)]) -> Reader {
        let mut out = Vec::new();
        let mut w = Writer::new(&mut out, WriteOptions::default());
        w.set_limits(min, max);
        for (name, value) in refs {
            w.add_ref(&RefRecord {
                ref_name: (*name).into(),
                update_index: min,
                value: value.clone(),
            })
            .unwrap();
        }
        w.close().unwrap();
        Reader::open(Box::new(BufBlockSource::new(out))).unwrap()
    }

    #[test]
    fn newer_table_shadows_older() {
        let r1 = table_with(1, 1, &[("refs/heads/main", RefValue::Direct { value: vec![1; 20] })]);
        let r2 = table_with(2, 2, &[("refs/heads/main", RefValue::Direct { value: vec![2; 20] })]);
        let stack = [r1, r2];
        let merged = MergedTables::new(&stack).unwrap();

        let mut it = merged.seek_ref("refs/heads/main").unwrap();
        let rec = it.next_ref().unwrap().unwrap();
        assert_eq!(rec.value, RefValue::Direct { value: vec![2; 20] });
        assert!(it.next_ref().unwrap().is_none());
    }

    #[test]
    fn deletion_shadows_and_is_hidden() {
        let r1 = table_with(1, 1, &[("refs/heads/main", RefValue::Direct { value: vec![1; 20] })]);
        let r2 = table_with(2, 2, &[("refs/heads/main", RefValue::Deletion)]);
        let stack = [r1, r2];
        let merged = MergedTables::new(&stack).unwrap();

        let mut it = merged.seek_ref("refs/heads/main").unwrap();
        assert!(it.next_ref().unwrap().is_none());
    }

    #[test]
    fn rejects_overlapping_update_index_ranges() {
        let r1 = table_with(1, 5, &[("a", RefValue::Direct { value: vec![1; 20] })]);
        let r2 = table_with(4, 6, &[("b", RefValue::Direct { value: vec![2; 20] })]);
        let stack = [r1, r2];
        assert!(MergedTables::new(&stack).is_err());
    }
}
