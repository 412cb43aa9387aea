//! Block format v1: prefix-compressed keys, a trailing restart array for
//! binary search, and a single type tag per block.
//!
//! # On-disk layout
//!
//! ```text
//! Offset (from block start)  Size   Field
//!   0                         1     block_type   'r' 'g' 'o' 'i'
//!   1                         3     length       u24, this block's total byte count
//!   4                       ...     entries      prefix-compressed key + value, repeated
//!   length-2-3*R            3*R     restart_offsets  u24 each, offsets from block start
//!   length-2                 2     restart_count R (u16)
//! ```
//!
//! # Key codec
//! Each entry's key is `put_varint(prefix_len); put_varint(suffix_len<<3 |
//! val_type); suffix_bytes`. A "restart" entry always encodes `prefix_len =
//! 0` (a full key) so that binary search over the restart array never needs
//! to decode anything but restart entries to locate a starting point.
//!
//! # Endianness
//! All fixed-width fields are big-endian, per the reftable format (note the
//! direction — this is not the convention used elsewhere in this workspace).

use crate::basics::{common_prefix_size, get_u16, get_u24, get_u64, get_varint, put_u16, put_u24, put_varint};
use crate::error::{Error, Result};
use crate::record::Record;

/// `restart_count` is a u16 on the wire; exceeding it stops recording further
/// restart offsets but does not fail the write — later entries are still
/// admitted, just without a restart anchor of their own.
pub const MAX_RESTARTS: usize = (1 << 16) - 1;

// ── Key codec ────────────────────────────────────────────────────────────────

/// Encode `key` relative to `last_key`. Returns `true` if this entry is a
/// restart point (`prefix_len == 0`), which the caller reports to the block
/// writer's restart bookkeeping.
pub fn encode_key(out: &mut Vec<u8>, last_key: &[u8], key: &[u8], val_type: u8, force_restart: bool) -> bool {
    let prefix_len = if force_restart { 0 } else { common_prefix_size(last_key, key) };
    let suffix = &key[prefix_len..];
    put_varint(out, prefix_len as u64);
    put_varint(out, ((suffix.len() as u64) << 3) | (val_type as u64 & 0x7));
    out.extend_from_slice(suffix);
    prefix_len == 0
}

/// Decode a key relative to `last_key`. Returns `(key, val_type, bytes_consumed)`.
pub fn decode_key(data: &[u8], last_key: &[u8]) -> Result<(Vec<u8>, u8, usize)> {
    let mut pos = 0usize;
    let (prefix_len, n) = get_varint(&data[pos..])?;
    pos += n;
    let (combined, n) = get_varint(&data[pos..])?;
    pos += n;

    let prefix_len = prefix_len as usize;
    let suffix_len = (combined >> 3) as usize;
    let val_type = (combined & 0x7) as u8;

    if prefix_len > last_key.len() {
        return Err(Error::format("key prefix_len exceeds last key length"));
    }
    if data.len() < pos + suffix_len {
        return Err(Error::format("truncated key suffix"));
    }

    let mut key = Vec::with_capacity(prefix_len + suffix_len);
    key.extend_from_slice(&last_key[..prefix_len]);
    key.extend_from_slice(&data[pos..pos + suffix_len]);
    pos += suffix_len;

    Ok((key, val_type, pos))
}

// ── Block writer ─────────────────────────────────────────────────────────────

/// Packs one block of homogeneous-type records into `buf`, starting at
/// `header_off`. The caller owns `buf` across possibly many blocks (the
/// table writer reuses one growable buffer for the whole file).
pub struct BlockWriter {
    header_off: usize,
    block_type: u8,
    block_size: u32,
    restart_interval: u16,
    hash_size: u8,
    restarts: Vec<u32>,
    entries_since_restart: u16,
    last_key: Vec<u8>,
}

impl BlockWriter {
    pub fn new(
        buf: &mut Vec<u8>,
        header_off: usize,
        block_type: u8,
        block_size: u32,
        restart_interval: u16,
        hash_size: u8,
    ) -> Self {
        buf.resize(header_off + 4, 0);
        buf[header_off] = block_type;
        Self {
            header_off,
            block_type,
            block_size,
            restart_interval: restart_interval.max(1),
            hash_size,
            restarts: Vec::new(),
            entries_since_restart: 0,
            last_key: Vec::new(),
        }
    }

    pub fn block_type(&self) -> u8 {
        self.block_type
    }

    pub fn header_off(&self) -> usize {
        self.header_off
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Attempt to add `rec`. Returns `Ok(true)` on success, `Ok(false)` when
    /// the block is already full and the caller must flush and start a new
    /// one. The writer tracks the last added key for prefix compression.
    pub fn add(&mut self, buf: &mut Vec<u8>, rec: &Record) -> Result<bool> {
        let force_restart = self.restarts.is_empty()
            || (self.entries_since_restart as u32) >= self.restart_interval as u32;

        let mut entry = Vec::new();
        let is_restart = encode_key(&mut entry, &self.last_key, rec.key(), rec.val_type(), force_restart);
        rec.encode(&mut entry, self.hash_size);

        // Reserve room for one more restart slot, whether or not this entry
        // becomes one, plus the final restart count field.
        let projected = buf.len() + entry.len() + 3 * (self.restarts.len() + 1) + 2;
        if projected > self.header_off + self.block_size as usize && buf.len() > self.header_off + 4 {
            return Ok(false);
        }

        if is_restart {
            if self.restarts.len() < MAX_RESTARTS {
                self.restarts.push(buf.len() as u32);
            }
            self.entries_since_restart = 0;
        } else {
            self.entries_since_restart += 1;
        }

        buf.extend_from_slice(&entry);
        self.last_key = rec.key().to_vec();
        Ok(true)
    }

    /// Write the restart array and count, patch the length field, and
    /// return the absolute offset just past this block.
    pub fn finish(&mut self, buf: &mut Vec<u8>) -> usize {
        for &off in &self.restarts {
            let mut tmp = [0u8; 3];
            put_u24(&mut tmp, off);
            buf.extend_from_slice(&tmp);
        }
        let mut tmp = [0u8; 2];
        put_u16(&mut tmp, self.restarts.len() as u16);
        buf.extend_from_slice(&tmp);

        let length = (buf.len() - self.header_off) as u32;
        let mut len_bytes = [0u8; 3];
        put_u24(&mut len_bytes, length);
        buf[self.header_off + 1..self.header_off + 4].copy_from_slice(&len_bytes);

        buf.len()
    }
}

// ── Block reader / iterator ─────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct BlockReader<'a> {
    data: &'a [u8],
    header_off: usize,
    length: usize,
    restart_count: u16,
    restarts_off: usize,
    hash_size: u8,
}

impl<'a> BlockReader<'a> {
    pub fn new(data: &'a [u8], header_off: usize, hash_size: u8) -> Result<Self> {
        if data.len() < header_off + 4 {
            return Err(Error::format("truncated block header"));
        }
        let length = get_u24(&data[header_off + 1..header_off + 4]) as usize;
        if data.len() < header_off + length || length < 6 {
            return Err(Error::format("truncated block"));
        }
        let restart_count = get_u16(&data[header_off + length - 2..header_off + length]);
        let restarts_off = header_off + length - 2 - 3 * restart_count as usize;
        if restarts_off < header_off + 4 {
            return Err(Error::format("restart array overlaps block header"));
        }
        Ok(Self {
            data,
            header_off,
            length,
            restart_count,
            restarts_off,
            hash_size,
        })
    }

    pub fn block_type(&self) -> u8 {
        self.data[self.header_off]
    }

    pub fn restart_count(&self) -> u16 {
        self.restart_count
    }

    fn restart_entry_offset(&self, i: u16) -> usize {
        let at = self.restarts_off + 3 * i as usize;
        self.header_off + get_u24(&self.data[at..at + 3]) as usize
    }

    fn restart_key(&self, i: u16) -> Result<Vec<u8>> {
        let off = self.restart_entry_offset(i);
        let (key, _val_type, _n) = decode_key(&self.data[off..], &[])?;
        Ok(key)
    }

    /// Start iterating from the first entry in the block.
    pub fn start(&self) -> BlockIter<'a> {
        BlockIter {
            reader: *self,
            pos: self.header_off + 4,
            last_key: Vec::new(),
        }
    }

    /// Resume iterating at a raw byte position previously reported by
    /// `BlockIter::pos()`, with the key that was last decoded there. Lets a
    /// caller hold a block's bytes across calls without holding onto a
    /// borrowed iterator.
    pub(crate) fn iter_at(&self, pos: usize, last_key: Vec<u8>) -> BlockIter<'a> {
        BlockIter {
            reader: *self,
            pos,
            last_key,
        }
    }

    /// Binary search the restart array for the greatest restart whose key is
    /// `<= want_key`, then linearly scan forward to `want_key` itself.
    pub fn seek(&self, want_key: &[u8]) -> Result<BlockIter<'a>> {
        let n = self.restart_count as usize;
        let mut keys = Vec::with_capacity(n);
        for i in 0..n {
            keys.push(self.restart_key(i as u16)?);
        }
        let idx = crate::basics::binsearch(n, |i| keys[i].as_slice() > want_key);

        let (pos, last_key) = if idx == 0 {
            (self.header_off + 4, Vec::new())
        } else {
            (self.restart_entry_offset((idx - 1) as u16), Vec::new())
        };

        let mut it = BlockIter {
            reader: *self,
            pos,
            last_key,
        };
        loop {
            let save = it.clone();
            match it.next()? {
                None => return Ok(save),
                Some(rec) => {
                    if rec.key() >= want_key {
                        return Ok(save);
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct BlockIter<'a> {
    reader: BlockReader<'a>,
    pos: usize,
    last_key: Vec<u8>,
}

impl<'a> BlockIter<'a> {
    /// Raw byte offset of the next undecoded entry (or the restart array, at
    /// end of block). Paired with `last_key()`, this lets a caller resume
    /// iteration later via `BlockReader::iter_at` without borrowing `self`.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Returns `Ok(None)` at end of block.
    pub fn next(&mut self) -> Result<Option<Record>> {
        if self.pos >= self.reader.restarts_off {
            return Ok(None);
        }
        let (key, val_type, n1) = decode_key(&self.reader.data[self.pos..], &self.last_key)?;
        self.pos += n1;
        let (rec, n2) = Record::decode(
            self.reader.block_type(),
            &key,
            val_type,
            &self.reader.data[self.pos..],
            self.reader.hash_size,
        )?;
        self.pos += n2;
        self.last_key = key;
        Ok(Some(rec))
    }
}

trait RecordKeyExt {
    fn key(&self) -> &[u8];
}
impl RecordKeyExt for Record {
    fn key(&self) -> &[u8] {
        Record::key(self)
    }
}

/// Reads the `u64` footer offset field at `data[off..off+8]`. Small helper
/// shared by the table reader and stack when inspecting raw footer bytes.
pub fn read_offset_field(data: &[u8], off: usize) -> u64 {
    get_u64(&data[off..off + 8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RefRecord, RefValue};

    fn ref_rec(name: &str, b: u8) -> Record {
        Record::Ref(RefRecord {
            ref_name: name.into(),
            update_index: 0,
            value: RefValue::Direct { value: vec![b; 20] },
        })
    }

    #[test]
    fn write_read_block_of_refs() {
        let mut buf = Vec::new();
        let mut w = BlockWriter::new(&mut buf, 0, b'r', 4096, 16, 20);
        for i in 0..30u8 {
            let name = format!("branch{i:02}");
            let rec = ref_rec(&name, i);
            assert!(w.add(&mut buf, &rec).unwrap());
        }
        w.finish(&mut buf);

        let r = BlockReader::new(&buf, 0, 20).unwrap();
        let mut it = r.start();
        for i in 0..30u8 {
            let rec = it.next().unwrap().unwrap();
            let want = format!("branch{i:02}");
            assert_eq!(rec.as_ref().unwrap().ref_name, want);
        }
        assert!(it.next().unwrap().is_none());
    }

    #[test]
    fn seek_exact_and_truncated_key() {
        let mut buf = Vec::new();
        let mut w = BlockWriter::new(&mut buf, 0, b'r', 4096, 16, 20);
        for i in 0..30u8 {
            let name = format!("branch{i:02}");
            w.add(&mut buf, &ref_rec(&name, i)).unwrap();
        }
        w.finish(&mut buf);
        let r = BlockReader::new(&buf, 0, 20).unwrap();

        for i in 0..30u8 {
            let want = format!("branch{i:02}");
            let mut it = r.seek(want.as_bytes()).unwrap();
            let rec = it.next().unwrap().unwrap();
            assert_eq!(rec.as_ref().unwrap().ref_name, want);
        }
    }
}
