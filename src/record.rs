//! Record taxonomy: `RefRecord`, `LogRecord`, `ObjRecord`, `IndexRecord`.
//!
//! The C source dispatches these through a `record_vtable` of function
//! pointers. There is no cycle and no shared mutable state between variants,
//! so a single tagged enum replaces the vtable outright — each arm owns its
//! fields directly instead of boxing a trait object.
//!
//! `update_index` fields here are always the value actually written to or
//! read from the wire, i.e. *relative* to the containing file's
//! `min_update_index`. Converting to/from the absolute update index a
//! caller sees is the table writer's and table reader's job, not this
//! module's — mirrors the split between `record_encode`/`record_decode` and
//! `writer_add_ref`/`table_iter_next_in_block` in the source.

use crate::basics::{get_varint, put_varint};
use crate::error::{Error, Result};

pub const BLOCK_TYPE_REF: u8 = b'r';
pub const BLOCK_TYPE_OBJ: u8 = b'o';
pub const BLOCK_TYPE_LOG: u8 = b'g';
pub const BLOCK_TYPE_INDEX: u8 = b'i';

// ── Ref ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Deletion,
    Direct { value: Vec<u8> },
    Annotated { value: Vec<u8>, target_value: Vec<u8> },
    Symbolic { target: String },
}

impl RefValue {
    pub fn val_type(&self) -> u8 {
        match self {
            RefValue::Deletion => 0,
            RefValue::Direct { .. } => 1,
            RefValue::Annotated { .. } => 2,
            RefValue::Symbolic { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub ref_name: String,
    /// Relative to the containing file's `min_update_index` on the wire.
    pub update_index: u64,
    pub value: RefValue,
}

impl RefRecord {
    pub fn is_deletion(&self) -> bool {
        matches!(self.value, RefValue::Deletion)
    }

    fn encode(&self, out: &mut Vec<u8>, hash_size: u8) {
        put_varint(out, self.update_index);
        match &self.value {
            RefValue::Deletion => {}
            RefValue::Direct { value } => {
                debug_assert_eq!(value.len(), hash_size as usize);
                out.extend_from_slice(value);
            }
            RefValue::Annotated { value, target_value } => {
                debug_assert_eq!(value.len(), hash_size as usize);
                debug_assert_eq!(target_value.len(), hash_size as usize);
                out.extend_from_slice(value);
                out.extend_from_slice(target_value);
            }
            RefValue::Symbolic { target } => {
                put_varint(out, target.len() as u64);
                out.extend_from_slice(target.as_bytes());
            }
        }
    }

    fn decode(ref_name: &[u8], val_type: u8, data: &[u8], hash_size: u8) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let (update_index, n) = get_varint(&data[pos..])?;
        pos += n;

        let hs = hash_size as usize;
        let value = match val_type {
            0 => RefValue::Deletion,
            1 => {
                if data.len() < pos + hs {
                    return Err(Error::format("truncated ref record value"));
                }
                let value = data[pos..pos + hs].to_vec();
                pos += hs;
                RefValue::Direct { value }
            }
            2 => {
                if data.len() < pos + 2 * hs {
                    return Err(Error::format("truncated ref record value"));
                }
                let value = data[pos..pos + hs].to_vec();
                pos += hs;
                let target_value = data[pos..pos + hs].to_vec();
                pos += hs;
                RefValue::Annotated { value, target_value }
            }
            3 => {
                let (len, n) = get_varint(&data[pos..])?;
                pos += n;
                let len = len as usize;
                if data.len() < pos + len {
                    return Err(Error::format("truncated ref record target"));
                }
                let target = String::from_utf8(data[pos..pos + len].to_vec())
                    .map_err(|_| Error::format("ref target is not valid utf8"))?;
                pos += len;
                RefValue::Symbolic { target }
            }
            other => return Err(Error::format(format!("unknown ref val_type {other}"))),
        };

        let ref_name = String::from_utf8(ref_name.to_vec())
            .map_err(|_| Error::format("ref name is not valid utf8"))?;
        Ok((
            RefRecord {
                ref_name,
                update_index,
                value,
            },
            pos,
        ))
    }
}

// ── Log ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ref_name: String,
    pub update_index: u64,
    pub old_hash: Vec<u8>,
    pub new_hash: Vec<u8>,
    pub name: String,
    pub email: String,
    pub time: u64,
    pub tz_offset: i16,
    pub message: String,
}

impl LogRecord {
    fn encode(&self, out: &mut Vec<u8>, hash_size: u8) {
        let hs = hash_size as usize;
        debug_assert_eq!(self.old_hash.len(), hs);
        debug_assert_eq!(self.new_hash.len(), hs);

        put_varint(out, self.update_index);
        out.extend_from_slice(&self.old_hash);
        out.extend_from_slice(&self.new_hash);
        put_varint(out, self.name.len() as u64);
        out.extend_from_slice(self.name.as_bytes());
        put_varint(out, self.email.len() as u64);
        out.extend_from_slice(self.email.as_bytes());
        put_varint(out, self.message.len() as u64);
        out.extend_from_slice(self.message.as_bytes());
        put_varint(out, self.time);
        out.extend_from_slice(&self.tz_offset.to_be_bytes());
    }

    fn decode(ref_name: &[u8], data: &[u8], hash_size: u8) -> Result<(Self, usize)> {
        let hs = hash_size as usize;
        let mut pos = 0usize;

        let (update_index, n) = get_varint(&data[pos..])?;
        pos += n;

        if data.len() < pos + 2 * hs {
            return Err(Error::format("truncated log record hashes"));
        }
        let old_hash = data[pos..pos + hs].to_vec();
        pos += hs;
        let new_hash = data[pos..pos + hs].to_vec();
        pos += hs;

        let read_str = |data: &[u8], pos: &mut usize| -> Result<String> {
            let (len, n) = get_varint(&data[*pos..])?;
            *pos += n;
            let len = len as usize;
            if data.len() < *pos + len {
                return Err(Error::format("truncated log record string"));
            }
            let s = String::from_utf8(data[*pos..*pos + len].to_vec())
                .map_err(|_| Error::format("log record field is not valid utf8"))?;
            *pos += len;
            Ok(s)
        };

        let name = read_str(data, &mut pos)?;
        let email = read_str(data, &mut pos)?;
        let message = read_str(data, &mut pos)?;

        let (time, n) = get_varint(&data[pos..])?;
        pos += n;

        if data.len() < pos + 2 {
            return Err(Error::format("truncated log record tz_offset"));
        }
        let tz_offset = i16::from_be_bytes([data[pos], data[pos + 1]]);
        pos += 2;

        let ref_name = String::from_utf8(ref_name.to_vec())
            .map_err(|_| Error::format("ref name is not valid utf8"))?;

        Ok((
            LogRecord {
                ref_name,
                update_index,
                old_hash,
                new_hash,
                name,
                email,
                time,
                tz_offset,
                message,
            },
            pos,
        ))
    }
}

// ── Obj ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjRecord {
    pub hash_prefix: Vec<u8>,
    /// Strictly increasing file offsets of ref blocks mentioning this hash.
    pub offsets: Vec<u64>,
}

impl ObjRecord {
    /// `val_type` doubles as `offset_len` when it fits in 3 bits (the C
    /// source's space trick, preserved here rather than "cleaned up" since
    /// it is a real on-wire size optimization): if `offsets.len() < 8`, the
    /// count is smuggled into `val_type` itself and no length varint
    /// precedes the offsets; otherwise `val_type == 0` and a varint(len)
    /// comes first.
    fn val_type(&self) -> u8 {
        let len = self.offsets.len();
        if len < 8 {
            len as u8
        } else {
            0
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let len = self.offsets.len();
        if len == 0 || len >= 8 {
            put_varint(out, len as u64);
        }
        if let Some(first) = self.offsets.first() {
            put_varint(out, *first);
            for i in 1..self.offsets.len() {
                put_varint(out, self.offsets[i] - self.offsets[i - 1]);
            }
        }
    }

    fn decode(hash_prefix: &[u8], val_type: u8, data: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let offset_len = if val_type == 0 {
            let (v, n) = get_varint(&data[pos..])?;
            pos += n;
            v as usize
        } else {
            val_type as usize
        };

        let mut offsets = Vec::with_capacity(offset_len);
        if offset_len > 0 {
            let (first, n) = get_varint(&data[pos..])?;
            pos += n;
            offsets.push(first);
            for _ in 1..offset_len {
                let (delta, n) = get_varint(&data[pos..])?;
                pos += n;
                offsets.push(offsets.last().unwrap() + delta);
            }
        }

        Ok((
            ObjRecord {
                hash_prefix: hash_prefix.to_vec(),
                offsets,
            },
            pos,
        ))
    }
}

// ── Index ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub last_key: Vec<u8>,
    pub offset: u64,
}

impl IndexRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.offset);
    }

    fn decode(last_key: &[u8], data: &[u8]) -> Result<(Self, usize)> {
        let (offset, n) = get_varint(data)?;
        Ok((
            IndexRecord {
                last_key: last_key.to_vec(),
                offset,
            },
            n,
        ))
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Ref(RefRecord),
    Log(LogRecord),
    Obj(ObjRecord),
    Index(IndexRecord),
}

impl Record {
    pub fn block_type(&self) -> u8 {
        match self {
            Record::Ref(_) => BLOCK_TYPE_REF,
            Record::Log(_) => BLOCK_TYPE_LOG,
            Record::Obj(_) => BLOCK_TYPE_OBJ,
            Record::Index(_) => BLOCK_TYPE_INDEX,
        }
    }

    /// The key used for ordering within a section: `ref_name`/`ref_name` for
    /// Ref/Log, `hash_prefix` for Obj, `last_key` for Index.
    pub fn key(&self) -> &[u8] {
        match self {
            Record::Ref(r) => r.ref_name.as_bytes(),
            Record::Log(l) => l.ref_name.as_bytes(),
            Record::Obj(o) => &o.hash_prefix,
            Record::Index(i) => &i.last_key,
        }
    }

    pub fn val_type(&self) -> u8 {
        match self {
            Record::Ref(r) => r.value.val_type(),
            Record::Log(_) => 0,
            Record::Obj(o) => o.val_type(),
            Record::Index(_) => 0,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>, hash_size: u8) {
        match self {
            Record::Ref(r) => r.encode(out, hash_size),
            Record::Log(l) => l.encode(out, hash_size),
            Record::Obj(o) => o.encode(out),
            Record::Index(i) => i.encode(out),
        }
    }

    /// Decode the value bytes following a key already parsed by the block
    /// codec. `key` and `val_type` come from the key codec; `data` is
    /// positioned at the start of the value. Returns the decoded record and
    /// the number of bytes of `data` consumed.
    pub fn decode(
        block_type: u8,
        key: &[u8],
        val_type: u8,
        data: &[u8],
        hash_size: u8,
    ) -> Result<(Self, usize)> {
        match block_type {
            BLOCK_TYPE_REF => {
                let (r, n) = RefRecord::decode(key, val_type, data, hash_size)?;
                Ok((Record::Ref(r), n))
            }
            BLOCK_TYPE_LOG => {
                let (l, n) = LogRecord::decode(key, data, hash_size)?;
                Ok((Record::Log(l), n))
            }
            BLOCK_TYPE_OBJ => {
                let (o, n) = ObjRecord::decode(key, val_type, data)?;
                Ok((Record::Obj(o), n))
            }
            BLOCK_TYPE_INDEX => {
                let (i, n) = IndexRecord::decode(key, data)?;
                Ok((Record::Index(i), n))
            }
            other => Err(Error::format(format!("unknown block type {other:#x}"))),
        }
    }

    pub fn as_ref(&self) -> Option<&RefRecord> {
        match self {
            Record::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_log(&self) -> Option<&LogRecord> {
        match self {
            Record::Log(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&ObjRecord> {
        match self {
            Record::Obj(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&IndexRecord> {
        match self {
            Record::Index(i) => Some(i),
            _ => None,
        }
    }
}
