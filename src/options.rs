//! Writer/reader configuration.
//!
//! The C source scatters these as loose fields assigned ad hoc at each call
//! site, with defaults that differ depending on whether a caller goes
//! through the header-declared struct or a hand-rolled code path. This
//! collects them into one configuration struct per direction, constructed
//! once and passed down, matching the canonical defaults spelled out by the
//! design notes rather than either of the source's two diverging paths.

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_RESTART_INTERVAL: u16 = 16;
pub const DEFAULT_HASH_SIZE: u8 = 20; // SHA-1 digest length

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Target size of a packed block, in bytes. Blocks are padded to this
    /// size unless `unpadded` is set or the block is a log block.
    pub block_size: u32,
    /// Cadence at which a full (unprefixed) key is written as a restart
    /// point for binary search.
    pub restart_interval: u16,
    /// Skip padding ref/obj blocks out to `block_size`. Log blocks are never
    /// padded regardless of this flag.
    pub unpadded: bool,
    /// Do not build or emit the object-id index, even if ref records were
    /// written.
    pub skip_index_objects: bool,
    /// Length in bytes of the opaque hash digests stored in ref/obj/log
    /// records. 20 for SHA-1, 32 for SHA-256. The engine never interprets
    /// the bytes themselves.
    pub hash_size: u8,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            unpadded: false,
            skip_index_objects: false,
            hash_size: DEFAULT_HASH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Block size hint used when a footer fails to specify one (should not
    /// happen for a valid file, but guards a zero `block_size` field).
    pub default_block_size: Option<u32>,
}
