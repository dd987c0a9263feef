//! Reftable: block-structured, sorted, prefix-compressed tables of
//! reference and reflog records.
//!
//! A file is laid out as
//!
//! ```text
//! +--------+-----------+-----------+-----------+------------+--------+
//! | header | ref block+| obj block*| log block*| index blk* | footer |
//! +--------+-----------+-----------+-----------+------------+--------+
//! ```
//!
//! - header (8 bytes): `0x01 'R' 'E' 'F' <version> <block size u24>`
//! - every block starts with a 4-byte `(type << 24) | length` descriptor;
//!   index blocks may set the top bit and use a 31-bit length
//! - footer (16 bytes): `'R' 'F'`, min update index (u48), update-index
//!   span (u32), CRC-32 over the header plus the first 12 footer bytes
//!
//! Tables are immutable once written. Mutation happens by writing a new
//! table ([`ReftableWriter`]) or collapsing a stack of them
//! ([`Compactor`]) and publishing the result atomically.

mod block;
mod compactor;
mod merged;
mod reader;
mod writer;

pub use compactor::{CompactionStats, Compactor};
pub use merged::{MergedLogCursor, MergedRefCursor, ReftableStack};
pub use reader::{LogCursor, RefCursor, ReftableReader};
pub use writer::{ReftableWriter, WriterStats};

use crate::id::ObjectId;
use crate::{Error, Result};

/// First four bytes of every reftable file.
pub const FILE_MAGIC: [u8; 4] = [0x01, b'R', b'E', b'F'];

/// The only format version understood by this crate.
pub const VERSION_1: u8 = 0x01;

/// Total size of the file header.
pub const FILE_HEADER_LEN: usize = 8;

/// Total size of the file footer.
pub const FOOTER_LEN: usize = 16;

/// First two bytes of the footer.
pub const FOOTER_MAGIC: [u8; 2] = [b'R', b'F'];

pub const BLOCK_TYPE_REF: u8 = b'r';
pub const BLOCK_TYPE_OBJ: u8 = b'o';
pub const BLOCK_TYPE_LOG: u8 = b'g';
pub const BLOCK_TYPE_INDEX: u8 = b'i';

/// Ref value types, carried in the low 3 bits of the prefix varint.
pub const VALUE_DELETE: u8 = 0;
pub const VALUE_1ID: u8 = 1;
pub const VALUE_2ID: u8 = 2;
pub const VALUE_SYMBOLIC: u8 = 3;

/// Log entries reuse value type 1 for ordinary data.
pub const VALUE_LOG_DATA: u8 = 1;

/// Largest ref/obj/log block the format can describe (24-bit length).
pub const MAX_BLOCK_LEN: u32 = 1 << 24;

/// Largest index block (31-bit length with the index flag bit set).
pub const MAX_INDEX_LEN: u32 = 1 << 31;

/// A section gets an index block only when it spans more than this many
/// blocks; smaller sections are cheap enough to binary-search directly.
pub const INDEX_SECTION_THRESHOLD: usize = 4;

/// Largest update index the footer can record (48 bits on disk).
pub const MAX_ON_DISK_UPDATE_INDEX: u64 = (1 << 48) - 1;

/// A named reference.
///
/// Names are non-empty UTF-8 and sort byte-lexicographically within a
/// table. A tombstone (`Unpeeled` with no target) shadows any older entry
/// of the same name further down a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// Points at an object that has not been peeled (or deleted, when
    /// `target` is `None`).
    Unpeeled {
        name: String,
        target: Option<ObjectId>,
    },
    /// Points directly at a non-tag object.
    PeeledNonTag { name: String, target: ObjectId },
    /// Points at an annotated tag, with the commit the tag peels to.
    PeeledTag {
        name: String,
        target: ObjectId,
        peeled: ObjectId,
    },
    /// Points at another ref by name, never by address.
    Symbolic { name: String, target_name: String },
}

impl Ref {
    /// A deletion marker for `name`.
    pub fn tombstone(name: impl Into<String>) -> Self {
        Ref::Unpeeled {
            name: name.into(),
            target: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Ref::Unpeeled { name, .. }
            | Ref::PeeledNonTag { name, .. }
            | Ref::PeeledTag { name, .. }
            | Ref::Symbolic { name, .. } => name,
        }
    }

    /// The object this ref points at, if it points at one directly.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Ref::Unpeeled { target, .. } => target.as_ref(),
            Ref::PeeledNonTag { target, .. } | Ref::PeeledTag { target, .. } => Some(target),
            Ref::Symbolic { .. } => None,
        }
    }

    /// For annotated tags, the commit the tag object peels to.
    pub fn peeled_id(&self) -> Option<&ObjectId> {
        match self {
            Ref::PeeledTag { peeled, .. } => Some(peeled),
            _ => None,
        }
    }

    /// For symbolic refs, the name of the ref they resolve through.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Ref::Symbolic { target_name, .. } => Some(target_name),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Ref::Unpeeled { target: None, .. })
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Ref::Symbolic { .. })
    }

    pub fn is_peeled(&self) -> bool {
        matches!(self, Ref::PeeledNonTag { .. } | Ref::PeeledTag { .. })
    }
}

/// Who performed a reference update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committer {
    pub name: String,
    pub email: String,
    /// Seconds since the unix epoch.
    pub time_secs: u64,
    /// Offset from UTC in minutes.
    pub tz_offset_mins: i16,
}

/// One reflog record.
///
/// Within a table, entries sort by (name ascending, reverse update index
/// ascending), so the newest update of a ref is read first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub name: String,
    pub update_index: u64,
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub committer: Committer,
    pub message: String,
}

/// On-disk key of a log entry: name, NUL, reversed update index.
pub(crate) fn log_key(name: &str, update_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 9);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(&(u64::MAX - update_index).to_be_bytes());
    key
}

/// Key that sorts at the newest possible entry for `name`.
pub(crate) fn log_key_first(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

pub(crate) fn parse_log_key(key: &[u8]) -> Result<(String, u64)> {
    let nul = key
        .iter()
        .position(|b| *b == 0)
        .filter(|n| key.len() == n + 9)
        .ok_or_else(|| Error::CorruptBlock {
            position: 0,
            reason: "malformed log key".into(),
        })?;
    let name = std::str::from_utf8(&key[..nul])
        .map_err(|_| Error::CorruptBlock {
            position: 0,
            reason: "log key name is not UTF-8".into(),
        })?
        .to_owned();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[nul + 1..]);
    Ok((name, u64::MAX - u64::from_be_bytes(raw)))
}

/// Tunables for writing tables.
#[derive(Debug, Clone)]
pub struct ReftableConfig {
    /// Target on-disk block size. Must stay below 2^24; the default is
    /// 4 KiB.
    pub block_size: u32,
    /// A full key is stored (and a restart point recorded) every this
    /// many entries.
    pub restart_interval: u16,
    /// Emit object blocks for reverse (id -> ref) lookup alongside a ref
    /// index.
    pub index_objects: bool,
}

impl Default for ReftableConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            restart_interval: 16,
            index_objects: true,
        }
    }
}

impl ReftableConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.block_size < 64 || self.block_size >= MAX_BLOCK_LEN {
            return Err(Error::InvariantViolated(format!(
                "block size {} out of range",
                self.block_size
            )));
        }
        if self.restart_interval == 0 {
            return Err(Error::InvariantViolated(
                "restart interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
