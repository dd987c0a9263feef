//! Core storage engines for a git object and reference database.
//!
//! Two on-disk formats live here:
//!
//! - **reftable**: a block-structured, sorted, prefix-compressed table of
//!   reference and reflog records, read through [`reftable::ReftableReader`]
//!   and stacks of tables merged newest-first.
//! - **pack chunks**: content-addressed blobs of object records in the
//!   native pack format, located through [`chunk::ChunkIndex`] and
//!   materialized (following OFS/REF delta chains) by [`store::ChunkStore`].
//!
//! Both are immutable once written; all mutation is out-of-place through
//! [`reftable::ReftableWriter`] and [`reftable::Compactor`], with the
//! caller publishing new files atomically.

pub mod chunk;
pub mod codec;
pub mod delta;
pub mod id;
pub mod inflate;
pub mod progress;
pub mod reftable;
pub mod source;
pub mod store;

pub use chunk::{ChunkIndex, ChunkKey, ChunkMeta, ChunkSource, ObjectType, PackChunk};
pub use id::ObjectId;
pub use reftable::{Compactor, Ref, ReftableReader, ReftableStack, ReftableWriter};
pub use source::{BlockSource, FileBlockSource, MemBlockSource};
pub use store::{ChunkStore, ObjectLoader, Store};

/// Maximum number of delta hops followed before a chain is rejected.
pub const MAX_DELTA_DEPTH: usize = 50;

/// Errors raised by the storage core.
///
/// Every fallible operation returns one of these; callers are expected to
/// match on variants (the chunk reader itself recovers from
/// [`Error::OversizedAllocation`] by switching to the streaming path).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("truncated input at offset {offset}: wanted {wanted} bytes, got {got}")]
    TruncatedInput {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("not a reftable (bad magic)")]
    InvalidMagic,

    #[error("bad reftable footer magic")]
    InvalidMagicFooter,

    #[error("corrupt block at {position}: {reason}")]
    CorruptBlock { position: u64, reason: String },

    #[error("footer crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CorruptCrc { stored: u32, computed: u32 },

    #[error("chunk bytes do not hash to {key}")]
    CorruptChunk { key: ChunkKey },

    #[error("missing object {0}")]
    MissingObject(ObjectId),

    #[error("delta produced {actual} bytes, declared {declared}")]
    DeltaSizeMismatch { declared: u64, actual: u64 },

    #[error("delta chain deeper than {max} levels")]
    DeltaChainTooDeep { max: usize },

    #[error("zero delta opcode at stream offset {0}")]
    DeltaOpcodeZero(usize),

    #[error("delta copy of {len} bytes at {offset} escapes base of {base_len} bytes")]
    DeltaOutOfRangeCopy {
        offset: u64,
        len: u64,
        base_len: u64,
    },

    #[error("object of {size} bytes exceeds allocation budget of {budget}")]
    OversizedAllocation { size: u64, budget: u64 },

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("unsupported format version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("block of {len} bytes exceeds block size {max}")]
    OverflowedBlock { len: u32, max: u32 },

    #[error("invalid block sequence: {0}")]
    InvalidBlockSequence(String),

    #[error("fragmented object requires the streaming path")]
    FragmentedObjectNotSupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A fully materialized small object: its type and inflated bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub obj_type: ObjectType,
    pub data: bytes::Bytes,
}
