//! Content-addressed pack chunks and their object indexes.
//!
//! A chunk is a self-contained blob of object records in the native pack
//! format, named by the SHA-1 of its raw bytes. A separate
//! [`ChunkIndex`] maps object ids to record offsets; optional
//! [`ChunkMeta`] describes base-chunk windows for cross-chunk OFS deltas
//! and continuation fragments for objects split across chunks.

mod cache;
mod reader;

pub use cache::DeltaBaseCache;
pub use reader::{ChunkReaderOptions, ObjectStream};
pub(crate) use reader::ObjectReader;

use crate::codec::{put_u32_be, ByteReader};
use crate::id::{ObjectId, ID_LEN};
use crate::{Error, Result};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::fmt::{Debug, Display};
use std::sync::Arc;

/// Magic of a serialized chunk index.
pub const INDEX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];

/// Only version 2 indexes are written or understood.
pub const INDEX_VERSION: u32 = 2;

/// Identity of a chunk: the SHA-1 over its raw bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey(pub ObjectId);

impl Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkKey<{}>", self.0)
    }
}

/// Object types storable in a chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectType {
    pub fn code(self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        }
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tag => write!(f, "tag"),
        }
    }
}

/// Record types as encoded in object headers.
///
/// Types 1 through 4 carry whole objects; 6 and 7 are deltas. Type 0 is
/// invalid and type 5 is reserved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecordType {
    Whole(ObjectType),
    OfsDelta,
    RefDelta,
}

impl RecordType {
    pub fn from_code(code: u8, position: u64) -> Result<Self> {
        match code {
            1 => Ok(RecordType::Whole(ObjectType::Commit)),
            2 => Ok(RecordType::Whole(ObjectType::Tree)),
            3 => Ok(RecordType::Whole(ObjectType::Blob)),
            4 => Ok(RecordType::Whole(ObjectType::Tag)),
            6 => Ok(RecordType::OfsDelta),
            7 => Ok(RecordType::RefDelta),
            other => Err(Error::CorruptBlock {
                position,
                reason: format!("invalid object record type {other}"),
            }),
        }
    }
}

/// Where a cross-chunk OFS delta base lives: the base chunk's window
/// starts `relative_start` bytes before this chunk's first byte and runs
/// for `len` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseChunk {
    pub relative_start: u64,
    pub key: ChunkKey,
    pub len: u64,
}

/// Side information a [`ChunkSource`] supplies with a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Chunks that precede this one in pack order, for OFS deltas whose
    /// base lies before the first byte of this chunk.
    pub base_chunks: Vec<BaseChunk>,
    /// Continuation fragments, in order, for objects whose bodies run
    /// past the end of this chunk. Each fragment's raw form is payload
    /// followed by a CRC-32 of the payload.
    pub fragments: Vec<ChunkKey>,
}

impl ChunkMeta {
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Translate a position `before` bytes before this chunk's start
    /// into a (base chunk, offset) pair.
    pub fn translate_base(&self, before: u64) -> Option<(ChunkKey, u64)> {
        self.base_chunks
            .iter()
            .find(|b| b.relative_start >= before && b.relative_start - before < b.len)
            .map(|b| (b.key, b.relative_start - before))
    }
}

/// One immutable pack chunk.
pub struct PackChunk {
    key: ChunkKey,
    bytes: Bytes,
    index: ChunkIndex,
    meta: ChunkMeta,
}

impl PackChunk {
    /// Wrap chunk bytes, deriving the key from their SHA-1.
    pub fn new(bytes: impl Into<Bytes>, index: ChunkIndex, meta: ChunkMeta) -> Self {
        let bytes = bytes.into();
        let key = ChunkKey(ObjectId::hash_of(&bytes));
        Self {
            key,
            bytes,
            index,
            meta,
        }
    }

    /// Wrap chunk bytes under a caller-supplied key. The key is trusted
    /// until [`PackChunk::verify`] or a validating copy runs.
    pub fn with_key(key: ChunkKey, bytes: impl Into<Bytes>, index: ChunkIndex, meta: ChunkMeta) -> Self {
        Self {
            key,
            bytes: bytes.into(),
            index,
            meta,
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    /// Check the bytes still hash to the chunk's key.
    pub fn verify(&self) -> Result<()> {
        let mut hasher = Sha1::new();
        hasher.update(&self.bytes);
        if ObjectId::from_hasher(hasher) != self.key.0 {
            return Err(Error::CorruptChunk { key: self.key });
        }
        Ok(())
    }
}

impl Debug for PackChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackChunk")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .field("objects", &self.index.len())
            .finish()
    }
}

/// Sorted (object id, offset) pairs for one chunk, with a 256-way
/// fan-out over the leading id byte to narrow binary searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    fanout: [u32; 256],
    entries: Vec<(ObjectId, u32)>,
}

impl Default for ChunkIndex {
    fn default() -> Self {
        Self {
            fanout: [0; 256],
            entries: Vec::new(),
        }
    }
}

impl ChunkIndex {
    pub fn from_entries(mut entries: Vec<(ObjectId, u32)>) -> Self {
        entries.sort_by_key(|(id, _)| *id);
        let mut fanout = [0u32; 256];
        for (id, _) in &entries {
            fanout[id.first_byte() as usize] += 1;
        }
        // cumulative counts, the way pack indexes lay out layer one
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        Self { fanout, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of `id` within the chunk, if present.
    pub fn find_offset(&self, id: &ObjectId) -> Option<u32> {
        let bucket = id.first_byte() as usize;
        let lo = if bucket == 0 {
            0
        } else {
            self.fanout[bucket - 1] as usize
        };
        let hi = self.fanout[bucket] as usize;
        self.entries[lo..hi]
            .binary_search_by_key(id, |(id, _)| *id)
            .ok()
            .map(|i| self.entries[lo + i].1)
    }

    pub fn entries(&self) -> impl Iterator<Item = &(ObjectId, u32)> {
        self.entries.iter()
    }

    /// Serialize: magic, version, fan-out, id layer, offset layer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 256 * 4 + self.entries.len() * (ID_LEN + 4));
        out.extend_from_slice(&INDEX_MAGIC);
        put_u32_be(&mut out, INDEX_VERSION);
        for n in self.fanout {
            put_u32_be(&mut out, n);
        }
        for (id, _) in &self.entries {
            out.extend_from_slice(id.as_bytes());
        }
        for (_, offset) in &self.entries {
            put_u32_be(&mut out, *offset);
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut rd = ByteReader::new(bytes);
        if rd.bytes(4)? != INDEX_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = rd.u32_be()?;
        if version != INDEX_VERSION {
            return Err(Error::UnsupportedVersion(version as u8));
        }
        let mut fanout = [0u32; 256];
        for slot in fanout.iter_mut() {
            *slot = rd.u32_be()?;
        }
        let count = fanout[255] as usize;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(rd.object_id()?);
        }
        let mut entries = Vec::with_capacity(count);
        for id in ids {
            entries.push((id, rd.u32_be()?));
        }
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(Error::CorruptBlock {
                position: 8,
                reason: "chunk index ids are not sorted".into(),
            });
        }
        Ok(Self { fanout, entries })
    }
}

/// Provider of chunks and object placement.
///
/// The core makes no assumptions about how chunks are named or stored
/// beyond their byte identity.
pub trait ChunkSource {
    /// Fetch a chunk by key.
    fn get(&self, key: &ChunkKey) -> Result<Arc<PackChunk>>;

    /// Locate the chunk and offset holding `id`, if any. `type_hint`
    /// lets a source skip indexes that cannot contain the type.
    fn find_chunk(
        &self,
        id: &ObjectId,
        type_hint: Option<ObjectType>,
    ) -> Result<Option<(ChunkKey, u32)>>;
}

/// Chunk source over a fixed in-memory set, searched in insertion order.
#[derive(Default)]
pub struct InMemoryChunkSource {
    chunks: Vec<Arc<PackChunk>>,
}

impl InMemoryChunkSource {
    pub fn new(chunks: Vec<Arc<PackChunk>>) -> Self {
        Self { chunks }
    }

    pub fn push(&mut self, chunk: Arc<PackChunk>) {
        self.chunks.push(chunk);
    }
}

impl ChunkSource for InMemoryChunkSource {
    fn get(&self, key: &ChunkKey) -> Result<Arc<PackChunk>> {
        self.chunks
            .iter()
            .find(|c| c.key() == key)
            .cloned()
            .ok_or(Error::MissingObject(key.0))
    }

    fn find_chunk(
        &self,
        id: &ObjectId,
        _type_hint: Option<ObjectType>,
    ) -> Result<Option<(ChunkKey, u32)>> {
        for chunk in &self.chunks {
            if let Some(offset) = chunk.index().find_offset(id) {
                return Ok(Some((*chunk.key(), offset)));
            }
        }
        Ok(None)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[0] = n;
        ObjectId::from_bytes(&raw)
    }

    #[test]
    fn index_finds_every_entry() {
        let entries: Vec<(ObjectId, u32)> =
            (0..50u8).map(|n| (id(n.wrapping_mul(5)), n as u32 * 100)).collect();
        let index = ChunkIndex::from_entries(entries.clone());
        for (oid, offset) in &entries {
            assert_eq!(index.find_offset(oid), Some(*offset));
        }
        assert_eq!(index.find_offset(&id(251)), None);
    }

    #[test]
    fn index_serializes_round_trip() {
        let index = ChunkIndex::from_entries(
            (0..10u8).map(|n| (id(n * 20), n as u32 + 12)).collect(),
        );
        let raw = index.serialize();
        let parsed = ChunkIndex::parse(&raw).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn index_parse_rejects_bad_magic() {
        let mut raw = ChunkIndex::from_entries(vec![(id(1), 12)]).serialize();
        raw[0] = 0;
        assert!(matches!(ChunkIndex::parse(&raw), Err(Error::InvalidMagic)));
    }

    #[test]
    fn chunk_identity_and_verification() {
        let chunk = PackChunk::new(
            b"PACK\x00\x00\x00\x02\x00\x00\x00\x00".as_slice(),
            ChunkIndex::default(),
            ChunkMeta::default(),
        );
        chunk.verify().unwrap();

        let tampered = PackChunk::with_key(
            *chunk.key(),
            b"PACK\x00\x00\x00\x02\x00\x00\x00\x01".as_slice(),
            ChunkIndex::default(),
            ChunkMeta::default(),
        );
        assert!(matches!(
            tampered.verify(),
            Err(Error::CorruptChunk { .. })
        ));
    }

    #[test]
    fn base_window_translation() {
        let meta = ChunkMeta {
            base_chunks: vec![
                BaseChunk {
                    relative_start: 100,
                    key: ChunkKey(id(9)),
                    len: 60,
                },
                BaseChunk {
                    relative_start: 40,
                    key: ChunkKey(id(8)),
                    len: 40,
                },
            ],
            fragments: Vec::new(),
        };
        // 70 bytes back lands inside the first window at offset 30
        assert_eq!(meta.translate_base(70), Some((ChunkKey(id(9)), 30)));
        // 10 bytes back lands in the nearer window
        assert_eq!(meta.translate_base(10), Some((ChunkKey(id(8)), 30)));
        // past every window
        assert_eq!(meta.translate_base(500), None);
    }

    #[test]
    fn record_header_layout() {
        let mut out = Vec::new();
        testutil::put_record_header(&mut out, 3, 11);
        assert_eq!(out, vec![0x3b]); // 0011 1011: type 3, size 11
        out.clear();
        testutil::put_record_header(&mut out, 1, 0x90);
        // low 4 bits = 0, continuation, then 0x09
        assert_eq!(out, vec![0x80 | 0x10, 0x09]);
    }
}
