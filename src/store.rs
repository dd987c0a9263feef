//! The store facade: a reftable stack for names, a chunk store for
//! objects.

use crate::chunk::{
    ChunkKey, ChunkReaderOptions, ChunkSource, DeltaBaseCache, ObjectReader, ObjectStream,
    ObjectType,
};
use crate::id::ObjectId;
use crate::reftable::{Ref, ReftableStack};
use crate::source::BlockSource;
use crate::{Error, RawObject, Result};
use bytes::Bytes;
use io_tee::TeeWriter;
use sha1::{Digest, Sha1};
use std::io::{Cursor, Write};
use std::sync::Arc;
use tracing::debug;

/// Read access to every object reachable through a [`ChunkSource`].
///
/// Immutable after construction; the only shared mutable state is the
/// delta-base cache behind its own lock, so a store can be used from any
/// number of threads.
pub struct ChunkStore {
    source: Arc<dyn ChunkSource + Send + Sync>,
    cache: Arc<DeltaBaseCache>,
    opts: ChunkReaderOptions,
}

impl ChunkStore {
    pub fn new(
        source: Arc<dyn ChunkSource + Send + Sync>,
        cache: Arc<DeltaBaseCache>,
        opts: ChunkReaderOptions,
    ) -> Self {
        Self {
            source,
            cache,
            opts,
        }
    }

    fn reader(&self) -> ObjectReader<'_> {
        ObjectReader {
            source: self.source.as_ref(),
            cache: &self.cache,
            opts: &self.opts,
        }
    }

    /// Locate and materialize `id`.
    ///
    /// Objects above the configured allocation budget (and fragmented
    /// ones) come back as large loaders wrapping a stream instead of
    /// failing.
    pub fn open(&self, id: &ObjectId) -> Result<ObjectLoader> {
        let Some((key, offset)) = self.source.find_chunk(id, None)? else {
            return Err(Error::MissingObject(*id));
        };
        let chunk = self.source.get(&key)?;
        if self.opts.validate {
            chunk.verify()?;
        }
        match self.reader().read_at(chunk.clone(), offset as u64) {
            Ok(RawObject { obj_type, data }) => Ok(ObjectLoader {
                obj_type,
                size: data.len() as u64,
                kind: LoaderKind::Small(data),
            }),
            Err(Error::OversizedAllocation { size, budget }) => {
                debug!(%id, size, budget, "switching to streaming load");
                let stream = self.reader().open_stream(chunk, offset as u64)?;
                Ok(ObjectLoader {
                    obj_type: stream.object_type(),
                    size: stream.size(),
                    kind: LoaderKind::Large(stream),
                })
            }
            Err(Error::FragmentedObjectNotSupported) => {
                let stream = self.reader().open_stream(chunk, offset as u64)?;
                Ok(ObjectLoader {
                    obj_type: stream.object_type(),
                    size: stream.size(),
                    kind: LoaderKind::Large(stream),
                })
            }
            Err(other) => Err(other),
        }
    }

    pub fn has(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.source.find_chunk(id, None)?.is_some())
    }

    /// Type and size of `id` without materializing its content.
    pub fn object_info(&self, id: &ObjectId) -> Result<(ObjectType, u64)> {
        let Some((key, offset)) = self.source.find_chunk(id, None)? else {
            return Err(Error::MissingObject(*id));
        };
        let chunk = self.source.get(&key)?;
        self.reader().object_info(chunk, offset as u64)
    }

    /// Copy a chunk's raw bytes (with continuation fragments, their CRC
    /// trailers stripped) into `out`. With `validate` the first chunk is
    /// hashed while copying and compared against its key; fragments are
    /// checked against their CRC trailers.
    pub fn copy_as_is<W: Write>(&self, key: &ChunkKey, out: &mut W, validate: bool) -> Result<u64> {
        let chunk = self.source.get(key)?;
        let mut copied = chunk.len();
        if validate {
            let mut hasher = Sha1::new();
            let mut tee = TeeWriter::new(&mut hasher, &mut *out);
            tee.write_all(chunk.bytes())?;
            if ObjectId::from_hasher(hasher) != key.0 {
                return Err(Error::CorruptChunk { key: *key });
            }
        } else {
            out.write_all(chunk.bytes())?;
        }

        for frag_key in &chunk.meta().fragments {
            let frag = self.source.get(frag_key)?;
            let bytes = frag.bytes();
            if bytes.len() < 4 {
                return Err(Error::CorruptChunk { key: *frag_key });
            }
            let payload = &bytes[..bytes.len() - 4];
            if validate {
                let mut crc = crc32fast::Hasher::new();
                crc.update(payload);
                let stored = u32::from_be_bytes([
                    bytes[bytes.len() - 4],
                    bytes[bytes.len() - 3],
                    bytes[bytes.len() - 2],
                    bytes[bytes.len() - 1],
                ]);
                if crc.finalize() != stored {
                    return Err(Error::CorruptChunk { key: *frag_key });
                }
            }
            out.write_all(payload)?;
            copied += payload.len() as u64;
        }
        Ok(copied)
    }
}

enum LoaderKind {
    Small(Bytes),
    Large(ObjectStream),
}

/// Result of opening an object: small objects carry their bytes, large
/// ones a stream.
pub struct ObjectLoader {
    obj_type: ObjectType,
    size: u64,
    kind: LoaderKind,
}

impl ObjectLoader {
    pub fn object_type(&self) -> ObjectType {
        self.obj_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_large(&self) -> bool {
        matches!(self.kind, LoaderKind::Large(_))
    }

    /// Inflated bytes of a small object. Large objects refuse with
    /// [`Error::OversizedAllocation`]; take [`ObjectLoader::stream`]
    /// instead.
    pub fn bytes(&self) -> Result<&Bytes> {
        match &self.kind {
            LoaderKind::Small(data) => Ok(data),
            LoaderKind::Large(stream) => Err(Error::OversizedAllocation {
                size: stream.size(),
                budget: 0,
            }),
        }
    }

    /// Consume the loader as a reader over the inflated content.
    pub fn stream(self) -> Box<dyn std::io::Read> {
        match self.kind {
            LoaderKind::Small(data) => Box::new(Cursor::new(data)),
            LoaderKind::Large(stream) => Box::new(stream),
        }
    }
}

/// A store pairs an ordered reftable stack (newest table first) with an
/// object database of chunks.
pub struct Store<S: BlockSource> {
    refs: ReftableStack<S>,
    objects: ChunkStore,
}

impl<S: BlockSource> Store<S> {
    pub fn new(refs: ReftableStack<S>, objects: ChunkStore) -> Self {
        Self { refs, objects }
    }

    pub fn refs(&self) -> &ReftableStack<S> {
        &self.refs
    }

    pub fn objects(&self) -> &ChunkStore {
        &self.objects
    }

    /// Current value of a ref, tombstones already applied.
    pub fn lookup_ref(&self, name: &str) -> Result<Option<Ref>> {
        self.refs.seek(name)
    }

    /// Resolve a ref all the way to an object loader: symbolic refs are
    /// chased by name (never by pointer), then the target object is
    /// opened.
    pub fn resolve(&self, name: &str) -> Result<Option<(Ref, ObjectLoader)>> {
        let mut seen = 0;
        let mut cursor_name = name.to_owned();
        loop {
            let Some(r) = self.refs.seek(&cursor_name)? else {
                return Ok(None);
            };
            if let Some(target) = r.target_name() {
                seen += 1;
                if seen > 5 {
                    return Err(Error::InvariantViolated(format!(
                        "symbolic ref chain through {name:?} is too deep"
                    )));
                }
                cursor_name = target.to_owned();
                continue;
            }
            let Some(id) = r.object_id() else {
                return Ok(None);
            };
            let loader = self.objects.open(id)?;
            return Ok(Some((r, loader)));
        }
    }
}
