//! Reading objects out of pack chunks: header decoding, delta chains,
//! and the streaming escape hatch for objects too large to materialize.

use super::{ChunkKey, ChunkSource, ObjectType, PackChunk, RecordType};
use crate::chunk::DeltaBaseCache;
use crate::codec::ByteReader;
use crate::delta;
use crate::inflate::{self, Inflater};
use crate::{Error, RawObject, Result, MAX_DELTA_DEPTH};
use bytes::Bytes;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::trace;

/// Tunables for object reads.
#[derive(Debug, Clone)]
pub struct ChunkReaderOptions {
    /// Largest declared size the eager path will allocate. Bigger
    /// objects fail with [`Error::OversizedAllocation`] so callers can
    /// fall back to streaming.
    pub stream_threshold: u64,
    /// Longest delta chain followed before giving up.
    pub max_delta_depth: usize,
    /// Verify fragment CRC trailers while assembling bodies.
    pub validate: bool,
}

impl Default for ChunkReaderOptions {
    fn default() -> Self {
        Self {
            stream_threshold: 16 << 20,
            max_delta_depth: MAX_DELTA_DEPTH,
            validate: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub rtype: RecordType,
    /// Inflated size of the record body (for deltas, of the delta
    /// stream).
    pub size: u64,
    pub header_len: usize,
}

/// Decode the variable-length type+size header at `offset`.
pub(crate) fn read_record_header(chunk: &PackChunk, offset: u64) -> Result<RecordHeader> {
    let bytes = chunk.bytes();
    if offset >= bytes.len() as u64 {
        return Err(Error::TruncatedInput {
            offset,
            wanted: 1,
            got: 0,
        });
    }
    let mut rd = ByteReader::with_base(&bytes[offset as usize..], offset);
    let b0 = rd.u8()?;
    let code = (b0 >> 4) & 0x7;
    let mut size = (b0 & 0x0f) as u64;
    let mut shift = 4u32;
    let mut b = b0;
    while b & 0x80 != 0 {
        b = rd.u8()?;
        if shift >= 64 && b & 0x7f != 0 {
            return Err(Error::CorruptBlock {
                position: offset,
                reason: "record size exceeds 64 bits".into(),
            });
        }
        size |= ((b & 0x7f) as u64).checked_shl(shift).unwrap_or(0);
        shift += 7;
    }
    Ok(RecordHeader {
        rtype: RecordType::from_code(code, offset)?,
        size,
        header_len: rd.pos(),
    })
}

fn check_budget(budget: Option<u64>, size: u64) -> Result<()> {
    match budget {
        Some(b) if size > b => Err(Error::OversizedAllocation { size, budget: b }),
        _ => Ok(()),
    }
}

/// Inflate a body spread over `segments`, which must decompress to
/// exactly `expected` bytes. Running out of input is
/// [`Error::TruncatedInput`]; everything else inexact is corruption.
fn inflate_segments(segments: &[Bytes], expected: usize, position: u64) -> Result<Vec<u8>> {
    let mut inf = inflate::checkout();
    let mut out = vec![0u8; expected];
    let mut filled = 0;
    let mut next_seg = 0;
    loop {
        if inf.needs_input() {
            if next_seg >= segments.len() {
                return Err(Error::TruncatedInput {
                    offset: position,
                    wanted: expected,
                    got: filled,
                });
            }
            inf.set_input(&segments[next_seg]);
            next_seg += 1;
            continue;
        }
        if filled == expected {
            // the stream must terminate exactly here
            let mut probe = [0u8; 1];
            let n = inf.inflate(&mut probe)?;
            if n > 0 {
                return Err(Error::CorruptBlock {
                    position,
                    reason: format!("record inflates past its declared size {expected}"),
                });
            }
            if inf.finished() {
                return Ok(out);
            }
            if !inf.needs_input() {
                return Err(Error::CorruptBlock {
                    position,
                    reason: "record deflate stream stalled".into(),
                });
            }
            continue;
        }
        let n = inf.inflate(&mut out[filled..])?;
        filled += n;
        if n == 0 {
            if inf.finished() {
                break;
            }
            if !inf.needs_input() {
                return Err(Error::CorruptBlock {
                    position,
                    reason: "record deflate stream stalled".into(),
                });
            }
        }
    }
    if filled != expected {
        return Err(Error::CorruptBlock {
            position,
            reason: format!("record inflated to {filled} bytes, declared {expected}"),
        });
    }
    Ok(out)
}

struct Frame {
    base_key: ChunkKey,
    base_offset: u64,
    delta: Vec<u8>,
}

/// Stateless object reader over a chunk source, a shared delta-base
/// cache, and read options.
pub(crate) struct ObjectReader<'a> {
    pub source: &'a dyn ChunkSource,
    pub cache: &'a DeltaBaseCache,
    pub opts: &'a ChunkReaderOptions,
}

impl ObjectReader<'_> {
    /// Materialize the object at `offset`, following delta chains and
    /// enforcing the allocation budget.
    pub fn read_at(&self, chunk: Arc<PackChunk>, offset: u64) -> Result<RawObject> {
        self.read_at_impl(chunk, offset, Some(self.opts.stream_threshold))
    }

    /// Open the object at `offset` as a stream. Whole objects inflate
    /// lazily (fragments included); delta chains are resolved iteratively
    /// with at most one intermediate base resident, then streamed from
    /// the final buffer.
    pub fn open_stream(&self, chunk: Arc<PackChunk>, offset: u64) -> Result<ObjectStream> {
        let hdr = read_record_header(&chunk, offset)?;
        match hdr.rtype {
            RecordType::Whole(t) => {
                let data_start = offset + hdr.header_len as u64;
                let segments = self.body_segments(&chunk, data_start)?;
                Ok(ObjectStream::inflating(t, hdr.size, segments))
            }
            _ => {
                let raw = self.read_at_impl(chunk, offset, None)?;
                Ok(ObjectStream::buffered(raw.obj_type, raw.data))
            }
        }
    }

    /// Type and inflated size of the object at `offset`, without
    /// materializing it. For deltas the size comes from the delta
    /// header and the type from the chain's terminal base.
    pub fn object_info(&self, chunk: Arc<PackChunk>, offset: u64) -> Result<(ObjectType, u64)> {
        let hdr = read_record_header(&chunk, offset)?;
        match hdr.rtype {
            RecordType::Whole(t) => Ok((t, hdr.size)),
            RecordType::OfsDelta | RecordType::RefDelta => {
                let after = offset + hdr.header_len as u64;
                let mut rd = ByteReader::with_base(&chunk.bytes()[after as usize..], after);
                match hdr.rtype {
                    RecordType::OfsDelta => {
                        rd.varint()?;
                    }
                    _ => {
                        rd.object_id()?;
                    }
                }
                let data_start = after + rd.pos() as u64;
                let prefix = self.inflate_prefix(&chunk, data_start, 32, hdr.size)?;
                let size = delta::result_size(&prefix)?;
                let obj_type = self.chain_type(chunk, offset)?;
                Ok((obj_type, size))
            }
        }
    }

    fn read_at_impl(
        &self,
        chunk: Arc<PackChunk>,
        offset: u64,
        budget: Option<u64>,
    ) -> Result<RawObject> {
        let mut frames: Vec<Frame> = Vec::new();
        let mut cur_chunk = chunk;
        let mut cur_off = offset;

        let (obj_type, mut data) = loop {
            if frames.len() >= self.opts.max_delta_depth {
                return Err(Error::DeltaChainTooDeep {
                    max: self.opts.max_delta_depth,
                });
            }
            if let Some(hit) = self.cache.get(cur_chunk.key(), cur_off) {
                trace!(offset = cur_off, "delta base cache hit");
                break hit;
            }
            let hdr = read_record_header(&cur_chunk, cur_off)?;
            let after = cur_off + hdr.header_len as u64;
            match hdr.rtype {
                RecordType::Whole(t) => {
                    check_budget(budget, hdr.size)?;
                    let raw = self.inflate_record(&cur_chunk, after, hdr.size, budget.is_none())?;
                    break (t, Bytes::from(raw));
                }
                RecordType::OfsDelta => {
                    let mut rd =
                        ByteReader::with_base(&cur_chunk.bytes()[after as usize..], after);
                    let distance = rd.varint()?;
                    let data_start = after + rd.pos() as u64;
                    check_budget(budget, hdr.size)?;
                    let delta =
                        self.inflate_record(&cur_chunk, data_start, hdr.size, budget.is_none())?;

                    let (base_key, base_offset) = if distance <= cur_off {
                        (*cur_chunk.key(), cur_off - distance)
                    } else {
                        // the base lies in an earlier chunk of the pack
                        let before = distance - cur_off;
                        cur_chunk.meta().translate_base(before).ok_or(Error::CorruptChunk {
                            key: *cur_chunk.key(),
                        })?
                    };
                    frames.push(Frame {
                        base_key,
                        base_offset,
                        delta,
                    });
                    if base_key != *cur_chunk.key() {
                        cur_chunk = self.source.get(&base_key)?;
                    }
                    cur_off = base_offset;
                }
                RecordType::RefDelta => {
                    let mut rd =
                        ByteReader::with_base(&cur_chunk.bytes()[after as usize..], after);
                    let base_id = rd.object_id()?;
                    let data_start = after + rd.pos() as u64;
                    check_budget(budget, hdr.size)?;
                    let delta =
                        self.inflate_record(&cur_chunk, data_start, hdr.size, budget.is_none())?;

                    let (base_key, base_offset) =
                        if let Some(off) = cur_chunk.index().find_offset(&base_id) {
                            (*cur_chunk.key(), off as u64)
                        } else {
                            match self.source.find_chunk(&base_id, None)? {
                                Some((key, off)) => (key, off as u64),
                                None => return Err(Error::MissingObject(base_id)),
                            }
                        };
                    frames.push(Frame {
                        base_key,
                        base_offset,
                        delta,
                    });
                    if base_key != *cur_chunk.key() {
                        cur_chunk = self.source.get(&base_key)?;
                    }
                    cur_off = base_offset;
                }
            }
        };

        while let Some(frame) = frames.pop() {
            let declared = delta::result_size(&frame.delta)?;
            check_budget(budget, declared)?;
            if frames.is_empty() {
                // the base immediately preceding the target is the one
                // most likely to serve the next sibling delta
                self.cache
                    .put(&frame.base_key, frame.base_offset, obj_type, data.clone());
            }
            let mut out = Vec::with_capacity(declared as usize);
            delta::apply(&data, &frame.delta, &mut out)?;
            data = Bytes::from(out);
        }
        Ok(RawObject { obj_type, data })
    }

    /// Resolve the terminal base type of a (possibly deltified) record by
    /// walking headers only.
    fn chain_type(&self, chunk: Arc<PackChunk>, offset: u64) -> Result<ObjectType> {
        let mut cur_chunk = chunk;
        let mut cur_off = offset;
        for _ in 0..=self.opts.max_delta_depth {
            if let Some((t, _)) = self.cache.get(cur_chunk.key(), cur_off) {
                return Ok(t);
            }
            let hdr = read_record_header(&cur_chunk, cur_off)?;
            let after = cur_off + hdr.header_len as u64;
            let (base_key, base_offset) = match hdr.rtype {
                RecordType::Whole(t) => return Ok(t),
                RecordType::OfsDelta => {
                    let mut rd =
                        ByteReader::with_base(&cur_chunk.bytes()[after as usize..], after);
                    let distance = rd.varint()?;
                    if distance <= cur_off {
                        (*cur_chunk.key(), cur_off - distance)
                    } else {
                        let before = distance - cur_off;
                        cur_chunk.meta().translate_base(before).ok_or(Error::CorruptChunk {
                            key: *cur_chunk.key(),
                        })?
                    }
                }
                RecordType::RefDelta => {
                    let mut rd =
                        ByteReader::with_base(&cur_chunk.bytes()[after as usize..], after);
                    let base_id = rd.object_id()?;
                    if let Some(off) = cur_chunk.index().find_offset(&base_id) {
                        (*cur_chunk.key(), off as u64)
                    } else {
                        match self.source.find_chunk(&base_id, None)? {
                            Some((key, off)) => (key, off as u64),
                            None => return Err(Error::MissingObject(base_id)),
                        }
                    }
                }
            };
            if base_key != *cur_chunk.key() {
                cur_chunk = self.source.get(&base_key)?;
            }
            cur_off = base_offset;
        }
        Err(Error::DeltaChainTooDeep {
            max: self.opts.max_delta_depth,
        })
    }

    /// Inflate the record body starting at `data_start`. In the eager
    /// path (`allow_fragments` false) the body must end inside this
    /// chunk; an object continued in fragments is only readable through
    /// the streaming path.
    fn inflate_record(
        &self,
        chunk: &Arc<PackChunk>,
        data_start: u64,
        expected: u64,
        allow_fragments: bool,
    ) -> Result<Vec<u8>> {
        if allow_fragments && chunk.meta().fragment_count() > 0 {
            let segments = self.body_segments(chunk, data_start)?;
            return inflate_segments(&segments, expected as usize, data_start);
        }
        let seg = [chunk.bytes().slice(data_start as usize..)];
        inflate_segments(&seg, expected as usize, data_start).map_err(|e| match e {
            Error::TruncatedInput { .. } if chunk.meta().fragment_count() > 0 => {
                Error::FragmentedObjectNotSupported
            }
            other => other,
        })
    }

    /// Inflate at most `want` bytes from the head of a record body
    /// (enough to parse a delta size header).
    fn inflate_prefix(
        &self,
        chunk: &Arc<PackChunk>,
        data_start: u64,
        want: usize,
        declared: u64,
    ) -> Result<Vec<u8>> {
        let want = want.min(declared as usize);
        let mut inf = inflate::checkout();
        let mut out = vec![0u8; want];
        let mut filled = 0;
        let mut fed_first = false;
        let mut fragments: Option<Vec<Bytes>> = None;
        let mut next_frag = 0;
        while filled < want {
            if inf.needs_input() {
                if !fed_first {
                    inf.set_input(&chunk.bytes()[data_start as usize..]);
                    fed_first = true;
                } else {
                    let frags = match &fragments {
                        Some(f) => f,
                        None => {
                            fragments = Some(self.body_segments(chunk, data_start)?);
                            fragments.as_ref().expect("just set")
                        }
                    };
                    // segment 0 repeats the in-chunk bytes already fed
                    next_frag += 1;
                    match frags.get(next_frag) {
                        Some(seg) => inf.set_input(seg),
                        None => {
                            return Err(Error::TruncatedInput {
                                offset: data_start,
                                wanted: want,
                                got: filled,
                            })
                        }
                    }
                }
                continue;
            }
            let n = inf.inflate(&mut out[filled..])?;
            filled += n;
            if n == 0 {
                if inf.finished() {
                    break;
                }
                if !inf.needs_input() {
                    return Err(Error::CorruptBlock {
                        position: data_start,
                        reason: "delta header deflate stream stalled".into(),
                    });
                }
            }
        }
        out.truncate(filled);
        Ok(out)
    }

    /// The record body as byte segments: the tail of this chunk, then
    /// each continuation fragment minus its CRC trailer.
    fn body_segments(&self, chunk: &Arc<PackChunk>, data_start: u64) -> Result<Vec<Bytes>> {
        let mut segments = vec![chunk.bytes().slice(data_start as usize..)];
        for key in &chunk.meta().fragments {
            let frag = self.source.get(key)?;
            let bytes = frag.bytes();
            if bytes.len() < 4 {
                return Err(Error::CorruptChunk { key: *key });
            }
            let payload = bytes.slice(..bytes.len() - 4);
            if self.opts.validate {
                let mut crc = crc32fast::Hasher::new();
                crc.update(&payload);
                let stored = u32::from_be_bytes([
                    bytes[bytes.len() - 4],
                    bytes[bytes.len() - 3],
                    bytes[bytes.len() - 2],
                    bytes[bytes.len() - 1],
                ]);
                if crc.finalize() != stored {
                    return Err(Error::CorruptChunk { key: *key });
                }
            }
            segments.push(payload);
        }
        Ok(segments)
    }
}

enum StreamState {
    Inflating {
        inf: Inflater,
        segments: Vec<Bytes>,
        next_seg: usize,
        produced: u64,
    },
    Buffered {
        data: Bytes,
        pos: usize,
    },
}

/// Streaming view of one object: an inflater pipeline for whole objects,
/// a buffer for resolved delta chains.
pub struct ObjectStream {
    obj_type: ObjectType,
    size: u64,
    state: StreamState,
}

impl ObjectStream {
    fn inflating(obj_type: ObjectType, size: u64, segments: Vec<Bytes>) -> Self {
        Self {
            obj_type,
            size,
            state: StreamState::Inflating {
                inf: inflate::checkout(),
                segments,
                next_seg: 0,
                produced: 0,
            },
        }
    }

    fn buffered(obj_type: ObjectType, data: Bytes) -> Self {
        Self {
            obj_type,
            size: data.len() as u64,
            state: StreamState::Buffered { data, pos: 0 },
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.obj_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for ObjectStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Buffered { data, pos } => {
                let n = buf.len().min(data.len() - *pos);
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            StreamState::Inflating {
                inf,
                segments,
                next_seg,
                produced,
            } => {
                let want = (buf.len() as u64).min(self.size - *produced) as usize;
                if want == 0 {
                    return Ok(0);
                }
                loop {
                    if inf.needs_input() {
                        match segments.get(*next_seg) {
                            Some(seg) => {
                                inf.set_input(seg);
                                *next_seg += 1;
                            }
                            None => {
                                return Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "object body ended before its declared size",
                                ))
                            }
                        }
                        continue;
                    }
                    let n = inf
                        .inflate(&mut buf[..want])
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    if n > 0 {
                        *produced += n as u64;
                        return Ok(n);
                    }
                    if inf.finished() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "deflate stream ended before the declared size",
                        ));
                    }
                }
            }
        }
    }
}
