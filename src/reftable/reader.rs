//! Reading a single reftable file.

use super::block::{parse_block_header, Block, BlockEntry, RawCursor, BLOCK_HEADER_LEN};
use super::{
    log_key, log_key_first, LogEntry, Ref, BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG, BLOCK_TYPE_OBJ,
    BLOCK_TYPE_REF, FILE_HEADER_LEN, FILE_MAGIC, FOOTER_LEN, FOOTER_MAGIC,
    INDEX_SECTION_THRESHOLD, VERSION_1,
};
use crate::id::ObjectId;
use crate::inflate;
use crate::source::BlockSource;
use crate::{Error, Result};
use tracing::{debug, trace};

/// Immutable view of one reftable.
///
/// Opening validates the header magic and the footer CRC, then walks the
/// block headers once to learn where each section lives. After
/// construction a reader only ever reads; it can be shared across threads
/// when its block source can.
pub struct ReftableReader<S: BlockSource> {
    source: S,
    block_size: u32,
    min_update_index: u64,
    max_update_index: u64,
    ref_blocks: Vec<u64>,
    obj_blocks: Vec<u64>,
    log_blocks: Vec<u64>,
    ref_index: Option<Block>,
    log_index: Option<Block>,
    index_keys: usize,
}

impl<S: BlockSource> ReftableReader<S> {
    pub fn open(source: S) -> Result<Self> {
        let size = source.size()?;
        if size < FILE_HEADER_LEN as u64 {
            return Err(Error::TruncatedInput {
                offset: 0,
                wanted: FILE_HEADER_LEN,
                got: size as usize,
            });
        }
        let header = source.read_exact(0, FILE_HEADER_LEN as u32)?;
        if header[..4] != FILE_MAGIC {
            return Err(Error::InvalidMagic);
        }
        if header[4] != VERSION_1 {
            return Err(Error::UnsupportedVersion(header[4]));
        }
        let block_size =
            ((header[5] as u32) << 16) | ((header[6] as u32) << 8) | header[7] as u32;

        if size < (FILE_HEADER_LEN + FOOTER_LEN) as u64 {
            return Err(Error::TruncatedInput {
                offset: FILE_HEADER_LEN as u64,
                wanted: FOOTER_LEN,
                got: (size - FILE_HEADER_LEN as u64) as usize,
            });
        }
        let footer = source.read_exact(size - FOOTER_LEN as u64, FOOTER_LEN as u32)?;
        if footer[..2] != FOOTER_MAGIC {
            return Err(Error::InvalidMagicFooter);
        }
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&footer[..12]);
        let computed = crc.finalize();
        let stored = u32::from_be_bytes([footer[12], footer[13], footer[14], footer[15]]);
        if stored != computed {
            return Err(Error::CorruptCrc { stored, computed });
        }
        let mut min_update_index = 0u64;
        for b in &footer[2..8] {
            min_update_index = (min_update_index << 8) | *b as u64;
        }
        let span = u32::from_be_bytes([footer[8], footer[9], footer[10], footer[11]]);
        let max_update_index = min_update_index + span as u64;

        let mut reader = Self {
            source,
            block_size,
            min_update_index,
            max_update_index,
            ref_blocks: Vec::new(),
            obj_blocks: Vec::new(),
            log_blocks: Vec::new(),
            ref_index: None,
            log_index: None,
            index_keys: 0,
        };
        reader.source.advise_sequential(FILE_HEADER_LEN as u64, size);
        reader.walk_blocks(size - FOOTER_LEN as u64)?;
        debug!(
            ref_blocks = reader.ref_blocks.len(),
            obj_blocks = reader.obj_blocks.len(),
            log_blocks = reader.log_blocks.len(),
            index_keys = reader.index_keys,
            "opened reftable"
        );
        Ok(reader)
    }

    /// Walk every block header from the first block to `end`, recording
    /// section positions and enforcing the r -> o -> g -> i ordering.
    fn walk_blocks(&mut self, end: u64) -> Result<()> {
        let mut pos = FILE_HEADER_LEN as u64;
        let mut stage = 0u8;
        let mut indexes = Vec::new();
        while pos < end {
            let raw = self.source.read_exact(pos, BLOCK_HEADER_LEN as u32)?;
            let hdr = parse_block_header(&raw, pos)?;
            let rank = match hdr.btype {
                BLOCK_TYPE_REF => 0,
                BLOCK_TYPE_OBJ => 1,
                BLOCK_TYPE_LOG => 2,
                BLOCK_TYPE_INDEX => 3,
                other => {
                    return Err(Error::CorruptBlock {
                        position: pos,
                        reason: format!("unknown block type {other:#04x}"),
                    })
                }
            };
            if rank < stage {
                return Err(Error::InvalidBlockSequence(format!(
                    "block type {:?} at offset {pos} after a later section",
                    hdr.btype as char
                )));
            }
            stage = rank;

            match hdr.btype {
                BLOCK_TYPE_REF | BLOCK_TYPE_OBJ => {
                    if hdr.len > self.block_size {
                        return Err(Error::OverflowedBlock {
                            len: hdr.len,
                            max: self.block_size,
                        });
                    }
                    if hdr.btype == BLOCK_TYPE_REF {
                        self.ref_blocks.push(pos);
                    } else {
                        self.obj_blocks.push(pos);
                    }
                    pos += hdr.len as u64;
                }
                BLOCK_TYPE_LOG => {
                    if hdr.len > self.block_size {
                        return Err(Error::OverflowedBlock {
                            len: hdr.len,
                            max: self.block_size,
                        });
                    }
                    let (_, extent) = self.read_log_block(pos)?;
                    self.log_blocks.push(pos);
                    pos += extent;
                }
                _ => {
                    let body = self
                        .source
                        .read_exact(pos + BLOCK_HEADER_LEN as u64, hdr.len - BLOCK_HEADER_LEN as u32)?;
                    indexes.push(Block::parse(BLOCK_TYPE_INDEX, body, pos)?);
                    pos += hdr.len as u64;
                }
            }
        }
        if pos != end {
            return Err(Error::CorruptBlock {
                position: pos,
                reason: "blocks overrun the footer".into(),
            });
        }

        // At most one index per section, refs before logs. With a single
        // index block the writer's own threshold rule tells the sections
        // apart.
        let mut indexes = indexes.into_iter();
        match (indexes.next(), indexes.next(), indexes.next()) {
            (None, _, _) => {}
            (Some(first), None, _) => {
                if self.ref_blocks.len() > INDEX_SECTION_THRESHOLD {
                    self.ref_index = Some(first);
                } else {
                    self.log_index = Some(first);
                }
            }
            (Some(first), Some(second), None) => {
                self.ref_index = Some(first);
                self.log_index = Some(second);
            }
            _ => {
                return Err(Error::InvalidBlockSequence(
                    "more than two index blocks".into(),
                ))
            }
        }

        if let Some(idx) = &self.ref_index {
            let mut cur = idx.cursor();
            while cur.next()?.is_some() {
                self.index_keys += 1;
            }
        }
        Ok(())
    }

    /// Number of ref blocks in the file.
    pub fn block_count(&self) -> usize {
        self.ref_blocks.len()
    }

    /// Number of keys in the ref index block (zero when no index was
    /// written).
    pub fn index_keys(&self) -> usize {
        self.index_keys
    }

    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    pub fn close(&mut self) {
        self.source.close();
    }

    fn read_plain_block(&self, btype: u8, pos: u64) -> Result<Block> {
        let raw = self.source.read_exact(pos, BLOCK_HEADER_LEN as u32)?;
        let hdr = parse_block_header(&raw, pos)?;
        if hdr.btype != btype {
            return Err(Error::CorruptBlock {
                position: pos,
                reason: format!(
                    "expected block type {:?}, found {:?}",
                    btype as char, hdr.btype as char
                ),
            });
        }
        let body = self
            .source
            .read_exact(pos + BLOCK_HEADER_LEN as u64, hdr.len - BLOCK_HEADER_LEN as u32)?;
        Block::parse(btype, body, pos)
    }

    /// Inflate a log block, returning the parsed block and its on-disk
    /// extent (header plus compressed body).
    fn read_log_block(&self, pos: u64) -> Result<(Block, u64)> {
        let raw = self.source.read_exact(pos, BLOCK_HEADER_LEN as u32)?;
        let hdr = parse_block_header(&raw, pos)?;
        if hdr.btype != BLOCK_TYPE_LOG {
            return Err(Error::CorruptBlock {
                position: pos,
                reason: "expected a log block".into(),
            });
        }
        let expected = (hdr.len - BLOCK_HEADER_LEN as u32) as usize;
        let reposition = |e: Error| match e {
            Error::CorruptBlock { reason, .. } => Error::CorruptBlock {
                position: pos,
                reason,
            },
            other => other,
        };

        let mut inf = inflate::checkout();
        let mut out = vec![0u8; expected];
        let mut filled = 0;
        let mut feed = pos + BLOCK_HEADER_LEN as u64;
        loop {
            if inf.needs_input() {
                let chunk = self.source.read(feed, self.block_size.max(4096))?;
                if chunk.is_empty() {
                    return Err(Error::CorruptBlock {
                        position: pos,
                        reason: "log block deflate stream is truncated".into(),
                    });
                }
                feed += chunk.len() as u64;
                inf.set_input(&chunk);
            }
            let n = inf.inflate(&mut out[filled..]).map_err(reposition)?;
            if n == 0 {
                if inf.finished() {
                    break;
                }
                if !inf.needs_input() {
                    return Err(Error::CorruptBlock {
                        position: pos,
                        reason: "log block deflate stream stalled".into(),
                    });
                }
                continue;
            }
            filled += n;
            if filled == expected && !inf.finished() {
                // the stream must terminate exactly here
                let mut probe = [0u8; 1];
                loop {
                    if inf.needs_input() {
                        let chunk = self.source.read(feed, self.block_size.max(4096))?;
                        if chunk.is_empty() {
                            return Err(Error::CorruptBlock {
                                position: pos,
                                reason: "log block deflate stream is truncated".into(),
                            });
                        }
                        feed += chunk.len() as u64;
                        inf.set_input(&chunk);
                    }
                    let n = inf.inflate(&mut probe).map_err(reposition)?;
                    if n > 0 {
                        return Err(Error::CorruptBlock {
                            position: pos,
                            reason: format!(
                                "log block inflates past its declared size {expected}"
                            ),
                        });
                    }
                    if inf.finished() {
                        break;
                    }
                }
                break;
            }
        }
        if filled != expected {
            return Err(Error::CorruptBlock {
                position: pos,
                reason: format!(
                    "log block inflated to {filled} bytes, declared {expected}"
                ),
            });
        }
        let extent = BLOCK_HEADER_LEN as u64 + inf.bytes_read();
        let block = Block::parse(BLOCK_TYPE_LOG, bytes::Bytes::from(out), pos)?;
        Ok((block, extent))
    }

    fn open_section_block(&self, section: Section, ix: usize) -> Result<RawCursor> {
        let positions = self.section_positions(section);
        let block = match section {
            Section::Ref => self.read_plain_block(BLOCK_TYPE_REF, positions[ix])?,
            Section::Log => self.read_log_block(positions[ix])?.0,
        };
        Ok(block.cursor())
    }

    fn section_positions(&self, section: Section) -> &[u64] {
        match section {
            Section::Ref => &self.ref_blocks,
            Section::Log => &self.log_blocks,
        }
    }

    fn section_index(&self, section: Section) -> Option<&Block> {
        match section {
            Section::Ref => self.ref_index.as_ref(),
            Section::Log => self.log_index.as_ref(),
        }
    }

    /// Index of the block a lower-bound scan for `target` should start
    /// in, or `None` when the section is empty.
    fn locate_block(&self, section: Section, target: &[u8]) -> Result<Option<usize>> {
        let positions = self.section_positions(section);
        if positions.is_empty() {
            return Ok(None);
        }
        if let Some(idx) = self.section_index(section) {
            let mut cur = idx.cursor();
            cur.seek(target)?;
            return match cur.next()? {
                Some(BlockEntry::Index { position, .. }) => {
                    let ix = positions.binary_search(&position).map_err(|_| {
                        Error::CorruptBlock {
                            position,
                            reason: "index entry points at no block".into(),
                        }
                    })?;
                    Ok(Some(ix))
                }
                Some(_) => Err(Error::CorruptBlock {
                    position: idx.position,
                    reason: "non-index entry in index block".into(),
                }),
                // target is beyond the last key of the section
                None => Ok(None),
            };
        }

        // no index: binary search block first keys
        trace!(?section, "binary searching block positions");
        let mut lo = 0usize;
        let mut hi = positions.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let first = match section {
                Section::Ref => self.read_plain_block(BLOCK_TYPE_REF, positions[mid])?.first_key()?,
                Section::Log => self.read_log_block(positions[mid])?.0.first_key()?,
            };
            if first.as_slice() <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(Some(lo.saturating_sub(1)))
    }

    /// Cursor over every ref in the table, in name order.
    pub fn seek_to_first(&self) -> RefCursor<'_, S> {
        RefCursor {
            table: self,
            next_block: 0,
            cur: None,
            prefix: None,
        }
    }

    /// Cursor positioned at the first ref whose name is `>= name`.
    pub fn seek(&self, name: &str) -> Result<RefCursor<'_, S>> {
        self.seek_bytes(name.as_bytes(), None)
    }

    /// Cursor over refs whose names start with `prefix`.
    pub fn seek_prefix(&self, prefix: &str) -> Result<RefCursor<'_, S>> {
        self.seek_bytes(prefix.as_bytes(), Some(prefix.as_bytes().to_vec()))
    }

    fn seek_bytes(&self, target: &[u8], prefix: Option<Vec<u8>>) -> Result<RefCursor<'_, S>> {
        let Some(ix) = self.locate_block(Section::Ref, target)? else {
            return Ok(RefCursor {
                table: self,
                next_block: self.ref_blocks.len(),
                cur: None,
                prefix,
            });
        };
        let mut raw = self.open_section_block(Section::Ref, ix)?;
        raw.seek(target)?;
        Ok(RefCursor {
            table: self,
            next_block: ix + 1,
            cur: Some(raw),
            prefix,
        })
    }

    /// All log entries for `name`, newest update first.
    pub fn seek_log(&self, name: &str) -> Result<LogCursor<'_, S>> {
        self.seek_log_bytes(&log_key_first(name), Some(name.to_owned()))
    }

    /// Log entries for `name` at or below `update_index`, newest first.
    pub fn seek_log_at(&self, name: &str, update_index: u64) -> Result<LogCursor<'_, S>> {
        self.seek_log_bytes(&log_key(name, update_index), Some(name.to_owned()))
    }

    /// Every log entry in the table, in (name, newest-first) order.
    pub fn scan_logs(&self) -> Result<LogCursor<'_, S>> {
        Ok(LogCursor {
            table: self,
            next_block: 0,
            cur: None,
            name: None,
        })
    }

    fn seek_log_bytes(&self, target: &[u8], name: Option<String>) -> Result<LogCursor<'_, S>> {
        let Some(ix) = self.locate_block(Section::Log, target)? else {
            return Ok(LogCursor {
                table: self,
                next_block: self.log_blocks.len(),
                cur: None,
                name,
            });
        };
        let mut raw = self.open_section_block(Section::Log, ix)?;
        raw.seek(target)?;
        Ok(LogCursor {
            table: self,
            next_block: ix + 1,
            cur: Some(raw),
            name,
        })
    }

    /// Refs whose value (direct or peeled) is `id`.
    ///
    /// Uses the object blocks when the table carries them, otherwise
    /// falls back to a full scan.
    pub fn refs_for(&self, id: &ObjectId) -> Result<Vec<Ref>> {
        let matches = |r: &Ref| r.object_id() == Some(id) || r.peeled_id() == Some(id);
        if !self.obj_blocks.is_empty() {
            let mut ordinals: Option<Vec<u64>> = None;
            for pos in &self.obj_blocks {
                let block = self.read_plain_block(BLOCK_TYPE_OBJ, *pos)?;
                let mut cur = block.cursor();
                cur.seek(id.as_bytes())?;
                if let Some(BlockEntry::Obj { id: got, blocks }) = cur.next()? {
                    if got == *id {
                        ordinals = Some(blocks);
                        break;
                    }
                }
            }
            let Some(ordinals) = ordinals else {
                return Ok(Vec::new());
            };
            let mut out = Vec::new();
            for ord in ordinals {
                let ix = ord as usize;
                if ix >= self.ref_blocks.len() {
                    return Err(Error::CorruptBlock {
                        position: self.obj_blocks[0],
                        reason: format!("obj entry names ref block {ix} of {}", self.ref_blocks.len()),
                    });
                }
                let mut cur = self.open_section_block(Section::Ref, ix)?;
                while let Some(BlockEntry::Ref(r)) = cur.next()? {
                    if matches(&r) {
                        out.push(r);
                    }
                }
            }
            return Ok(out);
        }

        let mut out = Vec::new();
        let mut cur = self.seek_to_first();
        while let Some(r) = cur.next()? {
            if matches(&r) {
                out.push(r);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Ref,
    Log,
}

/// Forward cursor over refs, spanning block boundaries.
pub struct RefCursor<'r, S: BlockSource> {
    table: &'r ReftableReader<S>,
    next_block: usize,
    cur: Option<RawCursor>,
    prefix: Option<Vec<u8>>,
}

impl<S: BlockSource> RefCursor<'_, S> {
    pub fn next(&mut self) -> Result<Option<Ref>> {
        loop {
            let Some(raw) = self.cur.as_mut() else {
                if self.next_block >= self.table.ref_blocks.len() {
                    return Ok(None);
                }
                self.cur = Some(self.table.open_section_block(Section::Ref, self.next_block)?);
                self.next_block += 1;
                continue;
            };
            match raw.next()? {
                Some(BlockEntry::Ref(r)) => {
                    if let Some(prefix) = &self.prefix {
                        if !r.name().as_bytes().starts_with(prefix) {
                            // sorted order: once past the prefix range,
                            // nothing later can match
                            self.cur = None;
                            self.next_block = self.table.ref_blocks.len();
                            return Ok(None);
                        }
                    }
                    return Ok(Some(r));
                }
                Some(other) => {
                    return Err(Error::CorruptBlock {
                        position: 0,
                        reason: format!("unexpected entry in ref block: {other:?}"),
                    })
                }
                None => {
                    self.cur = None;
                }
            }
        }
    }
}

/// Forward cursor over log entries, spanning block boundaries.
pub struct LogCursor<'r, S: BlockSource> {
    table: &'r ReftableReader<S>,
    next_block: usize,
    cur: Option<RawCursor>,
    /// When set, only entries for this ref are yielded and the cursor
    /// ends at the first entry of any other ref.
    name: Option<String>,
}

impl<S: BlockSource> LogCursor<'_, S> {
    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        loop {
            let Some(raw) = self.cur.as_mut() else {
                if self.next_block >= self.table.log_blocks.len() {
                    return Ok(None);
                }
                self.cur = Some(self.table.open_section_block(Section::Log, self.next_block)?);
                self.next_block += 1;
                continue;
            };
            match raw.next()? {
                Some(BlockEntry::Log(e)) => {
                    if let Some(name) = &self.name {
                        if e.name != *name {
                            self.cur = None;
                            self.next_block = self.table.log_blocks.len();
                            return Ok(None);
                        }
                    }
                    return Ok(Some(e));
                }
                Some(other) => {
                    return Err(Error::CorruptBlock {
                        position: 0,
                        reason: format!("unexpected entry in log block: {other:?}"),
                    })
                }
                None => {
                    self.cur = None;
                }
            }
        }
    }
}
