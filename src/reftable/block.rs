//! Single-block reading and writing.
//!
//! Every block is a run of prefix-compressed entries followed by a
//! restart table:
//!
//! ```text
//! +--------+---------+-----+---------+------------------+-----------+-------+
//! | header | entry 1 | ... | entry n | restart offsets  | table pos | count |
//! | 4 B    |         |     |         | 3 B each         | 3 B       | 2 B   |
//! +--------+---------+-----+---------+------------------+-----------+-------+
//! ```
//!
//! An entry is `varint((prefix_len << 3) | value_type)`,
//! `varint(suffix_len)`, the suffix bytes, then a value whose shape
//! depends on the block type. Entries at restart points store their full
//! key (prefix 0), which is what makes binary search over the restart
//! table possible; offsets are relative to the block start and include
//! the 4-byte header.
//!
//! Log block bodies are deflated wholesale after the header; the header
//! declares the *uncompressed* length, so walking past a log block means
//! inflating it and asking the inflater how much input it consumed.

use super::{
    log_key, parse_log_key, Committer, LogEntry, Ref, BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG,
    BLOCK_TYPE_OBJ, BLOCK_TYPE_REF, MAX_BLOCK_LEN, MAX_INDEX_LEN, VALUE_1ID, VALUE_2ID,
    VALUE_DELETE, VALUE_LOG_DATA, VALUE_SYMBOLIC,
};
use crate::codec::{common_prefix, put_u16_be, put_u24_be, put_varint, varint_len, ByteReader};
use crate::id::ObjectId;
use crate::inflate;
use crate::{Error, Result};
use bytes::Bytes;

const LOG_SAME_COMMITTER: u8 = 0x01;
const LOG_SAME_MESSAGE: u8 = 0x02;

/// Size of the restart-table tail shared by every block: table position
/// (u24) plus restart count (u16).
const TAIL_FIXED: usize = 5;

pub(crate) const BLOCK_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub btype: u8,
    /// Declared length including the 4-byte header. For log blocks this
    /// is the uncompressed length; the on-disk extent is discovered by
    /// inflation.
    pub len: u32,
}

pub(crate) fn parse_block_header(raw: &[u8], position: u64) -> Result<BlockHeader> {
    let mut rd = ByteReader::with_base(raw, position);
    let word = rd.u32_be()?;
    let header = if word & 0x8000_0000 != 0 {
        // oversized index block: 31-bit length, type implied
        BlockHeader {
            btype: BLOCK_TYPE_INDEX,
            len: word & 0x7fff_ffff,
        }
    } else {
        BlockHeader {
            btype: (word >> 24) as u8,
            len: word & 0x00ff_ffff,
        }
    };
    if header.len as usize <= BLOCK_HEADER_LEN {
        return Err(corrupt(
            position,
            format!("block declares impossible length {}", header.len),
        ));
    }
    Ok(header)
}

fn encode_block_header(btype: u8, len: u32) -> Result<[u8; 4]> {
    if len < MAX_BLOCK_LEN {
        let word = ((btype as u32) << 24) | len;
        Ok(word.to_be_bytes())
    } else if btype == BLOCK_TYPE_INDEX && len < MAX_INDEX_LEN {
        Ok((0x8000_0000 | len).to_be_bytes())
    } else {
        Err(Error::OverflowedBlock {
            len,
            max: if btype == BLOCK_TYPE_INDEX {
                MAX_INDEX_LEN
            } else {
                MAX_BLOCK_LEN
            },
        })
    }
}

fn corrupt(position: u64, reason: impl Into<String>) -> Error {
    Error::CorruptBlock {
        position,
        reason: reason.into(),
    }
}

/// Accumulates one block's worth of sorted entries.
pub(crate) struct BlockWriter {
    btype: u8,
    cap: u32,
    restart_interval: u16,
    entries: Vec<u8>,
    restarts: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
    // log chain state, valid within the current restart run
    last_committer: Option<Committer>,
    last_message: Option<String>,
}

impl BlockWriter {
    pub fn new(btype: u8, cap: u32, restart_interval: u16) -> Self {
        Self {
            btype,
            cap,
            restart_interval,
            entries: Vec::new(),
            restarts: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
            last_committer: None,
            last_message: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Uncompressed on-disk size if the block were finished now.
    pub fn current_size(&self) -> u32 {
        (BLOCK_HEADER_LEN + self.entries.len() + 3 * self.restarts.len() + TAIL_FIXED) as u32
    }

    fn next_is_restart(&self) -> bool {
        self.entry_count % self.restart_interval as usize == 0
            && self.restarts.len() < u16::MAX as usize
            && BLOCK_HEADER_LEN + self.entries.len() < (1 << 24)
    }

    /// Append an entry, or report `false` when the block is full. The
    /// first entry of a block is always accepted; callers enforce any
    /// size policy on the finished block.
    fn push(&mut self, key: &[u8], vtype: u8, value: &[u8]) -> bool {
        let restart = self.next_is_restart();
        let prefix = if restart {
            0
        } else {
            common_prefix(&self.last_key, key)
        };
        let suffix = key.len() - prefix;
        let mut need = varint_len(((prefix as u64) << 3) | vtype as u64)
            + varint_len(suffix as u64)
            + suffix
            + value.len();
        if restart {
            need += 3;
        }
        if self.entry_count > 0 && self.current_size() as usize + need > self.cap as usize {
            return false;
        }

        if restart {
            self.restarts
                .push((BLOCK_HEADER_LEN + self.entries.len()) as u32);
        }
        put_varint(&mut self.entries, ((prefix as u64) << 3) | vtype as u64);
        put_varint(&mut self.entries, suffix as u64);
        self.entries.extend_from_slice(&key[prefix..]);
        self.entries.extend_from_slice(value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
        true
    }

    pub fn add_ref(&mut self, r: &Ref) -> bool {
        let (vtype, value) = encode_ref_value(r);
        self.push(r.name().as_bytes(), vtype, &value)
    }

    pub fn add_log(&mut self, e: &LogEntry) -> bool {
        let key = log_key(&e.name, e.update_index);
        let mut flags = 0u8;
        if !self.next_is_restart() {
            if self.last_committer.as_ref() == Some(&e.committer) {
                flags |= LOG_SAME_COMMITTER;
            }
            if self.last_message.as_deref() == Some(e.message.as_str()) {
                flags |= LOG_SAME_MESSAGE;
            }
        }
        let value = encode_log_value(e, flags);
        if !self.push(&key, VALUE_LOG_DATA, &value) {
            return false;
        }
        self.last_committer = Some(e.committer.clone());
        self.last_message = Some(e.message.clone());
        true
    }

    pub fn add_index(&mut self, key: &[u8], position: u64) -> bool {
        let mut value = Vec::with_capacity(5);
        put_varint(&mut value, position);
        self.push(key, 0, &value)
    }

    pub fn add_obj(&mut self, id: &ObjectId, block_ordinals: &[u64]) -> bool {
        let mut value = Vec::new();
        put_varint(&mut value, block_ordinals.len() as u64);
        let mut prev = 0u64;
        for (i, ord) in block_ordinals.iter().enumerate() {
            put_varint(&mut value, if i == 0 { *ord } else { ord - prev });
            prev = *ord;
        }
        self.push(id.as_bytes(), 0, &value)
    }

    /// Serialize the block, compressing the body for log blocks.
    pub fn finish(self) -> Result<Vec<u8>> {
        debug_assert!(self.entry_count > 0, "finishing an empty block");
        let mut body = self.entries;
        for r in &self.restarts {
            put_u24_be(&mut body, *r);
        }
        // the table position is redundant with the count; an oversized
        // index block saturates the field and readers fall back to the
        // count alone
        let table_pos = (BLOCK_HEADER_LEN + body.len() - 3 * self.restarts.len()) as u32;
        put_u24_be(&mut body, table_pos.min(0x00ff_ffff));
        put_u16_be(&mut body, self.restarts.len() as u16);

        let declared = (BLOCK_HEADER_LEN + body.len()) as u32;
        let header = encode_block_header(self.btype, declared)?;

        let mut out = Vec::with_capacity(BLOCK_HEADER_LEN + body.len());
        out.extend_from_slice(&header);
        if self.btype == BLOCK_TYPE_LOG {
            out.extend_from_slice(&inflate::deflate(&body));
        } else {
            out.extend_from_slice(&body);
        }
        Ok(out)
    }
}

/// A parsed block: cheap to clone (the body is shared bytes).
#[derive(Clone)]
pub(crate) struct Block {
    pub btype: u8,
    body: Bytes,
    entries_end: usize,
    restart_count: usize,
    pub position: u64,
}

impl Block {
    /// Parse a block body (header already stripped, log bodies already
    /// inflated).
    pub fn parse(btype: u8, body: Bytes, position: u64) -> Result<Self> {
        if body.len() < TAIL_FIXED + 3 + 1 {
            return Err(corrupt(position, "block too small for restart table"));
        }
        let len = body.len();
        let restart_count =
            u16::from_be_bytes([body[len - 2], body[len - 1]]) as usize;
        let tail = TAIL_FIXED + 3 * restart_count;
        if restart_count == 0 || tail + 1 > len {
            return Err(corrupt(position, "restart count exceeds block bounds"));
        }
        let table_pos = ((body[len - 5] as u32) << 16)
            | ((body[len - 4] as u32) << 8)
            | body[len - 3] as u32;
        let expected = ((BLOCK_HEADER_LEN + len - tail) as u32).min(0x00ff_ffff);
        if table_pos != expected {
            return Err(corrupt(position, "restart table position disagrees with count"));
        }
        Ok(Self {
            btype,
            body,
            entries_end: len - tail,
            restart_count,
            position,
        })
    }

    /// Offset (within the body) of the restart entry `i`.
    fn restart_offset(&self, i: usize) -> Result<usize> {
        let at = self.entries_end + 3 * i;
        let raw = ((self.body[at] as usize) << 16)
            | ((self.body[at + 1] as usize) << 8)
            | self.body[at + 2] as usize;
        if raw < BLOCK_HEADER_LEN || raw - BLOCK_HEADER_LEN >= self.entries_end {
            return Err(corrupt(self.position, format!("restart offset {raw} out of bounds")));
        }
        Ok(raw - BLOCK_HEADER_LEN)
    }

    /// Full key stored at restart point `i`.
    fn restart_key(&self, i: usize) -> Result<&[u8]> {
        let at = self.restart_offset(i)?;
        let mut rd = ByteReader::with_base(
            &self.body[at..self.entries_end],
            self.position + (BLOCK_HEADER_LEN + at) as u64,
        );
        let v0 = rd.varint()?;
        if v0 >> 3 != 0 {
            return Err(corrupt(self.position, "restart entry has a compressed key"));
        }
        let suffix = rd.varint()? as usize;
        let start = at + rd.pos();
        if start + suffix > self.entries_end {
            return Err(corrupt(self.position, "restart key overruns entries"));
        }
        Ok(&self.body[start..start + suffix])
    }

    pub fn cursor(&self) -> RawCursor {
        RawCursor {
            block: self.clone(),
            pos: 0,
            key: Vec::new(),
            pending: None,
            last_committer: None,
            last_message: None,
        }
    }

    /// Key of the first entry.
    pub fn first_key(&self) -> Result<Vec<u8>> {
        self.restart_key(0).map(<[u8]>::to_vec)
    }
}

/// One decoded entry; the key lives in the cursor that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockEntry {
    Ref(Ref),
    Log(LogEntry),
    Index { last_key: Vec<u8>, position: u64 },
    Obj { id: ObjectId, blocks: Vec<u64> },
}

/// Forward scanner over a block's entries.
///
/// The key buffer grows monotonically and is reused across entries;
/// `seek` binary-searches the restart table, then scans linearly from the
/// last restart at or before the target.
pub(crate) struct RawCursor {
    block: Block,
    pos: usize,
    key: Vec<u8>,
    pending: Option<BlockEntry>,
    last_committer: Option<Committer>,
    last_message: Option<String>,
}

impl RawCursor {
    pub fn next(&mut self) -> Result<Option<BlockEntry>> {
        if let Some(e) = self.pending.take() {
            return Ok(Some(e));
        }
        if self.pos >= self.block.entries_end {
            return Ok(None);
        }
        self.decode_entry().map(Some)
    }

    /// Position so that the next entry returned is the first one with
    /// key >= `target` (possibly none).
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        let mut lo = 0;
        let mut hi = self.block.restart_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.block.restart_key(mid)? < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.jump_to_restart(lo.saturating_sub(1))?;
        while self.pos < self.block.entries_end {
            let e = self.decode_entry()?;
            if self.key.as_slice() >= target {
                self.pending = Some(e);
                break;
            }
        }
        Ok(())
    }

    fn jump_to_restart(&mut self, i: usize) -> Result<()> {
        self.pos = self.block.restart_offset(i)?;
        self.key.clear();
        self.pending = None;
        // the committer/message chain never crosses a restart
        self.last_committer = None;
        self.last_message = None;
        Ok(())
    }

    fn decode_entry(&mut self) -> Result<BlockEntry> {
        let block = &self.block;
        let base = block.position + (BLOCK_HEADER_LEN + self.pos) as u64;
        let mut rd = ByteReader::with_base(&block.body[self.pos..block.entries_end], base);

        let v0 = rd.varint()?;
        let vtype = (v0 & 7) as u8;
        let prefix = (v0 >> 3) as usize;
        if prefix > self.key.len() {
            return Err(corrupt(block.position, "key prefix longer than previous key"));
        }
        let suffix = rd.varint()? as usize;
        self.key.truncate(prefix);
        self.key.extend_from_slice(rd.bytes(suffix)?);

        let entry = match block.btype {
            BLOCK_TYPE_REF => decode_ref_entry(&self.key, vtype, &mut rd, block.position)?,
            BLOCK_TYPE_LOG => decode_log_entry(
                &self.key,
                vtype,
                &mut rd,
                block.position,
                &mut self.last_committer,
                &mut self.last_message,
            )?,
            BLOCK_TYPE_INDEX => BlockEntry::Index {
                last_key: self.key.clone(),
                position: rd.varint()?,
            },
            BLOCK_TYPE_OBJ => {
                let id = ObjectId::from_slice(&self.key)?;
                let count = rd.varint()? as usize;
                let mut blocks = Vec::with_capacity(count);
                let mut prev = 0u64;
                for i in 0..count {
                    let v = rd.varint()?;
                    prev = if i == 0 { v } else { prev + v };
                    blocks.push(prev);
                }
                BlockEntry::Obj { id, blocks }
            }
            other => {
                return Err(corrupt(
                    block.position,
                    format!("unknown block type {other:#04x}"),
                ))
            }
        };
        self.pos += rd.pos();
        Ok(entry)
    }
}

fn encode_ref_value(r: &Ref) -> (u8, Vec<u8>) {
    match r {
        Ref::Unpeeled { target: None, .. } => (VALUE_DELETE, Vec::new()),
        Ref::Unpeeled {
            target: Some(id), ..
        }
        | Ref::PeeledNonTag { target: id, .. } => (VALUE_1ID, id.as_bytes().to_vec()),
        Ref::PeeledTag { target, peeled, .. } => {
            let mut v = Vec::with_capacity(40);
            v.extend_from_slice(target.as_bytes());
            v.extend_from_slice(peeled.as_bytes());
            (VALUE_2ID, v)
        }
        Ref::Symbolic { target_name, .. } => {
            let mut v = Vec::with_capacity(target_name.len() + 2);
            put_varint(&mut v, target_name.len() as u64);
            v.extend_from_slice(target_name.as_bytes());
            (VALUE_SYMBOLIC, v)
        }
    }
}

fn decode_ref_entry(
    key: &[u8],
    vtype: u8,
    rd: &mut ByteReader<'_>,
    position: u64,
) -> Result<BlockEntry> {
    let name = std::str::from_utf8(key)
        .map_err(|_| corrupt(position, "ref name is not UTF-8"))?
        .to_owned();
    let r = match vtype {
        VALUE_DELETE => Ref::Unpeeled { name, target: None },
        VALUE_1ID => Ref::PeeledNonTag {
            name,
            target: rd.object_id()?,
        },
        VALUE_2ID => Ref::PeeledTag {
            name,
            target: rd.object_id()?,
            peeled: rd.object_id()?,
        },
        VALUE_SYMBOLIC => {
            let len = rd.varint()? as usize;
            let target_name = std::str::from_utf8(rd.bytes(len)?)
                .map_err(|_| corrupt(position, "symbolic target is not UTF-8"))?
                .to_owned();
            Ref::Symbolic { name, target_name }
        }
        other => return Err(corrupt(position, format!("unknown ref value type {other}"))),
    };
    Ok(BlockEntry::Ref(r))
}

fn encode_log_value(e: &LogEntry, flags: u8) -> Vec<u8> {
    let mut v = Vec::with_capacity(48);
    v.push(flags);
    v.extend_from_slice(e.old_id.as_bytes());
    v.extend_from_slice(e.new_id.as_bytes());
    if flags & LOG_SAME_COMMITTER == 0 {
        put_varint(&mut v, e.committer.name.len() as u64);
        v.extend_from_slice(e.committer.name.as_bytes());
        put_varint(&mut v, e.committer.email.len() as u64);
        v.extend_from_slice(e.committer.email.as_bytes());
        put_varint(&mut v, e.committer.time_secs);
        v.extend_from_slice(&e.committer.tz_offset_mins.to_be_bytes());
    }
    if flags & LOG_SAME_MESSAGE == 0 {
        put_varint(&mut v, e.message.len() as u64);
        v.extend_from_slice(e.message.as_bytes());
    }
    v
}

fn decode_log_entry(
    key: &[u8],
    vtype: u8,
    rd: &mut ByteReader<'_>,
    position: u64,
    last_committer: &mut Option<Committer>,
    last_message: &mut Option<String>,
) -> Result<BlockEntry> {
    if vtype != VALUE_LOG_DATA {
        return Err(corrupt(position, format!("unknown log value type {vtype}")));
    }
    let (name, update_index) =
        parse_log_key(key).map_err(|_| corrupt(position, "malformed log key"))?;
    let flags = rd.u8()?;
    let old_id = rd.object_id()?;
    let new_id = rd.object_id()?;

    let read_str = |rd: &mut ByteReader<'_>| -> Result<String> {
        let len = rd.varint()? as usize;
        std::str::from_utf8(rd.bytes(len)?)
            .map(str::to_owned)
            .map_err(|_| corrupt(position, "log text is not UTF-8"))
    };

    let committer = if flags & LOG_SAME_COMMITTER != 0 {
        last_committer
            .clone()
            .ok_or_else(|| corrupt(position, "same-committer flag with no previous committer"))?
    } else {
        let name = read_str(rd)?;
        let email = read_str(rd)?;
        let time_secs = rd.varint()?;
        let tz_offset_mins = i16::from_be_bytes([rd.u8()?, rd.u8()?]);
        Committer {
            name,
            email,
            time_secs,
            tz_offset_mins,
        }
    };
    let message = if flags & LOG_SAME_MESSAGE != 0 {
        last_message
            .clone()
            .ok_or_else(|| corrupt(position, "same-message flag with no previous message"))?
    } else {
        read_str(rd)?
    };

    *last_committer = Some(committer.clone());
    *last_message = Some(message.clone());

    Ok(BlockEntry::Log(LogEntry {
        name,
        update_index,
        old_id,
        new_id,
        committer,
        message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[0] = n;
        ObjectId::from_bytes(&raw)
    }

    fn committer(time: u64) -> Committer {
        Committer {
            name: "A U Thor".into(),
            email: "author@example.com".into(),
            time_secs: time,
            tz_offset_mins: -240,
        }
    }

    fn finish_ref_block(w: BlockWriter) -> Block {
        let raw = w.finish().unwrap();
        let header = parse_block_header(&raw, 0).unwrap();
        assert_eq!(header.btype, BLOCK_TYPE_REF);
        assert_eq!(header.len as usize, raw.len());
        Block::parse(BLOCK_TYPE_REF, Bytes::from(raw).slice(4..), 0).unwrap()
    }

    #[test]
    fn single_ref_block_layout() {
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 4096, 16);
        assert!(w.add_ref(&Ref::PeeledNonTag {
            name: "refs/heads/master".into(),
            target: id(1),
        }));
        let raw = w.finish().unwrap();
        // 4 header + (1 + 1 + 17 + 20) entry + 3 restart + 3 + 2 tail
        assert_eq!(raw.len(), 51);
        let header = parse_block_header(&raw, 0).unwrap();
        assert_eq!(header.len, 51);
    }

    #[test]
    fn iterate_and_seek_refs() {
        let names: Vec<String> = (0..100).map(|i| format!("refs/heads/{i:03}")).collect();
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 1 << 20, 16);
        for name in &names {
            assert!(w.add_ref(&Ref::PeeledNonTag {
                name: name.clone(),
                target: id(7),
            }));
        }
        let block = finish_ref_block(w);
        assert_eq!(block.restart_count, 100usize.div_ceil(16));

        let mut cur = block.cursor();
        for name in &names {
            match cur.next().unwrap().unwrap() {
                BlockEntry::Ref(r) => assert_eq!(r.name(), name),
                other => panic!("unexpected entry {other:?}"),
            }
        }
        assert!(cur.next().unwrap().is_none());

        // every present key is found
        for name in &names {
            let mut cur = block.cursor();
            cur.seek(name.as_bytes()).unwrap();
            match cur.next().unwrap().unwrap() {
                BlockEntry::Ref(r) => assert_eq!(r.name(), name),
                other => panic!("unexpected entry {other:?}"),
            }
        }

        // absent keys land on the next larger key
        let mut cur = block.cursor();
        cur.seek(b"refs/heads/0505").unwrap();
        match cur.next().unwrap().unwrap() {
            BlockEntry::Ref(r) => assert_eq!(r.name(), "refs/heads/051"),
            other => panic!("unexpected entry {other:?}"),
        }

        // past the end
        let mut cur = block.cursor();
        cur.seek(b"refs/tags/zzz").unwrap();
        assert!(cur.next().unwrap().is_none());
    }

    #[test]
    fn all_value_types_round_trip() {
        let refs = vec![
            Ref::Symbolic {
                name: "HEAD".into(),
                target_name: "refs/heads/master".into(),
            },
            Ref::tombstone("refs/heads/dead"),
            Ref::PeeledNonTag {
                name: "refs/heads/master".into(),
                target: id(1),
            },
            Ref::PeeledTag {
                name: "refs/tags/v1.0".into(),
                target: id(1),
                peeled: id(2),
            },
        ];
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 4096, 16);
        for r in &refs {
            assert!(w.add_ref(r));
        }
        let block = finish_ref_block(w);
        let mut cur = block.cursor();
        for want in &refs {
            match cur.next().unwrap().unwrap() {
                BlockEntry::Ref(got) => assert_eq!(&got, want),
                other => panic!("unexpected entry {other:?}"),
            }
        }
    }

    #[test]
    fn block_reports_full() {
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 128, 16);
        let mut added = 0;
        loop {
            let r = Ref::PeeledNonTag {
                name: format!("refs/heads/branch-{added:04}"),
                target: id(3),
            };
            if !w.add_ref(&r) {
                break;
            }
            added += 1;
        }
        assert!(added > 0);
        assert!(w.current_size() <= 128);
        // a fresh block always accepts its first entry, even a huge one
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 64, 16);
        assert!(w.add_ref(&Ref::Symbolic {
            name: "refs/heads/long".into(),
            target_name: "x".repeat(200),
        }));
        assert!(w.current_size() > 64);
    }

    #[test]
    fn corrupt_restart_table_detected() {
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 4096, 16);
        w.add_ref(&Ref::PeeledNonTag {
            name: "refs/heads/master".into(),
            target: id(1),
        });
        let mut raw = w.finish().unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0x01; // flip the restart count
        assert!(matches!(
            Block::parse(BLOCK_TYPE_REF, Bytes::from(raw).slice(4..), 0),
            Err(Error::CorruptBlock { .. })
        ));
    }

    #[test]
    fn log_block_compresses_and_chains() {
        let mut w = BlockWriter::new(BLOCK_TYPE_LOG, 1 << 20, 16);
        let mut entries = Vec::new();
        for i in (1..=40u64).rev() {
            entries.push(LogEntry {
                name: "refs/heads/master".into(),
                update_index: i,
                old_id: id((i - 1) as u8),
                new_id: id(i as u8),
                committer: committer(1000 + i),
                message: "push".into(),
            });
        }
        for e in &entries {
            assert!(w.add_log(e));
        }
        let raw = w.finish().unwrap();
        let header = parse_block_header(&raw, 0).unwrap();
        assert_eq!(header.btype, BLOCK_TYPE_LOG);
        // header declares the uncompressed length
        let declared = header.len as usize - 4;
        let (body, consumed) = inflate::inflate_sized(&raw[4..], declared).unwrap();
        assert_eq!(consumed as usize, raw.len() - 4);

        let block = Block::parse(BLOCK_TYPE_LOG, Bytes::from(body), 0).unwrap();
        let mut cur = block.cursor();
        for want in &entries {
            match cur.next().unwrap().unwrap() {
                BlockEntry::Log(got) => assert_eq!(&got, want),
                other => panic!("unexpected entry {other:?}"),
            }
        }
        assert!(cur.next().unwrap().is_none());

        // seeking straight to an older update still resolves chained
        // committers because chains never cross a restart
        let mut cur = block.cursor();
        cur.seek(&log_key("refs/heads/master", 7)).unwrap();
        match cur.next().unwrap().unwrap() {
            BlockEntry::Log(got) => {
                assert_eq!(got.update_index, 7);
                assert_eq!(got.committer, committer(1007));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn index_entries_round_trip() {
        let mut w = BlockWriter::new(BLOCK_TYPE_INDEX, 1 << 20, 16);
        assert!(w.add_index(b"refs/heads/c", 8));
        assert!(w.add_index(b"refs/heads/q", 4104));
        assert!(w.add_index(b"refs/tags/v9", 80000));
        let raw = w.finish().unwrap();
        let header = parse_block_header(&raw, 0).unwrap();
        assert_eq!(header.btype, BLOCK_TYPE_INDEX);
        let block = Block::parse(BLOCK_TYPE_INDEX, Bytes::from(raw).slice(4..), 0).unwrap();

        let mut cur = block.cursor();
        cur.seek(b"refs/heads/m").unwrap();
        match cur.next().unwrap().unwrap() {
            BlockEntry::Index { last_key, position } => {
                assert_eq!(last_key, b"refs/heads/q");
                assert_eq!(position, 4104);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn obj_entries_round_trip() {
        let mut w = BlockWriter::new(BLOCK_TYPE_OBJ, 1 << 20, 16);
        let mut ids: Vec<ObjectId> = (1..=5u8).map(id).collect();
        ids.sort();
        for (i, oid) in ids.iter().enumerate() {
            assert!(w.add_obj(oid, &[i as u64, i as u64 + 2]));
        }
        let raw = w.finish().unwrap();
        let block = Block::parse(BLOCK_TYPE_OBJ, Bytes::from(raw).slice(4..), 0).unwrap();
        let mut cur = block.cursor();
        for (i, oid) in ids.iter().enumerate() {
            match cur.next().unwrap().unwrap() {
                BlockEntry::Obj { id: got, blocks } => {
                    assert_eq!(&got, oid);
                    assert_eq!(blocks, vec![i as u64, i as u64 + 2]);
                }
                other => panic!("unexpected entry {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_plain_block_rejected() {
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, u32::MAX, 16);
        // one enormous symbolic target pushes the block past 2^24
        assert!(w.add_ref(&Ref::Symbolic {
            name: "refs/heads/huge".into(),
            target_name: "t".repeat(MAX_BLOCK_LEN as usize),
        }));
        assert!(matches!(
            w.finish(),
            Err(Error::OverflowedBlock { .. })
        ));
    }
}
