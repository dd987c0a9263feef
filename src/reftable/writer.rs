//! Writing a reftable from sorted streams of refs and logs.

use super::block::BlockWriter;
use super::{
    log_key, LogEntry, Ref, ReftableConfig, BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG, BLOCK_TYPE_OBJ,
    BLOCK_TYPE_REF, FILE_MAGIC, FOOTER_MAGIC, INDEX_SECTION_THRESHOLD, MAX_INDEX_LEN,
    MAX_ON_DISK_UPDATE_INDEX, VERSION_1,
};
use crate::codec::{put_u24_be, put_u32_be, put_u48_be};
use crate::id::ObjectId;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::debug;

/// Counters describing a finished table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub refs: u64,
    pub logs: u64,
    pub ref_blocks: usize,
    pub obj_blocks: usize,
    pub log_blocks: usize,
    /// Keys in the ref index block; zero when none was needed.
    pub index_keys: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Refs,
    Logs,
}

/// Streams sorted refs (then sorted logs) into a new table.
///
/// Refs must arrive in strictly ascending name order and logs in strictly
/// ascending (name, reverse update index) order; a violation fails
/// immediately with [`Error::InvariantViolated`]. One block is buffered
/// at a time; when an entry does not fit, the block is flushed, an index
/// entry recorded, and a fresh block started. `finish` writes any index
/// blocks, then the footer and its CRC.
pub struct ReftableWriter<W: Write> {
    out: W,
    cfg: ReftableConfig,
    position: u64,
    phase: Phase,
    cur: Option<BlockWriter>,
    ref_block_index: Vec<(Vec<u8>, u64)>,
    log_block_index: Vec<(Vec<u8>, u64)>,
    obj_refs: BTreeMap<ObjectId, Vec<u64>>,
    last_ref_name: Vec<u8>,
    last_log_key: Vec<u8>,
    min_update_index: u64,
    max_update_index: u64,
    stats: WriterStats,
}

impl<W: Write> ReftableWriter<W> {
    /// Create a writer and emit the file header.
    pub fn new(mut out: W, cfg: ReftableConfig) -> Result<Self> {
        cfg.validate()?;
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&FILE_MAGIC);
        header.push(VERSION_1);
        put_u24_be(&mut header, cfg.block_size);
        out.write_all(&header)?;
        Ok(Self {
            out,
            cfg,
            position: 8,
            phase: Phase::Refs,
            cur: None,
            ref_block_index: Vec::new(),
            log_block_index: Vec::new(),
            obj_refs: BTreeMap::new(),
            last_ref_name: Vec::new(),
            last_log_key: Vec::new(),
            min_update_index: 0,
            max_update_index: 0,
            stats: WriterStats::default(),
        })
    }

    /// Record the update-index range the footer will carry.
    pub fn set_update_index_range(&mut self, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Err(Error::InvariantViolated(format!(
                "update index range {min}..{max} is inverted"
            )));
        }
        if min > MAX_ON_DISK_UPDATE_INDEX {
            return Err(Error::InvariantViolated(format!(
                "min update index {min} exceeds the 48-bit on-disk limit"
            )));
        }
        if max - min > u32::MAX as u64 {
            return Err(Error::InvariantViolated(format!(
                "update index span {} exceeds the 32-bit on-disk limit",
                max - min
            )));
        }
        self.min_update_index = min;
        self.max_update_index = max;
        Ok(())
    }

    /// Append the next ref. Names must be non-empty and strictly
    /// ascending.
    pub fn add_ref(&mut self, r: &Ref) -> Result<()> {
        if self.phase != Phase::Refs {
            return Err(Error::InvariantViolated(
                "refs must be written before logs".into(),
            ));
        }
        let name = r.name().as_bytes();
        if name.is_empty() {
            return Err(Error::InvariantViolated("ref name is empty".into()));
        }
        if !self.last_ref_name.is_empty() && name <= self.last_ref_name.as_slice() {
            return Err(Error::InvariantViolated(format!(
                "ref {:?} arrived out of order",
                r.name()
            )));
        }

        let cur = self.cur.get_or_insert_with(|| {
            BlockWriter::new(BLOCK_TYPE_REF, self.cfg.block_size, self.cfg.restart_interval)
        });
        if !cur.add_ref(r) {
            self.flush_block()?;
            let cur = self.cur.insert(BlockWriter::new(
                BLOCK_TYPE_REF,
                self.cfg.block_size,
                self.cfg.restart_interval,
            ));
            // a fresh block always takes one entry; the size policy is
            // enforced when the block is flushed
            cur.add_ref(r);
        }

        if self.cfg.index_objects {
            let ordinal = self.ref_block_index.len() as u64;
            for id in [r.object_id(), r.peeled_id()].into_iter().flatten() {
                let ords = self.obj_refs.entry(*id).or_default();
                if ords.last() != Some(&ordinal) {
                    ords.push(ordinal);
                }
            }
        }

        self.last_ref_name.clear();
        self.last_ref_name.extend_from_slice(name);
        self.stats.refs += 1;
        Ok(())
    }

    /// Append the next log entry. Keys must be strictly ascending, which
    /// for a single ref means update indexes strictly descending.
    pub fn add_log(&mut self, e: &LogEntry) -> Result<()> {
        if e.name.is_empty() {
            return Err(Error::InvariantViolated("log ref name is empty".into()));
        }
        if self.phase == Phase::Refs {
            self.finish_refs()?;
        }
        let key = log_key(&e.name, e.update_index);
        if !self.last_log_key.is_empty() && key <= self.last_log_key {
            return Err(Error::InvariantViolated(format!(
                "log entry for {:?} at update index {} arrived out of order",
                e.name, e.update_index
            )));
        }

        let cur = self.cur.get_or_insert_with(|| {
            BlockWriter::new(BLOCK_TYPE_LOG, self.cfg.block_size, self.cfg.restart_interval)
        });
        if !cur.add_log(e) {
            self.flush_block()?;
            let cur = self.cur.insert(BlockWriter::new(
                BLOCK_TYPE_LOG,
                self.cfg.block_size,
                self.cfg.restart_interval,
            ));
            cur.add_log(e);
        }

        self.last_log_key = key;
        self.stats.logs += 1;
        Ok(())
    }

    /// Flush pending blocks, write index blocks and the footer.
    pub fn finish(mut self) -> Result<WriterStats> {
        if self.phase == Phase::Refs {
            self.finish_refs()?;
        }
        self.flush_block()?;

        if self.ref_block_index.len() > INDEX_SECTION_THRESHOLD {
            self.stats.index_keys = self.ref_block_index.len();
            let entries = std::mem::take(&mut self.ref_block_index);
            self.write_index(entries)?;
        }
        if self.log_block_index.len() > INDEX_SECTION_THRESHOLD {
            let entries = std::mem::take(&mut self.log_block_index);
            self.write_index(entries)?;
        }

        let mut footer = Vec::with_capacity(16);
        footer.extend_from_slice(&FOOTER_MAGIC);
        put_u48_be(&mut footer, self.min_update_index);
        put_u32_be(&mut footer, (self.max_update_index - self.min_update_index) as u32);
        let mut crc = crc32fast::Hasher::new();
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&FILE_MAGIC);
        header.push(VERSION_1);
        put_u24_be(&mut header, self.cfg.block_size);
        crc.update(&header);
        crc.update(&footer);
        put_u32_be(&mut footer, crc.finalize());
        self.out.write_all(&footer)?;
        self.position += footer.len() as u64;
        self.out.flush()?;

        self.stats.bytes = self.position;
        debug!(stats = ?self.stats, "finished reftable");
        Ok(self.stats)
    }

    /// Close out the ref section: flush the open ref block and, when the
    /// section is large enough to earn an index, the object blocks.
    fn finish_refs(&mut self) -> Result<()> {
        self.flush_block()?;
        self.phase = Phase::Logs;
        if !self.cfg.index_objects
            || self.ref_block_index.len() <= INDEX_SECTION_THRESHOLD
            || self.obj_refs.is_empty()
        {
            return Ok(());
        }
        let obj_refs = std::mem::take(&mut self.obj_refs);
        let mut bw = BlockWriter::new(BLOCK_TYPE_OBJ, self.cfg.block_size, self.cfg.restart_interval);
        for (id, ords) in &obj_refs {
            if !bw.add_obj(id, ords) {
                self.write_obj_block(bw)?;
                bw = BlockWriter::new(BLOCK_TYPE_OBJ, self.cfg.block_size, self.cfg.restart_interval);
                bw.add_obj(id, ords);
            }
        }
        if !bw.is_empty() {
            self.write_obj_block(bw)?;
        }
        Ok(())
    }

    fn write_obj_block(&mut self, bw: BlockWriter) -> Result<()> {
        self.check_block_fits(&bw)?;
        let bytes = bw.finish()?;
        self.out.write_all(&bytes)?;
        self.position += bytes.len() as u64;
        self.stats.obj_blocks += 1;
        Ok(())
    }

    fn write_index(&mut self, entries: Vec<(Vec<u8>, u64)>) -> Result<()> {
        let mut bw = BlockWriter::new(BLOCK_TYPE_INDEX, MAX_INDEX_LEN, self.cfg.restart_interval);
        for (key, position) in &entries {
            // cap is 2^31, so a single index block always suffices
            bw.add_index(key, *position);
        }
        let bytes = bw.finish()?;
        self.out.write_all(&bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(bw) = self.cur.take() else {
            return Ok(());
        };
        if bw.is_empty() {
            return Ok(());
        }
        self.check_block_fits(&bw)?;
        let last_key = bw.last_key().to_vec();
        let section = if self.phase == Phase::Refs {
            BLOCK_TYPE_REF
        } else {
            BLOCK_TYPE_LOG
        };
        let bytes = bw.finish()?;
        self.out.write_all(&bytes)?;
        if section == BLOCK_TYPE_REF {
            self.ref_block_index.push((last_key, self.position));
            self.stats.ref_blocks += 1;
        } else {
            self.log_block_index.push((last_key, self.position));
            self.stats.log_blocks += 1;
        }
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn check_block_fits(&self, bw: &BlockWriter) -> Result<()> {
        if bw.current_size() > self.cfg.block_size {
            return Err(Error::InvariantViolated(format!(
                "a single entry needs {} bytes, more than the {} byte block size",
                bw.current_size(),
                self.cfg.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::reftable::{Committer, LogEntry};

    fn id(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[0] = n;
        ObjectId::from_bytes(&raw)
    }

    fn write_refs(refs: &[Ref]) -> (Vec<u8>, WriterStats) {
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        for r in refs {
            w.add_ref(r).unwrap();
        }
        let stats = w.finish().unwrap();
        (buf, stats)
    }

    #[test]
    fn empty_table_is_header_plus_footer() {
        let (buf, stats) = write_refs(&[]);
        assert_eq!(buf.len(), 24);
        assert_eq!(stats.bytes, 24);
        assert_eq!(stats.ref_blocks, 0);
    }

    #[test]
    fn single_peeled_ref_table_size() {
        let (buf, _) = write_refs(&[Ref::PeeledNonTag {
            name: "refs/heads/master".into(),
            target: id(1),
        }]);
        // 8 + 2 + 17 + 20 + 12 + 16
        assert_eq!(buf.len(), 75);
    }

    #[test]
    fn annotated_tag_table_size() {
        let (buf, _) = write_refs(&[Ref::PeeledTag {
            name: "refs/tags/v1.0".into(),
            target: id(1),
            peeled: id(2),
        }]);
        // 8 + 2 + 14 + 40 + 12 + 16
        assert_eq!(buf.len(), 92);
    }

    #[test]
    fn single_ref_size_formula() {
        // 8 + 2 + name_len + value_bytes + 12 + 16 for every value shape
        let cases: Vec<(Ref, usize)> = vec![
            (Ref::tombstone("refs/heads/gone"), 0),
            (
                Ref::PeeledNonTag {
                    name: "refs/heads/gone".into(),
                    target: id(3),
                },
                20,
            ),
            (
                Ref::Symbolic {
                    name: "HEAD".into(),
                    target_name: "refs/heads/master".into(),
                },
                1 + 17,
            ),
        ];
        for (r, value_bytes) in cases {
            let name_len = r.name().len();
            let (buf, _) = write_refs(&[r]);
            assert_eq!(buf.len(), 8 + 2 + name_len + value_bytes + 12 + 16);
        }
    }

    #[test]
    fn rejects_out_of_order_and_duplicate_refs() {
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        w.add_ref(&Ref::tombstone("refs/heads/b")).unwrap();
        assert!(matches!(
            w.add_ref(&Ref::tombstone("refs/heads/a")),
            Err(Error::InvariantViolated(_))
        ));
        assert!(matches!(
            w.add_ref(&Ref::tombstone("refs/heads/b")),
            Err(Error::InvariantViolated(_))
        ));
    }

    #[test]
    fn rejects_refs_after_logs() {
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        w.add_log(&LogEntry {
            name: "refs/heads/master".into(),
            update_index: 1,
            old_id: id(0),
            new_id: id(1),
            committer: Committer {
                name: "A".into(),
                email: "a@b".into(),
                time_secs: 1,
                tz_offset_mins: 0,
            },
            message: "m".into(),
        })
        .unwrap();
        assert!(matches!(
            w.add_ref(&Ref::tombstone("refs/heads/a")),
            Err(Error::InvariantViolated(_))
        ));
    }

    #[test]
    fn rejects_descending_log_keys() {
        let entry = |idx: u64| LogEntry {
            name: "refs/heads/master".into(),
            update_index: idx,
            old_id: id(0),
            new_id: id(1),
            committer: Committer {
                name: "A".into(),
                email: "a@b".into(),
                time_secs: 1,
                tz_offset_mins: 0,
            },
            message: "m".into(),
        };
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        // update indexes must arrive newest first for one ref
        w.add_log(&entry(5)).unwrap();
        w.add_log(&entry(4)).unwrap();
        assert!(matches!(
            w.add_log(&entry(6)),
            Err(Error::InvariantViolated(_))
        ));
    }

    #[test]
    fn update_index_range_limits() {
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        assert!(w.set_update_index_range(7, 3).is_err());
        assert!(w.set_update_index_range(1 << 48, 1 << 48).is_err());
        assert!(w
            .set_update_index_range(10, 10 + u32::MAX as u64 + 1)
            .is_err());
        w.set_update_index_range(10, 200).unwrap();
    }

    #[test]
    fn index_written_only_past_threshold() {
        let refs: Vec<Ref> = (1..=567)
            .map(|i| Ref::PeeledNonTag {
                name: format!("refs/heads/{i:04}"),
                target: id(1),
            })
            .collect();
        let (_, stats) = write_refs(&refs);
        assert_eq!(stats.ref_blocks, 4);
        assert_eq!(stats.index_keys, 0);
        assert_eq!(stats.obj_blocks, 0);

        let refs: Vec<Ref> = (1..=5670)
            .map(|i| Ref::PeeledNonTag {
                name: format!("refs/heads/{i:04}"),
                target: id(1),
            })
            .collect();
        let (_, stats) = write_refs(&refs);
        assert!(stats.ref_blocks > INDEX_SECTION_THRESHOLD);
        assert_eq!(stats.index_keys, stats.ref_blocks);
        assert!(stats.obj_blocks > 0);
    }

    #[test]
    fn entry_too_large_for_block_rejected() {
        let mut buf = Vec::new();
        let cfg = ReftableConfig {
            block_size: 256,
            ..ReftableConfig::default()
        };
        let mut w = ReftableWriter::new(&mut buf, cfg).unwrap();
        w.add_ref(&Ref::Symbolic {
            name: "refs/heads/a".into(),
            target_name: "t".repeat(400),
        })
        .unwrap();
        assert!(matches!(
            w.finish(),
            Err(Error::InvariantViolated(_))
        ));
    }
}
