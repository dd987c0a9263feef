//! Collapsing a stack of reftables into one table.

use super::merged::{merged_logs_all, merged_refs_all};
use super::reader::ReftableReader;
use super::writer::{ReftableWriter, WriterStats};
use super::ReftableConfig;
use crate::progress::ProgressMonitor;
use crate::source::BlockSource;
use crate::Result;
use std::io::Write;
use tracing::debug;

/// Counters describing one compaction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub refs_written: u64,
    pub logs_written: u64,
    pub tombstones_dropped: u64,
    pub logs_expired: u64,
    pub table: WriterStats,
}

/// Streams the merged view of a stack into a fresh table, dropping
/// shadowed entries, tombstones and expired log entries along the way.
///
/// Compaction is single-pass: refs stream through first, then logs, each
/// already merged and deduplicated. Applying the compactor to its own
/// output produces an identical table.
pub struct Compactor {
    cfg: ReftableConfig,
    include_deletes: bool,
    oldest_reflog_time: u64,
    compact_bytes_limit: Option<u64>,
    budget_used: u64,
    budget_tables: usize,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compactor {
    pub fn new() -> Self {
        Self {
            cfg: ReftableConfig::default(),
            include_deletes: false,
            oldest_reflog_time: 0,
            compact_bytes_limit: None,
            budget_used: 0,
            budget_tables: 0,
        }
    }

    pub fn config(mut self, cfg: ReftableConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Keep tombstones in the output. Required when the compaction is
    /// partial (older tables remain below the output) so deletions keep
    /// shadowing them.
    pub fn include_deletes(mut self, yes: bool) -> Self {
        self.include_deletes = yes;
        self
    }

    /// Drop log entries older than this committer time (seconds).
    pub fn oldest_reflog_time(mut self, time_secs: u64) -> Self {
        self.oldest_reflog_time = time_secs;
        self
    }

    /// Byte budget for greedy input selection via [`Compactor::try_add`].
    pub fn compact_bytes_limit(mut self, limit: u64) -> Self {
        self.compact_bytes_limit = Some(limit);
        self
    }

    /// Greedily claim a table of `table_bytes` for this compaction.
    /// Returns `false` once the byte budget is exhausted; the first table
    /// is always accepted.
    pub fn try_add(&mut self, table_bytes: u64) -> bool {
        if let Some(limit) = self.compact_bytes_limit {
            if self.budget_tables > 0 && self.budget_used + table_bytes > limit {
                return false;
            }
        }
        self.budget_used += table_bytes;
        self.budget_tables += 1;
        true
    }

    /// Merge `tables` (newest first) into `out`.
    pub fn compact<S: BlockSource, W: Write>(
        &self,
        tables: &[ReftableReader<S>],
        out: W,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        let mut writer = ReftableWriter::new(out, self.cfg.clone())?;

        let min = tables.iter().map(|t| t.min_update_index()).min().unwrap_or(0);
        let max = tables.iter().map(|t| t.max_update_index()).max().unwrap_or(0);
        writer.set_update_index_range(min, max.max(min))?;

        progress.begin("compacting refs", None);
        // pull tombstones through the merge so they still shadow older
        // entries, then decide here whether they survive
        let mut refs = merged_refs_all(tables, true)?;
        while let Some(r) = refs.next()? {
            if r.is_tombstone() && !self.include_deletes {
                stats.tombstones_dropped += 1;
                continue;
            }
            writer.add_ref(&r)?;
            stats.refs_written += 1;
            progress.update(1);
        }
        progress.end();

        progress.begin("compacting logs", None);
        let mut logs = merged_logs_all(tables)?;
        while let Some(e) = logs.next()? {
            if self.oldest_reflog_time > 0 && e.committer.time_secs < self.oldest_reflog_time {
                stats.logs_expired += 1;
                continue;
            }
            writer.add_log(&e)?;
            stats.logs_written += 1;
            progress.update(1);
        }
        progress.end();

        stats.table = writer.finish()?;
        debug!(?stats, inputs = tables.len(), "compacted reftable stack");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::progress::NoProgress;
    use crate::reftable::{Committer, LogEntry, Ref, ReftableReader, ReftableWriter};
    use crate::source::MemBlockSource;

    fn id(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[0] = n;
        ObjectId::from_bytes(&raw)
    }

    fn log(name: &str, idx: u64, time: u64) -> LogEntry {
        LogEntry {
            name: name.into(),
            update_index: idx,
            old_id: id(0),
            new_id: id(idx as u8),
            committer: Committer {
                name: "A U Thor".into(),
                email: "author@example.com".into(),
                time_secs: time,
                tz_offset_mins: 0,
            },
            message: "push".into(),
        }
    }

    fn table(
        range: (u64, u64),
        refs: &[Ref],
        logs: &[LogEntry],
    ) -> ReftableReader<MemBlockSource> {
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        w.set_update_index_range(range.0, range.1).unwrap();
        for r in refs {
            w.add_ref(r).unwrap();
        }
        for e in logs {
            w.add_log(e).unwrap();
        }
        w.finish().unwrap();
        ReftableReader::open(MemBlockSource::new(buf)).unwrap()
    }

    fn reopen(buf: Vec<u8>) -> ReftableReader<MemBlockSource> {
        ReftableReader::open(MemBlockSource::new(buf)).unwrap()
    }

    #[test]
    fn drops_shadowed_and_tombstoned_refs() {
        let newer = table(
            (3, 4),
            &[
                Ref::tombstone("refs/heads/dead"),
                Ref::PeeledNonTag {
                    name: "refs/heads/main".into(),
                    target: id(9),
                },
            ],
            &[],
        );
        let older = table(
            (1, 2),
            &[
                Ref::PeeledNonTag {
                    name: "refs/heads/dead".into(),
                    target: id(1),
                },
                Ref::PeeledNonTag {
                    name: "refs/heads/main".into(),
                    target: id(2),
                },
            ],
            &[],
        );

        let mut out = Vec::new();
        let stats = Compactor::new()
            .compact(&[newer, older], &mut out, &mut NoProgress)
            .unwrap();
        assert_eq!(stats.refs_written, 1);
        assert_eq!(stats.tombstones_dropped, 1);

        let t = reopen(out);
        assert_eq!(t.min_update_index(), 1);
        assert_eq!(t.max_update_index(), 4);
        let mut cur = t.seek_to_first();
        let only = cur.next().unwrap().unwrap();
        assert_eq!(only.name(), "refs/heads/main");
        assert_eq!(only.object_id(), Some(&id(9)));
        assert!(cur.next().unwrap().is_none());
    }

    #[test]
    fn include_deletes_preserves_tombstones() {
        let newer = table((2, 2), &[Ref::tombstone("refs/heads/dead")], &[]);
        let older = table(
            (1, 1),
            &[Ref::PeeledNonTag {
                name: "refs/heads/dead".into(),
                target: id(1),
            }],
            &[],
        );

        let mut out = Vec::new();
        let stats = Compactor::new()
            .include_deletes(true)
            .compact(&[newer, older], &mut out, &mut NoProgress)
            .unwrap();
        assert_eq!(stats.refs_written, 1);
        assert_eq!(stats.tombstones_dropped, 0);

        let t = reopen(out);
        let only = t.seek_to_first().next().unwrap().unwrap();
        assert!(only.is_tombstone());
    }

    #[test]
    fn expires_old_log_entries() {
        let newer = table((3, 3), &[], &[log("refs/heads/main", 3, 5000)]);
        let older = table(
            (1, 2),
            &[],
            &[
                log("refs/heads/main", 2, 1500),
                log("refs/heads/main", 1, 900),
            ],
        );

        let mut out = Vec::new();
        let stats = Compactor::new()
            .oldest_reflog_time(1000)
            .compact(&[newer, older], &mut out, &mut NoProgress)
            .unwrap();
        assert_eq!(stats.logs_written, 2);
        assert_eq!(stats.logs_expired, 1);

        let t = reopen(out);
        let mut cur = t.seek_log("refs/heads/main").unwrap();
        assert_eq!(cur.next().unwrap().unwrap().update_index, 3);
        assert_eq!(cur.next().unwrap().unwrap().update_index, 2);
        assert!(cur.next().unwrap().is_none());
    }

    #[test]
    fn compaction_is_idempotent_on_its_own_output() {
        let newer = table(
            (5, 9),
            &[
                Ref::PeeledNonTag {
                    name: "refs/heads/main".into(),
                    target: id(9),
                },
                Ref::Symbolic {
                    name: "refs/heads/sym".into(),
                    target_name: "refs/heads/main".into(),
                },
            ],
            &[log("refs/heads/main", 9, 900), log("refs/heads/main", 8, 800)],
        );
        let older = table(
            (1, 4),
            &[Ref::PeeledTag {
                name: "refs/tags/v1".into(),
                target: id(1),
                peeled: id(2),
            }],
            &[log("refs/tags/v1", 4, 400)],
        );

        let mut once = Vec::new();
        Compactor::new()
            .compact(&[newer, older], &mut once, &mut NoProgress)
            .unwrap();

        let compacted = reopen(once.clone());
        let mut twice = Vec::new();
        Compactor::new()
            .compact(&[compacted], &mut twice, &mut NoProgress)
            .unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn byte_budget_is_greedy() {
        let mut c = Compactor::new().compact_bytes_limit(100);
        assert!(c.try_add(70));
        assert!(c.try_add(30));
        assert!(!c.try_add(1));

        // a single table above the budget is still accepted
        let mut c = Compactor::new().compact_bytes_limit(10);
        assert!(c.try_add(500));
        assert!(!c.try_add(1));

        // no limit configured: everything fits
        let mut c = Compactor::new();
        for _ in 0..32 {
            assert!(c.try_add(1 << 20));
        }
    }
}
