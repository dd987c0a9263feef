//! Merging a stack of reftables with shadowing.
//!
//! Tables are ordered newest first. A cursor pulls the smallest unread
//! key across every table; on equal keys the youngest table wins and the
//! shadowed entries are skipped. Tombstones suppress their name entirely
//! unless the caller opts into seeing them (compactors doing partial work
//! must).

use super::reader::{LogCursor, RefCursor, ReftableReader};
use super::{LogEntry, Ref};
use crate::source::BlockSource;
use crate::Result;

/// An ordered list of tables, newest first, read as one logical table.
pub struct ReftableStack<S: BlockSource> {
    tables: Vec<ReftableReader<S>>,
}

impl<S: BlockSource> ReftableStack<S> {
    /// Build a stack from tables ordered newest first.
    pub fn new(tables: Vec<ReftableReader<S>>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &[ReftableReader<S>] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Current value of `name`: the youngest live entry, or `None` when
    /// the name is unknown or its youngest entry is a tombstone.
    pub fn seek(&self, name: &str) -> Result<Option<Ref>> {
        let mut cur = merged_refs_from(&self.tables, name, false)?;
        match cur.next()? {
            Some(r) if r.name() == name => Ok(Some(r)),
            _ => Ok(None),
        }
    }

    /// Cursor over live refs whose names start with `prefix`, in name
    /// order with shadowing applied.
    pub fn seek_prefix(&self, prefix: &str) -> Result<MergedRefCursor<'_, S>> {
        let cursors = self
            .tables
            .iter()
            .map(|t| t.seek_prefix(prefix))
            .collect::<Result<Vec<_>>>()?;
        Ok(MergedRefCursor::new(cursors, false))
    }

    /// Cursor over every live ref in the stack.
    pub fn seek_all(&self) -> Result<MergedRefCursor<'_, S>> {
        merged_refs_all(&self.tables, false)
    }

    /// Merged reflog of `name`, newest update first, duplicates resolved
    /// in favor of the youngest table.
    pub fn log(&self, name: &str) -> Result<MergedLogCursor<'_, S>> {
        let cursors = self
            .tables
            .iter()
            .map(|t| t.seek_log(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(MergedLogCursor::new(cursors))
    }
}

/// Merged cursor positioned at the first name `>= name` across `tables`.
pub(crate) fn merged_refs_from<'a, S: BlockSource>(
    tables: &'a [ReftableReader<S>],
    name: &str,
    include_deletes: bool,
) -> Result<MergedRefCursor<'a, S>> {
    let cursors = tables
        .iter()
        .map(|t| t.seek(name))
        .collect::<Result<Vec<_>>>()?;
    Ok(MergedRefCursor::new(cursors, include_deletes))
}

/// Merged cursor over every ref across `tables`.
pub(crate) fn merged_refs_all<'a, S: BlockSource>(
    tables: &'a [ReftableReader<S>],
    include_deletes: bool,
) -> Result<MergedRefCursor<'a, S>> {
    let cursors = tables.iter().map(|t| t.seek_to_first()).collect();
    Ok(MergedRefCursor::new(cursors, include_deletes))
}

/// Merged cursor over every log entry across `tables`.
pub(crate) fn merged_logs_all<'a, S: BlockSource>(
    tables: &'a [ReftableReader<S>],
) -> Result<MergedLogCursor<'a, S>> {
    let cursors = tables
        .iter()
        .map(|t| t.scan_logs())
        .collect::<Result<Vec<_>>>()?;
    Ok(MergedLogCursor::new(cursors))
}

/// K-way merge over per-table ref cursors.
///
/// A read failure in any table fails the composite read; nothing is
/// masked.
pub struct MergedRefCursor<'a, S: BlockSource> {
    cursors: Vec<RefCursor<'a, S>>,
    peeked: Vec<Option<Ref>>,
    include_deletes: bool,
}

impl<'a, S: BlockSource> MergedRefCursor<'a, S> {
    fn new(cursors: Vec<RefCursor<'a, S>>, include_deletes: bool) -> Self {
        let peeked = cursors.iter().map(|_| None).collect();
        Self {
            cursors,
            peeked,
            include_deletes,
        }
    }

    pub fn next(&mut self) -> Result<Option<Ref>> {
        loop {
            for (cur, slot) in self.cursors.iter_mut().zip(self.peeked.iter_mut()) {
                if slot.is_none() {
                    *slot = cur.next()?;
                }
            }

            // youngest table with the smallest name wins
            let mut best: Option<usize> = None;
            for (i, slot) in self.peeked.iter().enumerate() {
                let Some(r) = slot else { continue };
                match best {
                    None => best = Some(i),
                    Some(b) => {
                        if r.name() < self.peeked[b].as_ref().map(Ref::name).unwrap_or("") {
                            best = Some(i);
                        }
                    }
                }
            }
            let Some(b) = best else {
                return Ok(None);
            };
            let winner = self.peeked[b].take().expect("winning slot is filled");

            // drop shadowed entries of the same name in older tables
            for slot in self.peeked.iter_mut().skip(b + 1) {
                if slot.as_ref().map(Ref::name) == Some(winner.name()) {
                    *slot = None;
                }
            }

            if winner.is_tombstone() && !self.include_deletes {
                continue;
            }
            return Ok(Some(winner));
        }
    }
}

/// K-way merge over per-table log cursors, ordered by (name, newest
/// update first). Exact (name, update index) duplicates resolve to the
/// youngest table's entry.
pub struct MergedLogCursor<'a, S: BlockSource> {
    cursors: Vec<LogCursor<'a, S>>,
    peeked: Vec<Option<LogEntry>>,
}

impl<'a, S: BlockSource> MergedLogCursor<'a, S> {
    fn new(cursors: Vec<LogCursor<'a, S>>) -> Self {
        let peeked = cursors.iter().map(|_| None).collect();
        Self { cursors, peeked }
    }

    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        fn order_key(e: &LogEntry) -> (&str, u64) {
            (e.name.as_str(), u64::MAX - e.update_index)
        }

        for (cur, slot) in self.cursors.iter_mut().zip(self.peeked.iter_mut()) {
            if slot.is_none() {
                *slot = cur.next()?;
            }
        }

        let mut best: Option<usize> = None;
        for (i, slot) in self.peeked.iter().enumerate() {
            let Some(e) = slot else { continue };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let cur_best = self.peeked[b].as_ref().expect("best slot is filled");
                    if order_key(e) < order_key(cur_best) {
                        best = Some(i);
                    }
                }
            }
        }
        let Some(b) = best else {
            return Ok(None);
        };
        let winner = self.peeked[b].take().expect("winning slot is filled");
        for slot in self.peeked.iter_mut().skip(b + 1) {
            if let Some(e) = slot {
                if e.name == winner.name && e.update_index == winner.update_index {
                    *slot = None;
                }
            }
        }
        Ok(Some(winner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ObjectId;
    use crate::reftable::{Committer, LogEntry, ReftableConfig, ReftableWriter};
    use crate::source::MemBlockSource;

    fn id(n: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[0] = n;
        ObjectId::from_bytes(&raw)
    }

    fn peeled(name: &str, n: u8) -> Ref {
        Ref::PeeledNonTag {
            name: name.into(),
            target: id(n),
        }
    }

    fn log(name: &str, idx: u64, n: u8, time: u64) -> LogEntry {
        LogEntry {
            name: name.into(),
            update_index: idx,
            old_id: id(0),
            new_id: id(n),
            committer: Committer {
                name: "A U Thor".into(),
                email: "author@example.com".into(),
                time_secs: time,
                tz_offset_mins: 0,
            },
            message: format!("update {idx}"),
        }
    }

    fn table(refs: &[Ref], logs: &[LogEntry]) -> ReftableReader<MemBlockSource> {
        let mut buf = Vec::new();
        let mut w = ReftableWriter::new(&mut buf, ReftableConfig::default()).unwrap();
        for r in refs {
            w.add_ref(r).unwrap();
        }
        for e in logs {
            w.add_log(e).unwrap();
        }
        w.finish().unwrap();
        ReftableReader::open(MemBlockSource::new(buf)).unwrap()
    }

    fn stack(tables: Vec<ReftableReader<MemBlockSource>>) -> ReftableStack<MemBlockSource> {
        ReftableStack::new(tables)
    }

    #[test]
    fn newest_table_shadows_older_entries() {
        let newer = table(&[peeled("refs/heads/main", 9)], &[]);
        let older = table(
            &[peeled("refs/heads/main", 1), peeled("refs/heads/old", 2)],
            &[],
        );
        let s = stack(vec![newer, older]);

        let main = s.seek("refs/heads/main").unwrap().unwrap();
        assert_eq!(main.object_id(), Some(&id(9)));
        let old = s.seek("refs/heads/old").unwrap().unwrap();
        assert_eq!(old.object_id(), Some(&id(2)));
        assert!(s.seek("refs/heads/absent").unwrap().is_none());
    }

    #[test]
    fn tombstone_hides_name_unless_requested() {
        let newer = table(&[Ref::tombstone("refs/heads/gone")], &[]);
        let older = table(&[peeled("refs/heads/gone", 5)], &[]);
        let tables = vec![newer, older];

        let s = ReftableStack::new(tables);
        assert!(s.seek("refs/heads/gone").unwrap().is_none());

        let mut all = s.seek_all().unwrap();
        assert!(all.next().unwrap().is_none());

        // compactors ask for the deletes and see the youngest entry
        let mut with_deletes = merged_refs_all(s.tables(), true).unwrap();
        let got = with_deletes.next().unwrap().unwrap();
        assert!(got.is_tombstone());
        assert!(with_deletes.next().unwrap().is_none());
    }

    #[test]
    fn merged_iteration_is_name_ordered() {
        let t0 = table(&[peeled("refs/heads/b", 1), peeled("refs/heads/d", 2)], &[]);
        let t1 = table(&[peeled("refs/heads/a", 3), peeled("refs/heads/c", 4)], &[]);
        let s = stack(vec![t0, t1]);

        let mut names = Vec::new();
        let mut cur = s.seek_all().unwrap();
        while let Some(r) = cur.next().unwrap() {
            names.push(r.name().to_owned());
        }
        assert_eq!(
            names,
            ["refs/heads/a", "refs/heads/b", "refs/heads/c", "refs/heads/d"]
        );
    }

    #[test]
    fn prefix_cursor_merges_and_filters() {
        let t0 = table(&[peeled("refs/tags/v2", 1)], &[]);
        let t1 = table(&[peeled("refs/heads/a", 2), peeled("refs/tags/v1", 3)], &[]);
        let s = stack(vec![t0, t1]);

        let mut cur = s.seek_prefix("refs/tags/").unwrap();
        assert_eq!(cur.next().unwrap().unwrap().name(), "refs/tags/v1");
        assert_eq!(cur.next().unwrap().unwrap().name(), "refs/tags/v2");
        assert!(cur.next().unwrap().is_none());
    }

    #[test]
    fn merged_log_newest_first_with_dedup() {
        let newer = table(
            &[],
            &[
                log("refs/heads/main", 3, 30, 300),
                log("refs/heads/main", 2, 99, 299),
            ],
        );
        let older = table(
            &[],
            &[
                log("refs/heads/main", 2, 20, 200),
                log("refs/heads/main", 1, 10, 100),
            ],
        );
        let s = stack(vec![newer, older]);

        let mut cur = s.log("refs/heads/main").unwrap();
        let a = cur.next().unwrap().unwrap();
        assert_eq!((a.update_index, a.new_id), (3, id(30)));
        // update 2 exists in both tables; the younger wins
        let b = cur.next().unwrap().unwrap();
        assert_eq!((b.update_index, b.new_id), (2, id(99)));
        let c = cur.next().unwrap().unwrap();
        assert_eq!((c.update_index, c.new_id), (1, id(10)));
        assert!(cur.next().unwrap().is_none());
    }
}
