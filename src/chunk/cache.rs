//! Bounded cache of reconstructed delta bases.

use super::{ChunkKey, ObjectType};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use tracing::trace;

type CacheSlot = (ChunkKey, u64);

struct CacheEntry {
    obj_type: ObjectType,
    data: Bytes,
    /// Recency stamp; stale queue records are skipped during eviction.
    stamp: u64,
}

struct CacheInner {
    map: HashMap<CacheSlot, CacheEntry>,
    recency: VecDeque<(CacheSlot, u64)>,
    clock: u64,
    total_bytes: u64,
}

/// Shared map of `(chunk, offset)` to inflated base bytes.
///
/// Eviction is approximate LRU over total buffer bytes: every access
/// pushes a fresh recency record, and eviction pops from the cold end,
/// skipping records whose stamp no longer matches. One lock guards the
/// whole structure; hits clone shared bytes, so the critical section
/// stays short.
pub struct DeltaBaseCache {
    limit_bytes: u64,
    inner: Mutex<CacheInner>,
}

impl DeltaBaseCache {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                recency: VecDeque::new(),
                clock: 0,
                total_bytes: 0,
            }),
        }
    }

    pub fn get(&self, chunk: &ChunkKey, offset: u64) -> Option<(ObjectType, Bytes)> {
        let slot = (*chunk, offset);
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        let entry = inner.map.get_mut(&slot)?;
        entry.stamp = stamp;
        let hit = (entry.obj_type, entry.data.clone());
        inner.recency.push_back((slot, stamp));
        Some(hit)
    }

    pub fn put(&self, chunk: &ChunkKey, offset: u64, obj_type: ObjectType, data: Bytes) {
        if data.len() as u64 > self.limit_bytes {
            return; // larger than the whole budget, not worth keeping
        }
        let slot = (*chunk, offset);
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let stamp = inner.clock;
        if let Some(old) = inner.map.insert(
            slot,
            CacheEntry {
                obj_type,
                data: data.clone(),
                stamp,
            },
        ) {
            inner.total_bytes -= old.data.len() as u64;
        }
        inner.total_bytes += data.len() as u64;
        inner.recency.push_back((slot, stamp));
        self.evict(&mut inner);
    }

    fn evict(&self, inner: &mut CacheInner) {
        while inner.total_bytes > self.limit_bytes {
            let Some((slot, stamp)) = inner.recency.pop_front() else {
                break;
            };
            let live = matches!(inner.map.get(&slot), Some(e) if e.stamp == stamp);
            if !live {
                continue; // re-accessed since this record was queued
            }
            if let Some(e) = inner.map.remove(&slot) {
                inner.total_bytes -= e.data.len() as u64;
                trace!(offset = slot.1, bytes = e.data.len(), "evicted delta base");
            }
        }
    }

    /// Bytes currently held.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().map.len()
    }
}
