//! Shared test harness: a minimal in-memory `CacheCollaborator` standing in
//! for the hash table / LRU machinery this crate never owns directly.

use std::collections::HashMap;
use std::sync::Mutex;

use slabcache::{CacheCollaborator, CacheLockGuard};
use slabcache::page::ChunkId;

pub struct NoopGuard;
impl CacheLockGuard for NoopGuard {}

/// Tracks per-chunk refcount and link state so the rebalancer's MOVE phase
/// has something real to classify, plus a log of unlinked
/// chunks so tests can assert "no longer reachable via the cache".
#[derive(Default)]
pub struct MockCache {
    refcounts: Mutex<HashMap<ChunkId, u32>>,
    unlinked: Mutex<Vec<ChunkId>>,
    evictions: Mutex<Vec<u64>>,
}

impl MockCache {
    pub fn new(largest_class: u32) -> Self {
        MockCache {
            refcounts: Mutex::new(HashMap::new()),
            unlinked: Mutex::new(Vec::new()),
            evictions: Mutex::new(vec![0; largest_class as usize + 1]),
        }
    }

    pub fn is_unlinked(&self, chunk: ChunkId) -> bool {
        self.unlinked.lock().unwrap().contains(&chunk)
    }

    pub fn set_evicted(&self, class_id: u32, count: u64) {
        self.evictions.lock().unwrap()[class_id as usize] = count;
    }
}

impl CacheCollaborator for MockCache {
    fn lock(&self) -> Box<dyn CacheLockGuard + '_> {
        Box::new(NoopGuard)
    }

    fn item_unlink_no_lock(&self, item: ChunkId, _hash: u64) {
        self.unlinked.lock().unwrap().push(item);
    }

    fn refcount_incr(&self, item: ChunkId) -> u32 {
        let mut map = self.refcounts.lock().unwrap();
        let entry = map.entry(item).or_insert(0);
        *entry += 1;
        *entry
    }

    fn refcount_decr(&self, item: ChunkId) -> u32 {
        let mut map = self.refcounts.lock().unwrap();
        let entry = map.entry(item).or_insert(0);
        *entry = entry.saturating_sub(1);
        *entry
    }

    fn item_stats_evictions(&self, out: &mut [u64]) {
        let snapshot = self.evictions.lock().unwrap();
        let n = out.len().min(snapshot.len());
        out[..n].copy_from_slice(&snapshot[..n]);
    }

    fn hash_key(&self, _key: &[u8]) -> u64 {
        0
    }
}
