//! Rebalance state machine: START → MOVE* → FINISH.
//!
//! Grounded on `slabs.c`'s `slab_rebalance_start/move/finish`. The C
//! source's raw `slab_pos`/`slab_start`/`slab_end` pointers become a
//! chunk-index cursor over the fixed victim page (always the source
//! class's first page), since pages here are addressed by index rather
//! than by pointer.

use crate::class_store::ClassStore;
use crate::collaborators::CacheCollaborator;
use crate::page::{ChunkId, ChunkState};

/// Visible state of the rebalancer, consulted by the cache to steer
/// lookups away from items in a page under evacuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Idle,
    /// A job is queued; START has not run yet.
    Requested,
    /// A page has been selected and MOVE is scanning it.
    Running,
}

#[derive(Debug, Clone, Copy)]
struct RebalanceJob {
    src_class: u32,
    /// `None` means "release" (`dst_class == 0`).
    dst_class: Option<u32>,
    num_slabs_remaining: u32,
}

/// Outcome of one `start` attempt, matching the `no_go` codes in
/// `slab_rebalance_start` closely enough for the caller to log them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    BadClass,
    SrcDstSame,
    DstCannotGrow,
    TooFewSourcePages,
}

/// Bookkeeping for one page currently being moved or released.
pub struct RebalanceContext {
    signal: Signal,
    job: Option<RebalanceJob>,
    /// Page index within `src_class.pages` being evacuated (always 0,
    /// since START always selects the first page).
    page_index: u32,
    chunks_in_page: u32,
    pos: u32,
    busy_items: u32,
    done: bool,
    slabs_moved: u64,
    slabs_shrunk: u64,
}

impl Default for RebalanceContext {
    fn default() -> Self {
        RebalanceContext {
            signal: Signal::Idle,
            job: None,
            page_index: 0,
            chunks_in_page: 0,
            pos: 0,
            busy_items: 0,
            done: false,
            slabs_moved: 0,
            slabs_shrunk: 0,
        }
    }
}

impl RebalanceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn slabs_moved(&self) -> u64 {
        self.slabs_moved
    }

    pub fn slabs_shrunk(&self) -> u64 {
        self.slabs_shrunk
    }

    /// The page currently under evacuation, if any — what the cache's
    /// lookup path should treat as in-flight.
    pub fn evacuating_page(&self) -> Option<(u32, u32)> {
        if self.signal == Signal::Running {
            self.job.map(|j| (j.src_class, self.page_index))
        } else {
            None
        }
    }

    /// Queue a new job. Called under the external `rebalance_lock`; does
    /// not itself touch `ClassStore` (validation happens in `start`, under
    /// `cache_lock` + `allocator_lock`).
    pub fn request(&mut self, src_class: u32, dst_class: Option<u32>, num_slabs: u32) {
        self.job = Some(RebalanceJob {
            src_class,
            dst_class,
            num_slabs_remaining: num_slabs,
        });
        self.signal = Signal::Requested;
    }

    pub fn is_idle(&self) -> bool {
        self.signal == Signal::Idle
    }

    /// START. Call under cache lock then allocator lock.
    pub fn start(&mut self, store: &mut ClassStore) -> Result<(), StartError> {
        let mut job = self.job.expect("start called without a queued job");

        if !store.is_valid_class(job.src_class) {
            self.abandon();
            return Err(StartError::BadClass);
        }
        if let Some(dst) = job.dst_class {
            if job.src_class == dst {
                self.abandon();
                return Err(StartError::SrcDstSame);
            }
            if !store.is_valid_class(dst) || !store.can_grow_page_list(dst) {
                self.abandon();
                return Err(StartError::DstCannotGrow);
            }
        }

        let Some((page_index, chunks_in_page)) = store.begin_evacuation(job.src_class) else {
            self.abandon();
            return Err(StartError::TooFewSourcePages);
        };

        job.num_slabs_remaining = job.num_slabs_remaining.saturating_sub(1);
        self.job = Some(job);
        self.page_index = page_index;
        self.chunks_in_page = chunks_in_page;
        self.pos = 0;
        self.busy_items = 0;
        self.done = false;
        self.signal = Signal::Running;
        log::info!(
            "rebalance start: class {} -> {:?}",
            job.src_class,
            job.dst_class
        );
        Ok(())
    }

    fn abandon(&mut self) {
        self.job = None;
        self.signal = Signal::Idle;
    }

    /// MOVE: inspect up to `bulk` chunks. Call under cache
    /// lock then allocator lock; the caller releases `cache_lock` between
    /// ticks.
    pub fn move_tick(&mut self, store: &mut ClassStore, cache: &dyn CacheCollaborator, bulk: u32) {
        let job = self.job.expect("move_tick called without a started job");
        let mut tick_busy = false;

        for _ in 0..bulk {
            if self.pos >= self.chunks_in_page {
                break;
            }
            let chunk = ChunkId {
                page: self.page_index,
                chunk: self.pos,
            };

            match store.chunk_state(job.src_class, chunk) {
                Some(ChunkState::Evacuated) => {
                    // Already cleared by a previous pass over this page.
                }
                _ => {
                    let refcount = cache.refcount_incr(chunk);
                    let done = match refcount {
                        1 => {
                            if store.chunk_state(job.src_class, chunk) == Some(ChunkState::Free) {
                                store.splice_from_free_list(job.src_class, chunk);
                                true
                            } else {
                                false
                            }
                        }
                        2 => {
                            if store.chunk_linked(job.src_class, chunk) {
                                let hash = cache.hash_key(&chunk_key(chunk));
                                cache.item_unlink_no_lock(chunk, hash);
                                true
                            } else {
                                false
                            }
                        }
                        _ => false,
                    };

                    if done {
                        store.mark_evacuated(job.src_class, chunk);
                    } else {
                        cache.refcount_decr(chunk);
                        self.busy_items += 1;
                        tick_busy = true;
                    }
                }
            }

            self.pos += 1;
        }

        if self.pos >= self.chunks_in_page {
            if self.busy_items > 0 {
                // Retry from the top; holders get a chance to release
                // between ticks (the rebalancer sleeps 50us when the
                // previous tick saw any busy chunk).
                self.pos = 0;
                self.busy_items = 0;
            } else {
                self.done = true;
            }
        }

        let _ = tick_busy;
    }

    pub fn saw_busy_last_tick(&self) -> bool {
        self.busy_items > 0
    }

    pub fn is_scan_done(&self) -> bool {
        self.done
    }

    /// FINISH. Call under cache lock then allocator lock.
    pub fn finish(&mut self, store: &mut ClassStore) {
        let job = self.job.expect("finish called without a started job");

        store.finish_evacuation(job.src_class, job.dst_class);

        match job.dst_class {
            None => self.slabs_shrunk += 1,
            Some(_) => self.slabs_moved += 1,
        }

        if job.num_slabs_remaining > 0 {
            self.job = Some(RebalanceJob {
                num_slabs_remaining: job.num_slabs_remaining,
                ..job
            });
            self.signal = Signal::Requested;
        } else {
            self.job = None;
            self.signal = Signal::Idle;
        }
        self.done = false;
        log::info!("rebalance finish: class {} -> {:?}", job.src_class, job.dst_class);
    }
}

/// This crate never reads or constructs real cache keys — it only ever
/// forwards the caller's own `CacheCollaborator` implementation the
/// `ChunkId` of the item being unlinked, letting that implementation look
/// up whatever key material it stores. `hash_key` here is a placeholder
/// input (empty slice) for collaborators that compute the hash from the
/// chunk itself rather than from a passed-in key.
fn chunk_key(_chunk: ChunkId) -> [u8; 0] {
    []
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CacheLockGuard;
    use crate::memory::OnDemandMemory;
    use crate::size_class::SizeClassTable;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct NoopGuard;
    impl CacheLockGuard for NoopGuard {}

    #[derive(Default)]
    struct MockCache {
        refcounts: Mutex<HashMap<ChunkId, u32>>,
        unlinked: Mutex<Vec<ChunkId>>,
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
        fn item_stats_evictions(&self, _out: &mut [u64]) {}
        fn hash_key(&self, _key: &[u8]) -> u64 {
            0
        }
    }

    fn store() -> ClassStore {
        let table = SizeClassTable::build(96, 2.0, 8, 1 << 20);
        ClassStore::new(table, Box::new(OnDemandMemory::new()), 0)
    }

    fn run_to_finish(ctx: &mut RebalanceContext, store: &mut ClassStore, cache: &MockCache) {
        loop {
            match ctx.signal() {
                Signal::Idle => break,
                Signal::Requested => {
                    ctx.start(store).unwrap();
                }
                Signal::Running => {
                    ctx.move_tick(store, cache, 64);
                    if ctx.is_scan_done() {
                        ctx.finish(store);
                    }
                }
            }
        }
    }

    #[test]
    fn move_releases_empty_pages_and_tracks_shrunk_count() {
        let mut store = store();
        let class = store.table().class_for_size(50);
        // Create 3 pages worth of chunks, all immediately freed so every
        // chunk is on the free list.
        let per_page = store.chunks_per_page(class);
        let mut chunks = Vec::new();
        for _ in 0..per_page * 3 {
            chunks.push(store.alloc(50, class).unwrap());
        }
        for c in chunks {
            store.free(c, 50, class);
        }
        assert_eq!(store.pages_len(class), 3);

        let cache = MockCache::default();
        let mut ctx = RebalanceContext::new();
        ctx.request(class, None, 1);
        run_to_finish(&mut ctx, &mut store, &cache);

        assert_eq!(store.pages_len(class), 2);
        assert_eq!(ctx.slabs_shrunk(), 1);
        assert_eq!(ctx.signal(), Signal::Idle);
    }

    #[test]
    fn move_between_classes_leaves_fresh_free_chunks_on_destination() {
        let mut store = store();
        let src = store.table().class_for_size(50);
        let dst = store.table().largest();
        assert_ne!(src, dst);

        let per_page = store.chunks_per_page(src);
        let mut chunks = Vec::new();
        for _ in 0..per_page * 2 {
            chunks.push(store.alloc(50, src).unwrap());
        }
        for c in chunks {
            store.free(c, 50, src);
        }
        store.alloc(1, dst).unwrap(); // give dst a first page so it exists

        let cache = MockCache::default();
        let mut ctx = RebalanceContext::new();
        ctx.request(src, Some(dst), 1);
        run_to_finish(&mut ctx, &mut store, &cache);

        assert_eq!(store.pages_len(src), 1);
        assert_eq!(store.pages_len(dst), 2);
        assert_eq!(ctx.slabs_moved(), 1);
    }

    #[test]
    fn start_rejects_source_with_fewer_than_two_pages() {
        let mut store = store();
        let class = store.table().class_for_size(50);
        store.alloc(50, class).unwrap();
        assert_eq!(store.pages_len(class), 1);

        let mut ctx = RebalanceContext::new();
        ctx.request(class, None, 1);
        let err = ctx.start(&mut store).unwrap_err();
        assert_eq!(err, StartError::TooFewSourcePages);
        assert_eq!(ctx.signal(), Signal::Idle);
    }

    #[test]
    fn start_rejects_destination_whose_page_list_growth_would_exceed_the_limit() {
        let mut store = store();
        let src = store.table().class_for_size(50);
        let dst = store.table().largest();
        assert_ne!(src, dst);

        // Fill the destination's page array to its current capacity (16
        // entries) so the next page would force it to double.
        for _ in 0..16 {
            store.alloc(1, dst).unwrap();
        }
        assert_eq!(store.pages_len(dst), 16);

        // Give src two pages so start() gets past the source-pages check.
        let per_page = store.chunks_per_page(src);
        for _ in 0..per_page * 2 {
            store.alloc(50, src).unwrap();
        }

        // Clamp the limit to exactly what's accounted for now: any further
        // growth, including doubling the destination's page list, no
        // longer fits.
        let total = store.total_accounted_bytes();
        assert_eq!(store.set_memory_limit(total), 0);

        let mut ctx = RebalanceContext::new();
        ctx.request(src, Some(dst), 1);
        let err = ctx.start(&mut store).unwrap_err();
        assert_eq!(err, StartError::DstCannotGrow);
        assert_eq!(ctx.signal(), Signal::Idle);
    }

    #[test]
    fn move_does_not_evacuate_a_chunk_a_concurrent_reader_still_holds() {
        let mut store = store();
        let class = store.table().class_for_size(50);
        let per_page = store.chunks_per_page(class);

        let chunk = store.alloc(50, class).unwrap(); // page 0, chunk 0
        for _ in 0..per_page {
            store.alloc(50, class).unwrap(); // spills into a second page
        }
        assert_eq!(store.pages_len(class), 2);

        let cache = MockCache::default();
        // A live get() already holds this item: the hash table's own link
        // (1) plus the reader's own reference (2).
        cache.refcounts.lock().unwrap().insert(chunk, 2);

        let mut ctx = RebalanceContext::new();
        ctx.request(class, None, 1);
        ctx.start(&mut store).unwrap();
        ctx.move_tick(&mut store, &cache, 64);

        assert!(cache.unlinked.lock().unwrap().is_empty());
        assert_ne!(store.chunk_state(class, chunk), Some(ChunkState::Evacuated));
        assert!(ctx.saw_busy_last_tick());
    }
}
