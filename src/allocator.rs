//! Top-level allocator: ties all modules together.
//!
//! `SlabAllocator` owns the size-class table, the per-class free lists, the
//! rebalance and automove state, and the backing memory provider. It holds
//! no reference to the embedding cache's hash table or LRU directly — only
//! through the `CacheCollaborator` trait object.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::automove::{AutomoveDecision, AutomoveState};
use crate::class_store::ClassStore;
use crate::collaborators::CacheCollaborator;
use crate::config::{AutomoveMode, SlabConfig};
use crate::error::{ReassignResult, SlabError};
use crate::memory::make_backing_memory;
use crate::page::ChunkId;
use crate::rebalance::{RebalanceContext, Signal};
use crate::size_class::{SizeClassTable, SMALLEST};
use crate::stats::{emit_class_stats, emit_global_stats, ClassHitCounters, ClassStats, GlobalStats, StatsSink};

/// Opaque handle returned by `alloc`, carrying the class id a caller must
/// present back to `free`/`adjust_requested`: `class_id` is part of the
/// caller's bookkeeping, not something this crate tracks per-chunk on its
/// behalf once handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub class_id: u32,
    pub chunk: ChunkId,
}

/// The owning service object: a single allocator instance rather than
/// process-wide statics. Construct with [`SlabAllocator::init`], share via
/// the returned `Arc`, and hand that `Arc` to
/// [`crate::worker::MaintenanceWorker`] and [`crate::worker::RebalanceWorker`]
/// to run its background tasks.
///
/// Lock order, enforced by construction: `cache.lock()` (external,
/// the embedder's `cache_lock`) is always acquired, if at all, before
/// `class_store`/`rebalance`/`automove`, which this type locks in that
/// fixed order and never re-enters.
pub struct SlabAllocator<C: CacheCollaborator> {
    config: SlabConfig,
    table: SizeClassTable,
    class_store: Mutex<ClassStore>,
    rebalance: Mutex<RebalanceContext>,
    automove: Mutex<AutomoveState>,
    cache: Arc<C>,
    /// Round-robin cursor for `reassign`'s "pick any source" mode
    /// (`src_class == 0`, since class ids start at 1 and 0 is otherwise
    /// unused as a source), mirroring `slabs.c: slabs_reassign_pick_any`'s
    /// static `cur` cursor.
    pick_any_cursor: AtomicU32,
}

impl<C: CacheCollaborator> SlabAllocator<C> {
    /// Construct and, if `config.prealloc` is set, preallocate one page per
    /// size class — `slabs_preallocate`'s stated intent, not its
    /// `power_largest`-as-count implementation bug. Applies the
    /// `MEMCACHED_SLAB_BULK_CHECK` and `T_MEMD_INITIAL_MALLOC` environment
    /// overrides.
    pub fn init(config: SlabConfig, cache: Arc<C>) -> Result<Arc<Self>, SlabError> {
        let config = config.apply_env_overrides();
        if config.growth_factor <= 1.0 {
            return Err(SlabError::PreallocFailed("growth_factor must be > 1.0".into()));
        }

        let table = SizeClassTable::build(
            config.start_chunk_size(),
            config.growth_factor,
            config.chunk_align,
            config.page_size,
        );

        let mut backing = make_backing_memory(config.memory_limit, config.arena_mode)?;
        if let Some(seed) = SlabConfig::initial_malloc_override() {
            backing.seed_initial_malloc(seed);
        }

        let mut class_store = ClassStore::new(table.clone(), backing, config.memory_limit);

        if config.prealloc {
            for id in table.ids() {
                let size = table.get(id).expect("valid id").chunk_size as usize;
                let Some(chunk) = class_store.alloc(size, id) else {
                    log::error!("prealloc: failed to reserve a page for class {id}, exiting");
                    std::process::exit(1);
                };
                // Hand the probe chunk straight back; its only job was to
                // force the class's first page into existence.
                class_store.free(chunk, size, id);
            }
        }

        let largest = table.largest();
        Ok(Arc::new(SlabAllocator {
            config,
            table,
            class_store: Mutex::new(class_store),
            rebalance: Mutex::new(RebalanceContext::new()),
            automove: Mutex::new(AutomoveState::new(largest)),
            cache,
            pick_any_cursor: AtomicU32::new(SMALLEST.saturating_sub(1)),
        }))
    }

    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    pub fn table(&self) -> &SizeClassTable {
        &self.table
    }

    // -- Allocator API -------------------------------------------

    pub fn class_for_size(&self, size: usize) -> u32 {
        self.table.class_for_size(size)
    }

    /// Allocate one chunk sized for `size`. Returns `None` if `size`
    /// exceeds the largest class or the backing memory is exhausted;
    /// capacity exhaustion is not an error condition.
    pub fn alloc(&self, size: usize) -> Option<Handle> {
        let class_id = self.table.class_for_size(size);
        if class_id == 0 {
            return None;
        }
        let mut store = self.class_store.lock();
        let chunk = store.alloc(size, class_id)?;
        Some(Handle { class_id, chunk })
    }

    pub fn free(&self, handle: Handle, size: usize) {
        let mut store = self.class_store.lock();
        store.free(handle.chunk, size, handle.class_id);
    }

    /// Tell the allocator a chunk became reachable/unreachable through the
    /// cache's hash index; see DESIGN.md.
    pub fn set_linked(&self, handle: Handle, linked: bool) {
        let mut store = self.class_store.lock();
        store.set_linked(handle.class_id, handle.chunk, linked);
    }

    pub fn adjust_requested(&self, class_id: u32, old: usize, new: usize) {
        let mut store = self.class_store.lock();
        store.adjust_requested(class_id, old, new);
    }

    /// The page currently under evacuation, if any — callers should steer
    /// lookups of items inside it through the slow path.
    pub fn evacuating_page(&self, class_id: u32) -> Option<(u32, u32)> {
        let rebalance = self.rebalance.lock();
        rebalance
            .evacuating_page()
            .filter(|(src, _)| *src == class_id)
    }

    // -- Control API ---------------------------------------------

    /// Queue a manual page move or release, mirroring `slabs_reassign`.
    /// `dst_class == 0` means release to the backing provider rather than
    /// moving to another class. `src_class == 0` means "pick any class with
    /// a spare page", cycling through classes round-robin — the `src = -1`
    /// convention from `slabs.c: slabs_reassign_pick_any`.
    pub fn reassign(&self, src_class: u32, dst_class: u32, num_slabs: u32) -> ReassignResult {
        if num_slabs < 1 {
            return ReassignResult::KillFew;
        }

        let dst = if dst_class == 0 { None } else { Some(dst_class) };
        if let Some(dst) = dst {
            if self.table.get(dst).is_none() {
                return ReassignResult::BadClass;
            }
        }

        // allocator_lock (class_store) before rebalance_lock, never reversed.
        let store = self.class_store.lock();
        let mut rebalance = self.rebalance.lock();
        if !rebalance.is_idle() {
            return ReassignResult::Running;
        }

        let src_class = if src_class == 0 {
            match self.pick_any_source(&store, dst) {
                Some(id) => id,
                None => return ReassignResult::BadClass,
            }
        } else {
            if self.table.get(src_class).is_none() {
                return ReassignResult::BadClass;
            }
            src_class
        };

        if Some(src_class) == dst {
            return ReassignResult::SrcDstSame;
        }
        if store.pages_len(src_class) < 2 {
            return ReassignResult::NoSpare;
        }
        drop(store);

        rebalance.request(src_class, dst, num_slabs);
        ReassignResult::Ok
    }

    /// One pass through the class ids starting just after the last pick,
    /// returning the first with a spare page, skipping `dst`.
    fn pick_any_source(&self, store: &ClassStore, dst: Option<u32>) -> Option<u32> {
        let largest = self.table.largest();
        let span = largest - SMALLEST + 1;
        let mut cur = self.pick_any_cursor.load(Ordering::Relaxed);
        for _ in 0..span {
            cur = if cur >= largest { SMALLEST } else { cur + 1 };
            if Some(cur) == dst {
                continue;
            }
            if store.pages_len(cur) > 1 {
                self.pick_any_cursor.store(cur, Ordering::Relaxed);
                return Some(cur);
            }
        }
        self.pick_any_cursor.store(cur, Ordering::Relaxed);
        None
    }

    /// Change the active memory budget. Takes effect for the next page
    /// acquisition; pages already outstanding are never revoked. Returns
    /// `-1` if this allocator is arena-backed (fixed-size, inflexible),
    /// `-2` if `limit` is smaller than one page, else the number of pages
    /// the automover needs to reclaim to get under `limit` (0 if already
    /// under it).
    pub fn set_memory_limit(&self, limit: u64) -> i64 {
        let mut store = self.class_store.lock();
        let result = store.set_memory_limit(limit);
        log::info!("memory_limit set to {limit}, reclaim = {result}");
        result
    }

    /// Snapshot stats for every defined class plus global counters.
    /// `hit_counters` is indexed by class id and supplied by the embedding
    /// cache, since command-level hit/miss accounting is out of scope for
    /// this crate.
    pub fn slabs_stats(&self, hit_counters: &[ClassHitCounters], sink: &mut dyn StatsSink) {
        let store = self.class_store.lock();
        let rebalance = self.rebalance.lock();

        let mut active_slabs = 0u32;
        for id in self.table.ids() {
            let pages = store.pages_len(id);
            if pages == 0 {
                continue;
            }
            active_slabs += pages;
            let stats = ClassStats {
                class_id: id,
                chunk_size: store.chunk_size(id),
                chunks_per_page: store.chunks_per_page(id),
                total_pages: pages,
                total_chunks: pages as u64 * store.chunks_per_page(id) as u64,
                used_chunks: store.used_chunks(id),
                free_chunks: store.free_count(id),
                mem_requested: store.requested_bytes(id),
                hits: hit_counters.get(id as usize).copied().unwrap_or_default(),
            };
            emit_class_stats(sink, &stats);
        }

        let global = GlobalStats {
            active_slabs,
            total_malloced: store.bytes_malloced(),
            slabs_moved: rebalance.slabs_moved(),
            slabs_shrunk: rebalance.slabs_shrunk(),
        };
        emit_global_stats(sink, &global);
    }

    // -- Background-task hooks, driven by `worker.rs` ------

    /// One automove decision cycle. Called by
    /// `MaintenanceWorker` on its configured period; queues a `reassign`
    /// job when a decision is reached.
    pub fn automove_tick(&self) {
        if matches!(self.config.automove, AutomoveMode::Off) {
            return;
        }

        let largest = self.table.largest() as usize;
        let mut evicted = vec![0u64; largest + 1];
        self.cache.item_stats_evictions(&mut evicted);

        let store = self.class_store.lock();
        let mut pages = vec![0u32; largest + 1];
        for id in self.table.ids() {
            pages[id as usize] = store.pages_len(id);
        }
        let total_accounted = store.total_accounted_bytes();
        let memory_limit = store.memory_limit();
        drop(store);

        let decision = {
            let mut automove = self.automove.lock();
            automove.decide(&evicted, &pages, self.table.ids(), self.config.automove)
        };

        let count = |src: u32| {
            crate::automove::num_slabs(
                src,
                &pages,
                self.table.ids(),
                total_accounted,
                memory_limit,
                self.config.page_size as u64,
            )
        };

        match decision {
            AutomoveDecision::None => {}
            AutomoveDecision::ShrinkOnly { src } => {
                let n = count(src);
                log::info!("automove: shrinking class {src} by {n}");
                let _ = self.reassign(src, 0, n);
            }
            AutomoveDecision::MoveOrShrink { src, dst } => {
                let n = count(src);
                log::info!("automove: moving class {src} -> {dst} ({n})");
                let _ = self.reassign(src, dst, n);
            }
        }
    }

    /// Drive the rebalancer one step. Returns `true` if work
    /// was done (the caller should call again promptly); `false` means the
    /// rebalancer is idle and the caller may sleep until the next
    /// `reassign`/`automove_tick`.
    pub fn rebalance_tick(&self) -> bool {
        let signal = self.rebalance.lock().signal();
        match signal {
            Signal::Idle => false,
            Signal::Requested => {
                let _cache_guard = self.cache.lock();
                let mut store = self.class_store.lock();
                let mut rebalance = self.rebalance.lock();
                if let Err(err) = rebalance.start(&mut store) {
                    log::warn!("rebalance start rejected: {err:?}");
                }
                true
            }
            Signal::Running => {
                let _cache_guard = self.cache.lock();
                let mut store = self.class_store.lock();
                let mut rebalance = self.rebalance.lock();
                rebalance.move_tick(&mut store, self.cache.as_ref(), self.config.move_bulk);
                if rebalance.is_scan_done() {
                    rebalance.finish(&mut store);
                }
                true
            }
        }
    }

    pub fn rebalance_saw_busy_last_tick(&self) -> bool {
        self.rebalance.lock().saw_busy_last_tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CacheLockGuard;
    use std::sync::Mutex as StdMutex;

    struct NoopGuard;
    impl CacheLockGuard for NoopGuard {}

    #[derive(Default)]
    struct MockCache {
        unlinked: StdMutex<Vec<ChunkId>>,
    }
    impl CacheCollaborator for MockCache {
        fn lock(&self) -> Box<dyn CacheLockGuard + '_> {
            Box::new(NoopGuard)
        }
        fn item_unlink_no_lock(&self, item: ChunkId, _hash: u64) {
            self.unlinked.lock().unwrap().push(item);
        }
        fn refcount_incr(&self, _item: ChunkId) -> u32 {
            0
        }
        fn refcount_decr(&self, _item: ChunkId) -> u32 {
            0
        }
        fn item_stats_evictions(&self, _out: &mut [u64]) {}
        fn hash_key(&self, _key: &[u8]) -> u64 {
            0
        }
    }

    fn allocator() -> Arc<SlabAllocator<MockCache>> {
        let config = SlabConfig {
            memory_limit: 8 << 20,
            page_size: 1 << 20,
            ..SlabConfig::default()
        };
        SlabAllocator::init(config, Arc::new(MockCache::default())).unwrap()
    }

    #[test]
    fn alloc_then_free_roundtrips() {
        let alloc = allocator();
        let handle = alloc.alloc(100).expect("alloc should succeed");
        assert!(alloc.table().get(handle.class_id).unwrap().chunk_size >= 100);
        alloc.free(handle, 100);
    }

    #[test]
    fn alloc_rejects_oversized_request() {
        let alloc = allocator();
        let page_size = alloc.table().page_size() as usize;
        assert!(alloc.alloc(page_size + 1).is_none());
    }

    #[test]
    fn reassign_rejects_same_class() {
        let alloc = allocator();
        let class = alloc.table().class_for_size(50);
        assert_eq!(alloc.reassign(class, class, 1), ReassignResult::SrcDstSame);
    }

    #[test]
    fn reassign_rejects_source_with_one_page() {
        let alloc = allocator();
        let class = alloc.table().class_for_size(50);
        alloc.alloc(50).unwrap();
        assert_eq!(alloc.reassign(class, 0, 1), ReassignResult::NoSpare);
    }

    #[test]
    fn slabs_stats_reports_active_classes_only() {
        let alloc = allocator();
        alloc.alloc(50).unwrap();
        let mut out = Vec::new();
        let hits = vec![ClassHitCounters::default(); alloc.table().largest() as usize + 1];
        alloc.slabs_stats(&hits, &mut out);
        assert!(out.iter().any(|(k, _)| k.ends_with(":chunk_size")));
        assert!(out.iter().any(|(k, _)| k == "active_slabs"));
    }

    #[test]
    fn reassign_pick_any_finds_the_only_class_with_a_spare_page() {
        let alloc = allocator();
        let class = alloc.table().class_for_size(50);
        let per_page = alloc.table().get(class).unwrap().chunks_per_page as u64;
        for _ in 0..per_page + 1 {
            alloc.alloc(50).unwrap();
        }
        assert_eq!(alloc.reassign(0, 0, 1), ReassignResult::Ok);
    }

    #[test]
    fn reassign_pick_any_reports_bad_class_when_nothing_has_a_spare_page() {
        let alloc = allocator();
        alloc.alloc(50).unwrap();
        assert_eq!(alloc.reassign(0, 0, 1), ReassignResult::BadClass);
    }
}
