//! Per-class free-list allocator and page arrays.
//!
//! Free-list push/pop/batch growth follows `slabs.c`'s `do_slabs_alloc`,
//! `do_slabs_free`, `do_slabs_newslab`, and `grow_slab_list`.

use crate::memory::BackingMemory;
use crate::page::{ChunkId, ChunkState, Page};
use crate::size_class::{SizeClassTable, SMALLEST};

/// Initial capacity of a class's page array; doubles when full, matching
/// `grow_slab_list`'s `new_size = list_size != 0 ? list_size * 2 : 16`.
const INITIAL_PAGE_LIST_CAPACITY: u32 = 16;

/// Mutable, per-class state: the free list, owned pages, and the handful
/// of counters tracked per size class.
struct ClassState {
    /// Stack of free chunk ids; the last element is the "head".
    free_list: Vec<ChunkId>,
    pages: Vec<Page>,
    /// Tracks the page array's allocated capacity for `bytes_slab_list_overhead`
    /// accounting, independent of `Vec`'s own growth strategy.
    list_capacity: u32,
    /// 1-based index into `pages` of the page under evacuation, else `None`.
    killing: Option<u32>,
    requested_bytes: u64,
}

impl ClassState {
    fn new() -> Self {
        ClassState {
            free_list: Vec::new(),
            pages: Vec::new(),
            list_capacity: 0,
            killing: None,
            requested_bytes: 0,
        }
    }

    fn free_count(&self) -> u32 {
        self.free_list.len() as u32
    }
}

/// Owns the size-class table, every class's free lists and page arrays,
/// the backing memory provider, and the global byte counters that gate
/// page acquisition.
pub struct ClassStore {
    table: SizeClassTable,
    classes: Vec<Option<ClassState>>,
    backing: Box<dyn BackingMemory>,
    /// 0 = unlimited.
    memory_limit: u64,
    bytes_slab_list_overhead: u64,
}

impl ClassStore {
    pub fn new(table: SizeClassTable, backing: Box<dyn BackingMemory>, memory_limit: u64) -> Self {
        let mut classes = Vec::with_capacity(table.largest() as usize + 1);
        for _ in 0..=table.largest() {
            classes.push(None);
        }
        for id in table.ids() {
            classes[id as usize] = Some(ClassState::new());
        }
        ClassStore {
            table,
            classes,
            backing,
            memory_limit,
            bytes_slab_list_overhead: 0,
        }
    }

    pub fn table(&self) -> &SizeClassTable {
        &self.table
    }

    /// Reconfigure the active memory budget, matching `memory_shrink_expand`:
    /// `-1` if this store is backed by an arena (fixed-size, inflexible),
    /// `-2` if `limit` is smaller than one page, else the number of pages
    /// that must be reclaimed to get under `limit` (0 if already under it).
    pub fn set_memory_limit(&mut self, limit: u64) -> i64 {
        if !self.backing.supports_shrink() {
            return -1;
        }
        let page_size = self.table.page_size() as u64;
        if limit < page_size {
            return -2;
        }

        self.memory_limit = limit;

        let total = self.total_accounted_bytes();
        if total <= limit {
            return 0;
        }
        let gap = total - limit;
        gap.div_ceil(page_size) as i64
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Sum of bytes charged against `memory_limit`: pages from the backing
    /// provider plus the page-array growth overhead, the `TOTAL_MALLOCED`
    /// equivalent. The hash table's external overhead is out of scope and
    /// not modeled here.
    pub fn total_accounted_bytes(&self) -> u64 {
        self.backing.bytes_outstanding() + self.bytes_slab_list_overhead
    }

    pub fn bytes_slab_list_overhead(&self) -> u64 {
        self.bytes_slab_list_overhead
    }

    pub fn bytes_malloced(&self) -> u64 {
        self.backing.bytes_outstanding()
    }

    pub fn backing_supports_shrink(&self) -> bool {
        self.backing.supports_shrink()
    }

    fn state(&self, class_id: u32) -> Option<&ClassState> {
        self.classes.get(class_id as usize)?.as_ref()
    }

    fn state_mut(&mut self, class_id: u32) -> Option<&mut ClassState> {
        self.classes.get_mut(class_id as usize)?.as_mut()
    }

    pub fn is_valid_class(&self, class_id: u32) -> bool {
        class_id >= SMALLEST && class_id <= self.table.largest()
    }

    pub fn pages_len(&self, class_id: u32) -> u32 {
        self.state(class_id).map(|s| s.pages.len() as u32).unwrap_or(0)
    }

    pub fn free_count(&self, class_id: u32) -> u32 {
        self.state(class_id).map(|s| s.free_count()).unwrap_or(0)
    }

    pub fn requested_bytes(&self, class_id: u32) -> u64 {
        self.state(class_id).map(|s| s.requested_bytes).unwrap_or(0)
    }

    pub fn chunks_per_page(&self, class_id: u32) -> u32 {
        self.table.get(class_id).map(|d| d.chunks_per_page).unwrap_or(0)
    }

    pub fn chunk_size(&self, class_id: u32) -> u32 {
        self.table.get(class_id).map(|d| d.chunk_size).unwrap_or(0)
    }

    pub fn used_chunks(&self, class_id: u32) -> u64 {
        let total = self.pages_len(class_id) as u64 * self.chunks_per_page(class_id) as u64;
        total.saturating_sub(self.free_count(class_id) as u64)
    }

    pub fn killing(&self, class_id: u32) -> Option<u32> {
        self.state(class_id).and_then(|s| s.killing)
    }

    /// Allocate one chunk of `class_id`, requesting a fresh page if the
    /// free list is empty. Returns `None` on any failure: bad class id or
    /// memory exhaustion.
    pub fn alloc(&mut self, size: usize, class_id: u32) -> Option<ChunkId> {
        if !self.is_valid_class(class_id) {
            log::debug!("alloc: class {class_id} out of range");
            return None;
        }

        if self.free_count(class_id) == 0 && !self.new_page(class_id) {
            return None;
        }

        let state = self.state_mut(class_id)?;
        let chunk_id = state.free_list.pop()?;
        state.requested_bytes += size as u64;
        if let Some(page) = state.pages.get_mut(chunk_id.page as usize) {
            if let Some(meta) = page.chunk_meta.get_mut(chunk_id.chunk as usize) {
                meta.state = ChunkState::Live;
            }
        }
        Some(chunk_id)
    }

    /// Record whether the cache currently has this chunk reachable
    /// through its hash index. The cache calls this after linking or
    /// unlinking an item; the rebalancer's MOVE phase
    /// reads it back to decide whether a live chunk needs an explicit
    /// unlink before it can be reclaimed.
    pub fn set_linked(&mut self, class_id: u32, chunk_id: ChunkId, linked: bool) {
        if let Some(state) = self.state_mut(class_id) {
            if let Some(page) = state.pages.get_mut(chunk_id.page as usize) {
                if let Some(meta) = page.chunk_meta.get_mut(chunk_id.chunk as usize) {
                    meta.linked = linked;
                }
            }
        }
    }

    /// Return a chunk to its class's free list.
    pub fn free(&mut self, chunk_id: ChunkId, size: usize, class_id: u32) {
        let Some(state) = self.state_mut(class_id) else {
            log::warn!("free: class {class_id} out of range, dropping chunk");
            return;
        };
        if let Some(page) = state.pages.get_mut(chunk_id.page as usize) {
            if let Some(meta) = page.chunk_meta.get_mut(chunk_id.chunk as usize) {
                meta.state = ChunkState::Free;
                meta.linked = false;
            }
        }
        state.free_list.push(chunk_id);
        state.requested_bytes = state.requested_bytes.saturating_sub(size as u64);
    }

    /// Atomically replace an in-place value's contribution to
    /// `requested_bytes`. Aborts on an invalid class id,
    /// matching `slabs_adjust_mem_requested`'s `abort()` on caller bugs.
    pub fn adjust_requested(&mut self, class_id: u32, old: usize, new: usize) {
        if !self.is_valid_class(class_id) {
            panic!("adjust_requested: invalid slab class {class_id}");
        }
        let state = self.state_mut(class_id).expect("validated above");
        state.requested_bytes = state.requested_bytes - old as u64 + new as u64;
    }

    /// Acquire a fresh page for `class_id`, splitting it into free chunks.
    /// Applies a two-step tentative/re-check budget test: a class with
    /// zero pages is always permitted its first page.
    fn new_page(&mut self, class_id: u32) -> bool {
        let chunks_per_page = self.chunks_per_page(class_id);
        let page_size = self.table.page_size();

        let has_pages = self.pages_len(class_id) > 0;

        // Step 1: grow the page-array capacity if needed, charging the
        // growth against the limit first (it may by itself push us over).
        let state = self.state_mut(class_id).expect("validated by caller");
        if state.pages.len() as u32 == state.list_capacity {
            let new_capacity = if state.list_capacity == 0 {
                INITIAL_PAGE_LIST_CAPACITY
            } else {
                state.list_capacity * 2
            };
            let added_entries = new_capacity - state.list_capacity;
            let added_bytes = added_entries as u64 * std::mem::size_of::<Page>() as u64;

            if self.memory_limit > 0
                && has_pages
                && self.total_accounted_bytes() + added_bytes > self.memory_limit
            {
                log::debug!("new_page: class {class_id} page-list growth would exceed memory_limit");
                return false;
            }
            self.bytes_slab_list_overhead += added_bytes;
            let state = self.state_mut(class_id).expect("validated by caller");
            state.list_capacity = new_capacity;
        }

        // Step 2: re-check the budget now that the list may have grown,
        // then request the page itself from the backing provider.
        if self.memory_limit > 0
            && has_pages
            && self.total_accounted_bytes() + page_size as u64 > self.memory_limit
        {
            log::debug!("new_page: class {class_id} would exceed memory_limit");
            return false;
        }

        let Some(bytes) = self.backing.acquire_page(page_size as usize) else {
            log::warn!("new_page: backing memory provider exhausted for class {class_id}");
            return false;
        };

        let page = Page::new(bytes, chunks_per_page);
        let page_index = {
            let state = self.state_mut(class_id).expect("validated by caller");
            state.pages.len() as u32
        };

        // Split in descending chunk order so chunk 0 ends up on top of the
        // stack (the free-list "head").
        let state = self.state_mut(class_id).expect("validated by caller");
        state.pages.push(page);
        for chunk in (0..chunks_per_page).rev() {
            state.free_list.push(ChunkId {
                page: page_index,
                chunk,
            });
        }

        true
    }

    // -- rebalancer hooks --------------------------------------

    /// Start evacuating the first page of `class_id`. Returns the page
    /// index (0-based) and the number of chunks in it, or `None` if the
    /// class has fewer than 2 pages: a source must retain at least one
    /// page after the move.
    pub(crate) fn begin_evacuation(&mut self, class_id: u32) -> Option<(u32, u32)> {
        let state = self.state_mut(class_id)?;
        if state.pages.len() < 2 || state.killing.is_some() {
            return None;
        }
        state.killing = Some(1); // first page, 1-based
        Some((0, state.pages[0].chunk_meta.len() as u32))
    }

    pub(crate) fn chunk_state(&self, class_id: u32, chunk: ChunkId) -> Option<ChunkState> {
        let state = self.state(class_id)?;
        let page = state.pages.get(chunk.page as usize)?;
        Some(page.chunk_meta.get(chunk.chunk as usize)?.state)
    }

    pub(crate) fn chunk_linked(&self, class_id: u32, chunk: ChunkId) -> bool {
        self.state(class_id)
            .and_then(|s| s.pages.get(chunk.page as usize))
            .and_then(|p| p.chunk_meta.get(chunk.chunk as usize))
            .map(|m| m.linked)
            .unwrap_or(false)
    }

    fn chunk_meta_mut(&mut self, class_id: u32, chunk: ChunkId) -> Option<&mut crate::page::ChunkMeta> {
        let state = self.state_mut(class_id)?;
        let page = state.pages.get_mut(chunk.page as usize)?;
        page.chunk_meta.get_mut(chunk.chunk as usize)
    }

    /// Remove a chunk from the free list during MOVE (the `SLABBED`
    /// splice). Returns `true` if it was found and removed.
    pub(crate) fn splice_from_free_list(&mut self, class_id: u32, chunk: ChunkId) -> bool {
        let Some(state) = self.state_mut(class_id) else {
            return false;
        };
        if let Some(pos) = state.free_list.iter().position(|c| *c == chunk) {
            state.free_list.remove(pos);
            true
        } else {
            false
        }
    }

    /// Mark a chunk evacuated (cleared) so a re-scan skips it ("On DONE").
    pub(crate) fn mark_evacuated(&mut self, class_id: u32, chunk: ChunkId) {
        if let Some(meta) = self.chunk_meta_mut(class_id, chunk) {
            meta.state = ChunkState::Evacuated;
            meta.linked = false;
        }
    }

    /// FINISH: remove the evacuated page from `src_class` (swap-remove
    /// with the last page), and either hand it to
    /// `dst_class` (split into fresh free chunks) or release it to the
    /// backing provider.
    pub(crate) fn finish_evacuation(&mut self, src_class: u32, dst_class: Option<u32>) {
        let page_size = self.table.page_size();
        let page = {
            let state = self.state_mut(src_class).expect("evacuation in progress");
            let killing = state.killing.take().expect("evacuation in progress") as usize - 1;
            let last = state.pages.len() - 1;
            state.pages.swap(killing, last);
            let page = state.pages.pop().expect("non-empty");
            // The page that lived at `last` now lives at `killing`; any
            // free-list entries pointing at it must follow. The killing
            // page itself should have no remaining free-list entries —
            // every one of its chunks was spliced out during MOVE.
            if killing != last {
                for c in state.free_list.iter_mut() {
                    if c.page as usize == last {
                        c.page = killing as u32;
                    }
                }
            }
            page
        };

        match dst_class {
            None => {
                self.backing.release_page(page.bytes, page_size as usize);
            }
            Some(dst) => {
                let chunks_per_page = self.chunks_per_page(dst);
                let fresh = Page::new(vec![0u8; page_size as usize].into_boxed_slice(), chunks_per_page);
                let state = self.state_mut(dst).expect("validated at START");
                let page_index = state.pages.len() as u32;
                state.pages.push(fresh);
                for chunk in (0..chunks_per_page).rev() {
                    state.free_list.push(ChunkId {
                        page: page_index,
                        chunk,
                    });
                }
            }
        }
    }

    /// Whether `dst_class`'s page array can still grow (the START-time
    /// rejection check), without actually growing it. Mirrors `new_page`'s
    /// step 1 budget arithmetic read-only: a class with no pages yet is
    /// always permitted its first page-list allocation.
    pub(crate) fn can_grow_page_list(&self, class_id: u32) -> bool {
        let Some(state) = self.state(class_id) else {
            return false;
        };
        let has_pages = !state.pages.is_empty();
        if self.memory_limit == 0 || !has_pages {
            return true;
        }
        if state.pages.len() as u32 != state.list_capacity {
            return true;
        }
        let new_capacity = if state.list_capacity == 0 {
            INITIAL_PAGE_LIST_CAPACITY
        } else {
            state.list_capacity * 2
        };
        let added_entries = new_capacity - state.list_capacity;
        let added_bytes = added_entries as u64 * std::mem::size_of::<Page>() as u64;
        self.total_accounted_bytes() + added_bytes <= self.memory_limit
    }
}
