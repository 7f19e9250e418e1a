//! Backing memory provider: arena or on-demand page allocation.

use crate::error::SlabError;

/// Source of whole `PAGE_SIZE` blocks. Exactly one of `ArenaMemory` or
/// `OnDemandMemory` backs a given `SlabAllocator`; the choice is fixed at
/// construction and cannot change at runtime. Only on-demand mode supports
/// shrinking memory back to the system.
pub trait BackingMemory: Send {
    /// Request one `page_size`-byte block, zeroed. Returns `None` if the
    /// request cannot be satisfied (arena exhausted, or the system
    /// allocator failed).
    fn acquire_page(&mut self, page_size: usize) -> Option<Box<[u8]>>;

    /// Return a page obtained from `acquire_page` back to the provider.
    /// A no-op in arena mode: the page simply becomes untracked free
    /// memory inside the arena.
    fn release_page(&mut self, page: Box<[u8]>, page_size: usize);

    /// Bytes currently charged against `memory_limit` by this provider.
    /// Arena mode always reports 0 here (a documented asymmetry: arena
    /// memory is reserved once up front and never counted again);
    /// on-demand mode reports exactly what it has handed out.
    fn bytes_outstanding(&self) -> u64;

    /// Whether this provider can ever shrink (on-demand can; arena cannot).
    fn supports_shrink(&self) -> bool;

    /// Seed the outstanding-bytes counter at construction time, mirroring
    /// `T_MEMD_INITIAL_MALLOC`. A no-op for providers that don't
    /// track outstanding bytes (arena mode).
    fn seed_initial_malloc(&mut self, _bytes: u64) {}
}

/// Carves pages out of one pre-reserved, fixed-size arena. Never touches
/// the system heap again after the initial reservation.
pub struct ArenaMemory {
    arena: Box<[u8]>,
    cursor: usize,
}

impl ArenaMemory {
    pub fn new(limit_bytes: usize) -> Self {
        ArenaMemory {
            arena: vec![0u8; limit_bytes].into_boxed_slice(),
            cursor: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.arena.len() - self.cursor
    }
}

impl BackingMemory for ArenaMemory {
    fn acquire_page(&mut self, page_size: usize) -> Option<Box<[u8]>> {
        if self.remaining() < page_size {
            return None;
        }
        // The arena itself is already zeroed at reservation time; each
        // fresh slice handed out is effectively zeroed memory cut from it.
        let page = vec![0u8; page_size].into_boxed_slice();
        self.cursor += page_size;
        Some(page)
    }

    fn release_page(&mut self, _page: Box<[u8]>, _page_size: usize) {
        // Arena cannot shrink: the bytes are simply dropped
        // and become stranded, untracked free space inside the arena.
    }

    fn bytes_outstanding(&self) -> u64 {
        // Arena-mode pages are not counted against `memory_limit` via
        // `bytes_malloced` — the limit is enforced solely by arena
        // exhaustion; see DESIGN.md.
        0
    }

    fn supports_shrink(&self) -> bool {
        false
    }
}

/// Requests each page from the system heap individually.
#[derive(Default)]
pub struct OnDemandMemory {
    bytes_outstanding: u64,
}

impl OnDemandMemory {
    pub fn new() -> Self {
        OnDemandMemory::default()
    }

    /// Test hook mirroring `T_MEMD_INITIAL_MALLOC`: seed the outstanding
    /// byte counter without actually allocating anything.
    pub fn seed_bytes_malloced(&mut self, bytes: u64) {
        self.bytes_outstanding = bytes;
    }
}

impl BackingMemory for OnDemandMemory {
    fn acquire_page(&mut self, page_size: usize) -> Option<Box<[u8]>> {
        let page = vec![0u8; page_size].into_boxed_slice();
        self.bytes_outstanding += page_size as u64;
        Some(page)
    }

    fn release_page(&mut self, page: Box<[u8]>, page_size: usize) {
        drop(page);
        self.bytes_outstanding = self.bytes_outstanding.saturating_sub(page_size as u64);
    }

    fn bytes_outstanding(&self) -> u64 {
        self.bytes_outstanding
    }

    fn supports_shrink(&self) -> bool {
        true
    }

    fn seed_initial_malloc(&mut self, bytes: u64) {
        self.bytes_outstanding = bytes;
    }
}

/// Construct the right provider for a `(memory_limit, prealloc)` pair, or
/// fail loudly the way `slabs_init`'s arena path does when asked for an
/// arena of size 0.
pub fn make_backing_memory(
    memory_limit: u64,
    arena_mode: bool,
) -> Result<Box<dyn BackingMemory>, SlabError> {
    if arena_mode {
        if memory_limit == 0 {
            return Err(SlabError::PreallocFailed(
                "arena mode requires a nonzero memory_limit".into(),
            ));
        }
        Ok(Box::new(ArenaMemory::new(memory_limit as usize)))
    } else {
        Ok(Box::new(OnDemandMemory::new()))
    }
}
