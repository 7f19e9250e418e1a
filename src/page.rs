//! Page and chunk representation.
//!
//! Rather than an intrusive pointer-linked free list inside raw memory,
//! pages are addressed by index and the free list is a stack of
//! `ChunkId`s, a substitution safe Rust sanctions in place of that C
//! layout. Each chunk's logical state lives
//! in a small parallel metadata array per page, since this crate does not
//! own the cache's item record layout and must not read or write inside
//! it beyond what the cache itself requests via `alloc`/`free`.

/// Identifies one chunk within one size class's page array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub page: u32,
    pub chunk: u32,
}

/// Logical state of a chunk, replacing the C source's overloaded
/// `class_id == 0` ("on free list") / `class_id == 255` ("evacuated")
/// encoding with an explicit tagged enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// On the class's free list, available for `alloc`.
    Free,
    /// Live: handed out to a caller and not yet freed.
    Live,
    /// Cleared by a rebalance pass; will not be revisited on a re-scan of
    /// the same page.
    Evacuated,
}

/// Per-chunk bookkeeping the rebalancer and free-list allocator need.
/// Kept out of the page bytes themselves (see module docs).
///
/// The refcount MOVE classifies busy/done on is not tracked here: it is
/// the cache's own item refcount, reached through `CacheCollaborator`, so
/// that a genuine concurrent reader is actually observed.
#[derive(Debug, Clone, Copy)]
pub struct ChunkMeta {
    pub state: ChunkState,
    /// Mirrors the cache's `ITEM_LINKED` flag: whether the
    /// cache currently has this chunk reachable through its hash index.
    /// Maintained by the embedding cache via `CacheCollaborator`, not by
    /// this crate — defaults to `false` for freshly split chunks.
    pub linked: bool,
}

impl ChunkMeta {
    pub const fn free() -> Self {
        ChunkMeta {
            state: ChunkState::Free,
            linked: false,
        }
    }
}

/// One owned, fixed-size page belonging to exactly one size class at a
/// time. The byte storage is an opaque `Box<[u8]>`; nothing in this crate
/// interprets its contents beyond zeroing it on acquisition and on reuse.
pub struct Page {
    pub bytes: Box<[u8]>,
    pub chunk_meta: Vec<ChunkMeta>,
}

impl Page {
    pub fn new(bytes: Box<[u8]>, chunks_per_page: u32) -> Self {
        Page {
            bytes,
            chunk_meta: vec![ChunkMeta::free(); chunks_per_page as usize],
        }
    }

    pub fn chunk_offset(&self, chunk_index: u32, chunk_size: u32) -> usize {
        chunk_index as usize * chunk_size as usize
    }

    pub fn chunk_bytes(&self, chunk_index: u32, chunk_size: u32) -> &[u8] {
        let start = self.chunk_offset(chunk_index, chunk_size);
        &self.bytes[start..start + chunk_size as usize]
    }

    pub fn chunk_bytes_mut(&mut self, chunk_index: u32, chunk_size: u32) -> &mut [u8] {
        let start = self.chunk_offset(chunk_index, chunk_size);
        &mut self.bytes[start..start + chunk_size as usize]
    }
}
