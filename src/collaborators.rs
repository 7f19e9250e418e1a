//! Trait seams for the external collaborators this crate depends on.
//!
//! The hash table, LRU/eviction machinery, and item record layout are
//! explicitly out of scope; this module is the entire interface
//! this crate needs from them.

use crate::page::ChunkId;

/// An RAII guard representing the externally-owned `cache_lock`.
/// The rebalancer holds one across START, MOVE, and FINISH, and drops it
/// between MOVE ticks to let cache readers/writers make progress.
pub trait CacheLockGuard {}

/// Everything the rebalancer and automover need from the embedding cache.
/// Implementations own the hash table and LRU machinery; this crate never
/// reaches into them directly.
pub trait CacheCollaborator: Send + Sync {
    /// Acquire `cache_lock`. Must be reentrant-free: the rebalancer holds
    /// exactly one guard at a time and always releases it before
    /// requesting another (lock order: `cache_lock` before `allocator_lock`).
    fn lock(&self) -> Box<dyn CacheLockGuard + '_>;

    /// Unlink an item from the hash index and LRU while `cache_lock` is
    /// already held. Corresponds to `item_unlink_no_lock` / memcached's
    /// `do_item_unlink_nolock`.
    fn item_unlink_no_lock(&self, item: ChunkId, hash: u64);

    /// Atomically increment the item's refcount, returning the new value.
    fn refcount_incr(&self, item: ChunkId) -> u32;

    /// Atomically decrement the item's refcount, returning the new value.
    fn refcount_decr(&self, item: ChunkId) -> u32;

    /// Fill `out` (indexed by class id) with per-class eviction counts
    /// since process start. `out.len()` is at least `largest_class + 1`.
    fn item_stats_evictions(&self, out: &mut [u64]);

    /// Stable hash of a cache key, matching `hash(key, len, 0)`.
    fn hash_key(&self, key: &[u8]) -> u64;
}
