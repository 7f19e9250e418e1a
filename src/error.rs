//! Error and result-code vocabulary for the slab allocator.

use thiserror::Error;

/// Failures that can occur while configuring or operating the allocator.
///
/// Capacity exhaustion during normal `alloc`/`free` traffic is represented
/// as `None`, not an error — see `SlabAllocator::alloc`. This enum covers
/// the smaller set of conditions that are genuinely exceptional.
#[derive(Debug, Error)]
pub enum SlabError {
    #[error("requested size exceeds the largest size class")]
    ClassTooLarge,
    #[error("class id {0} is out of range")]
    BadClass(u32),
    #[error("failed to preallocate a page for every size class: {0}")]
    PreallocFailed(String),
    #[error("backing memory provider is exhausted")]
    OutOfMemory,
}

/// Outcome of `SlabAllocator::reassign`, mirroring `reassign_result_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignResult {
    /// The move/shrink job was accepted and queued for the rebalancer.
    Ok,
    /// A rebalance job is already running; try again later.
    Running,
    /// `src` or `dst` is not a valid class id.
    BadClass,
    /// The source class does not have a spare page to give up.
    NoSpare,
    /// `src == dst`.
    SrcDstSame,
    /// `num_slabs < 1`.
    KillFew,
}
