//! slabcache: a size-class slab allocator with an online page rebalancer.
//!
//! Backs an in-memory key/value cache whose item size distribution shifts
//! over time. Objects are bucketed into geometrically-spaced size classes;
//! each class owns fixed-size pages split into a free list of chunks. A
//! background rebalancer can move or release pages between classes without
//! stopping the world, steered by an automatic policy or by an explicit
//! [`allocator::SlabAllocator::reassign`] call.
//!
//! The hash table, LRU/eviction machinery, and item record layout are out
//! of scope: this crate reaches the embedding cache only through the
//! [`collaborators::CacheCollaborator`] trait.
//!
//! # Usage
//!
//! ```ignore
//! let config = config::SlabConfig::default();
//! let allocator = allocator::SlabAllocator::init(config, cache)?;
//! let maintenance = worker::MaintenanceWorker::start(allocator.clone());
//! let rebalance = worker::RebalanceWorker::start(allocator.clone());
//! ```

pub mod allocator;
pub mod automove;
pub mod class_store;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod memory;
pub mod page;
pub mod rebalance;
pub mod size_class;
pub mod stats;
pub mod worker;

pub use allocator::{Handle, SlabAllocator};
pub use collaborators::{CacheCollaborator, CacheLockGuard};
pub use config::{AutomoveMode, SlabConfig};
pub use error::{ReassignResult, SlabError};
pub use stats::StatsSink;
