//! Construction-time configuration.

use std::time::Duration;

/// Automover aggressiveness, selecting the maintenance tick period and
/// whether an emergency source is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomoveMode {
    /// Automover disabled; only explicit `reassign` calls move pages.
    Off,
    /// Normal automove: 10 s decision period, no emergency source.
    Normal,
    /// Aggressive automove: 1 s decision period, tracks an emergency
    /// source for forced shrinkage.
    Aggressive,
}

impl AutomoveMode {
    pub fn decision_period(&self) -> Duration {
        match self {
            AutomoveMode::Off => Duration::from_secs(5),
            AutomoveMode::Normal => Duration::from_secs(10),
            AutomoveMode::Aggressive => Duration::from_secs(1),
        }
    }

    pub fn is_aggressive(&self) -> bool {
        matches!(self, AutomoveMode::Aggressive)
    }
}

/// Construction parameters for `SlabAllocator::init`.
#[derive(Debug, Clone)]
pub struct SlabConfig {
    /// 0 = unlimited.
    pub memory_limit: u64,
    /// Geometric growth factor between consecutive size classes; must be
    /// > 1.0. Typical value 1.25.
    pub growth_factor: f64,
    /// Preallocate one page per class up front so every class can serve
    /// at least one request before any out-of-memory condition.
    pub prealloc: bool,
    /// Reserve `memory_limit` up front as one arena and never touch the
    /// system heap again; `memory_limit` must be nonzero. Mutually
    /// exclusive with later `set_memory_limit` calls.
    pub arena_mode: bool,
    /// Base chunk size before alignment: `sizeof(item_header) +
    /// chunk_prefix`.
    pub item_header_size: u32,
    pub chunk_prefix: u32,
    pub chunk_align: u32,
    pub page_size: u32,
    pub automove: AutomoveMode,
    /// Number of chunks inspected per MOVE tick; overridden by
    /// `MEMCACHED_SLAB_BULK_CHECK` if set to a nonzero value.
    pub move_bulk: u32,
}

impl Default for SlabConfig {
    fn default() -> Self {
        SlabConfig {
            memory_limit: 64 << 20,
            growth_factor: 1.25,
            prealloc: false,
            arena_mode: false,
            item_header_size: 48,
            chunk_prefix: 0,
            chunk_align: 8,
            page_size: 1 << 20,
            automove: AutomoveMode::Off,
            move_bulk: 1,
        }
    }
}

impl SlabConfig {
    /// Apply environment-variable overrides:
    /// `T_MEMD_INITIAL_MALLOC` is handled by the caller when constructing
    /// the backing memory provider; `MEMCACHED_SLAB_BULK_CHECK` is applied
    /// here.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("MEMCACHED_SLAB_BULK_CHECK") {
            match raw.parse::<u32>() {
                Ok(0) | Err(_) => {
                    log::warn!("MEMCACHED_SLAB_BULK_CHECK={raw:?} invalid, using default");
                }
                Ok(n) => self.move_bulk = n,
            }
        }
        self
    }

    /// Test hook mirroring `T_MEMD_INITIAL_MALLOC`: returns the seeded
    /// byte count, if set.
    pub fn initial_malloc_override() -> Option<u64> {
        std::env::var("T_MEMD_INITIAL_MALLOC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
    }

    pub fn start_chunk_size(&self) -> u32 {
        self.item_header_size + self.chunk_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = SlabConfig::default();
        assert!(cfg.growth_factor > 1.0);
        assert_eq!(cfg.start_chunk_size(), 48);
    }
}
