//! Automover decision policy.
//!
//! Grounded on `slabs.c: slab_automove_decision`. Kept deliberately
//! stateful and iteration-order-dependent the same way: the "larger class
//! id wins" source-preference is an accepted, undesigned bias in `slabs.c`,
//! and this crate preserves it rather than silently "fixing" it (see
//! DESIGN.md).

use crate::config::AutomoveMode;

/// Result of one automove decision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomoveDecision {
    /// No source candidate found (and, in aggressive mode, no emergency
    /// source either).
    None,
    /// A source was found but no destination has won three cycles in a
    /// row yet: shrink only.
    ShrinkOnly { src: u32 },
    /// Both a source and a three-time-winner destination were found.
    MoveOrShrink { src: u32, dst: u32 },
}

/// Per-class and cross-tick state the decision needs to remember:
/// previous eviction snapshot, consecutive zero-eviction run length per
/// class, and the destination hysteresis filter.
pub struct AutomoveState {
    evicted_prev: Vec<u64>,
    zero_run: Vec<u32>,
    winner: Option<u32>,
    wins: u32,
}

impl AutomoveState {
    /// `largest` is the highest valid class id; internal vectors are
    /// sized `largest + 1` so they can be indexed directly by class id.
    pub fn new(largest: u32) -> Self {
        let n = largest as usize + 1;
        AutomoveState {
            evicted_prev: vec![0; n],
            zero_run: vec![0; n],
            winner: None,
            wins: 0,
        }
    }

    /// One decision cycle. `evicted_new` and `pages` are indexed by class
    /// id (a per-class eviction snapshot and page-count snapshot);
    /// `classes` iterates the valid class ids in ascending order — the
    /// iteration order that produces the documented "larger class wins
    /// ties" bias.
    pub fn decide(
        &mut self,
        evicted_new: &[u64],
        pages: &[u32],
        classes: impl Iterator<Item = u32> + Clone,
        mode: AutomoveMode,
    ) -> AutomoveDecision {
        let mut source = None;
        let mut emergency_source: Option<u32> = None;
        let mut evicted_min = u64::MAX;
        let mut evicted_max = 0u64;
        let mut highest_slab = None;

        for id in classes.clone() {
            let i = id as usize;
            let diff = evicted_new[i].saturating_sub(self.evicted_prev[i]);

            if diff == 0 && pages[i] > 2 {
                self.zero_run[i] += 1;
                if source.is_none() && self.zero_run[i] >= 3 {
                    source = Some(id);
                }
            } else {
                self.zero_run[i] = 0;
                if diff > evicted_max {
                    evicted_max = diff;
                    highest_slab = Some(id);
                }
            }

            if mode.is_aggressive() && pages[i] >= 2 {
                let better = match emergency_source {
                    None => true,
                    Some(cur) => diff < evicted_min || pages[i] > pages[cur as usize],
                };
                if better {
                    evicted_min = diff;
                    emergency_source = Some(id);
                }
            }

            self.evicted_prev[i] = evicted_new[i];
        }

        // Destination must win three decision cycles in a row (hysteresis filter).
        let mut dest = None;
        if self.winner.is_some() && self.winner == highest_slab {
            self.wins += 1;
            if self.wins >= 3 {
                dest = highest_slab;
            }
        } else {
            self.wins = 1;
            self.winner = highest_slab;
        }

        let source = source.or(if mode.is_aggressive() { emergency_source } else { None });

        match (source, dest) {
            (None, _) => AutomoveDecision::None,
            (Some(src), Some(dst)) => AutomoveDecision::MoveOrShrink { src, dst },
            (Some(src), None) => AutomoveDecision::ShrinkOnly { src },
        }
    }
}

/// Count selection (`num_slabs`): how many pages to take from
/// `source` this cycle.
pub fn num_slabs(
    source: u32,
    pages: &[u32],
    classes: impl Iterator<Item = u32>,
    total_accounted: u64,
    memory_limit: u64,
    page_size: u64,
) -> u32 {
    if memory_limit == 0 || total_accounted <= memory_limit {
        return 1;
    }

    let gap = total_accounted - memory_limit;
    let slabs_gap = gap.div_ceil(page_size) as u32;

    let mut n = if slabs_gap <= 1 {
        slabs_gap
    } else {
        let active_classes = classes.filter(|&id| pages[id as usize] > 1).count() as u32;
        let active_classes = active_classes.max(1);
        let mut n = slabs_gap.div_ceil(active_classes);
        if active_classes * n < slabs_gap {
            n += 1;
        }
        n
    };

    let source_pages = pages[source as usize];
    if source_pages > 0 && source_pages - 1 < n {
        n = source_pages - 1;
    }
    n
}
