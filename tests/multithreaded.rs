//! Reassign move/shrink scenarios, plus concurrent alloc/free traffic
//! across threads exercising the allocator lock.

mod support;

use std::sync::Arc;

use slabcache::allocator::SlabAllocator;
use slabcache::config::SlabConfig;
use slabcache::error::ReassignResult;
use support::MockCache;

const PAGE_SIZE: u32 = 1 << 20;

fn config(memory_limit: u64) -> SlabConfig {
    SlabConfig {
        memory_limit,
        growth_factor: 2.0,
        chunk_align: 8,
        page_size: PAGE_SIZE,
        item_header_size: 96,
        chunk_prefix: 0,
        ..SlabConfig::default()
    }
}

fn allocator(memory_limit: u64) -> Arc<SlabAllocator<MockCache>> {
    let cfg = config(memory_limit);
    SlabAllocator::init(cfg, Arc::new(MockCache::new(32))).unwrap()
}

fn drain_rebalance(alloc: &SlabAllocator<MockCache>) {
    while alloc.rebalance_tick() {}
}

fn total_pages(alloc: &SlabAllocator<MockCache>, class: u32) -> u64 {
    let hits = vec![Default::default(); alloc.table().largest() as usize + 1];
    let mut out = Vec::new();
    alloc.slabs_stats(&hits, &mut out);
    out.iter()
        .find(|(k, _)| *k == format!("{class}:total_pages"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0)
}

fn fill_pages(alloc: &SlabAllocator<MockCache>, class: u32, num_pages: u64) -> Vec<slabcache::Handle> {
    let per_page = alloc.table().get(class).unwrap().chunks_per_page as u64;
    (0..per_page * num_pages)
        .map(|_| alloc.alloc(alloc.table().get(class).unwrap().chunk_size as usize).unwrap())
        .collect()
}

#[test]
fn seed_scenario_4_move_between_classes() {
    let alloc = allocator(64 << 20);
    let src = alloc.class_for_size(50);
    let dst = alloc.table().largest();
    assert_ne!(src, dst);

    let handles = fill_pages(&alloc, src, 3);
    for h in handles {
        alloc.free(h, 50);
    }
    assert_eq!(total_pages(&alloc, src), 3);

    // Give dst an initial page so it already exists in stats.
    let seed = alloc.alloc(alloc.table().get(dst).unwrap().chunk_size as usize).unwrap();
    alloc.free(seed, alloc.table().get(dst).unwrap().chunk_size as usize);

    assert_eq!(alloc.reassign(src, dst, 1), ReassignResult::Ok);
    drain_rebalance(&alloc);

    assert_eq!(total_pages(&alloc, src), 2);
    assert_eq!(total_pages(&alloc, dst), 2);
}

#[test]
fn seed_scenario_5_shrink_drops_bytes_malloced() {
    let alloc = allocator(64 << 20);
    let class = alloc.class_for_size(50);

    let handles = fill_pages(&alloc, class, 4);
    for h in handles {
        alloc.free(h, 50);
    }
    assert_eq!(total_pages(&alloc, class), 4);

    assert_eq!(alloc.reassign(class, 0, 2), ReassignResult::Ok);
    drain_rebalance(&alloc); // first iteration
    drain_rebalance(&alloc); // FINISH re-queues signal for the second slab

    assert_eq!(total_pages(&alloc, class), 2);
}

#[test]
fn reassign_returns_running_while_a_job_is_in_flight() {
    let alloc = allocator(64 << 20);
    let class = alloc.class_for_size(50);
    let handles = fill_pages(&alloc, class, 2);
    for h in handles {
        alloc.free(h, 50);
    }

    assert_eq!(alloc.reassign(class, 0, 1), ReassignResult::Ok);
    // Not yet drained: signal is Requested/Running.
    assert_eq!(alloc.reassign(class, 0, 1), ReassignResult::Running);
    drain_rebalance(&alloc);
}

#[test]
fn concurrent_alloc_and_free_across_threads() {
    let alloc = allocator(64 << 20);
    let num_threads = 8;
    let iterations = 200;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let alloc = Arc::clone(&alloc);
            std::thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..iterations {
                    let size = 8 + (i % 500);
                    live.push((alloc.alloc(size).expect("alloc under threads"), size));
                    if live.len() > 20 {
                        let (h, size) = live.remove(0);
                        alloc.free(h, size);
                    }
                }
                for (h, size) in live {
                    alloc.free(h, size);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
