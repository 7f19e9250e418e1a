//! Background task lifecycle.
//!
//! Grounded on `slabs.c`'s `slab_maintenance_thread`/`slab_rebalance_thread`
//! and their `start_slab_maintenance_thread`/`stop_slab_maintenance_thread`
//! entry points. Raw pthreads plus a global `do_run_slab_thread` flag become
//! `std::thread::JoinHandle` plus an `AtomicBool`, with explicit `start`/
//! `stop` methods standing in for the C source's module-level control
//! functions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::allocator::SlabAllocator;
use crate::collaborators::CacheCollaborator;

/// Runs `automove_tick` on `config.automove`'s decision period. Corresponds
/// to `slab_maintenance_thread`.
pub struct MaintenanceWorker {
    run: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub fn start<C: CacheCollaborator + 'static>(allocator: Arc<SlabAllocator<C>>) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let run_flag = run.clone();
        let period = allocator.config().automove.decision_period();

        let handle = std::thread::Builder::new()
            .name("slab-maintenance".into())
            .spawn(move || {
                log::info!("slab maintenance thread starting");
                while run_flag.load(Ordering::Acquire) {
                    allocator.automove_tick();
                    sleep_in_slices(period, &run_flag);
                }
                log::info!("slab maintenance thread stopping");
            })
            .expect("failed to spawn slab-maintenance thread");

        MaintenanceWorker {
            run,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drives `rebalance_tick` until idle, then sleeps on a condvar until woken
/// by a fresh `reassign`/automove decision. Corresponds to
/// `slab_rebalance_thread`, whose condition variable wait (`slab_rebalance_signal`)
/// becomes a `parking_lot::Condvar` pair here.
pub struct RebalanceWorker {
    run: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl RebalanceWorker {
    pub fn start<C: CacheCollaborator + 'static>(allocator: Arc<SlabAllocator<C>>) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let run_flag = run.clone();
        let wake = Arc::new((Mutex::new(false), Condvar::new()));
        let wake_flag = wake.clone();

        let handle = std::thread::Builder::new()
            .name("slab-rebalance".into())
            .spawn(move || {
                log::info!("slab rebalance thread starting");
                while run_flag.load(Ordering::Acquire) {
                    let mut did_work = allocator.rebalance_tick();
                    while did_work && run_flag.load(Ordering::Acquire) {
                        if allocator.rebalance_saw_busy_last_tick() {
                            std::thread::sleep(Duration::from_micros(50));
                        }
                        did_work = allocator.rebalance_tick();
                    }

                    let (lock, cvar) = &*wake_flag;
                    let mut woken = lock.lock();
                    if !*woken {
                        let timeout = Duration::from_secs(1);
                        cvar.wait_for(&mut woken, timeout);
                    }
                    *woken = false;
                }
                log::info!("slab rebalance thread stopping");
            })
            .expect("failed to spawn slab-rebalance thread");

        RebalanceWorker {
            run,
            wake,
            handle: Some(handle),
        }
    }

    /// Wake the rebalancer immediately rather than waiting out its poll
    /// timeout — called after a manual `reassign` so a freshly-queued job
    /// is noticed promptly.
    pub fn notify(&self) {
        let (lock, cvar) = &*self.wake;
        *lock.lock() = true;
        cvar.notify_one();
    }

    pub fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        self.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RebalanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep up to `total`, but wake every 100ms to check `run` so `stop()`
/// doesn't have to wait out a full decision period.
fn sleep_in_slices(total: Duration, run: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO && run.load(Ordering::Acquire) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}
