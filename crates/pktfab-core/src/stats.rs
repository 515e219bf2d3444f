//! Per-CPU counters and stats snapshots.
//!
//! Hot-path increments go to CPU-owned cells with `Relaxed` ordering — these
//! are sampling metrics, not synchronisation. Queried stats sum across cells.

use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::time;

// ---------------------------------------------------------------------------
// SparseCounter
// ---------------------------------------------------------------------------

/// A counter split into cache-padded per-CPU cells. Each cell is written only
/// by its owning CPU; readers sum all cells.
pub struct SparseCounter {
    cells: Box<[CachePadded<AtomicU64>]>,
}

impl SparseCounter {
    pub fn new(ncpu: usize) -> Self {
        Self {
            cells: (0..ncpu)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    #[inline]
    pub fn inc(&self, cpu: usize) {
        self.add(cpu, 1);
    }

    #[inline]
    pub fn add(&self, cpu: usize, n: u64) {
        self.cells[cpu].fetch_add(n, Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().map(|c| c.load(Relaxed)).sum()
    }

    pub fn reset(&self) {
        for c in self.cells.iter() {
            c.store(0, Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Counter groups
// ---------------------------------------------------------------------------

/// Fabric-wide receive counters.
pub struct GlobalStats {
    /// Frames that entered batch processing.
    pub recv: SparseCounter,
    /// Frames dropped for resource exhaustion (GC full, untag failure).
    pub lost: SparseCounter,
    /// Frames pushed to the kernel receive path.
    pub kern: SparseCounter,
    /// Frames forwarded to network devices.
    pub frwd: SparseCounter,
    /// Device forwards that failed to transmit.
    pub disc: SparseCounter,
    /// Kernel pushes rejected by the kernel path.
    pub quit: SparseCounter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStatsSnapshot {
    pub recv: u64,
    pub lost: u64,
    pub kern: u64,
    pub frwd: u64,
    pub disc: u64,
    pub quit: u64,
}

impl GlobalStats {
    pub fn new(ncpu: usize) -> Self {
        Self {
            recv: SparseCounter::new(ncpu),
            lost: SparseCounter::new(ncpu),
            kern: SparseCounter::new(ncpu),
            frwd: SparseCounter::new(ncpu),
            disc: SparseCounter::new(ncpu),
            quit: SparseCounter::new(ncpu),
        }
    }

    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            recv: self.recv.total(),
            lost: self.lost.total(),
            kern: self.kern.total(),
            frwd: self.frwd.total(),
            disc: self.disc.total(),
            quit: self.quit.total(),
        }
    }
}

/// Per-group receive counters.
pub struct GroupStats {
    pub recv: SparseCounter,
    pub drop: SparseCounter,
    pub frwd: SparseCounter,
    pub kern: SparseCounter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupStatsSnapshot {
    pub recv: u64,
    pub drop: u64,
    pub frwd: u64,
    pub kern: u64,
}

impl GroupStats {
    pub fn new(ncpu: usize) -> Self {
        Self {
            recv: SparseCounter::new(ncpu),
            drop: SparseCounter::new(ncpu),
            frwd: SparseCounter::new(ncpu),
            kern: SparseCounter::new(ncpu),
        }
    }

    pub fn snapshot(&self) -> GroupStatsSnapshot {
        GroupStatsSnapshot {
            recv: self.recv.total(),
            drop: self.drop.total(),
            frwd: self.frwd.total(),
            kern: self.kern.total(),
        }
    }

    pub fn reset(&self) {
        self.recv.reset();
        self.drop.reset();
        self.frwd.reset();
        self.kern.reset();
    }
}

/// Frame-pool allocation counters, shared by all per-CPU pools.
#[derive(Default)]
pub struct PoolStats {
    /// Allocations that fell back to the system allocator.
    pub os_alloc: AtomicU64,
    /// Allocations satisfied by recycling a pooled buffer.
    pub pool_alloc: AtomicU64,
    /// Pool misses (pool empty at alloc time).
    pub pool_fail: AtomicU64,
    /// Recycle refusals: buffer still shared.
    pub err_shared: AtomicU64,
    /// Recycle refusals: buffer was cloned.
    pub err_cloned: AtomicU64,
    /// Recycle refusals: insufficient capacity.
    pub err_memory: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatsSnapshot {
    pub os_alloc: u64,
    pub pool_alloc: u64,
    pub pool_fail: u64,
    pub err_shared: u64,
    pub err_cloned: u64,
    pub err_memory: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            os_alloc: self.os_alloc.load(Relaxed),
            pool_alloc: self.pool_alloc.load(Relaxed),
            pool_fail: self.pool_fail.load(Relaxed),
            err_shared: self.err_shared.load(Relaxed),
            err_cloned: self.err_cloned.load(Relaxed),
            err_memory: self.err_memory.load(Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Rate-limited log gate
// ---------------------------------------------------------------------------

/// Gate for log statements on the hot path: at most one emission per interval.
pub struct RateLimited {
    last_ns: AtomicU64,
    interval_ns: u64,
}

impl RateLimited {
    pub const fn new(interval_ms: u64) -> Self {
        Self {
            last_ns: AtomicU64::new(0),
            interval_ns: interval_ms * 1_000_000,
        }
    }

    /// True when the caller may emit; winning the slot is a single CAS.
    pub fn allow(&self) -> bool {
        let now = time::now_ns();
        let last = self.last_ns.load(Relaxed);
        if now.saturating_sub(last) < self.interval_ns && last != 0 {
            return false;
        }
        self.last_ns
            .compare_exchange(last, now, Relaxed, Relaxed)
            .is_ok()
    }
}
