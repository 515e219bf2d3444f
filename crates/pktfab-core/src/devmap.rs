//! Device map: `(ifindex, rx_queue)` → set of group ids.
//!
//! The hot path reads entries with relaxed atomic loads; updates serialize
//! under a dedicated lock and refresh the per-device monitor flags before
//! returning. Visibility of a teardown `reset_group` to in-flight receive
//! cycles is bounded by the group table's grace-period wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;

/// Device slots; power of two, indices masked.
pub const MAX_DEVICES: usize = 256;
/// Hardware queue slots per device; power of two, indices masked.
pub const MAX_HW_QUEUES: usize = 32;

/// Wildcard device/queue argument for `attach`/`detach`.
pub const ANY: i32 = -1;

pub struct DeviceMap {
    /// Row-major `[device][queue]` group bitmasks.
    map: Box<[AtomicU64]>,
    /// Per-device flag: any group listening on any of its queues.
    monitor: Box<[AtomicBool]>,
    write_lock: Mutex<()>,
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMap {
    pub fn new() -> Self {
        Self {
            map: (0..MAX_DEVICES * MAX_HW_QUEUES)
                .map(|_| AtomicU64::new(0))
                .collect(),
            monitor: (0..MAX_DEVICES).map(|_| AtomicBool::new(false)).collect(),
            write_lock: Mutex::new(()),
        }
    }

    #[inline]
    fn slot(ifindex: i32, queue: u16) -> usize {
        let d = (ifindex as usize) & (MAX_DEVICES - 1);
        let q = (queue as usize) & (MAX_HW_QUEUES - 1);
        d * MAX_HW_QUEUES + q
    }

    /// Hot-path lookup of the group mask for one `(device, queue)` pair.
    #[inline]
    pub fn lookup(&self, ifindex: i32, queue: u16) -> u64 {
        self.map[Self::slot(ifindex, queue)].load(Relaxed)
    }

    /// Whether any group is listening on this interface.
    #[inline]
    pub fn monitor(&self, ifindex: i32) -> bool {
        self.monitor[(ifindex as usize) & (MAX_DEVICES - 1)].load(Relaxed)
    }

    /// Add `gid` to the given device/queue; `ANY` is a wildcard on either axis.
    pub fn attach(&self, ifindex: i32, queue: i32, gid: usize) {
        self.update(true, ifindex, queue, gid);
    }

    /// Remove `gid` from the given device/queue; `ANY` wildcards as in `attach`.
    pub fn detach(&self, ifindex: i32, queue: i32, gid: usize) {
        self.update(false, ifindex, queue, gid);
    }

    /// Clear `gid` from every entry (group teardown).
    pub fn reset_group(&self, gid: usize) {
        self.update(false, ANY, ANY, gid);
    }

    fn update(&self, set: bool, ifindex: i32, queue: i32, gid: usize) {
        let bit = 1u64 << (gid & 63);
        let _guard = self.write_lock.lock().unwrap();
        let devs: Box<dyn Iterator<Item = usize>> = if ifindex == ANY {
            Box::new(0..MAX_DEVICES)
        } else {
            Box::new(std::iter::once((ifindex as usize) & (MAX_DEVICES - 1)))
        };
        for d in devs {
            let queues: Box<dyn Iterator<Item = usize>> = if queue == ANY {
                Box::new(0..MAX_HW_QUEUES)
            } else {
                Box::new(std::iter::once((queue as usize) & (MAX_HW_QUEUES - 1)))
            };
            for q in queues {
                let cell = &self.map[d * MAX_HW_QUEUES + q];
                if set {
                    cell.fetch_or(bit, Relaxed);
                } else {
                    cell.fetch_and(!bit, Relaxed);
                }
            }
        }
        self.refresh_monitor();
    }

    fn refresh_monitor(&self) {
        for d in 0..MAX_DEVICES {
            let row = &self.map[d * MAX_HW_QUEUES..(d + 1) * MAX_HW_QUEUES];
            let active = row.iter().any(|c| c.load(Relaxed) != 0);
            self.monitor[d].store(active, Relaxed);
        }
    }
}
