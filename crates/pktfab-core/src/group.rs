//! Group table: demux buckets binding sockets to a shared filter and program.
//!
//! All mutations serialize under a single coarse table lock held only on the
//! control path. The receive path reads the shared fields lock-free:
//! membership masks and VLAN tables are atomics, filter and program live in
//! atomically swappable cells. Displaced filter/program objects are retired
//! after a grace period long enough that no receive cycle already in progress
//! can still observe them.

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::devmap::DeviceMap;
use crate::error::{FabricError, Result};
use crate::exec::{FrameFilter, InstalledProgram, CLASS_ANY, MAX_CLASSES};
use crate::socket::MAX_SOCKETS;
use crate::stats::{GroupStats, GroupStatsSnapshot, SparseCounter};

pub const MAX_GROUPS: usize = 64;

/// Per-group integer cells available to programs.
pub const MAX_COUNTERS: usize = 8;

/// Persistent scratch slots per group.
pub const MAX_PERSISTENT: usize = 8;
pub const PERSISTENT_SIZE: usize = 64;

const VLAN_TABLE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Undefined,
    Private,
    Restricted,
    Shared,
}

// ---------------------------------------------------------------------------
// Shared (lock-free) group state
// ---------------------------------------------------------------------------

/// The part of a group the receive path reads without the table lock.
pub struct GroupShared {
    sock_mask: [AtomicU64; MAX_CLASSES],
    filter: ArcSwapOption<Box<dyn FrameFilter>>,
    program: ArcSwapOption<InstalledProgram>,
    vlan_filt: AtomicBool,
    vid_filters: Box<[AtomicBool]>,
    pub stats: GroupStats,
    counters: Box<[SparseCounter]>,
    persistent: Box<[Mutex<[u8; PERSISTENT_SIZE]>]>,
}

impl GroupShared {
    fn new(ncpu: usize) -> Self {
        Self {
            sock_mask: std::array::from_fn(|_| AtomicU64::new(0)),
            filter: ArcSwapOption::empty(),
            program: ArcSwapOption::empty(),
            vlan_filt: AtomicBool::new(false),
            vid_filters: (0..VLAN_TABLE).map(|_| AtomicBool::new(false)).collect(),
            stats: GroupStats::new(ncpu),
            counters: (0..MAX_COUNTERS).map(|_| SparseCounter::new(ncpu)).collect(),
            persistent: (0..MAX_PERSISTENT)
                .map(|_| Mutex::new([0u8; PERSISTENT_SIZE]))
                .collect(),
        }
    }

    /// Current members of one traffic class.
    #[inline]
    pub fn sock_mask(&self, class: usize) -> u64 {
        self.sock_mask[class & (MAX_CLASSES - 1)].load(Ordering::Relaxed)
    }

    /// Union of members across every class.
    pub fn membership_mask(&self) -> u64 {
        self.sock_mask
            .iter()
            .map(|m| m.load(Ordering::Relaxed))
            .fold(0, |a, b| a | b)
    }

    /// Snapshot of the installed filter, if any.
    #[inline]
    pub fn filter(&self) -> Option<Arc<Box<dyn FrameFilter>>> {
        self.filter.load_full()
    }

    /// Snapshot of the installed program + context pair, if any.
    #[inline]
    pub fn program(&self) -> Option<Arc<InstalledProgram>> {
        self.program.load_full()
    }

    #[inline]
    pub fn vlan_filters_enabled(&self) -> bool {
        self.vlan_filt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn vlan_accepts(&self, tci: u16) -> bool {
        self.vid_filters[(tci & 0xfff) as usize].load(Ordering::Relaxed)
    }

    /// One of the group's per-CPU counter cells, for program use.
    pub fn counter(&self, k: usize) -> Option<&SparseCounter> {
        self.counters.get(k)
    }

    /// Lock one of the group's persistent scratch slots, for program use.
    pub fn persistent(&self, m: usize) -> Option<MutexGuard<'_, [u8; PERSISTENT_SIZE]>> {
        self.persistent.get(m).map(|s| s.lock().unwrap())
    }

    fn add_member(&self, class: usize, id: usize) {
        self.sock_mask[class].fetch_or(1u64 << id, Ordering::Relaxed);
    }

    fn remove_member_all(&self, id: usize) {
        for m in &self.sock_mask {
            m.fetch_and(!(1u64 << id), Ordering::Relaxed);
        }
    }

    /// Reinitialize everything a fresh joiner must not inherit.
    fn reinit(&self) {
        for m in &self.sock_mask {
            m.store(0, Ordering::Relaxed);
        }
        self.stats.reset();
        for c in self.counters.iter() {
            c.reset();
        }
        for slot in self.persistent.iter() {
            slot.lock().unwrap().fill(0);
        }
        for v in self.vid_filters.iter() {
            v.store(false, Ordering::Relaxed);
        }
        self.vlan_filt.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Control state + table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct GroupCtl {
    /// Thread-group id of the creator; doubles as the in-use flag.
    pid: Option<u32>,
    /// First successful joiner; cleared only on free.
    owner: Option<usize>,
    policy: Policy,
}

impl Default for GroupCtl {
    fn default() -> Self {
        Self {
            pid: None,
            owner: None,
            policy: Policy::Undefined,
        }
    }
}

pub struct GroupTable {
    shared: Box<[GroupShared]>,
    ctl: Mutex<Vec<GroupCtl>>,
    devmap: Arc<DeviceMap>,
    grace: Duration,
}

impl GroupTable {
    pub fn new(ncpu: usize, devmap: Arc<DeviceMap>, grace: Duration) -> Self {
        Self {
            shared: (0..MAX_GROUPS).map(|_| GroupShared::new(ncpu)).collect(),
            ctl: Mutex::new(vec![GroupCtl::default(); MAX_GROUPS]),
            devmap,
            grace,
        }
    }

    /// Lock-free access to a group's shared state; `None` for out-of-range ids.
    #[inline]
    pub fn shared(&self, gid: usize) -> Option<&GroupShared> {
        self.shared.get(gid)
    }

    pub fn is_in_use(&self, gid: usize) -> bool {
        gid < MAX_GROUPS && self.ctl.lock().unwrap()[gid].pid.is_some()
    }

    pub fn owner(&self, gid: usize) -> Option<usize> {
        if gid >= MAX_GROUPS {
            return None;
        }
        self.ctl.lock().unwrap()[gid].owner
    }

    pub fn policy(&self, gid: usize) -> Option<Policy> {
        if gid >= MAX_GROUPS {
            return None;
        }
        Some(self.ctl.lock().unwrap()[gid].policy)
    }

    /// Whether `id` is a member of `gid` in any class.
    pub fn has_joined(&self, gid: usize, id: usize) -> bool {
        self.shared(gid)
            .map(|g| g.membership_mask() & (1u64 << id) != 0)
            .unwrap_or(false)
    }

    /// Bitmask of groups `id` belongs to.
    pub fn groups_of(&self, id: usize) -> u64 {
        let mut mask = 0u64;
        for gid in 0..MAX_GROUPS {
            if self.has_joined(gid, id) {
                mask |= 1u64 << gid;
            }
        }
        mask
    }

    pub fn stats_snapshot(&self, gid: usize) -> Option<GroupStatsSnapshot> {
        self.shared(gid).map(|g| g.stats.snapshot())
    }

    // -- join / leave -------------------------------------------------------

    pub fn join(
        &self,
        gid: usize,
        id: usize,
        class_mask: u64,
        policy: Policy,
        pid: u32,
    ) -> Result<()> {
        check_gid(gid)?;
        check_sock_id(id)?;
        let mut ctl = self.ctl.lock().unwrap();
        self.join_locked(&mut ctl, gid, id, class_mask, policy, pid)
    }

    /// Join the first free group; returns its id.
    pub fn join_free(&self, id: usize, class_mask: u64, policy: Policy, pid: u32) -> Result<usize> {
        check_sock_id(id)?;
        let mut ctl = self.ctl.lock().unwrap();
        for gid in 0..MAX_GROUPS {
            if ctl[gid].pid.is_none() {
                self.join_locked(&mut ctl, gid, id, class_mask, policy, pid)?;
                return Ok(gid);
            }
        }
        Err(FabricError::Busy)
    }

    pub fn leave(&self, gid: usize, id: usize) -> Result<()> {
        check_gid(gid)?;
        check_sock_id(id)?;
        let mut ctl = self.ctl.lock().unwrap();
        self.leave_locked(&mut ctl, gid, id)
    }

    pub fn leave_all(&self, id: usize) {
        let mut ctl = self.ctl.lock().unwrap();
        for gid in 0..MAX_GROUPS {
            let _ = self.leave_locked(&mut ctl, gid, id);
        }
    }

    fn join_locked(
        &self,
        ctl: &mut [GroupCtl],
        gid: usize,
        id: usize,
        class_mask: u64,
        policy: Policy,
        pid: u32,
    ) -> Result<()> {
        let fresh = ctl[gid].pid.is_none();
        if fresh {
            ctl[gid] = GroupCtl {
                pid: Some(pid),
                owner: None,
                policy: Policy::Undefined,
            };
            self.shared[gid].reinit();
        }

        if !self.access_ok(&ctl[gid], gid, id, policy, pid, fresh) {
            if fresh {
                // Roll the initialization back; a failed join must not leave
                // an in-use group with no members behind.
                ctl[gid] = GroupCtl::default();
            }
            tracing::debug!(gid, id, ?policy, "group not joinable");
            return Err(FabricError::NotPermitted);
        }

        let mut cm = class_mask & CLASS_ANY;
        while cm != 0 {
            let class = cm.trailing_zeros() as usize;
            cm &= cm - 1;
            self.shared[gid].add_member(class, id);
        }

        if ctl[gid].owner.is_none() {
            ctl[gid].owner = Some(id);
        }
        if ctl[gid].policy == Policy::Undefined {
            ctl[gid].policy = policy;
        }
        Ok(())
    }

    fn access_ok(
        &self,
        ctl: &GroupCtl,
        gid: usize,
        id: usize,
        requested: Policy,
        pid: u32,
        fresh: bool,
    ) -> bool {
        // An undefined request is only meaningful on a fresh group.
        if requested == Policy::Undefined && !fresh {
            return false;
        }
        match ctl.policy {
            Policy::Private => self.has_joined(gid, id),
            Policy::Restricted => requested == Policy::Restricted && ctl.pid == Some(pid),
            Policy::Shared => requested == Policy::Shared,
            Policy::Undefined => true,
        }
    }

    fn leave_locked(&self, ctl: &mut [GroupCtl], gid: usize, id: usize) -> Result<()> {
        if ctl[gid].pid.is_none() {
            return Err(FabricError::NotPermitted);
        }
        self.shared[gid].remove_member_all(id);
        if self.shared[gid].membership_mask() == 0 {
            self.free_locked(&mut ctl[gid], gid);
        }
        Ok(())
    }

    /// Tear a group down. Detaches it from the device map, unpublishes filter
    /// and program, and only releases them after the grace period so that no
    /// receive cycle that began before the swap still holds a reference.
    fn free_locked(&self, ctl: &mut GroupCtl, gid: usize) {
        self.devmap.reset_group(gid);
        *ctl = GroupCtl::default();

        let sh = &self.shared[gid];
        let old_filter = sh.filter.swap(None);
        let old_program = sh.program.swap(None);

        std::thread::sleep(self.grace);

        drop(old_filter);
        drop(old_program);
        sh.vlan_filt.store(false, Ordering::Release);
        tracing::debug!(gid, "group destroyed");
    }

    // -- access checks ------------------------------------------------------

    /// Bounds, membership, and ownership validation for owner-only operations.
    pub fn check_access(&self, id: usize, gid: usize) -> Result<()> {
        let ctl = self.ctl.lock().unwrap();
        self.check_access_locked(&ctl, id, gid)
    }

    fn check_access_locked(&self, ctl: &[GroupCtl], id: usize, gid: usize) -> Result<()> {
        check_gid(gid)?;
        check_sock_id(id)?;
        if !self.has_joined(gid, id) {
            return Err(FabricError::NotPermitted);
        }
        if ctl[gid].owner != Some(id) {
            return Err(FabricError::NotOwner);
        }
        Ok(())
    }

    // -- filter / program installation --------------------------------------

    /// Atomically replace the group filter. The displaced filter is released
    /// only after the grace period; the table lock is not held while waiting.
    pub fn set_filter(
        &self,
        gid: usize,
        id: usize,
        filter: Option<Box<dyn FrameFilter>>,
    ) -> Result<()> {
        let old = {
            let ctl = self.ctl.lock().unwrap();
            self.check_access_locked(&ctl, id, gid)?;
            self.shared[gid].filter.swap(filter.map(Arc::new))
        };
        std::thread::sleep(self.grace);
        drop(old);
        Ok(())
    }

    /// Atomically replace the group program + context pair. Serialized with
    /// itself: the table lock is held across the grace period.
    pub fn set_program(
        &self,
        gid: usize,
        id: usize,
        program: Option<InstalledProgram>,
    ) -> Result<()> {
        let ctl = self.ctl.lock().unwrap();
        self.check_access_locked(&ctl, id, gid)?;
        let old = self.shared[gid].program.swap(program.map(Arc::new));
        std::thread::sleep(self.grace);
        drop(old);
        drop(ctl);
        Ok(())
    }

    // -- VLAN filters -------------------------------------------------------

    /// Enable or disable per-VID filtering. Enabling clears the whole VID
    /// table (reject-all) before the flag becomes visible.
    pub fn toggle_vlan_filters(&self, gid: usize, id: usize, on: bool) -> Result<()> {
        let ctl = self.ctl.lock().unwrap();
        self.check_access_locked(&ctl, id, gid)?;
        let sh = &self.shared[gid];
        if on {
            for v in sh.vid_filters.iter() {
                v.store(false, Ordering::Relaxed);
            }
        }
        sh.vlan_filt.store(on, Ordering::Release);
        Ok(())
    }

    pub fn set_vlan_filter(&self, gid: usize, id: usize, vid: u16, accept: bool) -> Result<()> {
        let ctl = self.ctl.lock().unwrap();
        self.check_access_locked(&ctl, id, gid)?;
        self.shared[gid].vid_filters[(vid & 0xfff) as usize].store(accept, Ordering::Relaxed);
        Ok(())
    }
}

#[inline]
fn check_gid(gid: usize) -> Result<()> {
    if gid >= MAX_GROUPS {
        return Err(FabricError::InvalidArgument);
    }
    Ok(())
}

#[inline]
fn check_sock_id(id: usize) -> Result<()> {
    if id >= MAX_SOCKETS {
        return Err(FabricError::InvalidArgument);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
