//! The fabric container: device map, group table, socket table, global stats
//! and external collaborators, with an explicit init lifecycle. Tests and
//! embedders construct isolated instances; nothing here is ambient.

use crossbeam_channel::Receiver;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::devmap::DeviceMap;
use crate::engine::RxEngine;
use crate::error::{FabricError, Result};
use crate::frame::Frame;
use crate::group::GroupTable;
use crate::params::FabricParams;
use crate::socket::{Delivery, Egress, SockStatsSnapshot, Socket, SocketTable, MAX_SOCKETS};
use crate::stats::{
    GlobalStats, GlobalStatsSnapshot, GroupStatsSnapshot, PoolStats, PoolStatsSnapshot,
};

/// The OS receive path a kernel-forwarded frame is injected into.
pub trait KernelPath: Send + Sync {
    /// True when the frame was accepted.
    fn inject(&self, frame: Frame) -> bool;
}

/// Device transmission for program- and egress-staged forwards.
pub trait DeviceXmit: Send + Sync {
    /// True when the frame went out on `ifindex`.
    fn xmit(&self, frame: &Frame, ifindex: i32) -> bool;
}

/// Swallows kernel pushes; the default when no OS path is wired up.
pub struct NullKernelPath;

impl KernelPath for NullKernelPath {
    fn inject(&self, _frame: Frame) -> bool {
        true
    }
}

/// Rejects all transmissions; forwards count as discarded.
pub struct NullDeviceXmit;

impl DeviceXmit for NullDeviceXmit {
    fn xmit(&self, _frame: &Frame, _ifindex: i32) -> bool {
        false
    }
}

pub struct Fabric {
    pub params: FabricParams,
    pub devmap: Arc<DeviceMap>,
    pub groups: GroupTable,
    pub sockets: SocketTable,
    pub global: GlobalStats,
    pub(crate) kernel_path: Arc<dyn KernelPath>,
    pub(crate) dev_xmit: Arc<dyn DeviceXmit>,
    pub(crate) pool_stats: Arc<PoolStats>,
    pool_enabled: AtomicBool,
    ncpu: usize,
}

impl Fabric {
    pub fn new(
        params: FabricParams,
        ncpu: usize,
        kernel_path: Arc<dyn KernelPath>,
        dev_xmit: Arc<dyn DeviceXmit>,
    ) -> Result<Arc<Self>> {
        params.validate()?;
        if ncpu == 0 {
            return Err(FabricError::BadConfig("ncpu must be positive"));
        }
        let devmap = Arc::new(DeviceMap::new());
        let groups = GroupTable::new(ncpu, devmap.clone(), params.grace());
        let fabric = Arc::new(Self {
            groups,
            devmap,
            sockets: SocketTable::new(),
            global: GlobalStats::new(ncpu),
            kernel_path,
            dev_xmit,
            pool_stats: Arc::new(PoolStats::default()),
            pool_enabled: AtomicBool::new(params.pool_size > 0),
            params,
            ncpu,
        });
        tracing::info!(ncpu, "fabric ready");
        Ok(fabric)
    }

    /// A fabric with no kernel or device egress, for embedding and tests.
    pub fn new_detached(params: FabricParams, ncpu: usize) -> Result<Arc<Self>> {
        Self::new(params, ncpu, Arc::new(NullKernelPath), Arc::new(NullDeviceXmit))
    }

    #[inline]
    pub fn ncpu(&self) -> usize {
        self.ncpu
    }

    /// Build the receive engine for one CPU. The engine owns its CPU-local
    /// state; the caller keeps it on that CPU's thread.
    pub fn engine(self: &Arc<Self>, cpu: usize) -> Result<RxEngine> {
        if cpu >= self.ncpu {
            return Err(FabricError::InvalidArgument);
        }
        Ok(RxEngine::new(self.clone(), cpu))
    }

    /// Open a socket with the fabric's default capture length and queue size.
    pub fn open_socket(&self, egress: Egress) -> Result<(Arc<Socket>, Receiver<Delivery>)> {
        self.sockets
            .open(self.params.cap_len, self.params.max_queue_slots, egress)
    }

    /// Open a socket with explicit receive options.
    pub fn open_socket_with(
        &self,
        caplen: usize,
        queue_slots: usize,
        egress: Egress,
    ) -> Result<(Arc<Socket>, Receiver<Delivery>)> {
        self.sockets.open(caplen, queue_slots, egress)
    }

    /// Close a socket: leaves all its groups (freeing emptied ones), then
    /// releases the id slot.
    pub fn close_socket(&self, id: usize) {
        self.groups.leave_all(id);
        self.sockets.close(id);
    }

    pub fn enable_pools(&self, on: bool) {
        tracing::info!(on, "frame pool recycling");
        self.pool_enabled.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn pools_enabled(&self) -> bool {
        self.pool_enabled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FabricSnapshot {
        let groups = (0..crate::group::MAX_GROUPS)
            .filter(|&gid| self.groups.is_in_use(gid))
            .map(|gid| GroupEntry {
                gid,
                stats: self.groups.stats_snapshot(gid).unwrap_or_default(),
            })
            .collect();
        let sockets = (0..MAX_SOCKETS)
            .filter_map(|id| self.sockets.get(id))
            .map(|so| SocketEntry {
                id: so.id,
                stats: so.stats.snapshot(),
            })
            .collect();
        FabricSnapshot {
            global: self.global.snapshot(),
            pool: self.pool_stats.snapshot(),
            groups,
            sockets,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupEntry {
    pub gid: usize,
    pub stats: GroupStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SocketEntry {
    pub id: usize,
    pub stats: SockStatsSnapshot,
}

/// Point-in-time view of the whole fabric, for monitors and reports.
#[derive(Debug, Clone, Serialize)]
pub struct FabricSnapshot {
    pub global: GlobalStatsSnapshot,
    pub pool: PoolStatsSnapshot,
    pub groups: Vec<GroupEntry>,
    pub sockets: Vec<SocketEntry>,
}
