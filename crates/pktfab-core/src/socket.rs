//! Socket endpoints and the socket table.
//!
//! A socket pairs an id slot with receive options and a bounded delivery
//! queue. The engine resolves ids lock-free through atomically swappable
//! slots; open/close serialize under a small table lock. The queue is the
//! shared-memory ring's stand-in: the engine is the producer (`try_send`,
//! full counts as lost), a blocking `recv` on the consumer side is the
//! reader wait-queue.

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

use crate::error::{FabricError, Result};

pub const MAX_SOCKETS: usize = 64;

/// Where a socket's selected frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Egress {
    /// Copy payloads into the socket's delivery queue.
    Socket,
    /// Stage selected frames for transmission on a device instead.
    Device { ifindex: i32 },
}

/// Fixed-layout delivery header preceding each captured payload.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeliveryHeader {
    pub caplen: u32,
    /// Original frame length before truncation.
    pub len: u32,
    pub ifindex: i32,
    pub hw_queue: u16,
    pub tstamp_ns: u64,
    /// Slot-ready marker; always 1 on a pushed delivery.
    pub commit: u8,
    pub gid: u16,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub header: DeliveryHeader,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct SockStats {
    pub recv: AtomicU64,
    pub lost: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SockStatsSnapshot {
    pub recv: u64,
    pub lost: u64,
}

impl SockStats {
    pub fn snapshot(&self) -> SockStatsSnapshot {
        SockStatsSnapshot {
            recv: self.recv.load(Relaxed),
            lost: self.lost.load(Relaxed),
        }
    }
}

pub struct Socket {
    pub id: usize,
    pub egress: Egress,
    caplen: AtomicUsize,
    tstamp_on: AtomicBool,
    tx: Sender<Delivery>,
    pub stats: SockStats,
}

impl Socket {
    #[inline]
    pub fn caplen(&self) -> usize {
        self.caplen.load(Relaxed)
    }

    pub fn set_caplen(&self, caplen: usize) {
        self.caplen.store(caplen, Relaxed);
    }

    #[inline]
    pub fn tstamp_enabled(&self) -> bool {
        self.tstamp_on.load(Relaxed)
    }

    pub fn set_tstamp(&self, on: bool) {
        self.tstamp_on.store(on, Relaxed);
    }

    /// Producer side of the shared queue. False when the queue is full or
    /// the consumer is gone; callers count the loss.
    #[inline]
    pub(crate) fn push(&self, d: Delivery) -> bool {
        match self.tx.try_send(d) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct SocketTable {
    slots: Box<[ArcSwapOption<Socket>]>,
    count: AtomicUsize,
    open_lock: Mutex<()>,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SOCKETS).map(|_| ArcSwapOption::empty()).collect(),
            count: AtomicUsize::new(0),
            open_lock: Mutex::new(()),
        }
    }

    /// Claim a free id and build the socket around a fresh bounded queue.
    pub fn open(
        &self,
        caplen: usize,
        queue_slots: usize,
        egress: Egress,
    ) -> Result<(Arc<Socket>, Receiver<Delivery>)> {
        let _guard = self.open_lock.lock().unwrap();
        let id = (0..MAX_SOCKETS)
            .find(|&i| self.slots[i].load().is_none())
            .ok_or(FabricError::Busy)?;
        let (tx, rx) = bounded(queue_slots);
        let so = Arc::new(Socket {
            id,
            egress,
            caplen: AtomicUsize::new(caplen),
            tstamp_on: AtomicBool::new(false),
            tx,
            stats: SockStats::default(),
        });
        self.slots[id].store(Some(so.clone()));
        self.count.fetch_add(1, Relaxed);
        tracing::debug!(id, "socket opened");
        Ok((so, rx))
    }

    /// Release an id slot. Callers leave the socket's groups first.
    pub fn close(&self, id: usize) -> Option<Arc<Socket>> {
        let _guard = self.open_lock.lock().unwrap();
        let prev = self.slots.get(id)?.swap(None);
        if prev.is_some() {
            self.count.fetch_sub(1, Relaxed);
            tracing::debug!(id, "socket closed");
        }
        prev
    }

    /// Hot-path id resolution.
    #[inline]
    pub fn get(&self, id: usize) -> Option<Arc<Socket>> {
        self.slots.get(id)?.load_full()
    }

    /// Number of open sockets; the engine's no-socket short circuit.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Relaxed)
    }
}
