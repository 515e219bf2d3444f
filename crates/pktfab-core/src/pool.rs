//! Bounded per-CPU frame pools.
//!
//! Each engine owns one rx and one tx pool; no cross-CPU access. A pool is a
//! LIFO stack of retired frames whose allocations get reused when the head
//! frame is recycleable for the requested size. Misses and refusals are
//! counted, never propagated.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use crate::frame::{Frame, HEADROOM};
use crate::stats::PoolStats;

/// Hard cap on the configured per-CPU pool capacity.
pub const POOL_MAX_SIZE: usize = 1024;

pub struct FramePool {
    stack: Vec<Frame>,
    cap: usize,
    stats: Arc<PoolStats>,
}

impl FramePool {
    pub fn new(cap: usize, stats: Arc<PoolStats>) -> Self {
        Self {
            stack: Vec::with_capacity(cap.min(POOL_MAX_SIZE)),
            cap: cap.min(POOL_MAX_SIZE),
            stats,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Pop one frame if present.
    pub fn get(&mut self) -> Option<Frame> {
        self.stack.pop()
    }

    /// Push a retired frame; silently released when the pool is full.
    pub fn put(&mut self, frame: Frame) {
        if self.stack.len() < self.cap {
            self.stack.push(frame);
        }
    }

    /// Allocate a frame sized for `size` payload bytes. When `enabled`, the
    /// head of the pool is reused if recycleable; a non-recycleable head is
    /// released, not pushed back. Falls back to a fresh allocation.
    pub fn alloc(&mut self, size: usize, enabled: bool) -> Frame {
        if enabled {
            match self.stack.pop() {
                Some(mut f) => {
                    if self.recycleable(&f, size) {
                        self.stats.pool_alloc.fetch_add(1, Relaxed);
                        f.recycle();
                        return f;
                    }
                }
                None => {
                    self.stats.pool_fail.fetch_add(1, Relaxed);
                }
            }
        }
        self.stats.os_alloc.fetch_add(1, Relaxed);
        Frame::with_capacity(size)
    }

    /// A frame is recycleable iff it is solely owned, was never cloned, and
    /// its buffer accommodates `size` plus headroom.
    pub fn recycleable(&self, frame: &Frame, size: usize) -> bool {
        if frame.users > 1 {
            self.stats.err_shared.fetch_add(1, Relaxed);
            return false;
        }
        if frame.cloned {
            self.stats.err_cloned.fetch_add(1, Relaxed);
            return false;
        }
        if frame.capacity() < size + HEADROOM {
            self.stats.err_memory.fetch_add(1, Relaxed);
            return false;
        }
        true
    }

    /// Drain the pool; returns the number of frames released.
    pub fn purge(&mut self) -> usize {
        let n = self.stack.len();
        self.stack.clear();
        n
    }
}
