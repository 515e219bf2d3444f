//! Per-CPU garbage collector: the bounded batch of in-flight frames for one
//! receive cycle.
//!
//! The GC is the sole owner of enrolled frames between `make_buff` and the
//! end of the cycle. Buffs are referred to by small array indices; each slot
//! carries a parallel control block holding the cached group mask, the
//! direct-capture code, and the forwarding log written by programs.

use crate::frame::Frame;

/// Batch capacity. Per-socket dispatch masks pack batch indices into one
/// 64-bit word, so this can never exceed 64.
pub const BATCH_CAP: usize = 16;
const _: () = assert!(BATCH_CAP <= 64, "batch indices must fit a u64 mask");

/// Device forwards a program may stage per frame.
pub const FWD_LOG_MAX: usize = 8;

/// Distinct devices reported in an aggregated forward-target view.
pub const FWD_TARGETS_MAX: usize = 16;

pub type BuffIdx = usize;

#[derive(Debug, Clone, Copy, Default)]
pub struct FwdLog {
    pub devs: [i32; FWD_LOG_MAX],
    pub num_devs: usize,
    pub to_kernel: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlBlock {
    /// Groups listening on this frame's `(device, queue)`, cached per cycle.
    pub group_mask: u64,
    /// Intake path: 0 = protocol hook, 1..=3 = driver shims.
    pub direct: u8,
    pub log: FwdLog,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FwdTargets {
    pub devs: [i32; FWD_TARGETS_MAX],
    pub counts: [u32; FWD_TARGETS_MAX],
    pub num: usize,
    /// Every staged forward, including ones beyond the listing capacity.
    pub total: usize,
}

pub struct GcBatch {
    buffs: [Option<Frame>; BATCH_CAP],
    cbs: [ControlBlock; BATCH_CAP],
    len: usize,
}

impl Default for GcBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl GcBatch {
    pub fn new() -> Self {
        Self {
            buffs: std::array::from_fn(|_| None),
            cbs: [ControlBlock::default(); BATCH_CAP],
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Enroll a frame, surrendering ownership to the GC for the cycle.
    /// Returns the frame when the batch is at capacity.
    pub fn make_buff(&mut self, frame: Frame) -> Result<BuffIdx, Frame> {
        if self.len == BATCH_CAP {
            return Err(frame);
        }
        let ix = self.len;
        self.buffs[ix] = Some(frame);
        self.cbs[ix] = ControlBlock::default();
        self.len += 1;
        Ok(ix)
    }

    #[inline]
    pub fn frame(&self, ix: BuffIdx) -> Option<&Frame> {
        self.buffs.get(ix).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn frame_mut(&mut self, ix: BuffIdx) -> Option<&mut Frame> {
        self.buffs.get_mut(ix).and_then(|s| s.as_mut())
    }

    /// Extract a frame, leaving its slot empty for the rest of the cycle.
    pub fn take_frame(&mut self, ix: BuffIdx) -> Option<Frame> {
        self.buffs.get_mut(ix).and_then(|s| s.take())
    }

    #[inline]
    pub fn cb(&self, ix: BuffIdx) -> &ControlBlock {
        &self.cbs[ix]
    }

    #[inline]
    pub fn cb_mut(&mut self, ix: BuffIdx) -> &mut ControlBlock {
        &mut self.cbs[ix]
    }

    /// Stage a device forward for `ix`. False when the frame's log is full;
    /// the forward is not recorded.
    pub fn forward_to_device(&mut self, ix: BuffIdx, ifindex: i32) -> bool {
        let log = &mut self.cbs[ix].log;
        if log.num_devs == FWD_LOG_MAX {
            return false;
        }
        log.devs[log.num_devs] = ifindex;
        log.num_devs += 1;
        true
    }

    /// Record a kernel push request for `ix`.
    pub fn push_to_kernel(&mut self, ix: BuffIdx) {
        self.cbs[ix].log.to_kernel += 1;
    }

    /// Aggregate the forward logs of the whole batch into `out`.
    pub fn fwd_targets(&self, out: &mut FwdTargets) {
        *out = FwdTargets::default();
        for cb in &self.cbs[..self.len] {
            for &dev in &cb.log.devs[..cb.log.num_devs] {
                out.total += 1;
                match out.devs[..out.num].iter().position(|&d| d == dev) {
                    Some(i) => out.counts[i] += 1,
                    None if out.num < FWD_TARGETS_MAX => {
                        out.devs[out.num] = dev;
                        out.counts[out.num] = 1;
                        out.num += 1;
                    }
                    None => {}
                }
            }
        }
    }

    /// Empty the batch. Does not free frames; callers drain them explicitly
    /// after endpoint dispatch.
    pub fn reset(&mut self) {
        for slot in &mut self.buffs[..self.len] {
            *slot = None;
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testutil::eth_bytes;
    use crate::frame::ETH_P_IP;

    fn frame() -> Frame {
        Frame::from_ethernet(1, 0, eth_bytes(ETH_P_IP, b"x"))
    }

    #[test]
    fn test_make_buff_until_full() {
        let mut gc = GcBatch::new();
        for i in 0..BATCH_CAP {
            assert_eq!(gc.make_buff(frame()).unwrap(), i);
        }
        assert_eq!(gc.len(), BATCH_CAP);
        assert!(gc.make_buff(frame()).is_err());
    }

    #[test]
    fn test_take_frame_leaves_slot_empty() {
        let mut gc = GcBatch::new();
        let ix = gc.make_buff(frame()).unwrap();
        assert!(gc.take_frame(ix).is_some());
        assert!(gc.frame(ix).is_none());
        assert!(gc.take_frame(ix).is_none());
        assert_eq!(gc.len(), 1);
    }

    #[test]
    fn test_forward_log_bounded() {
        let mut gc = GcBatch::new();
        let ix = gc.make_buff(frame()).unwrap();
        for d in 0..FWD_LOG_MAX as i32 {
            assert!(gc.forward_to_device(ix, d));
        }
        assert!(!gc.forward_to_device(ix, 99));
        assert_eq!(gc.cb(ix).log.num_devs, FWD_LOG_MAX);
    }

    #[test]
    fn test_fwd_targets_aggregates_unique_devs() {
        let mut gc = GcBatch::new();
        let a = gc.make_buff(frame()).unwrap();
        let b = gc.make_buff(frame()).unwrap();
        gc.forward_to_device(a, 3);
        gc.forward_to_device(a, 5);
        gc.forward_to_device(b, 3);
        let mut t = FwdTargets::default();
        gc.fwd_targets(&mut t);
        assert_eq!(t.total, 3);
        assert_eq!(t.num, 2);
        let i3 = t.devs[..t.num].iter().position(|&d| d == 3).unwrap();
        assert_eq!(t.counts[i3], 2);
    }

    #[test]
    fn test_reset_empties_batch() {
        let mut gc = GcBatch::new();
        let ix = gc.make_buff(frame()).unwrap();
        gc.push_to_kernel(ix);
        gc.reset();
        assert!(gc.is_empty());
        let ix2 = gc.make_buff(frame()).unwrap();
        assert_eq!(gc.cb(ix2).log.to_kernel, 0, "control block reinitialized");
    }
}
