//! Endpoint dispatch: copy selected payloads to a socket's shared queue, or
//! stage them for device transmission when the socket's egress hint says so.

use crate::gc::{BuffIdx, GcBatch, BATCH_CAP};
use crate::socket::{Delivery, DeliveryHeader, Egress, Socket};
use crate::stats::RateLimited;
use std::sync::atomic::Ordering::Relaxed;

static WARN_QUEUE_FULL: RateLimited = RateLimited::new(1000);

/// Deliver the frames selected for one socket within one batch.
///
/// `frame_mask` holds batch indices (bit `n` = the n-th enrolled buff);
/// iterating it in ascending order preserves per-CPU arrival order. `refs`
/// maps each batch index to the (possibly program-transformed) buff that
/// actually gets delivered.
pub(crate) fn copy_to_endpoints(
    so: &Socket,
    gc: &mut GcBatch,
    refs: &[Option<BuffIdx>; BATCH_CAP],
    frame_mask: u64,
    cpu: usize,
    gid: usize,
) {
    let mut mask = frame_mask;
    while mask != 0 {
        let n = mask.trailing_zeros() as usize;
        mask &= mask - 1;

        let Some(ix) = refs.get(n).copied().flatten() else {
            continue;
        };

        match so.egress {
            Egress::Device { ifindex } => {
                // Forwarding endpoint: hand the frame to the lazy-xmit pass.
                gc.forward_to_device(ix, ifindex);
            }
            Egress::Socket => {
                let Some(frame) = gc.frame(ix) else { continue };
                let len = frame.len();
                let caplen = len.min(so.caplen());
                let d = Delivery {
                    header: DeliveryHeader {
                        caplen: caplen as u32,
                        len: len as u32,
                        ifindex: frame.ifindex,
                        hw_queue: frame.rx_queue,
                        tstamp_ns: if so.tstamp_enabled() {
                            frame.tstamp_ns
                        } else {
                            0
                        },
                        commit: 1,
                        gid: gid as u16,
                    },
                    payload: frame.payload()[..caplen].to_vec(),
                };
                if so.push(d) {
                    so.stats.recv.fetch_add(1, Relaxed);
                } else {
                    so.stats.lost.fetch_add(1, Relaxed);
                    if WARN_QUEUE_FULL.allow() {
                        tracing::warn!(id = so.id, cpu, "socket queue full, frame lost");
                    }
                }
            }
        }
    }
}
