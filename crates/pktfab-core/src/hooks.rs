//! Intake shims: driver-level direct capture and the protocol hook.
//!
//! The driver shims sit ahead of the normal OS receive path. Each checks the
//! device-map monitor; on a hit the frame is normalized and consumed by the
//! engine, on a miss it is handed back to the caller for the regular path.
//! The protocol hook is the classic handler: it filters loopback and
//! self-peeked frames and obeys the per-direction capture switches.

use crate::engine::RxEngine;
use crate::frame::{Frame, PktType, ETH_HLEN};

/// Outcome of a driver shim: either the fabric consumed the frame, or the
/// caller must continue down the regular OS path with it.
#[derive(Debug)]
pub enum HookVerdict {
    Consumed,
    Pass(Frame),
}

impl HookVerdict {
    pub fn consumed(&self) -> bool {
        matches!(self, HookVerdict::Consumed)
    }
}

/// Reset header offsets so the engine sees the frame the way a driver
/// delivers it: payload at the network layer.
fn normalize(frame: &mut Frame) {
    frame.reset_offsets();
}

impl RxEngine {
    /// Interrupt-context driver shim.
    pub fn netif_rx(&mut self, frame: Frame) -> HookVerdict {
        self.direct_intake(frame, 1)
    }

    /// Softirq-context driver shim.
    pub fn netif_receive(&mut self, frame: Frame) -> HookVerdict {
        self.direct_intake(frame, 2)
    }

    /// GRO driver shim.
    pub fn gro_receive(&mut self, frame: Frame) -> HookVerdict {
        self.direct_intake(frame, 3)
    }

    fn direct_intake(&mut self, mut frame: Frame, direct: u8) -> HookVerdict {
        if !self.fabric().params.direct_capture || !self.fabric().devmap.monitor(frame.ifindex) {
            return HookVerdict::Pass(frame);
        }
        normalize(&mut frame);
        self.receive(frame, direct);
        HookVerdict::Consumed
    }

    /// Protocol-hook handler for frames the OS stack shows us.
    pub fn packet_rcv(&mut self, mut frame: Frame) {
        if frame.pkt_type == PktType::Loopback {
            self.free_frame(frame);
            return;
        }
        // Frames this fabric pushed into the kernel loop back with the
        // peeked mark; capture them once, not twice.
        if frame.peeked {
            frame.peeked = false;
            self.free_frame(frame);
            return;
        }
        let (incoming, outgoing) = {
            let p = &self.fabric().params;
            (p.capture_incoming, p.capture_outgoing)
        };
        match frame.pkt_type {
            PktType::Outgoing => {
                if !outgoing {
                    self.free_frame(frame);
                    return;
                }
                frame.mac_len = ETH_HLEN;
            }
            _ => {
                if !incoming {
                    self.free_frame(frame);
                    return;
                }
            }
        }
        self.receive(frame, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;
    use crate::frame::testutil::eth_bytes;
    use crate::frame::ETH_P_IP;
    use crate::group::Policy;
    use crate::params::FabricParams;
    use crate::socket::Egress;
    use std::sync::Arc;

    const PID: u32 = 1;

    fn fabric(params: FabricParams) -> Arc<Fabric> {
        Fabric::new_detached(params, 1).unwrap()
    }

    fn listening_fabric(params: FabricParams) -> Arc<Fabric> {
        let f = fabric(params);
        let (so, rx) = f.open_socket_with(1514, 64, Egress::Socket).unwrap();
        std::mem::forget(rx);
        f.groups.join(0, so.id, 1, Policy::Shared, PID).unwrap();
        f.devmap.attach(1, 0, 0);
        f
    }

    fn frame() -> Frame {
        Frame::from_ethernet(1, 0, eth_bytes(ETH_P_IP, b"pkt"))
    }

    #[test]
    fn test_direct_capture_disabled_passes_through() {
        let f = listening_fabric(FabricParams {
            direct_capture: false,
            grace_period_ms: 1,
            ..Default::default()
        });
        let mut eng = f.engine(0).unwrap();
        assert!(!eng.netif_rx(frame()).consumed());
        assert_eq!(f.global.snapshot().recv, 0);
    }

    #[test]
    fn test_direct_capture_consumes_monitored_device() {
        let f = listening_fabric(FabricParams {
            direct_capture: true,
            grace_period_ms: 1,
            ..Default::default()
        });
        let mut eng = f.engine(0).unwrap();
        assert!(eng.netif_receive(frame()).consumed());
        // Unmonitored device falls through even with direct capture on.
        let other = Frame::from_ethernet(9, 0, eth_bytes(ETH_P_IP, b"pkt"));
        assert!(!eng.gro_receive(other).consumed());
    }

    #[test]
    fn test_packet_rcv_skips_loopback_and_peeked() {
        let f = listening_fabric(FabricParams {
            grace_period_ms: 1,
            ..Default::default()
        });
        let mut eng = f.engine(0).unwrap();

        let mut lo = frame();
        lo.pkt_type = PktType::Loopback;
        eng.packet_rcv(lo);

        let mut peeked = frame();
        peeked.peeked = true;
        eng.packet_rcv(peeked);

        eng.flush();
        assert_eq!(f.global.snapshot().recv, 0);
    }

    #[test]
    fn test_packet_rcv_direction_switches() {
        let f = listening_fabric(FabricParams {
            capture_incoming: false,
            capture_outgoing: true,
            grace_period_ms: 1,
            ..Default::default()
        });
        let mut eng = f.engine(0).unwrap();

        eng.packet_rcv(frame());
        eng.flush();
        assert_eq!(f.global.snapshot().recv, 0, "incoming capture is off");

        let mut out = frame();
        out.pkt_type = PktType::Outgoing;
        eng.packet_rcv(out);
        eng.flush();
        assert_eq!(f.global.snapshot().recv, 1, "outgoing capture is on");
    }
}
