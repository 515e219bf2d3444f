//! Frame buffs: the unit the receive engine manipulates.
//!
//! A frame owns its bytes and a head offset into them; `payload()` is the
//! current view. Drivers hand frames up positioned past the MAC header
//! (`head == mac_len`); the engine pushes the header back on for ingress
//! frames so captured payloads start at the Ethernet header.

use crate::time;

pub const ETH_HLEN: usize = 14;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;

/// Headroom reserved in recycled buffers ahead of the payload.
pub const HEADROOM: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    /// Ingress frame addressed to (or seen by) this host.
    Host,
    /// Locally originated frame seen on its way out.
    Outgoing,
    /// Loopback traffic; never captured.
    Loopback,
}

#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    head: usize,
    pub ifindex: i32,
    pub rx_queue: u16,
    /// Outer EtherType, host byte order.
    pub proto: u16,
    /// TCI of a stripped 802.1Q tag; 0 when the frame carried none.
    pub vlan_tci: u16,
    /// Receive timestamp; 0 until stamped.
    pub tstamp_ns: u64,
    pub pkt_type: PktType,
    pub mac_len: usize,
    /// Share count; anything above 1 means another holder exists.
    pub users: u32,
    /// Set on both sides of a forwarding clone.
    pub cloned: bool,
    /// Set on frames this fabric injected into the kernel path, so the
    /// protocol hook skips them when they loop back.
    pub peeked: bool,
}

impl Frame {
    /// An empty frame around a buffer sized for `size` payload bytes.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            data: Vec::with_capacity(size + HEADROOM),
            head: 0,
            ifindex: 0,
            rx_queue: 0,
            proto: 0,
            vlan_tci: 0,
            tstamp_ns: 0,
            pkt_type: PktType::Host,
            mac_len: ETH_HLEN,
            users: 1,
            cloned: false,
            peeked: false,
        }
    }

    /// Build a frame from raw Ethernet bytes as a driver hands them up.
    pub fn from_ethernet(ifindex: i32, rx_queue: u16, bytes: Vec<u8>) -> Self {
        let mut f = Self::with_capacity(0);
        f.data = bytes;
        f.ifindex = ifindex;
        f.rx_queue = rx_queue;
        f.parse_ethernet();
        f
    }

    /// Reload a (possibly recycled) frame with fresh Ethernet bytes.
    pub fn set_ethernet(&mut self, ifindex: i32, rx_queue: u16, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.ifindex = ifindex;
        self.rx_queue = rx_queue;
        self.parse_ethernet();
    }

    fn parse_ethernet(&mut self) {
        self.proto = if self.data.len() >= ETH_HLEN {
            u16::from_be_bytes([self.data[12], self.data[13]])
        } else {
            0
        };
        self.mac_len = ETH_HLEN;
        self.head = ETH_HLEN.min(self.data.len());
        self.vlan_tci = 0;
        self.tstamp_ns = 0;
        self.pkt_type = PktType::Host;
        self.users = 1;
        self.cloned = false;
        self.peeked = false;
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.head..]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Move the head back over the MAC header (ingress frames: make
    /// `payload()` start at the Ethernet header).
    #[inline]
    pub fn push_mac(&mut self) {
        self.head = self.head.saturating_sub(self.mac_len);
    }

    /// Move the head past the MAC header.
    #[inline]
    pub fn pull_mac(&mut self) {
        self.head = (self.head + self.mac_len).min(self.data.len());
    }

    /// Reset the view to the network layer (`head == mac_len`).
    #[inline]
    pub fn reset_offsets(&mut self) {
        self.head = self.mac_len.min(self.data.len());
    }

    /// Stamp the frame if untimestamped.
    #[inline]
    pub fn timestamp(&mut self) {
        if self.tstamp_ns == 0 {
            self.tstamp_ns = time::now_ns();
        }
    }

    /// Strip an 802.1Q tag in place. The TCI is preserved in `vlan_tci` and
    /// `proto` becomes the inner EtherType. Returns false when the frame
    /// carries no tag. Must be called before `push_mac` (head at L3).
    pub fn vlan_untag(&mut self) -> bool {
        if self.proto != ETH_P_8021Q || self.data.len() < ETH_HLEN + 4 {
            return false;
        }
        debug_assert_eq!(self.head, self.mac_len);
        let tci = u16::from_be_bytes([self.data[ETH_HLEN], self.data[ETH_HLEN + 1]]);
        let inner = u16::from_be_bytes([self.data[ETH_HLEN + 2], self.data[ETH_HLEN + 3]]);
        // Drop the EtherType + TCI dword; the inner EtherType slides into place.
        self.data.drain(ETH_HLEN - 2..ETH_HLEN + 2);
        self.vlan_tci = tci;
        self.proto = inner;
        true
    }

    /// Deep copy for kernel/device re-injection. Both sides are marked
    /// cloned, which the pool later refuses to recycle.
    pub fn clone_for_fwd(&mut self) -> Frame {
        self.cloned = true;
        Frame {
            data: self.data.clone(),
            head: self.head,
            ifindex: self.ifindex,
            rx_queue: self.rx_queue,
            proto: self.proto,
            vlan_tci: self.vlan_tci,
            tstamp_ns: self.tstamp_ns,
            pkt_type: self.pkt_type,
            mac_len: self.mac_len,
            users: 1,
            cloned: true,
            peeked: false,
        }
    }

    /// Clear the frame for reuse, keeping the allocation.
    pub(crate) fn recycle(&mut self) {
        self.data.clear();
        self.head = 0;
        self.ifindex = 0;
        self.rx_queue = 0;
        self.proto = 0;
        self.vlan_tci = 0;
        self.tstamp_ns = 0;
        self.pkt_type = PktType::Host;
        self.mac_len = ETH_HLEN;
        self.users = 1;
        self.cloned = false;
        self.peeked = false;
    }
}
