#![no_std]

//! Types shared between the dataplane daemon and out-of-tree inspection modules.
//!
//! Everything here is plain data: no allocation, no locking. The daemon attaches
//! one [`PacketMeta`] to every packet buffer at receive time; modules read and
//! mutate it while the packet moves through the hook pipeline, and the transmit
//! path consumes `port_out` / `queue_id` to pick the egress ring.

/// Highest lcore id (exclusive) the dataplane can schedule on.
pub const MAX_LCORE: usize = 128;
/// Highest port id (exclusive).
pub const MAX_PORT_NUM: usize = 32;
/// Highest queue index (exclusive) per port.
pub const MAX_QUEUE_NUM: usize = 16;
/// Upper bound for one receive or transmit burst.
pub const MAX_PKT_BURST: usize = 32;
/// Size of the id-indexed module table.
pub const MAX_MODULE_NUM: usize = 128;

/// Packet-type tag bits, set by the decoder.
pub mod ptype {
    pub const UNKNOWN: u32 = 0;
    pub const L2_ETHER: u32 = 1 << 0;
    pub const L2_VLAN: u32 = 1 << 1;
    pub const L3_IPV4: u32 = 1 << 4;
    pub const L3_IPV6: u32 = 1 << 5;
    pub const L4_TCP: u32 = 1 << 8;
    pub const L4_UDP: u32 = 1 << 9;
    pub const L4_ICMP: u32 = 1 << 10;
    pub const L4_OTHER: u32 = 1 << 11;
}

/// Per-packet flag bits.
pub mod flags {
    /// The decoder has filled `smac`/`dmac`/`tuple`.
    pub const DECODED: u32 = 1 << 0;
    /// A header claimed more bytes than the frame carries.
    pub const MALFORMED: u32 = 1 << 1;
    /// `port_out` was rewritten by a module.
    pub const REDIRECTED: u32 = 1 << 2;
}

/// IPv4 5-tuple, addresses and ports in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct Ip4Tuple {
    pub proto: u8,
    pub sip: u32,
    pub dip: u32,
    pub sp: u16,
    pub dp: u16,
}

/// IPv6 5-tuple, addresses as raw network-order octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct Ip6Tuple {
    pub proto: u8,
    pub sip: [u8; 16],
    pub dip: [u8; 16],
    pub sp: u16,
    pub dp: u16,
}

/// Parsed flow identity; the variant doubles as the address-family flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub enum FlowTuple {
    #[default]
    None,
    V4(Ip4Tuple),
    V6(Ip6Tuple),
}

impl FlowTuple {
    pub fn is_v4(&self) -> bool {
        matches!(self, FlowTuple::V4(_))
    }

    /// IP protocol number, if the packet carried an IP header.
    pub fn proto(&self) -> Option<u8> {
        match self {
            FlowTuple::None => None,
            FlowTuple::V4(t) => Some(t.proto),
            FlowTuple::V6(t) => Some(t.proto),
        }
    }

    /// `(source port, destination port)`, zero for protocols without ports.
    pub fn ports(&self) -> (u16, u16) {
        match self {
            FlowTuple::None => (0, 0),
            FlowTuple::V4(t) => (t.sp, t.dp),
            FlowTuple::V6(t) => (t.sp, t.dp),
        }
    }
}

/// Metadata record attached to every packet buffer.
///
/// Produced by the receive role, mutated by modules, consumed by the inspection
/// worker when it picks the transmit ring. It never outlives its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct PacketMeta {
    /// Port the packet arrived on.
    pub port_in: u16,
    /// Port the packet leaves on; defaults to `port_in`.
    pub port_out: u16,
    /// Queue the packet came from; also the queue it is sent to.
    pub queue_id: u16,
    /// Protocol-type tag, see [`ptype`].
    pub ptype: u32,
    /// Flag bits, see [`flags`].
    pub flags: u32,
    /// Source link address.
    pub smac: [u8; 6],
    /// Destination link address.
    pub dmac: [u8; 6],
    pub tuple: FlowTuple,
}

impl PacketMeta {
    /// Metadata stamped by the receive role.
    pub fn received(port: u16, queue: u16) -> Self {
        Self {
            port_in: port,
            port_out: port,
            queue_id: queue,
            ..Self::default()
        }
    }

    pub fn is_v4(&self) -> bool {
        self.tuple.is_v4()
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}
