//! Ethernet / IPv4 / IPv6 / TCP / UDP header decoding into packet metadata.

use ringwall_common::{flags, ptype, FlowTuple, Ip4Tuple, Ip6Tuple, PacketMeta};

use crate::mbuf::Mbuf;
use crate::module::{Capabilities, Hook, Module, ModuleId, Verdict};
use crate::snapshot::Snapshot;

const ETH_HLEN: usize = 14;
const VLAN_HLEN: usize = 4;
const IPV4_MIN_HLEN: usize = 20;
const IPV6_HLEN: usize = 40;

const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86dd;
const ETH_P_8021Q: u16 = 0x8100;
const ETH_P_8021AD: u16 = 0x88a8;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

/// A header ran past the end of the frame.
struct Truncated;

fn be16(data: &[u8], at: usize) -> Result<u16, Truncated> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(Truncated)
}

fn be32(data: &[u8], at: usize) -> Result<u32, Truncated> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(Truncated)
}

fn octets16(data: &[u8], at: usize) -> Result<[u8; 16], Truncated> {
    data.get(at..at + 16)
        .and_then(|b| b.try_into().ok())
        .ok_or(Truncated)
}

/// Fill `meta` from `frame`. On truncation `meta` keeps whatever was decoded
/// before the short header.
fn decode(frame: &[u8], meta: &mut PacketMeta) -> Result<(), Truncated> {
    if frame.len() < ETH_HLEN {
        return Err(Truncated);
    }
    meta.dmac.copy_from_slice(&frame[0..6]);
    meta.smac.copy_from_slice(&frame[6..12]);
    meta.ptype = ptype::L2_ETHER;

    let mut ethertype = be16(frame, 12)?;
    let mut offset = ETH_HLEN;
    while ethertype == ETH_P_8021Q || ethertype == ETH_P_8021AD {
        meta.ptype |= ptype::L2_VLAN;
        ethertype = be16(frame, offset + 2)?;
        offset += VLAN_HLEN;
    }

    match ethertype {
        ETH_P_IPV4 => decode_ipv4(&frame[offset..], meta),
        ETH_P_IPV6 => decode_ipv6(&frame[offset..], meta),
        _ => Ok(()),
    }
}

fn decode_ipv4(ip: &[u8], meta: &mut PacketMeta) -> Result<(), Truncated> {
    let ihl = (*ip.first().ok_or(Truncated)? & 0x0f) as usize * 4;
    if ihl < IPV4_MIN_HLEN || ip.len() < ihl {
        return Err(Truncated);
    }
    meta.ptype |= ptype::L3_IPV4;

    let mut tuple = Ip4Tuple {
        proto: ip[9],
        sip: be32(ip, 12)?,
        dip: be32(ip, 16)?,
        ..Ip4Tuple::default()
    };
    meta.tuple = FlowTuple::V4(tuple);

    // Only the first fragment carries the transport header.
    let fragment_offset = be16(ip, 6)? & 0x1fff;
    if fragment_offset != 0 {
        meta.ptype |= ptype::L4_OTHER;
        return Ok(());
    }

    let (sp, dp) = decode_l4(tuple.proto, &ip[ihl..], meta)?;
    tuple.sp = sp;
    tuple.dp = dp;
    meta.tuple = FlowTuple::V4(tuple);
    Ok(())
}

fn decode_ipv6(ip: &[u8], meta: &mut PacketMeta) -> Result<(), Truncated> {
    if ip.len() < IPV6_HLEN {
        return Err(Truncated);
    }
    meta.ptype |= ptype::L3_IPV6;

    let mut tuple = Ip6Tuple {
        proto: ip[6],
        sip: octets16(ip, 8)?,
        dip: octets16(ip, 24)?,
        ..Ip6Tuple::default()
    };
    meta.tuple = FlowTuple::V6(tuple);

    let (sp, dp) = decode_l4(tuple.proto, &ip[IPV6_HLEN..], meta)?;
    tuple.sp = sp;
    tuple.dp = dp;
    meta.tuple = FlowTuple::V6(tuple);
    Ok(())
}

fn decode_l4(proto: u8, l4: &[u8], meta: &mut PacketMeta) -> Result<(u16, u16), Truncated> {
    match proto {
        IPPROTO_TCP | IPPROTO_UDP => {
            meta.ptype |= if proto == IPPROTO_TCP {
                ptype::L4_TCP
            } else {
                ptype::L4_UDP
            };
            Ok((be16(l4, 0)?, be16(l4, 2)?))
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            meta.ptype |= ptype::L4_ICMP;
            Ok((0, 0))
        }
        _ => {
            meta.ptype |= ptype::L4_OTHER;
            Ok((0, 0))
        }
    }
}

/// Parses headers once per packet; later hooks see the result in the
/// metadata.
pub struct DecoderModule;

impl Module for DecoderModule {
    fn id(&self) -> ModuleId {
        ModuleId::DECODER
    }

    fn name(&self) -> &'static str {
        "decoder"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_process()
    }

    #[inline]
    fn process(&self, _snapshot: &Snapshot, mut pkt: Mbuf, _hook: Hook) -> Verdict {
        if pkt.meta().has_flag(flags::DECODED) {
            return Verdict::Accept(pkt);
        }

        let mut meta = *pkt.meta();
        let result = decode(pkt.data(), &mut meta);
        meta.flags |= flags::DECODED;
        if result.is_err() {
            meta.flags |= flags::MALFORMED;
        }
        *pkt.meta_mut() = meta;
        Verdict::Accept(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Fixture};

    fn run(fixture: &Fixture, frame: &[u8]) -> PacketMeta {
        let snapshot = fixture.snapshot();
        let pkt = fixture.pool.alloc_frame(frame).unwrap();
        match DecoderModule.process(&snapshot, pkt, Hook::Ingress) {
            Verdict::Accept(pkt) => *pkt.meta(),
            Verdict::Stolen => panic!("decoder must not steal"),
        }
    }

    #[test]
    fn test_decode_ipv4_udp() {
        let fixture = Fixture::vwire_pair();
        let meta = run(&fixture, &testutil::ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 53));

        assert!(meta.has_flag(flags::DECODED));
        assert!(!meta.has_flag(flags::MALFORMED));
        assert_eq!(meta.ptype, ptype::L2_ETHER | ptype::L3_IPV4 | ptype::L4_UDP);
        assert_eq!(meta.smac, testutil::SRC_MAC);
        assert_eq!(meta.dmac, testutil::DST_MAC);
        assert_eq!(
            meta.tuple,
            FlowTuple::V4(Ip4Tuple {
                proto: IPPROTO_UDP,
                sip: 0x0a00_0001,
                dip: 0x0a00_0002,
                sp: 1234,
                dp: 53,
            })
        );
    }

    #[test]
    fn test_decode_ipv6_tcp() {
        let fixture = Fixture::vwire_pair();
        let mut sip = [0u8; 16];
        sip[0] = 0xfd;
        sip[15] = 1;
        let meta = run(&fixture, &testutil::ipv6_tcp_frame(sip, [0xfe; 16], 443, 50000));

        assert_eq!(meta.ptype, ptype::L2_ETHER | ptype::L3_IPV6 | ptype::L4_TCP);
        let FlowTuple::V6(tuple) = meta.tuple else {
            panic!("expected v6 tuple");
        };
        assert_eq!(tuple.sip, sip);
        assert_eq!((tuple.sp, tuple.dp), (443, 50000));
    }

    #[test]
    fn test_vlan_tag_skipped() {
        let fixture = Fixture::vwire_pair();
        let inner = testutil::ipv4_udp_frame([1, 2, 3, 4], [5, 6, 7, 8], 1, 2);
        let mut frame = inner[..12].to_vec();
        frame.extend_from_slice(&[0x81, 0x00, 0x00, 0x0a]);
        frame.extend_from_slice(&inner[12..]);

        let meta = run(&fixture, &frame);
        assert_ne!(meta.ptype & ptype::L2_VLAN, 0);
        assert_eq!(meta.tuple.ports(), (1, 2));
    }

    #[test]
    fn test_non_ip_accepted_undecoded() {
        let fixture = Fixture::vwire_pair();
        let mut frame = testutil::ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2);
        frame[12] = 0x08;
        frame[13] = 0x06;

        let meta = run(&fixture, &frame);
        assert_eq!(meta.ptype, ptype::L2_ETHER);
        assert_eq!(meta.tuple, FlowTuple::None);
        assert!(!meta.has_flag(flags::MALFORMED));
    }

    #[test]
    fn test_truncated_frame_marked_malformed() {
        let fixture = Fixture::vwire_pair();
        let frame = testutil::ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2);

        let meta = run(&fixture, &frame[..ETH_HLEN + 10]);
        assert!(meta.has_flag(flags::MALFORMED));
        assert!(meta.has_flag(flags::DECODED));

        let meta = run(&fixture, &frame[..8]);
        assert!(meta.has_flag(flags::MALFORMED));
    }

    #[test]
    fn test_already_decoded_is_skipped() {
        let fixture = Fixture::vwire_pair();
        let snapshot = fixture.snapshot();
        let frame = testutil::ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2);
        let mut pkt = fixture.pool.alloc_frame(&frame).unwrap();
        pkt.meta_mut().flags = flags::DECODED;

        let Verdict::Accept(pkt) = DecoderModule.process(&snapshot, pkt, Hook::Egress) else {
            panic!("decoder must not steal");
        };
        assert_eq!(pkt.meta().ptype, ptype::UNKNOWN);
    }
}
