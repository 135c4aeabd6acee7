use log::{log_enabled, trace, Level};
use pnet::packet::{
    arp::ArpPacket,
    ethernet::{EtherTypes, EthernetPacket},
    icmp::{self, IcmpPacket, MutableIcmpPacket},
    icmpv6::{self, Icmpv6Packet, MutableIcmpv6Packet},
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::{self, MutableTcpPacket, TcpPacket},
    udp::{self, MutableUdpPacket, UdpPacket},
    vlan::VlanPacket,
};
use std::net::IpAddr;
use std::ops::Range;

const ETHERNET_HEADER: usize = 14;
const VLAN_TAG: usize = 4;
const ARP_IPV4_LEN: usize = 28;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;
const ICMPV4_HEADER: usize = 8;
const ICMPV6_HEADER: usize = 4;

/// Network layer of a decomposed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Arp,
    Ipv4,
    Ipv6,
}

/// Transport layer of a decomposed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// ARP, or a non-first IPv4 fragment
    None,
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

/// Layer offsets of an Ethernet frame, all relative to the frame start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dissection {
    pub vlan: bool,
    pub network: Network,
    pub network_offset: usize,
    pub transport: Transport,
    pub transport_offset: usize,
    /// End of the IP datagram; anything after it is link trailer
    pub datagram_end: usize,
    /// Innermost payload
    pub payload: Range<usize>,
    pub source: Option<IpAddr>,
    pub destination: Option<IpAddr>,
}

/// Decompose an Ethernet frame into its layers.
///
/// Returns `None` for anything that is not a single-tagged or untagged
/// Ethernet frame carrying ARP or IPv4/IPv6 with TCP, UDP or ICMP, or whose
/// headers are truncated.
pub fn dissect(frame: &[u8]) -> Option<Dissection> {
    let ethernet = EthernetPacket::new(frame)?;
    let mut ethertype = ethernet.get_ethertype();
    let mut offset = ETHERNET_HEADER;
    let mut vlan = false;

    if ethertype == EtherTypes::Vlan {
        let tag = VlanPacket::new(&frame[offset..])?;
        ethertype = tag.get_ethertype();
        offset += VLAN_TAG;
        vlan = true;
    }

    if log_enabled!(Level::Trace) {
        trace!("EtherType: {:?}, vlan: {}, {} bytes", ethertype, vlan, frame.len());
    }

    match ethertype {
        EtherTypes::Arp => {
            ArpPacket::new(&frame[offset..])?;
            let end = (offset + ARP_IPV4_LEN).min(frame.len());
            Some(Dissection {
                vlan,
                network: Network::Arp,
                network_offset: offset,
                transport: Transport::None,
                transport_offset: end,
                datagram_end: end,
                payload: end..end,
                source: None,
                destination: None,
            })
        }
        EtherTypes::Ipv4 => dissect_ipv4(frame, offset, vlan),
        EtherTypes::Ipv6 => dissect_ipv6(frame, offset, vlan),
        _ => None,
    }
}

fn dissect_ipv4(frame: &[u8], offset: usize, vlan: bool) -> Option<Dissection> {
    let ip = Ipv4Packet::new(&frame[offset..])?;
    let header = ip.get_header_length() as usize * 4;
    let total = ip.get_total_length() as usize;
    if ip.get_version() != 4 || header < 20 || total < header || offset + total > frame.len() {
        return None;
    }
    let transport_offset = offset + header;
    let datagram_end = offset + total;

    let mut dissection = Dissection {
        vlan,
        network: Network::Ipv4,
        network_offset: offset,
        transport: Transport::None,
        transport_offset,
        datagram_end,
        payload: transport_offset..datagram_end,
        source: Some(IpAddr::V4(ip.get_source())),
        destination: Some(IpAddr::V4(ip.get_destination())),
    };

    // later fragments carry no transport header
    if ip.get_fragment_offset() != 0 {
        return Some(dissection);
    }

    let segment = &frame[transport_offset..datagram_end];
    let (transport, header) = match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => (Transport::Tcp, tcp_header_len(segment)?),
        IpNextHeaderProtocols::Udp => (Transport::Udp, fixed_header_len(segment, UDP_HEADER)?),
        IpNextHeaderProtocols::Icmp => {
            (Transport::Icmp, fixed_header_len(segment, ICMPV4_HEADER)?)
        }
        _ => return None,
    };
    dissection.transport = transport;
    dissection.payload = transport_offset + header..datagram_end;
    Some(dissection)
}

fn dissect_ipv6(frame: &[u8], offset: usize, vlan: bool) -> Option<Dissection> {
    let ip = Ipv6Packet::new(&frame[offset..])?;
    let transport_offset = offset + IPV6_HEADER;
    let datagram_end = transport_offset + ip.get_payload_length() as usize;
    if ip.get_version() != 6 || datagram_end > frame.len() {
        return None;
    }

    let segment = &frame[transport_offset..datagram_end];
    let (transport, header) = match ip.get_next_header() {
        IpNextHeaderProtocols::Tcp => (Transport::Tcp, tcp_header_len(segment)?),
        IpNextHeaderProtocols::Udp => (Transport::Udp, fixed_header_len(segment, UDP_HEADER)?),
        IpNextHeaderProtocols::Icmpv6 => {
            (Transport::Icmpv6, fixed_header_len(segment, ICMPV6_HEADER)?)
        }
        _ => return None,
    };

    Some(Dissection {
        vlan,
        network: Network::Ipv6,
        network_offset: offset,
        transport,
        transport_offset,
        datagram_end,
        payload: transport_offset + header..datagram_end,
        source: Some(IpAddr::V6(ip.get_source())),
        destination: Some(IpAddr::V6(ip.get_destination())),
    })
}

fn tcp_header_len(segment: &[u8]) -> Option<usize> {
    let tcp = TcpPacket::new(segment)?;
    let len = tcp.get_data_offset() as usize * 4;
    if len < 20 || len > segment.len() {
        return None;
    }
    Some(len)
}

fn fixed_header_len(segment: &[u8], len: usize) -> Option<usize> {
    if segment.len() < len {
        None
    } else {
        Some(len)
    }
}

/// A computed UDP checksum of zero goes on the wire as `0xffff`, since zero
/// means "no checksum" over IPv4 and is forbidden over IPv6.
pub fn udp_wire_checksum(sum: u16) -> u16 {
    if sum == 0 {
        0xffff
    } else {
        sum
    }
}

/// Recompute the transport checksum after the payload changed.
///
/// A UDP-over-IPv4 checksum of zero means "no checksum" and stays zero.
/// Non-first fragments and ARP have nothing to fix.
pub fn refresh_checksum(frame: &mut [u8], dissection: &Dissection) {
    let segment = &mut frame[dissection.transport_offset..dissection.datagram_end];
    match (dissection.transport, dissection.source, dissection.destination) {
        (Transport::Tcp, Some(IpAddr::V4(src)), Some(IpAddr::V4(dst))) => {
            if let Some(mut tcp) = MutableTcpPacket::new(segment) {
                let sum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
                tcp.set_checksum(sum);
            }
        }
        (Transport::Tcp, Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => {
            if let Some(mut tcp) = MutableTcpPacket::new(segment) {
                let sum = tcp::ipv6_checksum(&tcp.to_immutable(), &src, &dst);
                tcp.set_checksum(sum);
            }
        }
        (Transport::Udp, Some(IpAddr::V4(src)), Some(IpAddr::V4(dst))) => {
            if let Some(mut udp) = MutableUdpPacket::new(segment) {
                if udp.get_checksum() != 0 {
                    let sum = udp::ipv4_checksum(&udp.to_immutable(), &src, &dst);
                    udp.set_checksum(udp_wire_checksum(sum));
                }
            }
        }
        (Transport::Udp, Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => {
            if let Some(mut udp) = MutableUdpPacket::new(segment) {
                let sum = udp::ipv6_checksum(&udp.to_immutable(), &src, &dst);
                udp.set_checksum(udp_wire_checksum(sum));
            }
        }
        (Transport::Icmp, _, _) => {
            if let Some(mut packet) = MutableIcmpPacket::new(segment) {
                let sum = icmp::checksum(&packet.to_immutable());
                packet.set_checksum(sum);
            }
        }
        (Transport::Icmpv6, Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => {
            if let Some(mut packet) = MutableIcmpv6Packet::new(segment) {
                let sum = icmpv6::checksum(&packet.to_immutable(), &src, &dst);
                packet.set_checksum(sum);
            }
        }
        _ => {}
    }
}

/// Whether the transport checksum of a dissected frame is valid
pub fn checksum_ok(frame: &[u8], dissection: &Dissection) -> bool {
    let segment = &frame[dissection.transport_offset..dissection.datagram_end];
    match (dissection.transport, dissection.source, dissection.destination) {
        (Transport::Tcp, Some(IpAddr::V4(src)), Some(IpAddr::V4(dst))) => TcpPacket::new(segment)
            .map(|p| tcp::ipv4_checksum(&p, &src, &dst) == p.get_checksum())
            .unwrap_or(false),
        (Transport::Tcp, Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => TcpPacket::new(segment)
            .map(|p| tcp::ipv6_checksum(&p, &src, &dst) == p.get_checksum())
            .unwrap_or(false),
        (Transport::Udp, Some(IpAddr::V4(src)), Some(IpAddr::V4(dst))) => UdpPacket::new(segment)
            .map(|p| {
                p.get_checksum() == 0
                    || udp_wire_checksum(udp::ipv4_checksum(&p, &src, &dst)) == p.get_checksum()
            })
            .unwrap_or(false),
        (Transport::Udp, Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => UdpPacket::new(segment)
            .map(|p| udp_wire_checksum(udp::ipv6_checksum(&p, &src, &dst)) == p.get_checksum())
            .unwrap_or(false),
        (Transport::Icmp, _, _) => IcmpPacket::new(segment)
            .map(|p| icmp::checksum(&p) == p.get_checksum())
            .unwrap_or(false),
        (Transport::Icmpv6, Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => {
            Icmpv6Packet::new(segment)
                .map(|p| icmpv6::checksum(&p, &src, &dst) == p.get_checksum())
                .unwrap_or(false)
        }
        _ => true,
    }
}
