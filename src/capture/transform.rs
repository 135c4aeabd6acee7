//! Packet-level transforms done in process: packet/payload shuffling and
//! IPv4 to IPv6 header conversion.

use log::debug;
use pnet::packet::{
    ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket},
    ip::IpNextHeaderProtocols,
    ipv4::{Ipv4Flags, Ipv4Packet},
    ipv6::MutableIpv6Packet,
    tcp::{self, MutableTcpPacket, TcpPacket},
    udp::{self, MutableUdpPacket},
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::capture::codec::{read_capture, write_capture};
use crate::capture::parser::{dissect, refresh_checksum, udp_wire_checksum};
use crate::models::modifier::{PacketWindow, ShuffleOptions};
use crate::models::packet::{CaptureFile, LINKTYPE_ETHERNET};
use crate::utils::error::{AppError, AppResult};

const ETHERNET_HEADER: usize = 14;
const IPV6_HEADER: usize = 40;

/// Counters of a shuffle pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShuffleStats {
    pub payloads_shuffled: usize,
    pub payloads_skipped: usize,
    pub packets_reordered: bool,
}

/// Counters of an IPv4 to IPv6 pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    pub converted: usize,
    pub unchanged: usize,
}

/// Permute the packets between the protected head and tail.
///
/// Returns whether anything was shuffled; sequences of `head + tail + 1`
/// or fewer items are left alone.
pub fn shuffle_packets<T, R: Rng>(items: &mut [T], window: PacketWindow, rng: &mut R) -> bool {
    if items.len() <= window.head + window.tail + 1 {
        return false;
    }
    let end = items.len() - window.tail;
    items[window.head..end].shuffle(rng);
    true
}

/// Permute the bytes of `payload` past the first `keep`
pub fn shuffle_payload<R: Rng>(payload: &mut [u8], keep: usize, rng: &mut R) {
    if payload.len() > keep {
        payload[keep..].shuffle(rng);
    }
}

/// Apply the enabled shuffles to a decoded capture.
///
/// Packets that cannot be decomposed are left as they are. It is an error
/// for payload shuffling to succeed on no packet at all.
pub fn shuffle_capture<R: Rng>(
    capture: &mut CaptureFile,
    options: ShuffleOptions,
    rng: &mut R,
) -> AppResult<ShuffleStats> {
    let mut stats = ShuffleStats::default();

    if let Some(window) = options.packets {
        stats.packets_reordered = shuffle_packets(&mut capture.packets, window, rng);
    }

    if let Some(keep) = options.payload_keep {
        let linktypes: Vec<Option<i32>> = capture
            .packets
            .iter()
            .map(|p| capture.linktype_of(p))
            .collect();

        for (packet, linktype) in capture.packets.iter_mut().zip(linktypes) {
            let dissection = match linktype {
                Some(LINKTYPE_ETHERNET) => dissect(&packet.data),
                _ => None,
            };
            match dissection {
                Some(d) => {
                    shuffle_payload(&mut packet.data[d.payload.clone()], keep, rng);
                    refresh_checksum(&mut packet.data, &d);
                    stats.payloads_shuffled += 1;
                }
                None => stats.payloads_skipped += 1,
            }
        }

        if stats.payloads_skipped > 0 {
            debug!(
                "payload shuffle skipped {} undecodable packets",
                stats.payloads_skipped
            );
        }
        if stats.payloads_shuffled == 0 {
            return Err(AppError::TransformError(format!(
                "payload shuffle did not apply to any of {} packets",
                capture.packets.len()
            )));
        }
    }

    Ok(stats)
}

/// The fixed `0100::ffff:a.b.c.d` embedding of an IPv4 address
pub fn embed_ipv4(addr: Ipv4Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::from([
        0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, o[0], o[1], o[2], o[3],
    ])
}

/// Rebuild an Ethernet/IPv4/{TCP,UDP} frame as Ethernet/IPv6.
///
/// Returns `None` when the frame does not have exactly that shape, is a
/// fragment, or is truncated. TTL becomes the hop limit, TOS the traffic
/// class, and the transport checksum is recomputed; link trailer bytes are
/// dropped.
pub fn convert_ipv4_to_ipv6(frame: &[u8]) -> Option<Vec<u8>> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ip = Ipv4Packet::new(&frame[ETHERNET_HEADER..])?;
    let header = ip.get_header_length() as usize * 4;
    let total = ip.get_total_length() as usize;
    if ip.get_version() != 4
        || header < 20
        || total < header
        || ETHERNET_HEADER + total > frame.len()
    {
        return None;
    }
    if ip.get_flags() & Ipv4Flags::MoreFragments != 0 || ip.get_fragment_offset() != 0 {
        return None;
    }

    let protocol = ip.get_next_level_protocol();
    let segment = &frame[ETHERNET_HEADER + header..ETHERNET_HEADER + total];
    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(segment)?;
            let len = tcp.get_data_offset() as usize * 4;
            if len < 20 || len > segment.len() {
                return None;
            }
        }
        IpNextHeaderProtocols::Udp if segment.len() >= 8 => {}
        _ => return None,
    }

    let source = embed_ipv4(ip.get_source());
    let destination = embed_ipv4(ip.get_destination());
    let mut out = vec![0u8; ETHERNET_HEADER + IPV6_HEADER + segment.len()];
    out[..ETHERNET_HEADER].copy_from_slice(&frame[..ETHERNET_HEADER]);
    out[ETHERNET_HEADER + IPV6_HEADER..].copy_from_slice(segment);

    // innermost first: the transport checksum now covers the IPv6 pseudo-header
    let transport = &mut out[ETHERNET_HEADER + IPV6_HEADER..];
    if protocol == IpNextHeaderProtocols::Tcp {
        let mut tcp = MutableTcpPacket::new(transport)?;
        let sum = tcp::ipv6_checksum(&tcp.to_immutable(), &source, &destination);
        tcp.set_checksum(sum);
    } else {
        let mut udp = MutableUdpPacket::new(transport)?;
        let sum = udp::ipv6_checksum(&udp.to_immutable(), &source, &destination);
        udp.set_checksum(udp_wire_checksum(sum));
    }

    {
        let mut ipv6 = MutableIpv6Packet::new(&mut out[ETHERNET_HEADER..])?;
        ipv6.set_version(6);
        ipv6.set_traffic_class((ip.get_dscp() << 2) | ip.get_ecn());
        ipv6.set_flow_label(0);
        ipv6.set_payload_length(segment.len() as u16);
        ipv6.set_next_header(protocol);
        ipv6.set_hop_limit(ip.get_ttl());
        ipv6.set_source(source);
        ipv6.set_destination(destination);
    }

    let mut ethernet = MutableEthernetPacket::new(&mut out)?;
    ethernet.set_ethertype(EtherTypes::Ipv6);
    Some(out)
}

/// Convert every eligible Ethernet packet of a capture to IPv6
pub fn convert_capture(capture: &mut CaptureFile) -> ConversionStats {
    let linktypes: Vec<Option<i32>> = capture
        .packets
        .iter()
        .map(|p| capture.linktype_of(p))
        .collect();
    let mut stats = ConversionStats::default();

    for (packet, linktype) in capture.packets.iter_mut().zip(linktypes) {
        let converted = match linktype {
            Some(LINKTYPE_ETHERNET) => convert_ipv4_to_ipv6(&packet.data),
            _ => None,
        };
        match converted {
            Some(data) => {
                packet.replace_data(data);
                stats.converted += 1;
            }
            None => stats.unchanged += 1,
        }
    }
    stats
}

/// Shuffle the capture at `src` into `dst`
pub fn shuffle_file<R: Rng>(
    src: &Path,
    dst: &Path,
    options: ShuffleOptions,
    rng: &mut R,
) -> AppResult<ShuffleStats> {
    let mut capture = read_capture(src)?;
    let stats = shuffle_capture(&mut capture, options, rng)?;
    write_capture(dst, &capture)?;
    Ok(stats)
}

/// Convert the capture at `src` to IPv6 into `dst`
pub fn convert_file(src: &Path, dst: &Path) -> AppResult<ConversionStats> {
    let mut capture = read_capture(src)?;
    let stats = convert_capture(&mut capture);
    write_capture(dst, &capture)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::codec::{decode, encode};
    use crate::capture::parser::fixtures::{ipv4_frame, DST, SRC};
    use crate::capture::parser::{checksum_ok, Network};
    use crate::models::packet::{Container, Packet, PacketMeta};
    use pnet::packet::ipv6::Ipv6Packet;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Cursor;

    fn capture_of(frames: Vec<Vec<u8>>) -> CaptureFile {
        CaptureFile {
            container: Container::Classic {
                nanosecond: false,
                version_major: 2,
                version_minor: 4,
                thiszone: 0,
                sigfigs: 0,
                snaplen: 65535,
                linktype: LINKTYPE_ETHERNET,
            },
            packets: frames
                .into_iter()
                .enumerate()
                .map(|(i, data)| Packet {
                    meta: PacketMeta::Legacy {
                        ts_sec: 1_600_000_000 + i as u32,
                        ts_frac: i as u32,
                    },
                    origlen: data.len() as u32,
                    data,
                })
                .collect(),
        }
    }

    #[test]
    fn short_sequences_are_not_reordered() {
        let window = PacketWindow { head: 3, tail: 4 };
        let mut rng = StdRng::seed_from_u64(1);
        for len in 0..=8 {
            let mut items: Vec<usize> = (0..len).collect();
            assert!(!shuffle_packets(&mut items, window, &mut rng));
            assert_eq!(items, (0..len).collect::<Vec<_>>());
        }
    }

    #[test]
    fn head_and_tail_stay_in_place() {
        let window = PacketWindow { head: 3, tail: 4 };
        let original: Vec<usize> = (0..40).collect();
        let mut items = original.clone();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(shuffle_packets(&mut items, window, &mut rng));
        assert_eq!(&items[..3], &original[..3]);
        assert_eq!(&items[36..], &original[36..]);
        assert_ne!(items, original);

        let mut middle = items[3..36].to_vec();
        middle.sort_unstable();
        assert_eq!(middle, original[3..36].to_vec());
    }

    #[test]
    fn same_seed_same_permutation() {
        let window = PacketWindow { head: 0, tail: 0 };
        let run = |seed| {
            let mut items: Vec<u32> = (0..20).collect();
            shuffle_packets(&mut items, window, &mut StdRng::seed_from_u64(seed));
            items
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn payload_prefix_is_protected() {
        let mut rng = StdRng::seed_from_u64(3);
        let original: Vec<u8> = (0..64).collect();

        let mut payload = original.clone();
        shuffle_payload(&mut payload, 64, &mut rng);
        assert_eq!(payload, original);

        let mut payload = original.clone();
        shuffle_payload(&mut payload, 100, &mut rng);
        assert_eq!(payload, original);

        let mut payload = original.clone();
        shuffle_payload(&mut payload, 5, &mut rng);
        assert_eq!(&payload[..5], &original[..5]);
        assert_ne!(payload, original);
        let mut sorted = payload.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, original);
    }

    #[test]
    fn shuffled_capture_keeps_metadata_and_valid_checksums() {
        let payload: Vec<u8> = (0..200u8).collect();
        let mut capture = capture_of(vec![
            ipv4_frame(IpNextHeaderProtocols::Tcp, &payload),
            vec![0xff; 20],
            ipv4_frame(IpNextHeaderProtocols::Udp, &payload),
        ]);
        let before = capture.clone();
        let options = ShuffleOptions {
            payload_keep: Some(4),
            packets: None,
        };

        let stats = shuffle_capture(&mut capture, options, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(stats.payloads_shuffled, 2);
        assert_eq!(stats.payloads_skipped, 1);
        assert_eq!(capture.packets[1], before.packets[1]);

        for (after, before) in capture.packets.iter().zip(&before.packets) {
            assert_eq!(after.meta, before.meta);
            assert_eq!(after.data.len(), before.data.len());
        }
        for packet in [&capture.packets[0], &capture.packets[2]] {
            let d = dissect(&packet.data).unwrap();
            assert_eq!(&packet.data[d.payload.start..d.payload.start + 4], &payload[..4]);
            assert!(checksum_ok(&packet.data, &d));
        }
    }

    #[test]
    fn payload_shuffle_without_any_success_fails() {
        let mut capture = capture_of(vec![vec![0xff; 20], vec![0xee; 30]]);
        let options = ShuffleOptions {
            payload_keep: Some(0),
            packets: None,
        };
        let err = shuffle_capture(&mut capture, options, &mut StdRng::seed_from_u64(1));
        assert!(matches!(err, Err(AppError::TransformError(_))));
    }

    #[test]
    fn ipv4_tcp_becomes_ipv6() {
        let frame = ipv4_frame(IpNextHeaderProtocols::Tcp, b"payload bytes");
        let converted = convert_ipv4_to_ipv6(&frame).unwrap();
        assert_eq!(converted.len(), frame.len() + 20);
        assert_eq!(&converted[12..14], &[0x86, 0xdd]);

        let ipv6 = Ipv6Packet::new(&converted[14..]).unwrap();
        assert_eq!(ipv6.get_source(), embed_ipv4(SRC));
        assert_eq!(ipv6.get_destination(), embed_ipv4(DST));
        assert_eq!(ipv6.get_source().octets()[0], 0x01);
        assert_eq!(ipv6.get_hop_limit(), 61);
        assert_eq!(ipv6.get_traffic_class(), (10 << 2) | 1);
        assert_eq!(ipv6.get_next_header(), IpNextHeaderProtocols::Tcp);

        let d = dissect(&converted).unwrap();
        assert_eq!(d.network, Network::Ipv6);
        assert_eq!(&converted[d.payload.clone()], b"payload bytes");
        assert!(checksum_ok(&converted, &d));
    }

    #[test]
    fn udp_trailer_is_dropped() {
        let mut frame = ipv4_frame(IpNextHeaderProtocols::Udp, b"dns");
        let datagram = frame.len() - 14;
        frame.extend_from_slice(&[0u8; 8]);
        let converted = convert_ipv4_to_ipv6(&frame).unwrap();
        assert_eq!(converted.len(), 14 + 40 + datagram - 20);
        let d = dissect(&converted).unwrap();
        assert!(checksum_ok(&converted, &d));
    }

    #[test]
    fn zero_udp_checksum_is_sent_as_all_ones() {
        let udp_checksum = |frame: &[u8]| u16::from_be_bytes([frame[54 + 6], frame[54 + 7]]);

        // with a zero payload word the result is some checksum c; putting c
        // into that word makes the one's complement sum all ones
        let first = convert_ipv4_to_ipv6(&ipv4_frame(IpNextHeaderProtocols::Udp, &[0, 0, 1, 2]))
            .unwrap();
        let word = udp_checksum(&first).to_be_bytes();
        let frame = ipv4_frame(IpNextHeaderProtocols::Udp, &[word[0], word[1], 1, 2]);
        let converted = convert_ipv4_to_ipv6(&frame).unwrap();

        let datagram = pnet::packet::udp::UdpPacket::new(&converted[54..]).unwrap();
        let computed = pnet::packet::udp::ipv6_checksum(
            &datagram,
            &embed_ipv4(SRC),
            &embed_ipv4(DST),
        );
        assert_eq!(computed, 0);
        assert_eq!(udp_checksum(&converted), 0xffff);
        assert!(checksum_ok(&converted, &dissect(&converted).unwrap()));
    }

    #[test]
    fn other_shapes_pass_through() {
        assert!(convert_ipv4_to_ipv6(&ipv4_frame(IpNextHeaderProtocols::Icmp, b"ping")).is_none());

        let mut fragment = ipv4_frame(IpNextHeaderProtocols::Udp, b"frag");
        fragment[14 + 6] = 0x20;
        assert!(convert_ipv4_to_ipv6(&fragment).is_none());

        let plain = ipv4_frame(IpNextHeaderProtocols::Tcp, b"tagged");
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x05, 0x08, 0x00]);
        tagged.extend_from_slice(&plain[14..]);
        assert!(convert_ipv4_to_ipv6(&tagged).is_none());

        let mut capture = capture_of(vec![
            plain.clone(),
            tagged.clone(),
            ipv4_frame(IpNextHeaderProtocols::Udp, b"x"),
        ]);
        let stats = convert_capture(&mut capture);
        assert_eq!(stats, ConversionStats { converted: 2, unchanged: 1 });
        assert_eq!(capture.packets[1].data, tagged);
        assert_eq!(capture.packets[0].origlen as usize, plain.len() + 20);

        let bytes = encode(&capture);
        let decoded = decode(Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, capture);
    }
}
