//! Byte-exact reading and writing of classic pcap and pcapng files.
//!
//! Reading keeps every packet's framing metadata so a rewrite only changes
//! what a transform touched. Output is always little-endian and uses the
//! same container family as the input.

use log::debug;
use pcap_parser::pcapng::PcapNGOption;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::models::packet::{CaptureFile, Container, Interface, Packet, PacketMeta, RawOption};
use crate::utils::error::{AppError, AppResult};

/// Reader buffer; must hold the largest single block
const READ_BUFFER: usize = 1 << 20;

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];
const PCAP_MAGIC_MICRO: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_NANO: u32 = 0xa1b2_3c4d;

const BLOCK_SHB: u32 = 0x0a0d_0d0a;
const BLOCK_IDB: u32 = 0x0000_0001;
const BLOCK_SPB: u32 = 0x0000_0003;
const BLOCK_EPB: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1a2b_3c4d;

fn parse_error<E: std::fmt::Debug>(context: &str, e: E) -> AppError {
    AppError::PacketParsingError(format!("{}: {:?}", context, e))
}

/// Read and fully decode the capture at `path`
pub fn read_capture(path: &Path) -> AppResult<CaptureFile> {
    let file = File::open(path)?;
    decode(file).map_err(|e| match e {
        AppError::PacketParsingError(msg) => {
            AppError::PacketParsingError(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Encode `capture` and write it to `path`
pub fn write_capture(path: &Path, capture: &CaptureFile) -> AppResult<()> {
    std::fs::write(path, encode(capture))?;
    Ok(())
}

/// Decode a capture from any byte stream, detecting the container family
pub fn decode<R: Read>(reader: R) -> AppResult<CaptureFile> {
    let mut reader = BufReader::new(reader);
    let head = reader.fill_buf()?;
    if head.len() < 4 {
        return Err(AppError::PacketParsingError(
            "file too short for a capture header".to_string(),
        ));
    }
    if head[..4] == PCAPNG_MAGIC {
        decode_ng(reader)
    } else {
        decode_legacy(reader)
    }
}

fn decode_legacy<R: Read>(reader: R) -> AppResult<CaptureFile> {
    let mut reader =
        LegacyPcapReader::new(READ_BUFFER, reader).map_err(|e| parse_error("pcap header", e))?;
    let mut container = None;
    let mut packets = Vec::new();
    let mut stalled = false;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                stalled = false;
                match block {
                    PcapBlockOwned::LegacyHeader(hdr) => {
                        container = Some(Container::Classic {
                            nanosecond: hdr.magic_number == PCAP_MAGIC_NANO
                                || hdr.magic_number == PCAP_MAGIC_NANO.swap_bytes(),
                            version_major: hdr.version_major,
                            version_minor: hdr.version_minor,
                            thiszone: hdr.thiszone,
                            sigfigs: hdr.sigfigs,
                            snaplen: hdr.snaplen,
                            linktype: hdr.network.0,
                        });
                    }
                    PcapBlockOwned::Legacy(b) => {
                        let len = (b.caplen as usize).min(b.data.len());
                        packets.push(Packet {
                            meta: PacketMeta::Legacy {
                                ts_sec: b.ts_sec,
                                ts_frac: b.ts_usec,
                            },
                            origlen: b.origlen,
                            data: b.data[..len].to_vec(),
                        });
                    }
                    PcapBlockOwned::NG(_) => {}
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                if stalled {
                    return Err(AppError::PacketParsingError(
                        "truncated pcap record".to_string(),
                    ));
                }
                stalled = true;
                reader.refill().map_err(|e| parse_error("refill", e))?;
            }
            Err(e) => return Err(parse_error("pcap record", e)),
        }
    }

    let container = container
        .ok_or_else(|| AppError::PacketParsingError("missing pcap header".to_string()))?;
    Ok(CaptureFile { container, packets })
}

fn raw_options(options: &[PcapNGOption]) -> Vec<RawOption> {
    options
        .iter()
        .filter(|opt| opt.code.0 != 0)
        .map(|opt| {
            let len = (opt.len as usize).min(opt.value.len());
            RawOption {
                code: opt.code.0,
                value: opt.value[..len].to_vec(),
            }
        })
        .collect()
}

fn decode_ng<R: Read>(reader: R) -> AppResult<CaptureFile> {
    let mut reader =
        PcapNGReader::new(READ_BUFFER, reader).map_err(|e| parse_error("pcapng header", e))?;
    let mut section: Option<(u16, u16, Vec<RawOption>)> = None;
    let mut interfaces: Vec<Interface> = Vec::new();
    // interface ids restart at every section header
    let mut if_base = 0u32;
    let mut packets = Vec::new();
    let mut skipped = 0usize;
    let mut stalled = false;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                stalled = false;
                if let PcapBlockOwned::NG(block) = block {
                    match block {
                        Block::SectionHeader(shb) => {
                            if_base = interfaces.len() as u32;
                            if section.is_none() {
                                section = Some((
                                    shb.major_version,
                                    shb.minor_version,
                                    raw_options(&shb.options),
                                ));
                            }
                        }
                        Block::InterfaceDescription(idb) => {
                            interfaces.push(Interface {
                                linktype: idb.linktype.0,
                                snaplen: idb.snaplen,
                                options: raw_options(&idb.options),
                            });
                        }
                        Block::EnhancedPacket(epb) => {
                            let len = (epb.caplen as usize).min(epb.data.len());
                            packets.push(Packet {
                                meta: PacketMeta::Enhanced {
                                    if_id: epb.if_id + if_base,
                                    ts_high: epb.ts_high,
                                    ts_low: epb.ts_low,
                                    options: raw_options(&epb.options),
                                },
                                origlen: epb.origlen,
                                data: epb.data[..len].to_vec(),
                            });
                        }
                        Block::SimplePacket(spb) => {
                            let snaplen = interfaces
                                .get(if_base as usize)
                                .map(|i| i.snaplen as usize)
                                .filter(|s| *s > 0)
                                .unwrap_or(usize::MAX);
                            let len = (spb.origlen as usize).min(spb.data.len()).min(snaplen);
                            packets.push(Packet {
                                meta: PacketMeta::Simple,
                                origlen: spb.origlen,
                                data: spb.data[..len].to_vec(),
                            });
                        }
                        _ => skipped += 1,
                    }
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                if stalled {
                    return Err(AppError::PacketParsingError(
                        "truncated pcapng block".to_string(),
                    ));
                }
                stalled = true;
                reader.refill().map_err(|e| parse_error("refill", e))?;
            }
            Err(e) => return Err(parse_error("pcapng block", e)),
        }
    }

    if skipped > 0 {
        debug!("dropped {} non-packet pcapng blocks", skipped);
    }
    let (version_major, version_minor, options) = section
        .ok_or_else(|| AppError::PacketParsingError("missing section header".to_string()))?;
    Ok(CaptureFile {
        container: Container::Ng {
            version_major,
            version_minor,
            options,
            interfaces,
        },
        packets,
    })
}

/// Serialize `capture` in its own container family
pub fn encode(capture: &CaptureFile) -> Vec<u8> {
    match &capture.container {
        Container::Classic {
            nanosecond,
            version_major,
            version_minor,
            thiszone,
            sigfigs,
            snaplen,
            linktype,
        } => {
            let payload: usize = capture.packets.iter().map(|p| 16 + p.data.len()).sum();
            let mut out = Vec::with_capacity(24 + payload);
            let magic = if *nanosecond {
                PCAP_MAGIC_NANO
            } else {
                PCAP_MAGIC_MICRO
            };
            out.extend_from_slice(&magic.to_le_bytes());
            out.extend_from_slice(&version_major.to_le_bytes());
            out.extend_from_slice(&version_minor.to_le_bytes());
            out.extend_from_slice(&thiszone.to_le_bytes());
            out.extend_from_slice(&sigfigs.to_le_bytes());
            out.extend_from_slice(&snaplen.to_le_bytes());
            out.extend_from_slice(&(*linktype as u32).to_le_bytes());

            for packet in &capture.packets {
                let (ts_sec, ts_frac) = match &packet.meta {
                    PacketMeta::Legacy { ts_sec, ts_frac } => (*ts_sec, *ts_frac),
                    _ => (0, 0),
                };
                let caplen = packet.data.len() as u32;
                out.extend_from_slice(&ts_sec.to_le_bytes());
                out.extend_from_slice(&ts_frac.to_le_bytes());
                out.extend_from_slice(&caplen.to_le_bytes());
                out.extend_from_slice(&packet.origlen.max(caplen).to_le_bytes());
                out.extend_from_slice(&packet.data);
            }
            out
        }
        Container::Ng {
            version_major,
            version_minor,
            options,
            interfaces,
        } => {
            let mut out = Vec::new();

            let mut shb = Vec::new();
            shb.extend_from_slice(&BYTE_ORDER_MAGIC.to_le_bytes());
            shb.extend_from_slice(&version_major.to_le_bytes());
            shb.extend_from_slice(&version_minor.to_le_bytes());
            shb.extend_from_slice(&(-1i64).to_le_bytes());
            encode_options(&mut shb, options);
            push_block(&mut out, BLOCK_SHB, &shb);

            for interface in interfaces {
                let mut idb = Vec::new();
                idb.extend_from_slice(&(interface.linktype as u16).to_le_bytes());
                idb.extend_from_slice(&0u16.to_le_bytes());
                idb.extend_from_slice(&interface.snaplen.to_le_bytes());
                encode_options(&mut idb, &interface.options);
                push_block(&mut out, BLOCK_IDB, &idb);
            }

            for packet in &capture.packets {
                let caplen = packet.data.len() as u32;
                let origlen = packet.origlen.max(caplen);
                let mut body = Vec::with_capacity(20 + packet.data.len() + 4);
                match &packet.meta {
                    PacketMeta::Simple => {
                        body.extend_from_slice(&origlen.to_le_bytes());
                        push_padded(&mut body, &packet.data);
                        push_block(&mut out, BLOCK_SPB, &body);
                    }
                    meta => {
                        let (if_id, ts_high, ts_low, options) = match meta {
                            PacketMeta::Enhanced {
                                if_id,
                                ts_high,
                                ts_low,
                                options,
                            } => (*if_id, *ts_high, *ts_low, options.as_slice()),
                            _ => (0, 0, 0, &[][..]),
                        };
                        body.extend_from_slice(&if_id.to_le_bytes());
                        body.extend_from_slice(&ts_high.to_le_bytes());
                        body.extend_from_slice(&ts_low.to_le_bytes());
                        body.extend_from_slice(&caplen.to_le_bytes());
                        body.extend_from_slice(&origlen.to_le_bytes());
                        push_padded(&mut body, &packet.data);
                        encode_options(&mut body, options);
                        push_block(&mut out, BLOCK_EPB, &body);
                    }
                }
            }
            out
        }
    }
}

fn push_padded(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    let pad = (4 - data.len() % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
}

fn encode_options(out: &mut Vec<u8>, options: &[RawOption]) {
    if options.is_empty() {
        return;
    }
    for opt in options {
        out.extend_from_slice(&opt.code.to_le_bytes());
        out.extend_from_slice(&(opt.value.len() as u16).to_le_bytes());
        push_padded(out, &opt.value);
    }
    // opt_endofopt
    out.extend_from_slice(&[0, 0, 0, 0]);
}

fn push_block(out: &mut Vec<u8>, block_type: u32, body: &[u8]) {
    let total = (12 + body.len()) as u32;
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&total.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::packet::LINKTYPE_ETHERNET;
    use std::io::Cursor;

    fn classic(packets: Vec<Packet>) -> CaptureFile {
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
            packets,
        }
    }

    fn legacy(ts: u32, data: &[u8]) -> Packet {
        Packet {
            meta: PacketMeta::Legacy {
                ts_sec: ts,
                ts_frac: ts * 10,
            },
            origlen: data.len() as u32,
            data: data.to_vec(),
        }
    }

    #[test]
    fn classic_file_is_reproduced_byte_for_byte() {
        let capture = classic(vec![legacy(1, &[1, 2, 3]), legacy(2, &[4; 61])]);
        let bytes = encode(&capture);
        assert_eq!(&bytes[..4], &PCAP_MAGIC_MICRO.to_le_bytes());
        assert_eq!(bytes.len(), 24 + 16 + 3 + 16 + 61);

        let decoded = decode(Cursor::new(bytes.clone())).unwrap();
        assert_eq!(decoded, capture);
        assert_eq!(encode(&decoded), bytes);
    }

    #[test]
    fn truncated_packets_keep_wire_length() {
        let mut packet = legacy(5, &[9; 10]);
        packet.origlen = 1500;
        let decoded = decode(Cursor::new(encode(&classic(vec![packet])))).unwrap();
        assert_eq!(decoded.packets[0].origlen, 1500);
        assert_eq!(decoded.packets[0].data.len(), 10);
    }

    #[test]
    fn ng_blocks_keep_metadata() {
        let capture = CaptureFile {
            container: Container::Ng {
                version_major: 1,
                version_minor: 0,
                options: vec![RawOption {
                    code: 4,
                    value: b"test-app".to_vec(),
                }],
                interfaces: vec![Interface {
                    linktype: LINKTYPE_ETHERNET,
                    snaplen: 262144,
                    options: vec![RawOption {
                        code: 9,
                        value: vec![6],
                    }],
                }],
            },
            packets: vec![
                Packet {
                    meta: PacketMeta::Enhanced {
                        if_id: 0,
                        ts_high: 0x0005_8a3b,
                        ts_low: 0x1234_5678,
                        options: vec![RawOption {
                            code: 1,
                            value: b"hello".to_vec(),
                        }],
                    },
                    origlen: 5,
                    data: vec![0xaa; 5],
                },
                Packet {
                    meta: PacketMeta::Enhanced {
                        if_id: 0,
                        ts_high: 0x0005_8a3b,
                        ts_low: 0x1234_9999,
                        options: vec![],
                    },
                    origlen: 64,
                    data: vec![0xbb; 64],
                },
            ],
        };

        let bytes = encode(&capture);
        assert_eq!(&bytes[..4], &PCAPNG_MAGIC);
        assert_eq!(bytes.len() % 4, 0);

        let decoded = decode(Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, capture);
        assert!(decoded.is_ng());
        assert_eq!(decoded.linktype_of(&decoded.packets[1]), Some(LINKTYPE_ETHERNET));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(Cursor::new(vec![1u8, 2])).is_err());
        assert!(decode(Cursor::new(vec![0u8; 64])).is_err());
    }

    #[test]
    fn truncated_file_is_an_error() {
        let mut bytes = encode(&classic(vec![legacy(1, &[1; 40])]));
        bytes.truncate(bytes.len() - 10);
        assert!(decode(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn big_endian_nanosecond_file_is_read() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PCAP_MAGIC_NANO.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&(-3600i32).to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&262_144u32.to_be_bytes());
        bytes.extend_from_slice(&(LINKTYPE_ETHERNET as u32).to_be_bytes());
        for (ts_sec, ts_frac, data) in [
            (1_600_000_000u32, 123_456_789u32, &[0xde, 0xad, 0xbe, 0xef][..]),
            (1_600_000_001, 999_999_999, &[7u8; 9][..]),
        ] {
            bytes.extend_from_slice(&ts_sec.to_be_bytes());
            bytes.extend_from_slice(&ts_frac.to_be_bytes());
            bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
            bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
            bytes.extend_from_slice(data);
        }

        let decoded = decode(Cursor::new(bytes)).unwrap();
        assert_eq!(
            decoded.container,
            Container::Classic {
                nanosecond: true,
                version_major: 2,
                version_minor: 4,
                thiszone: -3600,
                sigfigs: 0,
                snaplen: 262_144,
                linktype: LINKTYPE_ETHERNET,
            }
        );
        assert_eq!(decoded.packets.len(), 2);
        assert_eq!(
            decoded.packets[0].meta,
            PacketMeta::Legacy {
                ts_sec: 1_600_000_000,
                ts_frac: 123_456_789,
            }
        );
        assert_eq!(decoded.packets[0].data, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decoded.packets[1].origlen, 9);

        // rewritten little-endian, still nanosecond
        let rewritten = encode(&decoded);
        assert_eq!(&rewritten[..4], &PCAP_MAGIC_NANO.to_le_bytes());
        assert_eq!(decode(Cursor::new(rewritten)).unwrap(), decoded);
    }
}
