/// Link type number of Ethernet framing
pub const LINKTYPE_ETHERNET: i32 = 1;

/// A raw pcapng option, kept verbatim across a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub code: u16,
    pub value: Vec<u8>,
}

/// Per-packet framing data that must survive a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketMeta {
    /// Classic pcap record header
    Legacy {
        ts_sec: u32,
        /// Microseconds or nanoseconds, depending on the file magic
        ts_frac: u32,
    },
    /// pcapng enhanced packet block
    Enhanced {
        if_id: u32,
        ts_high: u32,
        ts_low: u32,
        options: Vec<RawOption>,
    },
    /// pcapng simple packet block, no timestamp
    Simple,
}

/// One captured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub meta: PacketMeta,

    /// Length on the wire, may exceed `data.len()` for truncated captures
    pub origlen: u32,

    /// Captured bytes, starting at the link layer
    pub data: Vec<u8>,
}

impl Packet {
    /// Replace the captured bytes.
    ///
    /// The wire length follows the new content whenever its size changes.
    pub fn replace_data(&mut self, data: Vec<u8>) {
        if data.len() != self.data.len() {
            self.origlen = data.len() as u32;
        }
        self.data = data;
    }

    pub fn interface_id(&self) -> u32 {
        match &self.meta {
            PacketMeta::Enhanced { if_id, .. } => *if_id,
            _ => 0,
        }
    }
}

/// A pcapng interface description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub linktype: i32,
    pub snaplen: u32,
    pub options: Vec<RawOption>,
}

/// File-level framing of a capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    Classic {
        nanosecond: bool,
        version_major: u16,
        version_minor: u16,
        thiszone: i32,
        sigfigs: u32,
        snaplen: u32,
        linktype: i32,
    },
    Ng {
        version_major: u16,
        version_minor: u16,
        options: Vec<RawOption>,
        interfaces: Vec<Interface>,
    },
}

/// A fully decoded capture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFile {
    pub container: Container,
    pub packets: Vec<Packet>,
}

impl CaptureFile {
    /// Link type a packet was captured with, if known
    pub fn linktype_of(&self, packet: &Packet) -> Option<i32> {
        match &self.container {
            Container::Classic { linktype, .. } => Some(*linktype),
            Container::Ng { interfaces, .. } => interfaces
                .get(packet.interface_id() as usize)
                .map(|i| i.linktype),
        }
    }

    pub fn is_ng(&self) -> bool {
        matches!(self.container, Container::Ng { .. })
    }
}
