use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::utils::error::{AppError, AppResult};

/// Default keep-head/keep-tail counts when packet shuffling is just `true`
pub const DEFAULT_PACKET_WINDOW: PacketWindow = PacketWindow { head: 3, tail: 4 };

/// A transformation profile as written in the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModifierSpec {
    pub id: String,

    /// Shift timestamps so the capture looks recent
    pub adjust_time: bool,

    /// Subtracted from the computed time shift
    #[serde(with = "crate::utils::duration::serde_duration")]
    pub time_offset: Duration,

    /// Skip endpoint rewriting entirely
    pub keep_ip: bool,

    pub c1: i64,
    pub c2: i64,
    pub c3: i64,
    pub c4: i64,
    pub s1: i64,
    pub s2: i64,
    pub s3: i64,
    pub s4: i64,

    /// Keep the third octet group fixed as well
    pub use_part_3: bool,

    /// Keep all four octet groups fixed
    pub use_part_4: bool,

    /// Convert IPv4 packets to IPv6
    pub to_ipv6: bool,

    /// Keep this many payload bytes and shuffle the rest
    pub shuffle_payload: Option<usize>,

    /// `false`, `true` or `head:tail`
    pub shuffle_packet: String,

    /// Read filter applied to every generated copy
    pub read_filter: Option<String>,
}

impl Default for ModifierSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            adjust_time: true,
            time_offset: Duration::ZERO,
            keep_ip: false,
            c1: 192,
            c2: 168,
            c3: 186,
            c4: 11,
            s1: 10,
            s2: 132,
            s3: 123,
            s4: 22,
            use_part_3: false,
            use_part_4: false,
            to_ipv6: false,
            shuffle_payload: None,
            shuffle_packet: "false".to_string(),
            read_filter: None,
        }
    }
}

/// Packets protected from reordering at the start and end of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacketWindow {
    pub head: usize,
    pub tail: usize,
}

/// Parse a packet shuffle setting: `""`/`false`, `true`, or `head:tail`
pub fn parse_packet_window(text: &str) -> AppResult<Option<PacketWindow>> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("false") {
        return Ok(None);
    }
    if text.eq_ignore_ascii_case("true") {
        return Ok(Some(DEFAULT_PACKET_WINDOW));
    }
    let (head, tail) = text.split_once(':').ok_or_else(|| {
        AppError::ConfigError(format!("shuffle_packet `{}` is not false, true or n:m", text))
    })?;
    let bound = |v: &str| {
        v.trim().parse::<usize>().map_err(|_| {
            AppError::ConfigError(format!(
                "shuffle_packet `{}`: `{}` is not a count >= 0",
                text, v
            ))
        })
    };
    Ok(Some(PacketWindow {
        head: bound(head)?,
        tail: bound(tail)?,
    }))
}

/// Which in-process shuffles are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShuffleOptions {
    /// Protected payload prefix length; `None` disables payload shuffling
    pub payload_keep: Option<usize>,

    /// Protected head/tail; `None` disables packet reordering
    pub packets: Option<PacketWindow>,
}

impl ShuffleOptions {
    pub fn is_enabled(&self) -> bool {
        self.payload_keep.is_some() || self.packets.is_some()
    }
}

/// How many leading octet groups of each endpoint stay fixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointDepth {
    Two,
    Three,
    Four,
}

/// Validated transformation profile
#[derive(Debug, Clone, Serialize)]
pub struct Modifier {
    pub id: String,
    pub adjust_time: bool,
    #[serde(with = "crate::utils::duration::serde_duration")]
    pub time_offset: Duration,
    pub keep_ip: bool,
    pub client: [u8; 4],
    pub server: [u8; 4],
    pub depth: EndpointDepth,
    pub to_ipv6: bool,
    pub shuffle: ShuffleOptions,
    pub read_filter: Option<String>,
}

impl Modifier {
    /// Validate a configured profile
    pub fn from_spec(spec: &ModifierSpec) -> AppResult<Self> {
        let octet = |name: &str, value: i64| -> AppResult<u8> {
            u8::try_from(value).map_err(|_| {
                AppError::ConfigError(format!(
                    "[Modifier {}] {} must be in [0, 255], got {}",
                    spec.id, name, value
                ))
            })
        };
        let client = [
            octet("c1", spec.c1)?,
            octet("c2", spec.c2)?,
            octet("c3", spec.c3)?,
            octet("c4", spec.c4)?,
        ];
        let server = [
            octet("s1", spec.s1)?,
            octet("s2", spec.s2)?,
            octet("s3", spec.s3)?,
            octet("s4", spec.s4)?,
        ];

        let depth = if spec.use_part_4 {
            EndpointDepth::Four
        } else if spec.use_part_3 {
            EndpointDepth::Three
        } else {
            EndpointDepth::Two
        };

        let packets = parse_packet_window(&spec.shuffle_packet).map_err(|e| match e {
            AppError::ConfigError(msg) => {
                AppError::ConfigError(format!("[Modifier {}] {}", spec.id, msg))
            }
            other => other,
        })?;

        Ok(Self {
            id: spec.id.clone(),
            adjust_time: spec.adjust_time,
            time_offset: spec.time_offset,
            keep_ip: spec.keep_ip,
            client,
            server,
            depth,
            to_ipv6: spec.to_ipv6,
            shuffle: ShuffleOptions {
                payload_keep: spec.shuffle_payload,
                packets,
            },
            read_filter: spec.read_filter.clone().filter(|f| !f.trim().is_empty()),
        })
    }

    /// Pick endpoints for one generated capture, in the rewriter's
    /// `client/mask:server/mask` syntax.
    ///
    /// Octet groups past the fixed depth are drawn at random. The mask is
    /// 16 or 24 bits for depth two or three plus a random 0..=4, and exactly
    /// 32 at depth four. IPv6 output embeds the addresses behind `0100::ffff:`
    /// and adds 96 to the mask.
    pub fn random_endpoints<R: Rng>(&self, ipv6: bool, rng: &mut R) -> String {
        let mut client = self.client;
        let mut server = self.server;
        let extra: u8 = rng.gen_range(0..=4);

        let mask: u8 = match self.depth {
            EndpointDepth::Four => 32,
            EndpointDepth::Three => {
                client[3] = rng.gen();
                server[3] = rng.gen();
                24 + extra
            }
            EndpointDepth::Two => {
                client[2] = rng.gen();
                client[3] = rng.gen();
                server[2] = rng.gen();
                server[3] = rng.gen();
                16 + extra
            }
        };

        if ipv6 {
            let mask = u16::from(mask) + 96;
            format!(
                "[0100::ffff:{:02x}{:02x}:{:02x}{:02x}/{m}]:[0100::ffff:{:02x}{:02x}:{:02x}{:02x}/{m}]",
                client[0], client[1], client[2], client[3],
                server[0], server[1], server[2], server[3],
                m = mask
            )
        } else {
            format!(
                "{}.{}.{}.{}/{m}:{}.{}.{}.{}/{m}",
                client[0], client[1], client[2], client[3],
                server[0], server[1], server[2], server[3],
                m = mask
            )
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Modifier {}]", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn spec() -> ModifierSpec {
        ModifierSpec {
            id: "m".to_string(),
            ..ModifierSpec::default()
        }
    }

    #[test]
    fn octets_must_fit_a_byte() {
        assert!(Modifier::from_spec(&spec()).is_ok());
        for bad in [-1, 256, 1000] {
            let mut s = spec();
            s.s3 = bad;
            assert!(matches!(Modifier::from_spec(&s), Err(AppError::ConfigError(_))));
        }
        let mut edge = spec();
        edge.c1 = 0;
        edge.c4 = 255;
        assert_eq!(Modifier::from_spec(&edge).unwrap().client, [0, 168, 186, 255]);
    }

    #[test]
    fn packet_window_syntax() {
        assert_eq!(parse_packet_window("").unwrap(), None);
        assert_eq!(parse_packet_window("false").unwrap(), None);
        assert_eq!(parse_packet_window("true").unwrap(), Some(DEFAULT_PACKET_WINDOW));
        assert_eq!(
            parse_packet_window("0:2").unwrap(),
            Some(PacketWindow { head: 0, tail: 2 })
        );
        assert!(parse_packet_window("-1:2").is_err());
        assert!(parse_packet_window("3").is_err());
        assert!(parse_packet_window("a:b").is_err());
    }

    #[test]
    fn endpoints_respect_depth() {
        let mut rng = StdRng::seed_from_u64(7);

        let mut s = spec();
        s.use_part_4 = true;
        let fixed = Modifier::from_spec(&s).unwrap();
        assert_eq!(
            fixed.random_endpoints(false, &mut rng),
            "192.168.186.11/32:10.132.123.22/32"
        );
        assert_eq!(
            fixed.random_endpoints(true, &mut rng),
            "[0100::ffff:c0a8:ba0b/128]:[0100::ffff:0a84:7b16/128]"
        );

        let two = Modifier::from_spec(&spec()).unwrap();
        for _ in 0..50 {
            let text = two.random_endpoints(false, &mut rng);
            let (client, server) = text.split_once(':').unwrap();
            assert!(client.starts_with("192.168."));
            assert!(server.starts_with("10.132."));
            let mask: u8 = client.rsplit('/').next().unwrap().parse().unwrap();
            assert!((16..=20).contains(&mask));
        }

        let mut s = spec();
        s.use_part_3 = true;
        let three = Modifier::from_spec(&s).unwrap();
        for _ in 0..50 {
            let text = three.random_endpoints(true, &mut rng);
            assert!(text.starts_with("[0100::ffff:c0a8:ba"));
            let mask: u16 = text[..text.find(']').unwrap()]
                .rsplit('/')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            assert!((120..=124).contains(&mask));
        }
    }

    #[test]
    fn seeded_endpoints_are_reproducible() {
        let m = Modifier::from_spec(&spec()).unwrap();
        let a = m.random_endpoints(false, &mut StdRng::seed_from_u64(42));
        let b = m.random_endpoints(false, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
