use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Metric categories that failed to parse out of an info report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoErrors(u16);

impl InfoErrors {
    pub const ENCAPSULATION: InfoErrors = InfoErrors(1 << 0);
    pub const PACKET_COUNT: InfoErrors = InfoErrors(1 << 1);
    pub const CAPTURE_DURATION: InfoErrors = InfoErrors(1 << 2);
    pub const FIRST_PACKET_TIME: InfoErrors = InfoErrors(1 << 3);
    pub const LAST_PACKET_TIME: InfoErrors = InfoErrors(1 << 4);
    pub const AVG_PACKET_SIZE: InfoErrors = InfoErrors(1 << 5);
    pub const AVG_PACKET_RATE: InfoErrors = InfoErrors(1 << 6);

    const NAMES: [(InfoErrors, &'static str); 7] = [
        (Self::ENCAPSULATION, "encapsulation"),
        (Self::PACKET_COUNT, "packet_count"),
        (Self::CAPTURE_DURATION, "capture_duration"),
        (Self::FIRST_PACKET_TIME, "first_packet_time"),
        (Self::LAST_PACKET_TIME, "last_packet_time"),
        (Self::AVG_PACKET_SIZE, "avg_packet_size"),
        (Self::AVG_PACKET_RATE, "avg_packet_rate"),
    ];

    pub fn empty() -> Self {
        InfoErrors(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: InfoErrors) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: InfoErrors) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl fmt::Display for InfoErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

impl Serialize for InfoErrors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Metrics of one capture file, as reported by the info-dump tool
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureInfo {
    /// Container type line (`File type`), when present
    pub file_type: Option<String>,

    /// Link-layer encapsulation name, e.g. `Ethernet`
    pub encapsulation: Option<String>,

    pub packet_count: i64,

    #[serde(with = "crate::utils::duration::serde_duration")]
    pub capture_duration: Duration,

    pub first_packet_time: Option<DateTime<Utc>>,

    pub last_packet_time: Option<DateTime<Utc>>,

    /// Bytes
    pub avg_packet_size: f64,

    /// Packets per second
    pub avg_packet_rate: f64,

    /// Fields that were missing or malformed
    pub errors: InfoErrors,
}

impl CaptureInfo {
    /// Parse a `key: value` report.
    ///
    /// Unknown keys are ignored. A missing or malformed metric sets its bit
    /// in `errors` and leaves the field at its default.
    pub fn parse(report: &str) -> Self {
        let mut info = CaptureInfo::default();
        let mut seen = InfoErrors::empty();

        for line in report.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            let flag = match key.as_str() {
                "file type" => {
                    info.file_type = Some(value.to_string());
                    continue;
                }
                "file encapsulation" => {
                    if !value.is_empty() {
                        info.encapsulation = Some(value.to_string());
                        seen.insert(InfoErrors::ENCAPSULATION);
                    }
                    continue;
                }
                "number of packets" => {
                    let parsed = value.parse::<i64>().ok().filter(|n| *n >= 0);
                    if let Some(count) = parsed {
                        info.packet_count = count;
                    }
                    (InfoErrors::PACKET_COUNT, parsed.is_some())
                }
                "capture duration" => {
                    let parsed = leading_number(value)
                        .filter(|v| v.is_finite() && *v >= 0.0)
                        .map(Duration::from_secs_f64);
                    if let Some(duration) = parsed {
                        info.capture_duration = duration;
                    }
                    (InfoErrors::CAPTURE_DURATION, parsed.is_some())
                }
                "start time" | "first packet time" => {
                    info.first_packet_time = epoch(value);
                    (InfoErrors::FIRST_PACKET_TIME, info.first_packet_time.is_some())
                }
                "end time" | "last packet time" => {
                    info.last_packet_time = epoch(value);
                    (InfoErrors::LAST_PACKET_TIME, info.last_packet_time.is_some())
                }
                "average packet size" => {
                    let parsed = leading_number(value);
                    if let Some(size) = parsed {
                        info.avg_packet_size = size;
                    }
                    (InfoErrors::AVG_PACKET_SIZE, parsed.is_some())
                }
                "average packet rate" | "average packets/s" => {
                    let parsed = leading_number(value);
                    if let Some(rate) = parsed {
                        info.avg_packet_rate = rate;
                    }
                    (InfoErrors::AVG_PACKET_RATE, parsed.is_some())
                }
                _ => continue,
            };

            match flag {
                (bit, true) => seen.insert(bit),
                (bit, false) => info.errors.insert(bit),
            }
        }

        for (bit, _) in InfoErrors::NAMES {
            if !seen.contains(bit) {
                info.errors.insert(bit);
            }
        }
        info
    }

    pub fn is_ethernet(&self) -> bool {
        self.encapsulation
            .as_deref()
            .map(|e| e.eq_ignore_ascii_case("ethernet"))
            .unwrap_or(false)
    }

    /// Whether the report describes a pcapng container
    pub fn is_pcapng(&self) -> bool {
        self.file_type
            .as_deref()
            .map(|t| t.to_ascii_lowercase().contains("pcapng"))
            .unwrap_or(false)
    }
}

/// First whitespace separated token as a float (`"12.5 bytes"` -> 12.5)
fn leading_number(value: &str) -> Option<f64> {
    value.split_whitespace().next()?.parse::<f64>().ok()
}

fn epoch(value: &str) -> Option<DateTime<Utc>> {
    let ts = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(secs as i64, nanos).single()
}
