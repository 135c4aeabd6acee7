#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use pcap_replayer::capture::codec::write_capture;
use pcap_replayer::capture::finder::Finder;
use pcap_replayer::capture::tools::Toolbox;
use pcap_replayer::models::config::ToolPaths;
use pcap_replayer::models::filter::FinderSpec;
use pcap_replayer::models::modifier::{Modifier, ModifierSpec};
use pcap_replayer::models::packet::{CaptureFile, Container, Packet, PacketMeta, LINKTYPE_ETHERNET};
use pcap_replayer::utils::exec::Executor;

/// A temp dir holding a capture root, a run directory and fake tools that
/// log every invocation.
pub struct Lab {
    pub dir: TempDir,
    pub root: PathBuf,
    pub run: PathBuf,
    pub calls: PathBuf,
    pub tools: Toolbox,
}

fn script(dir: &Path, name: &str, calls: &Path, body: &str) -> PathBuf {
    let path = dir.join(name);
    let text = format!(
        "#!/bin/sh\necho {} >> '{}'\n{}\n",
        name,
        calls.display(),
        body
    );
    std::fs::write(&path, text).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const CAPINFOS: &str = r#"for last; do :; done
case "$last" in *.ipv6.*) n=0;; *) n=10;; esac
echo "File name:           $last"
echo "File type:           Wireshark/tcpdump/... - pcap"
echo "File encapsulation:  Ethernet"
echo "Number of packets:   $n"
echo "Capture duration:    9.000000 seconds"
echo "First packet time:   1600000000.000000"
echo "Last packet time:    1600000009.000000"
echo "Average packet size: 60.00 bytes"
echo "Average packet rate: 1.11 packets/s""#;

const TCPPREP: &str = r#"for a; do case "$a" in --cachefile=*) : > "${a#--cachefile=}";; esac; done"#;

const TCPREWRITE: &str = r#"for a; do
  case "$a" in
    --infile=*) src="${a#--infile=}";;
    --outfile=*) dst="${a#--outfile=}";;
  esac
done
cp "$src" "$dst""#;

impl Lab {
    pub fn new() -> Self {
        Self::with_editcap(r#"cp "$3" "$4""#)
    }

    /// A lab whose capture-time editor runs `editcap` instead of copying
    pub fn with_editcap(editcap: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pcaps");
        let run = dir.path().join("run");
        let bin = dir.path().join("bin");
        for d in [&root, &run, &bin] {
            std::fs::create_dir_all(d).unwrap();
        }
        let calls = dir.path().join("calls.log");
        std::fs::write(&calls, b"").unwrap();

        let paths = ToolPaths {
            bash: PathBuf::from("/bin/sh"),
            capinfos: script(&bin, "capinfos", &calls, CAPINFOS),
            editcap: script(&bin, "editcap", &calls, editcap),
            tcpdump: script(&bin, "tcpdump", &calls, r#": > "$4""#),
            tcprewrite: script(&bin, "tcprewrite", &calls, TCPREWRITE),
            tcpprep: script(&bin, "tcpprep", &calls, TCPPREP),
            tshark: script(&bin, "tshark", &calls, r#"cp "$2" "$9""#),
            mergecap: script(&bin, "mergecap", &calls, "true"),
        };
        let tools = Toolbox::new(paths, Arc::new(Executor::new()), Duration::from_secs(10));

        Self {
            dir,
            root,
            run,
            calls,
            tools,
        }
    }

    /// Write a classic Ethernet capture of `packets` frames under the root
    pub fn add_capture(&self, relative: &str, packets: usize) -> PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let capture = CaptureFile {
            container: Container::Classic {
                nanosecond: false,
                version_major: 2,
                version_minor: 4,
                thiszone: 0,
                sigfigs: 0,
                snaplen: 65535,
                linktype: LINKTYPE_ETHERNET,
            },
            packets: (0..packets)
                .map(|i| Packet {
                    meta: PacketMeta::Legacy {
                        ts_sec: 1_600_000_000 + i as u32,
                        ts_frac: 0,
                    },
                    origlen: 60,
                    data: vec![i as u8; 60],
                })
                .collect(),
        };
        write_capture(&path, &capture).unwrap();
        path
    }

    /// How many times `tool` was invoked so far
    pub fn calls(&self, tool: &str) -> usize {
        std::fs::read_to_string(&self.calls)
            .unwrap()
            .lines()
            .filter(|line| *line == tool)
            .count()
    }

    pub fn finder(&self, patterns: &[&str]) -> Arc<Finder> {
        self.finder_with(patterns, ModifierSpec::default())
    }

    pub fn finder_with(&self, patterns: &[&str], modifier: ModifierSpec) -> Arc<Finder> {
        let spec = FinderSpec {
            id: "default".to_string(),
            directory: self.root.to_string_lossy().into_owned(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            ..FinderSpec::default()
        };
        let modifier = Modifier::from_spec(&ModifierSpec {
            id: "default".to_string(),
            ..modifier
        })
        .unwrap();
        Arc::new(Finder::from_spec(&spec, Arc::new(modifier), &self.run).unwrap())
    }
}
