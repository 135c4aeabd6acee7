use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::config::FileConfig;
use crate::utils::duration::parse_duration;

fn parse_key_value(text: &str) -> Result<(String, String), String> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| format!("`{}` is not key=value", text))?;
    if key.trim().is_empty() {
        return Err(format!("`{}` has an empty key", text));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Command line options. Everything left unset falls back to the
/// configuration file, then to built-in defaults.
#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Find captures, mutate them and replay them through analysis engines"
)]
pub struct Args {
    /// Configuration file, `~/.pcap-replayer.toml` by default
    #[clap(short = 'f', long)]
    pub config_file: Option<PathBuf>,

    /// Jobs running at the same time
    #[clap(short = 'C', long)]
    pub concurrency_jobs: Option<usize>,

    /// Commands running at the same time within one job
    #[clap(short = 'c', long)]
    pub concurrency_commands: Option<usize>,

    /// Rounds of every enabled job
    #[clap(short = 'T', long)]
    pub test_times: Option<usize>,

    /// Maximum run time such as `1h3m5s`, 0 for unlimited
    #[clap(short = 'D', long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Default timeout of a single command
    #[clap(short = 'S', long, value_parser = parse_duration)]
    pub command_timeout: Option<Duration>,

    /// Parent of the per-run working directory
    #[clap(short = 'w', long)]
    pub temporary_directory: Option<String>,

    /// Only list the enabled jobs
    #[clap(short = 'J', long)]
    pub just_show_jobs: bool,

    /// Only list the matched captures
    #[clap(short = 'j', long)]
    pub just_show_pcaps: bool,

    #[clap(long)]
    pub show_command: bool,

    /// Also log the output of successful commands
    #[clap(long)]
    pub show_stdout: bool,

    /// Log why captures were rejected
    #[clap(long)]
    pub show_why: bool,

    /// Keep the working directory after the run
    #[clap(long)]
    pub keep_data: bool,

    /// Job ids to run, comma separated; `all` runs every job
    #[clap(short = 'O', long, value_delimiter = ',')]
    pub jobs: Vec<String>,

    /// Run in the background
    #[clap(long)]
    pub daemon: bool,

    /// Set by the background parent, do not use directly
    #[clap(long, hide = true)]
    pub pingback: Option<String>,

    /// Copy every mutated capture into this directory
    #[clap(long)]
    pub fast_copy: Option<String>,

    /// Merge every mutated capture into this file
    #[clap(long)]
    pub fast_merge: Option<String>,

    /// Template variable `key=value`, repeatable
    #[clap(long = "vars", value_parser = parse_key_value)]
    pub vars: Vec<(String, String)>,

    /// Only log warnings and errors
    #[clap(short, long)]
    pub quiet: bool,

    /// Debug logging and a dump of the resolved configuration
    #[clap(long)]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long)]
    pub log_level: Option<String>,

    /// Exit non-zero when any command failed
    #[clap(long)]
    pub fail_on_command_error: bool,

    /// Shift timestamps so captures look recent
    #[clap(short = 'a', long, num_args = 0..=1, default_missing_value = "true")]
    pub adjust_time: Option<bool>,

    #[clap(short = 't', long, value_parser = parse_duration)]
    pub time_offset: Option<Duration>,

    /// Do not rewrite endpoints
    #[clap(short = 'K', long)]
    pub keep_ip: bool,

    #[clap(long)]
    pub c1: Option<i64>,
    #[clap(long)]
    pub c2: Option<i64>,
    #[clap(long)]
    pub c3: Option<i64>,
    #[clap(long)]
    pub c4: Option<i64>,
    #[clap(long)]
    pub s1: Option<i64>,
    #[clap(long)]
    pub s2: Option<i64>,
    #[clap(long)]
    pub s3: Option<i64>,
    #[clap(long)]
    pub s4: Option<i64>,

    /// Keep the third octet of both endpoints
    #[clap(short = '3', long)]
    pub use_part_3: bool,

    /// Keep every octet of both endpoints
    #[clap(short = '4', long)]
    pub use_part_4: bool,

    /// Convert IPv4 packets to IPv6
    #[clap(short = '6', long = "p426")]
    pub to_ipv6: bool,

    /// Keep this many payload bytes and shuffle the rest
    #[clap(short = 's', long)]
    pub shuffle_payload: Option<usize>,

    /// `false`, `true` (keeps 3 head and 4 tail packets) or `head:tail`
    #[clap(short = 'r', long)]
    pub shuffle_packet: Option<String>,

    /// Read filter applied to every generated copy
    #[clap(short = 'R', long = "tshark-filter")]
    pub modifier_read_filter: Option<String>,

    /// Search directory of the default finder
    #[clap(short = 'd', long)]
    pub directory: Option<String>,

    /// Name patterns, comma separated
    #[clap(short = 'p', long, value_delimiter = ',')]
    pub patterns: Vec<String>,

    /// Tag expression, repeatable
    #[clap(short = 'G', long)]
    pub tags: Vec<String>,

    #[clap(long)]
    pub pps_le: Option<f64>,
    #[clap(long)]
    pub pps_ge: Option<f64>,
    #[clap(long)]
    pub packet_count_le: Option<i64>,
    #[clap(long)]
    pub packet_count_ge: Option<i64>,
    #[clap(long)]
    pub avg_packet_size_le: Option<f64>,
    #[clap(long)]
    pub avg_packet_size_ge: Option<f64>,

    #[clap(long)]
    pub only_ipv6: bool,

    #[clap(short = 'E', long, num_args = 0..=1, default_missing_value = "true")]
    pub only_ethernet: Option<bool>,

    /// Read filter a capture must keep packets through to be matched
    #[clap(short = 'F', long = "tshark-read-filter")]
    pub finder_read_filter: Option<String>,

    #[clap(long)]
    pub bash: Option<PathBuf>,
    #[clap(long)]
    pub capinfos: Option<PathBuf>,
    #[clap(long)]
    pub editcap: Option<PathBuf>,
    #[clap(long)]
    pub tcpdump: Option<PathBuf>,
    #[clap(long)]
    pub tcprewrite: Option<PathBuf>,
    #[clap(long)]
    pub tcpprep: Option<PathBuf>,
    #[clap(long)]
    pub tshark: Option<PathBuf>,
    #[clap(long)]
    pub mergecap: Option<PathBuf>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn flag(target: &mut bool, value: bool) {
    if value {
        *target = true;
    }
}

impl Args {
    /// Configuration file to load and whether it must exist
    pub fn config_path(&self) -> Option<(PathBuf, bool)> {
        match &self.config_file {
            Some(path) => Some((path.clone(), true)),
            None => FileConfig::default_path().map(|path| (path, false)),
        }
    }

    /// Lay the command line over a loaded configuration
    pub fn apply(&self, file: &mut FileConfig) {
        let c = &mut file.config;
        set(&mut c.concurrency_jobs, self.concurrency_jobs);
        set(&mut c.concurrency_commands, self.concurrency_commands);
        set(&mut c.test_times, self.test_times);
        set(&mut c.duration, self.duration);
        set(&mut c.command_timeout, self.command_timeout);
        set(&mut c.temporary_directory, self.temporary_directory.clone());
        if !self.jobs.is_empty() {
            c.jobs = self.jobs.clone();
        }
        c.vars.extend(self.vars.iter().cloned());
        flag(&mut c.keep_data, self.keep_data);
        flag(&mut c.fail_on_command_error, self.fail_on_command_error);
        flag(&mut c.daemon, self.daemon);
        if self.pingback.is_some() {
            c.pingback = self.pingback.clone();
        }
        if self.fast_copy.is_some() {
            c.fast_copy = self.fast_copy.clone();
        }
        if self.fast_merge.is_some() {
            c.fast_merge = self.fast_merge.clone();
        }
        flag(&mut c.debug, self.debug);
        flag(&mut c.quiet, self.quiet);
        flag(&mut c.just_show_jobs, self.just_show_jobs);
        flag(&mut c.just_show_pcaps, self.just_show_pcaps);
        flag(&mut c.show_command, self.show_command);
        flag(&mut c.show_stdout, self.show_stdout);
        flag(&mut c.show_why, self.show_why);

        let m = &mut c.modifier;
        set(&mut m.adjust_time, self.adjust_time);
        set(&mut m.time_offset, self.time_offset);
        flag(&mut m.keep_ip, self.keep_ip);
        set(&mut m.c1, self.c1);
        set(&mut m.c2, self.c2);
        set(&mut m.c3, self.c3);
        set(&mut m.c4, self.c4);
        set(&mut m.s1, self.s1);
        set(&mut m.s2, self.s2);
        set(&mut m.s3, self.s3);
        set(&mut m.s4, self.s4);
        flag(&mut m.use_part_3, self.use_part_3);
        flag(&mut m.use_part_4, self.use_part_4);
        flag(&mut m.to_ipv6, self.to_ipv6);
        if self.shuffle_payload.is_some() {
            m.shuffle_payload = self.shuffle_payload;
        }
        set(&mut m.shuffle_packet, self.shuffle_packet.clone());
        if self.modifier_read_filter.is_some() {
            m.read_filter = self.modifier_read_filter.clone();
        }

        let f = &mut c.finder;
        set(&mut f.directory, self.directory.clone());
        if !self.patterns.is_empty() {
            f.patterns = self.patterns.clone();
        }
        if !self.tags.is_empty() {
            f.tags = self.tags.clone();
        }
        set(&mut f.pps_le, self.pps_le);
        set(&mut f.pps_ge, self.pps_ge);
        set(&mut f.packet_count_le, self.packet_count_le);
        set(&mut f.packet_count_ge, self.packet_count_ge);
        set(&mut f.avg_packet_size_le, self.avg_packet_size_le);
        set(&mut f.avg_packet_size_ge, self.avg_packet_size_ge);
        flag(&mut f.only_ipv6, self.only_ipv6);
        set(&mut f.only_ethernet, self.only_ethernet);
        if self.finder_read_filter.is_some() {
            f.read_filter = self.finder_read_filter.clone();
        }

        let t = &mut c.tool;
        set(&mut t.bash, self.bash.clone());
        set(&mut t.capinfos, self.capinfos.clone());
        set(&mut t.editcap, self.editcap.clone());
        set(&mut t.tcpdump, self.tcpdump.clone());
        set(&mut t.tcprewrite, self.tcprewrite.clone());
        set(&mut t.tcpprep, self.tcpprep.clone());
        set(&mut t.tshark, self.tshark.clone());
        set(&mut t.mergecap, self.mergecap.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn command_line_beats_file() {
        let mut file = FileConfig::from_toml(
            r#"
            [config]
            concurrency_jobs = 4
            test_times = 2
            jobs = ["zeek"]
            vars = { a = "file", b = "file" }

            [config.modifier]
            c1 = 172
            adjust_time = true

            [config.finder]
            patterns = ["dns*"]
            "#,
        )
        .unwrap();
        let args = Args::parse_from([
            "pcap-replayer",
            "-C",
            "2",
            "-O",
            "suricata,zeek",
            "--vars",
            "a=cli",
            "-a",
            "false",
            "-6",
            "-s",
            "0",
            "-p",
            "http*,tls*",
            "-G",
            "a,b c",
            "-S",
            "1m",
            "-E",
        ]);
        args.apply(&mut file);

        let c = &file.config;
        assert_eq!(c.concurrency_jobs, 2);
        assert_eq!(c.test_times, 2);
        assert_eq!(c.command_timeout, Duration::from_secs(60));
        assert_eq!(c.jobs, ["suricata", "zeek"]);
        assert_eq!(c.vars["a"], "cli");
        assert_eq!(c.vars["b"], "file");
        assert_eq!(c.modifier.c1, 172);
        assert!(!c.modifier.adjust_time);
        assert!(c.modifier.to_ipv6);
        assert_eq!(c.modifier.shuffle_payload, Some(0));
        assert_eq!(c.finder.patterns, ["http*", "tls*"]);
        assert_eq!(c.finder.tags, ["a,b c"]);
        assert!(c.finder.only_ethernet);
    }

    #[test]
    fn malformed_vars_are_rejected() {
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert_eq!(
            parse_key_value("rule=a=b").unwrap(),
            ("rule".to_string(), "a=b".to_string())
        );
    }
}
