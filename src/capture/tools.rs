use log::debug;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::models::capture_info::CaptureInfo;
use crate::models::config::ToolPaths;
use crate::utils::error::AppResult;
use crate::utils::exec::Executor;
use crate::utils::fs::Scratch;

/// The external capture tools, run through the shared executor with the
/// default command timeout.
#[derive(Debug, Clone)]
pub struct Toolbox {
    paths: ToolPaths,
    executor: Arc<Executor>,
    timeout: Duration,
}

fn arg(prefix: &str, path: &Path) -> OsString {
    let mut out = OsString::from(prefix);
    out.push(path.as_os_str());
    out
}

impl Toolbox {
    pub fn new(paths: ToolPaths, executor: Arc<Executor>, timeout: Duration) -> Self {
        Self {
            paths,
            executor,
            timeout,
        }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, program: &Path, args: Vec<OsString>) -> AppResult<String> {
        let output = self
            .executor
            .run_program(program, args, None, self.timeout)
            .await?;
        debug!("{} finished in {:?}", output.command, output.elapsed);
        output.into_result()
    }

    /// `capinfos` report of `file`
    pub async fn capture_info(&self, file: &Path) -> AppResult<CaptureInfo> {
        let mut args: Vec<OsString> = ["-M", "-t", "-E", "-c", "-u", "-a", "-e", "-z", "-x", "-S"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(file.into());
        let report = self.run(&self.paths.capinfos, args).await?;
        Ok(CaptureInfo::parse(&report))
    }

    /// Keep only packets matching a display filter
    pub async fn read_filter(
        &self,
        src: &Path,
        dst: &Path,
        filter: &str,
        pcapng: bool,
    ) -> AppResult<()> {
        let format = if pcapng { "pcapng" } else { "pcap" };
        let args = vec![
            OsString::from("-r"),
            src.into(),
            "-2".into(),
            "-R".into(),
            filter.into(),
            "-F".into(),
            format.into(),
            "-w".into(),
            dst.into(),
        ];
        self.run(&self.paths.tshark, args).await.map(drop)
    }

    /// Shift every timestamp by `seconds`
    pub async fn adjust_time(&self, src: &Path, dst: &Path, seconds: i64) -> AppResult<()> {
        let args = vec![
            OsString::from("-t"),
            seconds.to_string().into(),
            src.into(),
            dst.into(),
        ];
        self.run(&self.paths.editcap, args).await.map(drop)
    }

    /// Build the client/server split cache used by the endpoint rewriter
    pub async fn generate_cache(&self, src: &Path, cache: &Path) -> AppResult<()> {
        let args = vec![
            OsString::from("-a"),
            "client".into(),
            arg("--pcap=", src),
            arg("--cachefile=", cache),
            "--nonip".into(),
        ];
        self.run(&self.paths.tcpprep, args).await.map(drop)
    }

    /// Rewrite client and server addresses to `endpoints`
    pub async fn rewrite_endpoints(
        &self,
        src: &Path,
        dst: &Path,
        cache: &Path,
        endpoints: &str,
    ) -> AppResult<()> {
        let args = vec![
            OsString::from("--fixcsum"),
            arg("--infile=", src),
            arg("--outfile=", dst),
            "--skipbroadcast".into(),
            arg("--cachefile=", cache),
            format!("--endpoints={}", endpoints).into(),
        ];
        self.run(&self.paths.tcprewrite, args).await.map(drop)
    }

    /// Whether `src` contains at least one IPv6 packet.
    ///
    /// `scratch` receives the first IPv6 packet and is removed afterwards.
    pub async fn has_ipv6(&self, src: &Path, scratch: &Path) -> AppResult<bool> {
        let first_ipv6 = Scratch::new(scratch.to_path_buf(), false);
        let args = vec![
            OsString::from("-r"),
            src.into(),
            "-w".into(),
            first_ipv6.path().into(),
            "-c".into(),
            "1".into(),
            "ip6".into(),
        ];
        self.run(&self.paths.tcpdump, args).await?;
        let info = self.capture_info(first_ipv6.path()).await?;
        Ok(info.packet_count > 0)
    }
}
