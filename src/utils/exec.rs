use log::{debug, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::utils::error::{AppError, AppResult};

/// How long to wait for output pipes after the process itself is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Terminal state of one process execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Succeeded,
    /// Exited non-zero, or was killed by a signal (`None`)
    Failed(Option<i32>),
    TimedOut,
}

/// Result of running one external process
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Display form of the command line
    pub command: String,

    /// Interleaved stdout and stderr, possibly partial on timeout
    pub output: String,

    pub status: ExecStatus,

    pub elapsed: Duration,

    pub timeout: Duration,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.status == ExecStatus::Succeeded
    }

    /// Convert into the combined output, or the matching execution error
    pub fn into_result(self) -> AppResult<String> {
        match self.status {
            ExecStatus::Succeeded => Ok(self.output),
            ExecStatus::Failed(_) => Err(AppError::ExecutionError {
                command: self.command,
                output: self.output,
            }),
            ExecStatus::TimedOut => Err(AppError::TimeoutError {
                command: self.command,
                timeout: self.timeout,
                output: self.output,
            }),
        }
    }
}

/// Spawns external processes in their own process group and tracks the
/// live groups so they can all be killed on forced termination.
#[derive(Debug, Default)]
pub struct Executor {
    live_groups: Mutex<HashSet<i32>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `program` with an argument vector
    pub async fn run_program<I, S>(
        &self,
        program: &Path,
        args: I,
        dir: Option<&Path>,
        timeout: Duration,
    ) -> AppResult<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let mut display = program.display().to_string();
        for arg in &args {
            display.push(' ');
            display.push_str(&arg.to_string_lossy());
        }

        let mut command = Command::new(program);
        command.args(&args);
        self.run(command, display, dir, timeout).await
    }

    /// Run `script` through `shell -c`
    pub async fn run_shell(
        &self,
        shell: &Path,
        script: &str,
        dir: Option<&Path>,
        timeout: Duration,
    ) -> AppResult<ExecOutput> {
        let mut command = Command::new(shell);
        command.arg("-c").arg(script);
        self.run(command, script.to_string(), dir, timeout).await
    }

    async fn run(
        &self,
        mut command: Command,
        display: String,
        dir: Option<&Path>,
        timeout: Duration,
    ) -> AppResult<ExecOutput> {
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!("spawning: {}", display);
        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| AppError::ExecutionError {
            command: display.clone(),
            output: format!("failed to spawn: {}", e),
        })?;

        let group = child.id().map(|pid| pid as i32);
        if let Some(group) = group {
            self.live_groups.lock().insert(group);
        }

        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, Arc::clone(&sink)));
        }

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => ExecStatus::Succeeded,
            Ok(Ok(status)) => ExecStatus::Failed(status.code()),
            Ok(Err(e)) => {
                warn!("waiting for `{}` failed: {}", display, e);
                ExecStatus::Failed(None)
            }
            Err(_) => {
                if let Some(group) = group {
                    kill_group(group);
                }
                let _ = child.kill().await;
                ExecStatus::TimedOut
            }
        };

        if let Some(group) = group {
            self.live_groups.lock().remove(&group);
        }
        for handle in pumps {
            let _ = tokio::time::timeout(DRAIN_GRACE, handle).await;
        }

        let output = String::from_utf8_lossy(&sink.lock()).into_owned();
        Ok(ExecOutput {
            command: display,
            output,
            status,
            elapsed: started.elapsed(),
            timeout,
        })
    }

    /// Number of process groups currently running
    pub fn live_count(&self) -> usize {
        self.live_groups.lock().len()
    }

    /// SIGKILL every live process group
    pub fn kill_all(&self) {
        let groups: Vec<i32> = self.live_groups.lock().drain().collect();
        for group in groups {
            kill_group(group);
        }
    }
}

fn kill_group(group: i32) {
    if let Err(e) = killpg(Pid::from_raw(group), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", group, e);
    }
}

fn pump<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
            }
        }
    })
}
