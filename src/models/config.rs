use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::filter::FinderSpec;
use crate::models::job::JobSpec;
use crate::models::modifier::ModifierSpec;
use crate::utils::error::{AppError, AppResult};
use crate::utils::fs::absolute;

/// Prefix of per-run working directories and daemon log files
pub const RUN_PREFIX: &str = "pcap-replayer";

/// Search directory of the `default` finder
pub const DEFAULT_FINDER_DIRECTORY: &str = "/data/.pcap-replayer/pcaps/";

/// Paths of the external programs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub bash: PathBuf,
    pub capinfos: PathBuf,
    pub editcap: PathBuf,
    pub tcpdump: PathBuf,
    pub tcprewrite: PathBuf,
    pub tcpprep: PathBuf,
    pub tshark: PathBuf,
    pub mergecap: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            bash: "bash".into(),
            capinfos: "capinfos".into(),
            editcap: "editcap".into(),
            tcpdump: "tcpdump".into(),
            tcprewrite: "tcprewrite".into(),
            tcpprep: "tcpprep".into(),
            tshark: "tshark".into(),
            mergecap: "mergecap".into(),
        }
    }
}

impl ToolPaths {
    fn entries(&self) -> [(&'static str, &PathBuf); 8] {
        [
            ("bash", &self.bash),
            ("capinfos", &self.capinfos),
            ("editcap", &self.editcap),
            ("tcpdump", &self.tcpdump),
            ("tcprewrite", &self.tcprewrite),
            ("tcpprep", &self.tcpprep),
            ("tshark", &self.tshark),
            ("mergecap", &self.mergecap),
        ]
    }

    /// Resolve bare names through `PATH` and check every tool is a file
    pub fn resolve(&self) -> AppResult<Self> {
        let one = |name: &str, path: &Path| -> AppResult<PathBuf> {
            let text = path.to_string_lossy();
            let resolved = if text.contains('/') || text.starts_with('~') {
                absolute(&text)?
            } else {
                which::which(path).map_err(|e| {
                    AppError::ToolError(format!("{} ({}) not found in PATH: {}", name, text, e))
                })?
            };
            if !resolved.exists() {
                return Err(AppError::ToolError(format!(
                    "{} does not exist at {}",
                    name,
                    resolved.display()
                )));
            }
            if resolved.is_dir() {
                return Err(AppError::ToolError(format!(
                    "{} at {} is a directory",
                    name,
                    resolved.display()
                )));
            }
            Ok(resolved)
        };

        Ok(Self {
            bash: one("bash", &self.bash)?,
            capinfos: one("capinfos", &self.capinfos)?,
            editcap: one("editcap", &self.editcap)?,
            tcpdump: one("tcpdump", &self.tcpdump)?,
            tcprewrite: one("tcprewrite", &self.tcprewrite)?,
            tcpprep: one("tcpprep", &self.tcpprep)?,
            tshark: one("tshark", &self.tshark)?,
            mergecap: one("mergecap", &self.mergecap)?,
        })
    }

    /// Tool paths keyed by tool name, the default template layer
    pub fn as_vars(&self) -> Vec<(String, String)> {
        self.entries()
            .iter()
            .map(|(name, path)| (name.to_string(), path.to_string_lossy().into_owned()))
            .collect()
    }
}

/// The `[config]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Jobs running at the same time
    pub concurrency_jobs: usize,

    /// Commands running at the same time within one job
    pub concurrency_commands: usize,

    /// Rounds of every enabled job
    pub test_times: usize,

    /// Maximum run time, zero for unlimited
    #[serde(with = "crate::utils::duration::serde_duration")]
    pub duration: Duration,

    /// Default timeout of a single command
    #[serde(with = "crate::utils::duration::serde_duration")]
    pub command_timeout: Duration,

    /// Parent of the per-run working directory
    pub temporary_directory: String,

    /// Selected job ids, `all` selects every job
    pub jobs: Vec<String>,

    /// User template variables
    pub vars: BTreeMap<String, String>,

    pub keep_data: bool,

    /// Make any failed command fail the whole run
    pub fail_on_command_error: bool,

    pub daemon: bool,

    /// Set on the re-executed background child only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pingback: Option<String>,

    pub fast_copy: Option<String>,
    pub fast_merge: Option<String>,

    pub debug: bool,
    pub quiet: bool,
    pub just_show_jobs: bool,
    pub just_show_pcaps: bool,
    pub show_command: bool,
    pub show_stdout: bool,
    pub show_why: bool,

    pub tool: ToolPaths,

    /// Overrides of the `default` modifier
    pub modifier: ModifierSpec,

    /// Overrides of the `default` finder
    pub finder: FinderSpec,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            concurrency_jobs: 1,
            concurrency_commands: 6,
            test_times: 1,
            duration: Duration::ZERO,
            command_timeout: Duration::from_secs(30),
            temporary_directory: "/data/.pcap-replayer/history/".to_string(),
            jobs: Vec::new(),
            vars: BTreeMap::new(),
            keep_data: false,
            fail_on_command_error: false,
            daemon: false,
            pingback: None,
            fast_copy: None,
            fast_merge: None,
            debug: false,
            quiet: false,
            just_show_jobs: false,
            just_show_pcaps: false,
            show_command: false,
            show_stdout: false,
            show_why: false,
            tool: ToolPaths::default(),
            modifier: ModifierSpec {
                id: "default".to_string(),
                ..ModifierSpec::default()
            },
            finder: FinderSpec {
                id: "default".to_string(),
                directory: DEFAULT_FINDER_DIRECTORY.to_string(),
                ..FinderSpec::default()
            },
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub config: GeneralConfig,
    pub modifiers: Vec<ModifierSpec>,
    pub finders: Vec<FinderSpec>,
    pub jobs: Vec<JobSpec>,
}

impl FileConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".pcap-replayer.toml"))
    }

    pub fn from_toml(text: &str) -> AppResult<Self> {
        let mut parsed: FileConfig = toml::from_str(text)?;
        // the sections always describe the default profiles
        parsed.config.modifier.id = "default".to_string();
        parsed.config.finder.id = "default".to_string();
        if parsed.config.finder.directory.trim().is_empty() {
            parsed.config.finder.directory = DEFAULT_FINDER_DIRECTORY.to_string();
        }
        Ok(parsed)
    }

    /// Load `path`; a missing file is an error only when `required`
    pub fn load(path: &Path, required: bool) -> AppResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                Ok(Self::default())
            }
            Err(e) => Err(AppError::ConfigError(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Validated run-wide settings
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub concurrency_jobs: usize,
    pub concurrency_commands: usize,
    pub test_times: usize,
    pub duration: Option<Duration>,
    pub command_timeout: Duration,
    pub temporary_directory: PathBuf,
    /// Exclusive to this process, removed on exit unless `keep_data`
    pub working_directory: PathBuf,
    pub selected_jobs: Vec<String>,
    pub vars: BTreeMap<String, String>,
    pub keep_data: bool,
    pub fail_on_command_error: bool,
    pub daemon: bool,
    pub pingback: Option<SocketAddr>,
    pub fast_copy: Option<PathBuf>,
    pub fast_merge: Option<PathBuf>,
    pub debug: bool,
    pub quiet: bool,
    pub just_show_jobs: bool,
    pub just_show_pcaps: bool,
    pub show_command: bool,
    pub show_stdout: bool,
    pub show_why: bool,
    pub started_at: DateTime<Local>,
}

impl RunSettings {
    /// Check `[config]` values and create the temporary directory
    pub fn validate(general: &GeneralConfig, started_at: DateTime<Local>) -> AppResult<Self> {
        let positive = |name: &str, value: usize| {
            if value == 0 {
                Err(AppError::ConfigError(format!("{} must be > 0", name)))
            } else {
                Ok(value)
            }
        };
        let concurrency_jobs = positive("concurrency_jobs", general.concurrency_jobs)?;
        let concurrency_commands =
            positive("concurrency_commands", general.concurrency_commands)?;
        let test_times = positive("test_times", general.test_times)?;
        if general.command_timeout.is_zero() {
            return Err(AppError::ConfigError("command_timeout must be > 0".to_string()));
        }

        let temporary_directory = absolute(&general.temporary_directory)?;
        if temporary_directory.exists() {
            if !temporary_directory.is_dir() {
                return Err(AppError::ConfigError(format!(
                    "temporary_directory {} is not a directory",
                    temporary_directory.display()
                )));
            }
        } else {
            std::fs::create_dir_all(&temporary_directory).map_err(|e| {
                AppError::ConfigError(format!(
                    "cannot create temporary_directory {}: {}",
                    temporary_directory.display(),
                    e
                ))
            })?;
        }
        let working_directory = temporary_directory.join(run_name(started_at));

        let pingback = match general.pingback.as_deref().filter(|p| !p.is_empty()) {
            Some(addr) => Some(addr.parse::<SocketAddr>().map_err(|e| {
                AppError::ConfigError(format!("pingback address {}: {}", addr, e))
            })?),
            None => None,
        };
        let optional_path = |value: &Option<String>| -> AppResult<Option<PathBuf>> {
            match value.as_deref().filter(|v| !v.trim().is_empty()) {
                Some(v) => Ok(Some(absolute(v)?)),
                None => Ok(None),
            }
        };

        Ok(Self {
            concurrency_jobs,
            concurrency_commands,
            test_times,
            duration: Some(general.duration).filter(|d| !d.is_zero()),
            command_timeout: general.command_timeout,
            temporary_directory,
            working_directory,
            selected_jobs: general.jobs.clone(),
            vars: general.vars.clone(),
            keep_data: general.keep_data,
            fail_on_command_error: general.fail_on_command_error,
            daemon: general.daemon,
            pingback,
            fast_copy: optional_path(&general.fast_copy)?,
            fast_merge: optional_path(&general.fast_merge)?,
            debug: general.debug,
            quiet: general.quiet,
            just_show_jobs: general.just_show_jobs,
            just_show_pcaps: general.just_show_pcaps,
            show_command: general.show_command,
            show_stdout: general.show_stdout,
            show_why: general.show_why,
            started_at,
        })
    }

    /// Log file of a background child, next to its working directory
    pub fn daemon_log_path(&self) -> PathBuf {
        self.working_directory.with_extension("log")
    }

    /// Whether `id` is picked by the job selection
    pub fn selects(&self, id: &str) -> bool {
        self.selected_jobs.iter().any(|j| j == id || j == "all")
    }
}

/// `pcap-replayer-<YYYY_MM_DD_HH_MM_SS>-<pid>`
pub fn run_name(started_at: DateTime<Local>) -> String {
    format!(
        "{}-{}-{}",
        RUN_PREFIX,
        started_at.format("%Y_%m_%d_%H_%M_%S"),
        std::process::id()
    )
}
