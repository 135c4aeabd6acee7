use futures::stream::{self, StreamExt};
use log::{info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

use crate::capture::pipeline::Capture;
use crate::capture::tools::Toolbox;
use crate::models::check_id;
use crate::models::filter::{FilterRules, FinderSpec};
use crate::models::modifier::Modifier;
use crate::models::record::CaptureRecord;
use crate::models::tags::{satisfies_any, TagEntry, TagManifest};
use crate::utils::error::{AppError, AppResult};
use crate::utils::fs::absolute;
use crate::utils::stage::StageCell;

/// Width of the discovery pool, independent of the scheduler's pools
pub const DISCOVERY_WORKERS: usize = 20;

/// Result of the one-time finder staging
#[derive(Debug)]
pub struct FinderStage {
    /// `<run working dir>/finder-<id>`
    pub working_directory: PathBuf,

    /// Loaded only when the finder filters by tags
    pub manifest: Option<TagManifest>,
}

/// A search root plus the predicates selecting captures under it
pub struct Finder {
    pub id: String,
    pub root: PathBuf,
    pub modifier: Arc<Modifier>,
    pub rules: FilterRules,
    /// Applied once at staging to make sure something survives it
    pub read_filter: Option<String>,
    working_directory: PathBuf,
    used: AtomicBool,
    stage: StageCell<FinderStage>,
    captures: Mutex<Vec<Arc<Capture>>>,
}

impl fmt::Debug for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finder")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("modifier", &self.modifier.id)
            .field("used", &self.is_used())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Finder {}]", self.id)
    }
}

impl Finder {
    /// Validate a configured finder against its resolved modifier
    pub fn from_spec(
        spec: &FinderSpec,
        modifier: Arc<Modifier>,
        run_directory: &Path,
    ) -> AppResult<Self> {
        check_id(&spec.id).map_err(|e| prefixed(&spec.id, e))?;
        if spec.directory.trim().is_empty() {
            return Err(prefixed(
                &spec.id,
                AppError::ConfigError("directory is empty".to_string()),
            ));
        }
        let root = absolute(spec.directory.trim())?;
        if !root.is_dir() {
            return Err(prefixed(
                &spec.id,
                AppError::ConfigError(format!("directory {} does not exist", root.display())),
            ));
        }
        let rules = FilterRules::from_spec(spec, &root)?;

        Ok(Self {
            id: spec.id.clone(),
            working_directory: run_directory.join(format!("finder-{}", spec.id)),
            root,
            modifier,
            rules,
            read_filter: spec.read_filter.clone().filter(|f| !f.trim().is_empty()),
            used: AtomicBool::new(false),
            stage: StageCell::new(),
            captures: Mutex::new(Vec::new()),
        })
    }

    /// `<run working dir>/finder-<id>`, created at staging
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn mark_used(&self) {
        self.used.store(true, Ordering::SeqCst);
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    /// Matched captures, sorted by relative path once discovery is done
    pub fn captures(&self) -> Vec<Arc<Capture>> {
        self.captures.lock().clone()
    }

    /// Create the working directory and load the tag manifest, once
    pub async fn stage(&self) -> AppResult<Arc<FinderStage>> {
        self.stage
            .get_or_stage(|| async {
                tokio::fs::create_dir_all(&self.working_directory).await?;
                let manifest = if self.rules.uses_tags() {
                    Some(TagManifest::load(&self.root)?)
                } else {
                    None
                };
                Ok(FinderStage {
                    working_directory: self.working_directory.clone(),
                    manifest,
                })
            })
            .await
    }

    /// Populate the capture list.
    ///
    /// A staging failure or an empty result is fatal for the run.
    pub async fn discover(&self, tools: &Toolbox, show_why: bool) -> AppResult<usize> {
        let start = Instant::now();
        let staged = self.stage().await.map_err(|e| {
            AppError::DiscoveryError(format!("{} initialization failed: {}", self, e))
        })?;
        info!("{} loading pcaps from {}", self, self.root.display());

        let candidates: Vec<(PathBuf, Option<TagEntry>)> = match &staged.manifest {
            Some(manifest) => manifest
                .entries()
                .map(|(relative, entry)| (self.root.join(relative), Some(entry.clone())))
                .filter(|(path, _)| path.is_file())
                .collect(),
            None => {
                let root = self.root.clone();
                let label = self.to_string();
                tokio::task::spawn_blocking(move || walk(&root, &label))
                    .await
                    .map_err(|e| AppError::DiscoveryError(format!("walk failed: {}", e)))?
                    .into_iter()
                    .map(|path| (path, None))
                    .collect()
            }
        };

        stream::iter(candidates)
            .for_each_concurrent(DISCOVERY_WORKERS, |(path, entry)| async move {
                if let Some(capture) = self.consider(&path, entry, tools, show_why).await {
                    self.captures.lock().push(Arc::new(capture));
                }
            })
            .await;

        let mut captures = self.captures.lock();
        captures.sort_by(|a, b| a.record.relative_path.cmp(&b.record.relative_path));
        if captures.is_empty() {
            return Err(AppError::DiscoveryError(format!("{} loaded 0 pcaps", self)));
        }
        info!(
            "{} loaded {} pcaps in {:?}",
            self,
            captures.len(),
            start.elapsed()
        );
        Ok(captures.len())
    }

    /// Apply every predicate in order; `None` when the file is rejected
    async fn consider(
        &self,
        path: &Path,
        entry: Option<TagEntry>,
        tools: &Toolbox,
        show_why: bool,
    ) -> Option<Capture> {
        let record = match CaptureRecord::parse(path, &self.root, &self.working_directory) {
            Ok(record) => record,
            Err(e) => {
                warn!("{} {}", self, e);
                return None;
            }
        };
        let why = |reason: String| {
            if show_why {
                warn!("{} [Pcap-{}] {}", self, record.relative_str(), reason);
            }
        };

        if let Some(problem) = record.suffix_problem() {
            why(problem);
            return None;
        }

        let target = match &entry {
            Some(entry) => entry.name.clone(),
            None => record.relative_str(),
        };
        if !self.rules.name_matches(&target) {
            why(format!("pattern not matched: {}", target));
            return None;
        }

        if self.rules.uses_tags() {
            let tags = entry.as_ref().map(|e| e.tags.as_slice()).unwrap_or(&[]);
            if !satisfies_any(tags, &self.rules.tag_combos) {
                why(format!("tags not matched: {:?}", tags));
                return None;
            }
        }

        let info = match tools.capture_info(&record.path).await {
            Ok(info) => info,
            Err(e) => {
                why(format!("capture info failed: {}", e));
                return None;
            }
        };
        if let Some(reason) = self.rules.metrics_violation(&info) {
            why(reason);
            return None;
        }

        let capture = Capture::new(record.clone(), Some(info));
        let staged = match capture.stage(self, tools).await {
            Ok(staged) => staged,
            Err(e) => {
                why(e.to_string());
                return None;
            }
        };
        if self.rules.only_ipv6 && !staged.has_ipv6 {
            why("contains no IPv6 packet".to_string());
            return None;
        }
        Some(capture)
    }
}

fn prefixed(id: &str, e: AppError) -> AppError {
    match e {
        AppError::ConfigError(msg) => AppError::ConfigError(format!("[Finder {}] {}", id, msg)),
        other => other,
    }
}

/// Every regular file under `root`; unreadable entries are logged and skipped
fn walk(root: &Path, label: &str) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
            Ok(_) => None,
            Err(e) => {
                warn!("{} cannot access {}", label, e);
                None
            }
        })
        .collect()
}
