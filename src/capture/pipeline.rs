use chrono::Utc;
use log::debug;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::finder::Finder;
use crate::capture::tools::Toolbox;
use crate::capture::transform::{convert_file, shuffle_file};
use crate::models::capture_info::{CaptureInfo, InfoErrors};
use crate::models::modifier::Modifier;
use crate::models::record::CaptureRecord;
use crate::utils::error::{AppError, AppResult};
use crate::utils::fs::{sibling_with_step, Scratch};
use crate::utils::stage::StageCell;

/// Artifacts of the one-time staging of a capture
#[derive(Debug, Clone)]
pub struct CaptureStage {
    pub info: CaptureInfo,

    /// `<finder working dir>/<relative dir>`
    pub working_directory: PathBuf,

    /// Private copy every generation starts from
    pub base_copy: PathBuf,

    /// Client/server split cache, when endpoints are rewritten
    pub cache: Option<PathBuf>,

    pub has_ipv6: bool,
}

/// One matched capture and its mutation state
pub struct Capture {
    pub record: CaptureRecord,

    /// Metrics already collected during discovery
    preset_info: Option<CaptureInfo>,

    counter: AtomicU64,

    stage: StageCell<CaptureStage>,
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("record", &self.record)
            .field("generated", &self.generated())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Pcap-{}]", self.record.relative_str())
    }
}

/// Seconds to add to every timestamp so the capture ends "now", minus the
/// modifier's offset.
pub fn time_shift(info: &CaptureInfo, modifier: &Modifier) -> Option<i64> {
    let last = info.last_packet_time?;
    let offset = i64::try_from(modifier.time_offset.as_secs()).unwrap_or(i64::MAX);
    Some(
        Utc::now()
            .signed_duration_since(last)
            .num_seconds()
            .saturating_sub(offset),
    )
}

/// Keep timeouts and tool failures as they are, wrap everything else
fn step_failed(step: &str, e: AppError) -> AppError {
    match e {
        AppError::ExecutionError { .. } | AppError::TimeoutError { .. } => e,
        AppError::TransformError(msg) => AppError::TransformError(format!("{}: {}", step, msg)),
        other => AppError::TransformError(format!("{}: {}", step, other)),
    }
}

/// Move a finished step over the working file
async fn promote(step: Scratch, working: &Scratch) -> AppResult<()> {
    tokio::fs::rename(step.path(), working.path()).await?;
    step.persist();
    Ok(())
}

impl Capture {
    pub fn new(record: CaptureRecord, preset_info: Option<CaptureInfo>) -> Self {
        Self {
            record,
            preset_info,
            counter: AtomicU64::new(0),
            stage: StageCell::new(),
        }
    }

    /// Number of generated copies so far
    pub fn generated(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Staged artifacts, if staging already succeeded
    pub fn staged(&self) -> Option<Arc<CaptureStage>> {
        self.stage.get()
    }

    /// Run the one-time staging, or return its cached outcome
    pub async fn stage(&self, finder: &Finder, tools: &Toolbox) -> AppResult<Arc<CaptureStage>> {
        self.stage
            .get_or_stage(|| self.run_stage(finder, tools))
            .await
    }

    async fn run_stage(&self, finder: &Finder, tools: &Toolbox) -> AppResult<CaptureStage> {
        let staged_finder = finder.stage().await?;
        let record = &self.record;
        let modifier = &finder.modifier;

        let info = match &self.preset_info {
            Some(info) => info.clone(),
            None => tools.capture_info(&record.path).await?,
        };

        let working_directory = if record.relative_dir == Path::new(".") {
            staged_finder.working_directory.clone()
        } else {
            staged_finder.working_directory.join(&record.relative_dir)
        };
        tokio::fs::create_dir_all(&working_directory).await?;
        let base_copy = working_directory.join(&record.base_name);
        tokio::fs::copy(&record.path, &base_copy).await?;

        let scratch = |step: &str| {
            Scratch::new(
                sibling_with_step(&working_directory, &record.name, step, &record.ext),
                false,
            )
        };

        if modifier.adjust_time {
            if info.errors.contains(InfoErrors::LAST_PACKET_TIME) {
                return Err(AppError::StagingError(
                    "last packet time unavailable, cannot adjust time".to_string(),
                ));
            }
            let shift = time_shift(&info, modifier).unwrap_or_default();
            let dry_run = scratch("adjust-time");
            tools.adjust_time(&base_copy, dry_run.path(), shift).await?;
        }

        if let Some(filter) = &finder.read_filter {
            let filtered = scratch("read-filter");
            tools
                .read_filter(&base_copy, filtered.path(), filter, self.is_pcapng(&info))
                .await?;
            let remaining = tools.capture_info(filtered.path()).await?;
            if remaining.packet_count <= 0 {
                return Err(AppError::StagingError(
                    "no packets left after read filter".to_string(),
                ));
            }
        }

        let has_ipv6 = if !modifier.keep_ip || finder.rules.only_ipv6 {
            let first_ipv6 = sibling_with_step(&working_directory, &record.name, "ipv6", &record.ext);
            tools.has_ipv6(&base_copy, &first_ipv6).await?
        } else {
            false
        };

        let cache = if modifier.keep_ip {
            None
        } else {
            let cache = working_directory.join(format!("{}.cache", record.name));
            tools.generate_cache(&base_copy, &cache).await?;
            let endpoints =
                modifier.random_endpoints(has_ipv6 || modifier.to_ipv6, &mut rand::thread_rng());
            let dry_run = scratch("modify-ip");
            tools
                .rewrite_endpoints(&base_copy, dry_run.path(), &cache, &endpoints)
                .await
                .map_err(|e| step_failed("endpoint rewrite", e))?;
            Some(cache)
        };

        debug!(
            "{} {} staged: {} packets, ipv6: {}",
            finder, self, info.packet_count, has_ipv6
        );
        Ok(CaptureStage {
            info,
            working_directory,
            base_copy,
            cache,
            has_ipv6,
        })
    }

    fn is_pcapng(&self, info: &CaptureInfo) -> bool {
        info.is_pcapng() || self.record.is_pcapng()
    }

    /// Produce a fresh mutated copy for one replay.
    ///
    /// Every call gets a distinct `<name>_<seq>` file. On failure no
    /// intermediate file is left behind.
    pub async fn generate(&self, finder: &Finder, tools: &Toolbox) -> AppResult<PathBuf> {
        let staged = self.stage(finder, tools).await?;
        let record = &self.record;
        let modifier = &finder.modifier;
        let dir = &staged.working_directory;

        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let stem = format!("{}_{:06}", record.name, seq);
        let working = Scratch::new(dir.join(format!("{}{}", stem, record.ext)), false);
        tokio::fs::copy(&staged.base_copy, working.path()).await?;
        let step = |name: &str| Scratch::new(sibling_with_step(dir, &stem, name, &record.ext), false);

        // any of these invalidates the staged client/server cache
        let mut reshaped = false;

        if let Some(filter) = &modifier.read_filter {
            let out = step("rf");
            tools
                .read_filter(working.path(), out.path(), filter, self.is_pcapng(&staged.info))
                .await
                .map_err(|e| step_failed("read filter", e))?;
            promote(out, &working).await?;
            reshaped = true;
        }

        if modifier.to_ipv6 {
            let out = step("p426");
            let (src, dst) = (working.path().to_path_buf(), out.path().to_path_buf());
            let stats = tokio::task::spawn_blocking(move || convert_file(&src, &dst))
                .await
                .map_err(|e| AppError::TransformError(format!("ipv6 conversion: {}", e)))?
                .map_err(|e| step_failed("ipv6 conversion", e))?;
            debug!(
                "{} {} converted {} packets, {} unchanged",
                finder, self, stats.converted, stats.unchanged
            );
            promote(out, &working).await?;
            reshaped = true;
        }

        if modifier.shuffle.is_enabled() {
            let out = step("shuffle");
            let (src, dst) = (working.path().to_path_buf(), out.path().to_path_buf());
            let options = modifier.shuffle;
            tokio::task::spawn_blocking(move || {
                shuffle_file(&src, &dst, options, &mut rand::thread_rng())
            })
            .await
            .map_err(|e| AppError::TransformError(format!("shuffle: {}", e)))?
            .map_err(|e| step_failed("shuffle", e))?;
            promote(out, &working).await?;
            reshaped = true;
        }

        if modifier.adjust_time {
            let out = step("adjust-time");
            let shift = time_shift(&staged.info, modifier).unwrap_or_default();
            tools
                .adjust_time(working.path(), out.path(), shift)
                .await
                .map_err(|e| step_failed("adjust time", e))?;
            promote(out, &working).await?;
        }

        if !modifier.keep_ip {
            let fresh_cache;
            let cache = match (&staged.cache, reshaped) {
                (Some(cache), false) => cache.as_path(),
                _ => {
                    fresh_cache = Scratch::new(dir.join(format!("{}.cache", stem)), false);
                    tools
                        .generate_cache(working.path(), fresh_cache.path())
                        .await
                        .map_err(|e| step_failed("cache generation", e))?;
                    fresh_cache.path()
                }
            };
            let endpoints = modifier
                .random_endpoints(staged.has_ipv6 || modifier.to_ipv6, &mut rand::thread_rng());
            let out = step("modify-ip");
            tools
                .rewrite_endpoints(working.path(), out.path(), cache, &endpoints)
                .await
                .map_err(|e| step_failed("endpoint rewrite", e))?;
            promote(out, &working).await?;
        }

        Ok(working.persist())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::modifier::ModifierSpec;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[test]
    fn shift_brings_last_packet_to_now() {
        let mut info = CaptureInfo::default();
        assert_eq!(time_shift(&info, &Modifier::from_spec(&ModifierSpec::default()).unwrap()), None);

        info.last_packet_time = Some(Utc::now() - ChronoDuration::seconds(3600));
        let modifier = Modifier::from_spec(&ModifierSpec::default()).unwrap();
        let shift = time_shift(&info, &modifier).unwrap();
        assert!((3599..=3601).contains(&shift), "{}", shift);

        let offset = Modifier::from_spec(&ModifierSpec {
            time_offset: Duration::from_secs(600),
            ..ModifierSpec::default()
        })
        .unwrap();
        let shift = time_shift(&info, &offset).unwrap();
        assert!((2999..=3001).contains(&shift), "{}", shift);
    }

    #[test]
    fn tool_failures_keep_their_kind() {
        let timeout = AppError::TimeoutError {
            command: "x".to_string(),
            timeout: Duration::from_secs(1),
            output: String::new(),
        };
        assert!(step_failed("s", timeout).is_timeout());
        let io = AppError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(matches!(step_failed("s", io), AppError::TransformError(m) if m.starts_with("s: ")));
    }
}
