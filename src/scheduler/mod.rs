//! Two-level worker pools: job instances (round x job) in the outer pool,
//! the executions of one command in a per-job inner pool.

pub mod real;

use log::{error, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::capture::tools::Toolbox;
use crate::control::cancel::RunControl;
use crate::models::config::RunSettings;
use crate::models::job::Job;
use crate::models::stats::RunReport;
use crate::scheduler::real::RealJob;

/// Shared, read-only state of one scheduler run
#[derive(Debug)]
pub struct RunContext {
    pub tools: Toolbox,
    pub control: Arc<RunControl>,
    /// The per-run working directory
    pub working_directory: PathBuf,
    pub test_times: usize,
    pub concurrency_jobs: usize,
    pub concurrency_commands: usize,
    pub keep_data: bool,
    pub show_command: bool,
    pub show_stdout: bool,
    /// User template variables
    pub vars: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(settings: &RunSettings, tools: Toolbox, control: Arc<RunControl>) -> Self {
        Self {
            tools,
            control,
            working_directory: settings.working_directory.clone(),
            test_times: settings.test_times,
            concurrency_jobs: settings.concurrency_jobs,
            concurrency_commands: settings.concurrency_commands,
            keep_data: settings.keep_data,
            show_command: settings.show_command,
            show_stdout: settings.show_stdout,
            vars: settings.vars.clone(),
        }
    }
}

/// Width of the outer pool
pub fn outer_width(concurrency_jobs: usize, rounds: usize, jobs: usize) -> usize {
    concurrency_jobs.min(rounds * jobs).max(1)
}

/// Run every round of every job and wait for all of them.
///
/// Nothing new is dispatched once the run flag is cleared; whatever is
/// already running finishes and is reported.
pub async fn run(ctx: Arc<RunContext>, jobs: Vec<Arc<Job>>) -> RunReport {
    let mut report = RunReport::default();
    let planned = ctx.test_times * jobs.len();
    if planned == 0 {
        return report;
    }

    let start = Instant::now();
    let pool = Arc::new(Semaphore::new(outer_width(
        ctx.concurrency_jobs,
        ctx.test_times,
        jobs.len(),
    )));
    let mut set = JoinSet::new();
    let mut dispatched = 0;

    'rounds: for round in 1..=ctx.test_times {
        for job in &jobs {
            let permit = match Arc::clone(&pool).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break 'rounds,
            };
            if !ctx.control.is_running() {
                break 'rounds;
            }
            let real = RealJob::new(Arc::clone(job), round, ctx.test_times);
            let ctx = Arc::clone(&ctx);
            set.spawn(async move {
                let _permit = permit;
                real.run(&ctx).await
            });
            dispatched += 1;
        }
    }

    if dispatched < planned {
        warn!(
            "run stopped, {} of {} job rounds not started",
            planned - dispatched,
            planned
        );
        report.cancelled = true;
        report.skipped += planned - dispatched;
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(job_report) => report.merge(job_report),
            Err(e) => error!("job task panicked: {}", e),
        }
    }

    info!(
        "{} executions in {:?}: {} succeeded, {} failed, {} timed out",
        report.total(),
        start.elapsed(),
        report.succeeded(),
        report.failed(),
        report.timed_out()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::outer_width;

    #[test]
    fn outer_pool_never_exceeds_instances() {
        assert_eq!(outer_width(4, 1, 2), 2);
        assert_eq!(outer_width(1, 10, 5), 1);
        assert_eq!(outer_width(8, 3, 2), 6);
        assert_eq!(outer_width(3, 0, 0), 1);
    }
}
