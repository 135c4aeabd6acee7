use chrono::Utc;
use log::{error, info, log_enabled, trace, Level};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::capture::pipeline::Capture;
use crate::models::job::{Command, CommandKind, Job};
use crate::models::record::CaptureRecord;
use crate::models::stats::{ExecutionRecord, RunReport};
use crate::scheduler::RunContext;
use crate::utils::error::AppResult;
use crate::utils::exec::{ExecOutput, ExecStatus};
use crate::utils::fs::Scratch;
use crate::utils::template::TemplateContext;

/// One round of one job
#[derive(Debug)]
pub struct RealJob {
    job: Arc<Job>,
    round: usize,
    total: usize,
}

/// How many executions `command` would produce right now
fn planned_units(command: &Command) -> usize {
    match command.kind {
        CommandKind::Shell => 1,
        CommandKind::PerCapture => command.finder.captures().len(),
    }
}

impl RealJob {
    pub fn new(job: Arc<Job>, round: usize, total: usize) -> Self {
        Self { job, round, total }
    }

    /// Run the commands in order. Every execution of a command finishes
    /// before the next command starts.
    pub async fn run(&self, ctx: &Arc<RunContext>) -> RunReport {
        let mut report = RunReport::default();
        let pool = Arc::new(Semaphore::new(ctx.concurrency_commands.max(1)));
        info!("[{}/{}] {} started", self.round, self.total, self.job);

        for (index, command) in self.job.commands.iter().enumerate() {
            if !ctx.control.is_running() {
                report.cancelled = true;
                report.skipped += self.job.commands[index..]
                    .iter()
                    .map(planned_units)
                    .sum::<usize>();
                break;
            }

            let captures: Vec<Option<Arc<Capture>>> = match command.kind {
                CommandKind::Shell => vec![None],
                CommandKind::PerCapture => command.finder.captures().into_iter().map(Some).collect(),
            };

            let mut set = JoinSet::new();
            for capture in captures {
                let permit = match Arc::clone(&pool).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                if !ctx.control.is_running() {
                    report.cancelled = true;
                    report.skipped += 1;
                    continue;
                }
                let unit = RealCommand {
                    job: Arc::clone(&self.job),
                    index,
                    round: self.round,
                    total: self.total,
                    capture,
                };
                let ctx = Arc::clone(ctx);
                set.spawn(async move {
                    let _permit = permit;
                    unit.run(&ctx).await
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(record) => report.executions.push(record),
                    Err(e) => error!("{} command task panicked: {}", self.job, e),
                }
            }
        }
        report
    }
}

/// One execution: a shell command, or a per-capture command on one capture
#[derive(Debug)]
pub struct RealCommand {
    job: Arc<Job>,
    index: usize,
    round: usize,
    total: usize,
    capture: Option<Arc<Capture>>,
}

impl RealCommand {
    fn command(&self) -> &Command {
        &self.job.commands[self.index]
    }

    /// `[round/total] [Job id] [Command name] [Finder id] [capture]`
    pub fn label(&self) -> String {
        let command = self.command();
        let mut label = format!(
            "[{}/{}] {} [Command {}] {}",
            self.round, self.total, self.job, command.name, command.finder
        );
        if let Some(capture) = &self.capture {
            label.push(' ');
            label.push_str(&capture.to_string());
        }
        label
    }

    pub async fn run(&self, ctx: &RunContext) -> ExecutionRecord {
        let label = self.label();
        let started = Utc::now();
        let clock = Instant::now();
        info!("{} executing", label);

        let (succeeded, timed_out) = match self.execute(ctx, &label).await {
            Ok(output) => {
                report_output(ctx, &label, &output);
                (output.succeeded(), output.status == ExecStatus::TimedOut)
            }
            Err(e) => {
                error!("{} failed after {:?}: {}", label, clock.elapsed(), e);
                (false, e.is_timeout())
            }
        };

        ExecutionRecord {
            label,
            job: self.job.id.clone(),
            command: self.command().name.clone(),
            round: self.round,
            capture: self
                .capture
                .as_ref()
                .map(|c| c.record.relative_str()),
            started,
            finished: Utc::now(),
            elapsed: clock.elapsed(),
            succeeded,
            timed_out,
        }
    }

    async fn execute(&self, ctx: &RunContext, label: &str) -> AppResult<ExecOutput> {
        let command = self.command();
        let finder = &command.finder;

        let mut template = TemplateContext::new()
            .layer(ctx.tools.paths().as_vars())
            .layer(command.vars.clone())
            .layer(ctx.vars.clone());
        template.set("working_directory", path_text(&ctx.working_directory));
        template.set("finder_directory", path_text(finder.working_directory()));

        // removed when this execution is done, unless data is kept
        let mut generated: Option<Scratch> = None;
        let default_directory = match &self.capture {
            None => ctx.working_directory.clone(),
            Some(capture) => {
                let path = capture.generate(finder, &ctx.tools).await?;
                let scratch = Scratch::new(path, ctx.keep_data);
                let record = CaptureRecord::parse(
                    scratch.path(),
                    finder.working_directory(),
                    finder.working_directory(),
                )?;
                let staged = capture.stage(finder, &ctx.tools).await?;
                let pcap_directory = record
                    .path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| finder.working_directory().to_path_buf());

                template.set("pcap_directory", path_text(&pcap_directory));
                template.set("relative_directory", path_text(&record.relative_dir));
                template.set("relative_path", path_text(&record.relative_path));
                template.set("path", path_text(&record.path));
                template.set("base_name", record.base_name.clone());
                template.set("name", record.name.clone());
                template.set("ext", record.ext.clone());
                template.set("has_ipv6", staged.has_ipv6.to_string());
                template.set("packet_count", staged.info.packet_count.to_string());
                generated = Some(scratch);
                finder.working_directory().to_path_buf()
            }
        };

        let script = template.render(&command.text)?;
        let directory = match &command.directory {
            Some(dir) => PathBuf::from(template.render(dir)?),
            None => default_directory,
        };
        if ctx.show_command {
            info!(
                "{} running `{}` in {} (timeout {:?})",
                label,
                script,
                directory.display(),
                command.timeout
            );
        }
        if log_enabled!(Level::Trace) {
            trace!("{} template: {:?}", label, template);
        }

        let output = ctx
            .tools
            .executor()
            .run_shell(
                &ctx.tools.paths().bash,
                &script,
                Some(&directory),
                command.timeout,
            )
            .await;
        drop(generated);
        output
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn report_output(ctx: &RunContext, label: &str, output: &ExecOutput) {
    match output.status {
        ExecStatus::Succeeded => {
            info!("{} succeeded in {:?}", label, output.elapsed);
            if ctx.show_stdout {
                info!("{} output is:\n{}", label, output.output);
            }
        }
        ExecStatus::Failed(code) => {
            let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            error!(
                "{} failed with exit {} in {:?}, output is:\n{}",
                label, code, output.elapsed, output.output
            );
        }
        ExecStatus::TimedOut => {
            error!(
                "{} timed out after {:?}, output is:\n{}",
                label, output.timeout, output.output
            );
        }
    }
}
