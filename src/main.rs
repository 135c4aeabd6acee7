use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;

use pcap_replayer::capture::tools::Toolbox;
use pcap_replayer::catalog::Catalog;
use pcap_replayer::cli::Args;
use pcap_replayer::control::cancel::{watch_duration, watch_signals, RunControl};
use pcap_replayer::control::daemon::{send_confirmation, start_daemon};
use pcap_replayer::control::workspace::Workspace;
use pcap_replayer::control::Terminator;
use pcap_replayer::models::config::{FileConfig, RunSettings};
use pcap_replayer::scheduler::{self, RunContext};
use pcap_replayer::utils::exec::Executor;
use pcap_replayer::utils::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let started = Instant::now();
    let args = Args::parse();

    let mut file = match args.config_path() {
        Some((path, required)) => FileConfig::load(&path, required)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FileConfig::default(),
    };
    args.apply(&mut file);

    let general = &file.config;
    let level = logging::resolve_level(general.debug, general.quiet, args.log_level.as_deref());
    let settings = match RunSettings::validate(general, Local::now()) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init_logger(level);
            error!("{}", e);
            std::process::exit(1);
        }
    };

    // the background child confirms first, then logs to its own file
    if let Some(addr) = settings.pingback {
        send_confirmation(tokio::io::stdin(), addr).await?;
        logging::init_file_logger(level, &settings.daemon_log_path())?;
        info!("logging to {}", settings.daemon_log_path().display());
    } else {
        logging::init_logger(level);
    }
    info!("Starting pcap-replayer v{}", env!("CARGO_PKG_VERSION"));

    let code = match run(&file, &settings).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    info!("done in {:?}", started.elapsed());
    std::process::exit(code);
}

async fn run(file: &FileConfig, settings: &RunSettings) -> Result<i32> {
    let tools = file.config.tool.resolve()?;
    let executor = Arc::new(Executor::new());
    let toolbox = Toolbox::new(tools, Arc::clone(&executor), settings.command_timeout);
    let catalog = Catalog::resolve(file, settings)?;

    if settings.debug {
        info!(
            "resolved configuration:\n{}",
            serde_json::to_string_pretty(&catalog.describe())?
        );
    }

    let jobs = catalog.enabled_jobs();
    if jobs.is_empty() {
        let ids: Vec<_> = catalog.jobs.iter().map(|j| j.id.as_str()).collect();
        error!("no job selected, available jobs: {}", ids.join(", "));
        return Ok(1);
    }

    if settings.just_show_jobs {
        for job in &jobs {
            info!("{} {} uses {}", job, job.name, job.finder);
            for command in &job.commands {
                info!(
                    "{} [Command {}] {} via {}: {}",
                    job, command.name, command.kind, command.finder, command.text
                );
            }
        }
        return Ok(0);
    }

    let control = Arc::new(RunControl::new());
    let workspace = Arc::new(Workspace::create(
        settings.working_directory.clone(),
        settings.keep_data,
    )?);
    let terminator = Arc::new(Terminator::new(
        Arc::clone(&control),
        Arc::clone(&executor),
        Arc::clone(&workspace),
    ));
    watch_signals(Arc::clone(&terminator), settings.command_timeout)?;

    for finder in catalog.used_finders() {
        if let Err(e) = finder.discover(&toolbox, settings.show_why).await {
            error!("{}", e);
            workspace.cleanup();
            return Ok(1);
        }
    }

    if settings.just_show_pcaps {
        for finder in catalog.used_finders() {
            for capture in finder.captures() {
                info!("{} {}", finder, capture);
            }
        }
        workspace.cleanup();
        return Ok(0);
    }

    if settings.daemon && settings.pingback.is_none() {
        workspace.cleanup();
        let pid = start_daemon().await?;
        println!(
            "pcap-replayer is running in the background (pid={}), logging under {}",
            pid,
            settings.temporary_directory.display()
        );
        return Ok(0);
    }

    if let Some(limit) = settings.duration {
        info!("run time limited to {:?}", limit);
        watch_duration(Arc::clone(&terminator), limit);
    }

    let ctx = Arc::new(RunContext::new(settings, toolbox, Arc::clone(&control)));
    let report = scheduler::run(ctx, jobs).await;
    if report.cancelled {
        warn!("run cancelled, {} executions skipped", report.skipped);
    }
    workspace.cleanup_after_drain(report.cancelled).await;
    Ok(report.exit_code(settings.fail_on_command_error))
}
