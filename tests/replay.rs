mod common;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::Lab;
use pcap_replayer::capture::finder::Finder;
use pcap_replayer::control::cancel::RunControl;
use pcap_replayer::models::job::{Command, CommandKind, Job};
use pcap_replayer::models::modifier::ModifierSpec;
use pcap_replayer::scheduler::{self, RunContext};
use pcap_replayer::utils::error::AppError;

fn command(name: &str, kind: CommandKind, text: &str, finder: &Arc<Finder>) -> Command {
    Command {
        name: name.to_string(),
        text: text.to_string(),
        kind,
        directory: None,
        timeout: Duration::from_secs(10),
        vars: BTreeMap::new(),
        finder: Arc::clone(finder),
    }
}

fn job(finder: &Arc<Finder>, commands: Vec<Command>) -> Arc<Job> {
    Arc::new(Job {
        id: "replay".to_string(),
        name: "replay".to_string(),
        enabled: true,
        finder: Arc::clone(finder),
        commands,
    })
}

fn context(lab: &Lab, control: Arc<RunControl>, vars: &[(&str, &str)]) -> Arc<RunContext> {
    Arc::new(RunContext {
        tools: lab.tools.clone(),
        control,
        working_directory: lab.run.clone(),
        test_times: 1,
        concurrency_jobs: 2,
        concurrency_commands: 4,
        keep_data: false,
        show_command: true,
        show_stdout: true,
        vars: vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

#[tokio::test]
async fn pattern_selects_a_single_capture() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    lab.add_capture("other.pcap", 10);
    std::fs::write(lab.root.join("sample.txt"), b"not a capture").unwrap();

    let finder = lab.finder(&["sample*"]);
    assert_eq!(finder.discover(&lab.tools, true).await.unwrap(), 1);

    let captures = finder.captures();
    assert_eq!(captures[0].record.relative_path, PathBuf::from("sample.pcap"));
    assert_eq!(captures[0].record.base_name, "sample.pcap");
    let staged = captures[0].staged().expect("staged during discovery");
    assert_eq!(staged.info.packet_count, 10);
    assert!(!staged.has_ipv6);
    assert!(staged.base_copy.is_file());
}

#[tokio::test]
async fn nothing_matched_is_a_discovery_error() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);

    let finder = lab.finder(&["missing*"]);
    let err = finder.discover(&lab.tools, false).await.unwrap_err();
    assert!(matches!(err, AppError::DiscoveryError(_)), "{}", err);
    assert!(finder.captures().is_empty());
}

#[tokio::test]
async fn failing_tool_rejects_the_capture() {
    let lab = Lab::with_editcap("exit 1");
    lab.add_capture("sample.pcap", 10);

    let finder = lab.finder(&[]);
    assert!(finder.discover(&lab.tools, true).await.is_err());
}

#[tokio::test]
async fn staging_runs_each_tool_once() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    let finder = lab.finder(&[]);
    finder.discover(&lab.tools, false).await.unwrap();

    let tools = ["capinfos", "editcap", "tcpdump", "tcpprep", "tcprewrite"];
    let before: Vec<usize> = tools.iter().map(|t| lab.calls(t)).collect();
    assert_eq!(before, vec![2, 1, 1, 1, 1]);

    let capture = &finder.captures()[0];
    let first = capture.stage(&finder, &lab.tools).await.unwrap();
    let second = capture.stage(&finder, &lab.tools).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let after: Vec<usize> = tools.iter().map(|t| lab.calls(t)).collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn keep_ip_skips_endpoint_rewriting() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    let modifier = ModifierSpec {
        keep_ip: true,
        adjust_time: false,
        ..ModifierSpec::default()
    };
    let finder = lab.finder_with(&[], modifier);
    finder.discover(&lab.tools, false).await.unwrap();

    let capture = &finder.captures()[0];
    let path = capture.generate(&finder, &lab.tools).await.unwrap();
    assert!(path.is_file());
    for tool in ["editcap", "tcpdump", "tcpprep", "tcprewrite"] {
        assert_eq!(lab.calls(tool), 0, "{} should not run", tool);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generation_yields_unique_files() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    let finder = lab.finder(&[]);
    finder.discover(&lab.tools, false).await.unwrap();
    let capture = finder.captures()[0].clone();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let finder = Arc::clone(&finder);
        let capture = Arc::clone(&capture);
        let tools = lab.tools.clone();
        handles.push(tokio::spawn(async move {
            capture.generate(&finder, &tools).await
        }));
    }

    let mut paths = HashSet::new();
    for handle in handles {
        let path = handle.await.unwrap().unwrap();
        assert!(path.is_file(), "{} missing", path.display());
        paths.insert(path);
    }
    assert_eq!(paths.len(), 100);
    assert_eq!(capture.generated(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shell_command_finishes_before_captures_start() {
    let lab = Lab::new();
    for name in ["a.pcap", "b.pcap", "c.pcap"] {
        lab.add_capture(name, 10);
    }
    let finder = lab.finder(&[]);
    finder.discover(&lab.tools, false).await.unwrap();

    let job = job(
        &finder,
        vec![
            command("prepare", CommandKind::Shell, "sleep 0.3", &finder),
            command("replay", CommandKind::PerCapture, "test -f {{ path }}", &finder),
        ],
    );
    let report = scheduler::run(context(&lab, Arc::new(RunControl::new()), &[]), vec![job]).await;

    assert_eq!(report.total(), 4);
    assert_eq!(report.succeeded(), 4);
    assert!(report.completed());
    let prepared = report
        .executions
        .iter()
        .find(|e| e.command == "prepare")
        .unwrap()
        .finished;
    for replay in report.executions.iter().filter(|e| e.command == "replay") {
        assert!(replay.started >= prepared, "{} started too early", replay.label);
    }
}

#[tokio::test]
async fn user_vars_override_command_vars() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    let finder = lab.finder(&[]);
    finder.discover(&lab.tools, false).await.unwrap();

    let out = lab.dir.path().join("out.txt");
    let mut replay = command(
        "replay",
        CommandKind::PerCapture,
        &format!(
            "echo {{{{ mark }}}} {{{{ relative_path }}}} {{{{ packet_count }}}} > {}",
            out.display()
        ),
        &finder,
    );
    replay.vars.insert("mark".to_string(), "command".to_string());

    let ctx = context(&lab, Arc::new(RunControl::new()), &[("mark", "user")]);
    let report = scheduler::run(ctx, vec![job(&finder, vec![replay])]).await;
    assert_eq!(report.succeeded(), 1);

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written.trim(), "user sample_000001.pcap 10");
    // the generated copy is gone once the command is done
    assert!(!finder.working_directory().join("sample_000001.pcap").exists());
}

#[tokio::test]
async fn slow_command_is_reported_as_timed_out() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    let finder = lab.finder(&[]);
    finder.discover(&lab.tools, false).await.unwrap();

    let mut slow = command("slow", CommandKind::Shell, "sleep 5", &finder);
    slow.timeout = Duration::from_millis(200);
    let report = scheduler::run(
        context(&lab, Arc::new(RunControl::new()), &[]),
        vec![job(&finder, vec![slow])],
    )
    .await;

    assert_eq!(report.timed_out(), 1);
    assert_eq!(report.exit_code(false), 0);
    assert_eq!(report.exit_code(true), 1);
}

#[tokio::test]
async fn stopped_run_dispatches_nothing() {
    let lab = Lab::new();
    lab.add_capture("sample.pcap", 10);
    let finder = lab.finder(&[]);
    finder.discover(&lab.tools, false).await.unwrap();

    let control = Arc::new(RunControl::new());
    control.stop();
    let job = job(
        &finder,
        vec![command("replay", CommandKind::PerCapture, "true", &finder)],
    );
    let report = scheduler::run(context(&lab, control, &[]), vec![job]).await;

    assert!(report.cancelled);
    assert_eq!(report.total(), 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.exit_code(false), 1);
}
