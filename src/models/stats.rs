use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// One finished execution of a command
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// `[round/total] [Job] [Command] [Finder] [capture]` prefix
    pub label: String,

    pub job: String,

    pub command: String,

    pub round: usize,

    /// Relative path of the capture, for per-capture commands
    pub capture: Option<String>,

    pub started: DateTime<Utc>,

    pub finished: DateTime<Utc>,

    #[serde(with = "crate::utils::duration::serde_duration")]
    pub elapsed: Duration,

    pub succeeded: bool,

    pub timed_out: bool,
}

/// Outcome of a whole scheduler run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub executions: Vec<ExecutionRecord>,

    /// Units that were never dispatched because the run was cancelled
    pub skipped: usize,

    /// The run flag was cleared before every unit was dispatched
    pub cancelled: bool,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.executions.len()
    }

    pub fn succeeded(&self) -> usize {
        self.executions.iter().filter(|e| e.succeeded).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn timed_out(&self) -> usize {
        self.executions.iter().filter(|e| e.timed_out).count()
    }

    /// Whether every planned unit was dispatched
    pub fn completed(&self) -> bool {
        !self.cancelled && self.skipped == 0
    }

    /// Process exit code for a drained run
    pub fn exit_code(&self, fail_on_command_error: bool) -> i32 {
        if !self.completed() || (fail_on_command_error && self.failed() > 0) {
            1
        } else {
            0
        }
    }

    pub fn merge(&mut self, other: RunReport) {
        self.executions.extend(other.executions);
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(succeeded: bool, timed_out: bool) -> ExecutionRecord {
        ExecutionRecord {
            label: "[1/1] [Job j] [Command c] [Finder default]".to_string(),
            job: "j".to_string(),
            command: "c".to_string(),
            round: 1,
            capture: None,
            started: Utc::now(),
            finished: Utc::now(),
            elapsed: Duration::from_millis(5),
            succeeded,
            timed_out,
        }
    }

    #[test]
    fn exit_code_policy() {
        let mut report = RunReport {
            executions: vec![record(true, false), record(false, true)],
            ..RunReport::default()
        };
        assert_eq!(report.failed(), 1);
        assert_eq!(report.timed_out(), 1);
        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 1);

        report.merge(RunReport {
            skipped: 2,
            cancelled: true,
            ..RunReport::default()
        });
        assert!(!report.completed());
        assert_eq!(report.exit_code(false), 1);
    }
}
