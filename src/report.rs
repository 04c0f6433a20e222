//! Run results: per-task records, per-host state, totals and exit status
//!
//! Every string stored here has already passed through the host's redactor,
//! so the report can be printed or written to disk as is.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::playbook::HostState;

/// Process exit codes
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const HOST_FAILED: i32 = 2;
    pub const CONFIG_ERROR: i32 = 4;
    pub const INTERRUPTED: i32 = 130;
}

/// Result of one task execution on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Unchanged,
    Changed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskOutcome::Unchanged => "ok",
            TaskOutcome::Changed => "changed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// One line of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub play: String,
    pub task: String,
    /// Loop item label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub handler: bool,
    pub outcome: TaskOutcome,
    /// Failure or skip reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Failed with `ignore_errors: true`
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

/// Totals over a set of records; `ok` counts unchanged tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunStats {
    fn count(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Unchanged => self.ok += 1,
            TaskOutcome::Changed => self.changed += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
        }
    }

    fn add(&mut self, other: RunStats) {
        self.ok += other.ok;
        self.changed += other.changed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    pub host: String,
    pub state: HostState,
    pub tasks: Vec<TaskRecord>,
}

impl HostReport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: HostState::Pending,
            tasks: Vec::new(),
        }
    }

    pub fn stats(&self) -> RunStats {
        let mut stats = RunStats::default();
        for record in &self.tasks {
            stats.count(record.outcome);
        }
        stats
    }

    pub fn failed(&self) -> bool {
        self.state == HostState::Failed
    }

    /// Records of one task, in execution order
    pub fn records_for<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a TaskRecord> {
        self.tasks.iter().filter(move |r| r.task == task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub playbook: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub check_mode: bool,
    pub interrupted: bool,
    pub hosts: Vec<HostReport>,
    pub stats: RunStats,
}

impl RunReport {
    pub fn new(
        playbook: impl Into<String>,
        check_mode: bool,
        interrupted: bool,
        started_at: DateTime<Utc>,
        hosts: Vec<HostReport>,
    ) -> Self {
        let mut stats = RunStats::default();
        for host in &hosts {
            stats.add(host.stats());
        }
        Self {
            run_id: Uuid::new_v4().to_string(),
            playbook: playbook.into(),
            started_at,
            finished_at: Utc::now(),
            check_mode,
            interrupted,
            hosts,
            stats,
        }
    }

    pub fn host(&self, address: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.host == address)
    }

    pub fn failed_hosts(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts.iter().filter(|h| h.failed())
    }

    /// 130 when interrupted, 2 when any host failed, else 0
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            exit_code::INTERRUPTED
        } else if self.failed_hosts().next().is_some() {
            exit_code::HOST_FAILED
        } else {
            exit_code::SUCCESS
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Print the recap to stdout
    pub fn print_summary(&self) {
        println!();
        let mode = if self.check_mode { " (check mode)" } else { "" };
        let elapsed = self.finished_at - self.started_at;
        println!(
            "RECAP {}{} [run {}, {:.1}s]",
            self.playbook,
            mode,
            self.run_id,
            elapsed.num_milliseconds() as f64 / 1000.0
        );
        for host in &self.hosts {
            let stats = host.stats();
            println!(
                "  {:<20} ok={:<3} changed={:<3} failed={:<3} skipped={:<3} state={}",
                host.host, stats.ok, stats.changed, stats.failed, stats.skipped, host.state
            );
            for record in host.tasks.iter().filter(|r| r.outcome == TaskOutcome::Failed) {
                let item = record
                    .item
                    .as_ref()
                    .map(|i| format!(" ({i})"))
                    .unwrap_or_default();
                let ignored = if record.ignored { " [ignored]" } else { "" };
                println!(
                    "    failed: {}{}{}: {}",
                    record.task,
                    item,
                    ignored,
                    record.reason.as_deref().unwrap_or("unknown error")
                );
            }
        }
        println!(
            "  total: ok={} changed={} failed={} skipped={}",
            self.stats.ok, self.stats.changed, self.stats.failed, self.stats.skipped
        );
        if self.interrupted {
            println!("  run interrupted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task: &str, outcome: TaskOutcome) -> TaskRecord {
        TaskRecord {
            play: "App".to_string(),
            task: task.to_string(),
            item: None,
            handler: false,
            outcome,
            reason: None,
            ignored: false,
        }
    }

    fn host(name: &str, state: HostState, outcomes: &[TaskOutcome]) -> HostReport {
        HostReport {
            host: name.to_string(),
            state,
            tasks: outcomes
                .iter()
                .enumerate()
                .map(|(i, o)| record(&format!("task {i}"), *o))
                .collect(),
        }
    }

    #[test]
    fn test_totals_and_exit_codes() {
        let report = RunReport::new(
            "provision",
            false,
            false,
            Utc::now(),
            vec![
                host("a", HostState::Done, &[TaskOutcome::Changed, TaskOutcome::Unchanged]),
                host("b", HostState::Done, &[TaskOutcome::Skipped, TaskOutcome::Unchanged]),
            ],
        );
        assert_eq!(
            report.stats,
            RunStats {
                ok: 2,
                changed: 1,
                failed: 0,
                skipped: 1
            }
        );
        assert_eq!(report.exit_code(), exit_code::SUCCESS);
    }

    #[test]
    fn test_failed_host_exit_code() {
        let report = RunReport::new(
            "provision",
            false,
            false,
            Utc::now(),
            vec![host("a", HostState::Failed, &[TaskOutcome::Failed])],
        );
        assert_eq!(report.exit_code(), exit_code::HOST_FAILED);
    }

    #[test]
    fn test_tolerated_failure_keeps_success() {
        let report = RunReport::new(
            "provision",
            false,
            false,
            Utc::now(),
            vec![host("a", HostState::Done, &[TaskOutcome::Failed])],
        );
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.exit_code(), exit_code::SUCCESS);
    }

    #[test]
    fn test_interrupted_wins() {
        let report = RunReport::new(
            "provision",
            false,
            true,
            Utc::now(),
            vec![host("a", HostState::Failed, &[TaskOutcome::Failed])],
        );
        assert_eq!(report.exit_code(), exit_code::INTERRUPTED);
    }

    #[test]
    fn test_json_shape() {
        let report = RunReport::new(
            "provision",
            true,
            false,
            Utc::now(),
            vec![host("a", HostState::Done, &[TaskOutcome::Changed])],
        );
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["hosts"][0]["state"], "done");
        assert_eq!(json["hosts"][0]["tasks"][0]["outcome"], "changed");
        assert!(json["hosts"][0]["tasks"][0].get("handler").is_none());
        assert_eq!(json["stats"]["changed"], 1);
    }
}
