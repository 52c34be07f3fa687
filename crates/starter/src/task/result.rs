use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nodeguard::exitcode::{ExitCode, HistoryEntry, TaskState};
use nodeguard::hwstats::UsageSummary;

/// What happened to one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub index: usize,
    pub name: String,
    pub command: String,
    pub skipped: bool,
    pub code: i32,
    pub code_name: String,
    pub state: TaskState,
    /// Raw exit code of the application, `None` when it was ended by a signal
    /// or never started.
    pub process_exit: Option<i32>,
    /// Final verdict of the watchdog, if it ran.
    pub verdict: Option<String>,
    pub usage: Option<UsageSummary>,
    pub resource_log: Option<PathBuf>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl SubtaskResult {
    pub fn skipped(index: usize, name: String, command: String, exit_code: &ExitCode) -> Self {
        Self {
            index,
            name,
            command,
            skipped: true,
            code: exit_code.code(),
            code_name: exit_code.name().to_string(),
            state: exit_code.state(),
            process_exit: None,
            verdict: None,
            usage: None,
            resource_log: None,
            started: None,
            finished: None,
        }
    }
}

/// Aggregate outcome of a whole task, written to the result store exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub task_name: String,
    pub code: i32,
    pub code_name: String,
    pub description: String,
    pub state: TaskState,
    /// Most severe warning, if any was reported.
    pub warning: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub subtasks: Vec<SubtaskResult>,
    pub copied_files: u64,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl TaskRunResult {
    pub fn new(
        task_name: &str,
        exit_code: &ExitCode,
        subtasks: Vec<SubtaskResult>,
        copied_files: u64,
        started: DateTime<Utc>,
    ) -> Self {
        let warning = exit_code.warning();
        Self {
            task_name: task_name.to_string(),
            code: exit_code.code(),
            code_name: exit_code.name().to_string(),
            description: exit_code.desc().to_string(),
            state: exit_code.state(),
            warning: warning.unfailing.then(|| warning.name.clone()),
            history: exit_code.history().to_vec(),
            subtasks,
            copied_files,
            started,
            finished: Utc::now(),
        }
    }

    /// Total usage over all subtasks that ran.
    pub fn usage(&self) -> UsageSummary {
        let mut total = UsageSummary::default();
        for usage in self.subtasks.iter().filter_map(|s| s.usage.as_ref()) {
            total.peak_mem_bytes = total.peak_mem_bytes.max(usage.peak_mem_bytes);
            total.peak_virt_bytes = total.peak_virt_bytes.max(usage.peak_virt_bytes);
            total.peak_processes = total.peak_processes.max(usage.peak_processes);
            total.cpu_time_secs += usage.cpu_time_secs;
            total.io_bytes += usage.io_bytes;
            total.net_bytes += usage.net_bytes;
            total.samples += usage.samples;
            total.wall_time_secs += usage.wall_time_secs;
        }
        total
    }
}
