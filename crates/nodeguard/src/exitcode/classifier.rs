use std::fmt::{Display, Formatter, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Set;
use crate::exitcode::codes::{ERR_APP_EXIT, ERR_OK, ERR_SCRIPT_MALFUNCTION};
use crate::exitcode::table::{Category, ExitCodeInfo, ExitCodeTable};

/// Final disposition of a task or subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Finished,
    Failed,
    Canceled,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Finished => "Finished",
            TaskState::Failed => "Failed",
            TaskState::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Finished" => Ok(TaskState::Finished),
            "Failed" => Ok(TaskState::Failed),
            "Canceled" => Ok(TaskState::Canceled),
            _ => Err(format!("Unknown task state `{s}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub code: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: Option<String>,
    /// Subtask that reported the code, filled in when histories are merged.
    #[serde(default)]
    pub source: Option<String>,
    /// Suppressed entries stay in the history but do not take part in classification.
    #[serde(default)]
    pub suppressed: bool,
}

/// Prioritized classifier of everything that went wrong (or not) during a run.
///
/// Codes are reported by every stage of the pipeline. Each report lands on one of two
/// channels: unfailing codes on the warning channel, everything else on the error
/// channel. A channel only changes when a more severe (numerically lower priority)
/// code arrives, so the most severe condition wins regardless of reporting order.
#[derive(Debug, Clone)]
pub struct ExitCode {
    table: Arc<ExitCodeTable>,
    ok: usize,
    error: usize,
    warning: usize,
    history: Vec<HistoryEntry>,
    suppressed: Set<String>,
}

impl ExitCode {
    pub fn new(table: Arc<ExitCodeTable>) -> Self {
        let ok = table
            .index_of(ERR_OK)
            .expect("exit code tables always contain ERR_OK");
        Self {
            table,
            ok,
            error: ok,
            warning: ok,
            history: Vec::new(),
            suppressed: Default::default(),
        }
    }

    pub fn table(&self) -> &Arc<ExitCodeTable> {
        &self.table
    }

    /// Reports a code by name. Returns `true` if one of the channels changed.
    pub fn report(&mut self, name: &str) -> bool {
        self.report_entry(name, None, None)
    }

    pub fn report_with_detail(&mut self, name: &str, detail: impl Into<String>) -> bool {
        self.report_entry(name, Some(detail.into()), None)
    }

    /// Reports a numeric code coming from a library or helper executable.
    pub fn report_code(&mut self, code: i32) -> bool {
        match self.table.by_code(code) {
            Some(info) => {
                let name = info.name.clone();
                self.report(&name)
            }
            None => {
                self.report_with_detail(ERR_SCRIPT_MALFUNCTION, format!("Unknown exit code {code}"))
            }
        }
    }

    /// Reports the raw exit status of the launched application.
    /// `None` means the process was ended by a signal.
    pub fn report_process_exit(&mut self, code: Option<i32>) -> bool {
        match code {
            Some(0) => false,
            Some(code) => {
                self.report_with_detail(ERR_APP_EXIT, format!("Process exited with code {code}"))
            }
            None => self.report_with_detail(ERR_APP_EXIT, "Process was terminated by a signal"),
        }
    }

    fn report_entry(&mut self, name: &str, detail: Option<String>, source: Option<String>) -> bool {
        let Some(index) = self.table.index_of(name) else {
            log::error!("Reported exit code `{name}` is not in the exit code table");
            let detail = format!("Unknown exit code `{name}`");
            return self.report_entry(ERR_SCRIPT_MALFUNCTION, Some(detail), source);
        };
        if index == self.ok {
            // Reporting success can never improve on anything already recorded.
            return false;
        }
        let info = self.table.at(index);
        let suppressed = self.suppressed.contains(name);
        self.history.push(HistoryEntry {
            name: info.name.clone(),
            code: info.code,
            timestamp: Utc::now(),
            detail,
            source,
            suppressed,
        });
        if suppressed {
            log::debug!("Exit code {name} is suppressed, recorded in history only");
            return false;
        }
        let changed = self.apply(index);
        if changed {
            let info = self.table.at(index);
            log::info!(
                "Exit code set to {} ({}): {}",
                info.name,
                info.code,
                info.description
            );
        } else {
            log::debug!("Exit code {name} reported, keeping {}", self.error().name);
        }
        changed
    }

    fn apply(&mut self, index: usize) -> bool {
        let info = self.table.at(index);
        let channel = if info.unfailing {
            &mut self.warning
        } else {
            &mut self.error
        };
        if info.priority < self.table.at(*channel).priority {
            *channel = index;
            true
        } else {
            false
        }
    }

    fn replay(&mut self) {
        self.error = self.ok;
        self.warning = self.ok;
        let indices: Vec<usize> = self
            .history
            .iter()
            .filter(|entry| !entry.suppressed)
            .filter_map(|entry| self.table.index_of(&entry.name))
            .collect();
        for index in indices {
            self.apply(index);
        }
    }

    /// Removes `name` from classification, including everything already reported,
    /// by replaying the history without it. Later reports of `name` are recorded only.
    pub fn suppress(&mut self, name: &str) {
        if self.suppressed.insert(name.to_string()) {
            log::info!("Suppressing exit code {name}");
        }
        for entry in self.history.iter_mut().filter(|e| e.name == name) {
            entry.suppressed = true;
        }
        self.replay();
    }

    /// Resets both channels to `ERR_OK` and forgets the history.
    pub fn clear(&mut self) {
        self.error = self.ok;
        self.warning = self.ok;
        self.history.clear();
        self.suppressed.clear();
    }

    /// Appends the history of `other` (typically a finished subtask) and classifies its
    /// non-suppressed entries as if they had been reported here.
    pub fn merge(&mut self, other: &ExitCode, source: &str) {
        for entry in &other.history {
            let mut entry = entry.clone();
            if entry.source.is_none() {
                entry.source = Some(source.to_string());
            }
            let index = self.table.index_of(&entry.name);
            let active = !entry.suppressed;
            self.history.push(entry);
            if let (true, Some(index)) = (active, index) {
                self.apply(index);
            }
        }
    }

    pub fn error(&self) -> &ExitCodeInfo {
        self.table.at(self.error)
    }

    pub fn warning(&self) -> &ExitCodeInfo {
        self.table.at(self.warning)
    }

    pub fn code(&self) -> i32 {
        self.error().code
    }

    pub fn name(&self) -> &str {
        &self.error().name
    }

    pub fn desc(&self) -> &str {
        &self.error().description
    }

    pub fn state(&self) -> TaskState {
        let error = self.error();
        if error.category == Category::Cancellation {
            TaskState::Canceled
        } else if self.error == self.ok {
            TaskState::Finished
        } else {
            TaskState::Failed
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == self.ok
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Whether `name` was reported at any time (suppressed reports included).
    pub fn was_reported(&self, name: &str) -> bool {
        self.history.iter().any(|e| e.name == name)
    }

    /// Human-readable summary with the causal history, oldest first.
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        let error = self.error();
        let _ = writeln!(
            out,
            "Final exit code: {} ({}) - {} [{}]",
            error.code,
            error.name,
            error.description,
            self.state()
        );
        if self.warning != self.ok {
            let warning = self.warning();
            let _ = writeln!(out, "Warning: {} ({})", warning.code, warning.name);
        }
        if !self.history.is_empty() {
            let _ = writeln!(out, "History:");
        }
        for entry in &self.history {
            let _ = write!(
                out,
                "  {} {:>4} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                entry.code,
                entry.name
            );
            if let Some(source) = &entry.source {
                let _ = write!(out, " <{source}>");
            }
            if let Some(detail) = &entry.detail {
                let _ = write!(out, ": {detail}");
            }
            if entry.suppressed {
                let _ = write!(out, " (suppressed)");
            }
            out.push('\n');
        }
        out
    }
}
