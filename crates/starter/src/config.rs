//! Job configuration written by the submission side.
//!
//! The configuration is loaded once, validated, and read-only afterwards. Every field
//! of [`SubtaskSpec`] has a documented default, so a subtask can be as small as
//! `{"args": ["./run.sh"]}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use nodeguard::exitcode::ExitCodeTable;
use nodeguard::filter::WatchFlags;
use nodeguard::launcher::{LineFilter, WrapperSpec};
use nodeguard::watchdog::AppProfile;
use nodeguard::Set;

use crate::common::error::StarterError;
use crate::logscan::LogScanConfig;

/// How the argument list of a subtask is turned into a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchKind {
    /// Arguments are executed as they are.
    #[default]
    Generic,
    /// The recording replay application. Arguments as they are, with a longer
    /// startup grace period, higher memory ceilings and log scanning.
    Mts,
    /// `<interpreter> -u <args>`
    Python,
    /// `docker run` of `docker.image` with the task folder mounted.
    Docker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonOptions {
    pub interpreter: String,
}

impl Default for PythonOptions {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerOptions {
    pub image: String,
    /// Passed to `docker run` before the image name.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFilterConfig {
    /// Lines matching the pattern are dropped.
    Suppress(String),
    /// Only lines matching the pattern are kept.
    Select(String),
}

impl OutputFilterConfig {
    pub fn compile(&self) -> crate::Result<LineFilter> {
        Ok(match self {
            OutputFilterConfig::Suppress(pattern) => LineFilter::Suppress(Regex::new(pattern)?),
            OutputFilterConfig::Select(pattern) => LineFilter::Select(Regex::new(pattern)?),
        })
    }
}

fn default_timeout_hours() -> f64 {
    12.0
}

/// One command of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubtaskSpec {
    /// Used in log folder and file names. Defaults to `subtask<index>`.
    pub name: String,
    pub kind: LaunchKind,
    pub args: Vec<String>,
    /// Working directory, relative paths are resolved against the task folder.
    /// Defaults to the task folder.
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Resources that must show activity. Defaults to CPU and I/O.
    pub watch: WatchFlags,
    /// Wall time limit, capped at 72 hours.
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: f64,
    /// Overrides the resident memory ceiling of the launch kind.
    pub memory_limit_mb: Option<u64>,
    pub virtual_memory_limit_mb: Option<u64>,
    /// Started in order before the application, stopped after it.
    pub wrappers: Vec<WrapperSpec>,
    /// Exit code names of the previous subtask that cause this one to be skipped.
    pub skip_on: Vec<String>,
    /// Number of subtasks skipped when `skip_on` matches, this one included. Defaults to 1.
    pub skip_count: Option<u32>,
    /// Recording processed by the subtask, exported as `STARTER_RECORDING`.
    pub recording: Option<PathBuf>,
    /// Output lines that mean the application is beyond saving.
    pub fatal_patterns: Vec<String>,
    pub output_filter: Option<OutputFilterConfig>,
    pub python: PythonOptions,
    pub docker: DockerOptions,
    /// Extra files or folders (relative to the task folder) copied to the result folder.
    pub copy_back: Vec<PathBuf>,
    /// Scan the application logs after the run. Defaults to `true` for `mts`.
    pub log_scan: Option<bool>,
    /// Overrides the startup grace period of the launch kind.
    pub initial_wait_secs: Option<f64>,
}

impl Default for SubtaskSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: LaunchKind::Generic,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            watch: WatchFlags::default(),
            timeout_hours: default_timeout_hours(),
            memory_limit_mb: None,
            virtual_memory_limit_mb: None,
            wrappers: Vec::new(),
            skip_on: Vec::new(),
            skip_count: None,
            recording: None,
            fatal_patterns: Vec::new(),
            output_filter: None,
            python: PythonOptions::default(),
            docker: DockerOptions::default(),
            copy_back: Vec::new(),
            log_scan: None,
            initial_wait_secs: None,
        }
    }
}

impl SubtaskSpec {
    pub fn display_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("subtask{index}")
        } else {
            self.name.clone()
        }
    }

    pub fn profile(&self) -> AppProfile {
        match self.kind {
            LaunchKind::Mts => AppProfile::Heavy,
            _ => AppProfile::Generic,
        }
    }

    pub fn log_scan_enabled(&self) -> bool {
        self.log_scan.unwrap_or(self.kind == LaunchKind::Mts)
    }

    pub fn skip_count(&self) -> u32 {
        self.skip_count.unwrap_or(1).max(1)
    }

    pub fn resolve_cwd(&self, task_root: &Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => task_root.join(cwd),
            None => task_root.to_path_buf(),
        }
    }

    /// Expands the launch kind into the argument vector that is executed.
    pub fn command(&self, task_root: &Path) -> crate::Result<Vec<String>> {
        Ok(match self.kind {
            LaunchKind::Generic | LaunchKind::Mts => self.args.clone(),
            LaunchKind::Python => {
                let mut args = vec![self.python.interpreter.clone(), "-u".to_string()];
                args.extend(self.args.iter().cloned());
                args
            }
            LaunchKind::Docker => {
                if self.docker.image.is_empty() {
                    return Err(StarterError::ConfigError(
                        "Docker subtask without an image".to_string(),
                    ));
                }
                let root = task_root.display().to_string();
                let cwd = self.resolve_cwd(task_root).display().to_string();
                let mut args = vec![
                    "docker".to_string(),
                    "run".to_string(),
                    "--rm".to_string(),
                    "-v".to_string(),
                    format!("{root}:{root}"),
                    "-w".to_string(),
                    cwd,
                ];
                args.extend(self.docker.extra_args.iter().cloned());
                args.push(self.docker.image.clone());
                args.extend(self.args.iter().cloned());
                args
            }
        })
    }

    pub fn compile_fatal_patterns(&self) -> crate::Result<Vec<Regex>> {
        Ok(self
            .fatal_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<_, _>>()?)
    }
}

fn default_copy_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub task_name: String,
    /// Local scratch area, the task folder is `<work_dir>/<task_name>`.
    pub work_dir: PathBuf,
    /// Durable storage receiving the task folder at the end.
    #[serde(default)]
    pub result_dir: Option<PathBuf>,
    /// Skip all remaining subtasks once one has failed.
    #[serde(default)]
    pub end_on_error: bool,
    /// Created by the scheduler to cancel the task.
    #[serde(default)]
    pub cancel_file: Option<PathBuf>,
    /// JSON exit code table used when the database has none.
    #[serde(default)]
    pub exit_code_table: Option<PathBuf>,
    #[serde(default)]
    pub log_scan: LogScanConfig,
    #[serde(default = "default_copy_retries")]
    pub copy_back_retries: u32,
    pub subtasks: Vec<SubtaskSpec>,
}

impl JobConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            StarterError::ConfigError(format!(
                "Cannot read job configuration {}: {error}",
                path.display()
            ))
        })?;
        let config: JobConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn task_root(&self) -> PathBuf {
        self.work_dir.join(&self.task_name)
    }

    /// Checks everything that can be checked before the first subtask starts.
    ///
    /// Task and subtask names become folder and file names, so they must be a single
    /// path component.
    pub fn validate(&self, table: &ExitCodeTable) -> crate::Result<()> {
        let fail = |message: String| Err(StarterError::ConfigError(message));
        if !is_path_component(&self.task_name) {
            return fail(format!("Invalid task name `{}`", self.task_name));
        }
        if self.subtasks.is_empty() {
            return fail("No subtasks configured".to_string());
        }
        let mut names = Set::default();
        for (index, subtask) in self.subtasks.iter().enumerate() {
            let name = subtask.display_name(index);
            if !is_path_component(&name) {
                return fail(format!("Invalid subtask name `{name}`"));
            }
            if !names.insert(name.clone()) {
                return fail(format!("Duplicate subtask name `{name}`"));
            }
            if subtask.args.is_empty() && subtask.kind != LaunchKind::Docker {
                return fail(format!("Subtask `{name}` has no arguments"));
            }
            if subtask.timeout_hours.is_nan() || subtask.timeout_hours <= 0.0 {
                return fail(format!("Subtask `{name}` has a non-positive timeout"));
            }
            for code in &subtask.skip_on {
                if table.get(code).is_none() {
                    return fail(format!("Subtask `{name}` skips on unknown exit code `{code}`"));
                }
            }
            for wrapper in &subtask.wrappers {
                if wrapper.args.is_empty() {
                    return fail(format!(
                        "Wrapper `{}` of subtask `{name}` has no arguments",
                        wrapper.name
                    ));
                }
            }
            subtask.compile_fatal_patterns()?;
            if let Some(filter) = &subtask.output_filter {
                filter.compile()?;
            }
            subtask.command(&self.task_root())?;
        }
        let scan_codes = self
            .log_scan
            .rules
            .iter()
            .map(|rule| &rule.code)
            .chain(self.log_scan.suppressions.iter().map(|s| &s.code));
        for code in scan_codes {
            if table.get(code).is_none() {
                return fail(format!("Log scan refers to unknown exit code `{code}`"));
            }
        }
        self.log_scan.compile()?;
        Ok(())
    }
}

fn is_path_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
